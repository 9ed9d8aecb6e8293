//! Pause handshake between a controller and an interpreter thread.
//!
//! The controller asks for a pause, the interpreter notices it at the next
//! instruction boundary, confirms it and parks until resumed. Nothing is
//! ever paused in the middle of an instruction.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PauseState {
    Running,
    Pausing,
    Paused,
}

impl PauseState {
    const fn encode(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Pausing => 1,
            Self::Paused => 2,
        }
    }

    const fn decode(raw: u8) -> Self {
        match raw {
            1 => Self::Pausing,
            2 => Self::Paused,
            _ => Self::Running,
        }
    }
}

/// Shared pause token, cloned into the controller and the thread state.
#[derive(Debug, Clone, Default)]
pub struct PauseToken {
    state: Arc<AtomicU8>,
}

impl PauseToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PauseState {
        PauseState::decode(self.state.load(Ordering::Acquire))
    }

    /// Asks the interpreter thread to park at its next safepoint.
    pub fn request_pause(&self) {
        let _ = self.state.compare_exchange(
            PauseState::Running.encode(),
            PauseState::Pausing.encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Spins until the interpreter confirmed the pause. Only meaningful while
    /// that thread is executing bytecode.
    pub fn wait_until_paused(&self) {
        while self.state() == PauseState::Pausing {
            thread::yield_now();
        }
    }

    pub fn resume(&self) {
        self.state
            .store(PauseState::Running.encode(), Ordering::Release);
    }

    /// Interpreter side of the handshake. Returns true if the thread was
    /// parked. A parked thread leaves early once `halted` answers true, the
    /// token then stays `Paused` until resumed.
    pub fn checkpoint(&self, halted: impl Fn() -> bool) -> bool {
        if self
            .state
            .compare_exchange(
                PauseState::Pausing.encode(),
                PauseState::Paused.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        debug!("thread paused at safepoint");
        while self.state() == PauseState::Paused {
            if halted() {
                debug!("halted while paused");
                return true;
            }
            thread::yield_now();
        }
        debug!("thread resumed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_is_free_while_running() {
        let token = PauseToken::new();
        assert!(!token.checkpoint(|| false));
        assert_eq!(token.state(), PauseState::Running);
    }

    #[test]
    fn pause_handshake() {
        let token = PauseToken::new();
        token.request_pause();
        assert_eq!(token.state(), PauseState::Pausing);

        let worker = token.clone();
        let handle = thread::spawn(move || worker.checkpoint(|| false));
        token.wait_until_paused();
        assert_eq!(token.state(), PauseState::Paused);
        token.resume();
        assert!(handle.join().unwrap());
        assert_eq!(token.state(), PauseState::Running);
    }

    #[test]
    fn halt_releases_a_paused_thread() {
        use std::sync::atomic::AtomicBool;

        let token = PauseToken::new();
        let halted = Arc::new(AtomicBool::new(false));
        token.request_pause();
        let worker = token.clone();
        let flag = Arc::clone(&halted);
        let handle = thread::spawn(move || worker.checkpoint(|| flag.load(Ordering::Acquire)));
        token.wait_until_paused();
        halted.store(true, Ordering::Release);
        assert!(handle.join().unwrap());
        assert_eq!(token.state(), PauseState::Paused);
    }
}
