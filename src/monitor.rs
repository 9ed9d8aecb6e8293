//! Re-entrant monitors backing `synchronized` and `monitorenter`.
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    count: usize,
}

/// Lock owned by an object, array or class. The owning thread can enter it
/// any number of times and must exit it as many times to release it.
#[derive(Debug, Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    released: Condvar,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the calling thread owns the monitor.
    pub fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.count += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    /// Releases one level of ownership. Returns false when the calling
    /// thread doesn't own the monitor.
    pub fn exit(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return false;
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.released.notify_one();
        }
        true
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Recursion count held by the current owner, 0 if free.
    pub fn entry_count(&self) -> usize {
        self.state.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentrant_enter_and_exit() {
        let monitor = Monitor::new();
        monitor.enter();
        monitor.enter();
        assert_eq!(monitor.entry_count(), 2);
        assert!(monitor.exit());
        assert!(monitor.is_owned_by_current_thread());
        assert!(monitor.exit());
        assert!(!monitor.is_owned_by_current_thread());
        assert!(!monitor.exit());
    }

    #[test]
    fn blocks_other_threads_until_released() {
        let monitor = Arc::new(Monitor::new());
        monitor.enter();
        let other = Arc::clone(&monitor);
        let handle = thread::spawn(move || {
            other.enter();
            let owned = other.is_owned_by_current_thread();
            other.exit();
            owned
        });
        thread::sleep(Duration::from_millis(20));
        assert!(monitor.is_owned_by_current_thread());
        assert!(monitor.exit());
        assert!(handle.join().unwrap());
        assert_eq!(monitor.entry_count(), 0);
    }

    #[test]
    fn non_owner_cannot_exit() {
        let monitor = Arc::new(Monitor::new());
        monitor.enter();
        let other = Arc::clone(&monitor);
        let released = thread::spawn(move || other.exit()).join().unwrap();
        assert!(!released);
        assert!(monitor.exit());
    }
}
