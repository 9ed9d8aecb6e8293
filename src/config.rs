//! Execution engine configuration.
use serde::Deserialize;

use crate::error::{Result, RuntimeError};

/// Tunables for the execution engine. Every field has a default so a
/// configuration file only needs to mention what it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Run a safepoint collection check every N instructions, 0 disables the
    // periodic check (the collector's own flag is always honoured).
    pub gc_check_interval: u64,
    // Interpreted frames per thread before raising StackOverflowError.
    pub max_frames: usize,
    // Live heap entries before allocations fail, unbounded if unset.
    pub heap_capacity: Option<usize>,
    // Longest array the guest may allocate, unbounded if unset. Longer ones
    // raise OutOfMemoryError.
    pub max_array_length: Option<usize>,
    // Log every decoded instruction at trace level.
    pub trace_opcodes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gc_check_interval: if cfg!(debug_assertions) { 10_000 } else { 0 },
            max_frames: 2048,
            heap_capacity: None,
            max_array_length: Some(1 << 24),
            trace_opcodes: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| RuntimeError::invalid_state(format!("invalid engine config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let text = r#"{ "max_frames": 16, "heap_capacity": 100, "max_array_length": null }"#;
        let config = EngineConfig::from_json(text).unwrap();
        assert_eq!(config.max_frames, 16);
        assert_eq!(config.heap_capacity, Some(100));
        assert_eq!(config.max_array_length, None);
        assert!(!config.trace_opcodes);
        assert_eq!(config.gc_check_interval, EngineConfig::default().gc_check_interval);
    }

    #[test]
    fn rejects_bad_json() {
        assert!(EngineConfig::from_json("{ max_frames: }").is_err());
    }
}
