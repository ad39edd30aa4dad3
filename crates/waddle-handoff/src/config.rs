//! Dispatcher configuration.
//!
//! # Environment Variables
//!
//! - `WADDLE_HANDOFF_QUEUE_CAPACITY`: signal queue capacity. Default: 2,
//!   which is also the minimum (a restart trigger and the retiring signal
//!   may arrive back to back).

use tracing::info;

use crate::signals::Signal;

/// Default signal queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

/// Environment variable overriding the queue capacity.
pub const QUEUE_CAPACITY_VAR: &str = "WADDLE_HANDOFF_QUEUE_CAPACITY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Capacity of the signal queue feeding the dispatcher.
    pub queue_capacity: usize,
    /// Signal the replacement sends to retire its parent via external control.
    pub control_signal: Signal,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            control_signal: Signal::Quit,
        }
    }
}

impl DispatchConfig {
    /// Load from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_capacity = lookup(QUEUE_CAPACITY_VAR)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_QUEUE_CAPACITY)
            .max(DEFAULT_QUEUE_CAPACITY);

        Self {
            queue_capacity,
            ..Self::default()
        }
    }

    pub fn with_control_signal(mut self, signal: Signal) -> Self {
        self.control_signal = signal;
        self
    }

    pub fn log_config(&self) {
        info!(
            queue_capacity = self.queue_capacity,
            control_signal = %self.control_signal,
            "Handoff dispatcher configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::from_lookup(|_| None);
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.queue_capacity, 2);
        assert_eq!(config.control_signal, Signal::Quit);
    }

    #[test]
    fn test_capacity_override() {
        let config = DispatchConfig::from_lookup(|key| {
            (key == QUEUE_CAPACITY_VAR).then(|| "8".to_string())
        });
        assert_eq!(config.queue_capacity, 8);
    }

    #[test]
    fn test_capacity_never_below_two() {
        for value in ["0", "1", "junk"] {
            let config = DispatchConfig::from_lookup(|_| Some(value.to_string()));
            assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        }
    }

    #[test]
    fn test_with_control_signal() {
        let config = DispatchConfig::default().with_control_signal(Signal::Terminate);
        assert_eq!(config.control_signal, Signal::Terminate);
    }
}
