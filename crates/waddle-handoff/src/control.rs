//! External control: signal the process recorded in the environment.
//!
//! After a spawn, the parent records the child as `WADDLE_HANDOFF_PID`; the
//! child sees its parent as `WADDLE_HANDOFF_PPID`. A replacement that is
//! ready to serve calls [`signal_recorded`] to retire its parent.

use std::io;

use tracing::info;

use crate::codec::{PID_VAR, PPID_VAR, SIGNAL_VAR};
use crate::error::HandoffError;

/// A process and the signal to send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTarget {
    pub pid: i32,
    pub signal: i32,
}

fn parse_pid(value: Option<String>) -> Option<i32> {
    value
        .and_then(|v| v.trim().parse::<i32>().ok())
        // 0 and negatives address process groups, never a single process
        .filter(|pid| *pid > 0)
}

impl ControlTarget {
    /// Resolve the target from an environment lookup.
    ///
    /// Prefers the current pid, falls back to the previous pid, and defaults
    /// the signal to SIGQUIT when it is missing or unparsable.
    pub fn resolve<F>(lookup: F) -> Result<Self, HandoffError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pid = parse_pid(lookup(PID_VAR))
            .or_else(|| parse_pid(lookup(PPID_VAR)))
            .ok_or(HandoffError::MissingPid)?;

        let signal = lookup(SIGNAL_VAR)
            .and_then(|v| v.trim().parse::<i32>().ok())
            .filter(|sig| *sig > 0)
            .unwrap_or(libc::SIGQUIT);

        Ok(Self { pid, signal })
    }

    pub fn from_env() -> Result<Self, HandoffError> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Send the signal with `kill(2)`.
    pub fn deliver(&self) -> Result<(), HandoffError> {
        info!(pid = self.pid, signal = self.signal, "Sending signal to process");
        if unsafe { libc::kill(self.pid, self.signal) } < 0 {
            return Err(HandoffError::SignalDelivery {
                pid: self.pid,
                signal: self.signal,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Signal the process recorded in this process's environment.
pub fn signal_recorded() -> Result<ControlTarget, HandoffError> {
    let target = ControlTarget::from_env()?;
    target.deliver()?;
    Ok(target)
}
