//! Error type shared by every handoff operation.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Error returned by a service hook. Hook errors are logged, never propagated.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while registering, handing off or signalling listeners.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The listener could not yield its raw descriptor.
    #[error("Cannot obtain descriptor for service '{name}': {source}")]
    DescriptorUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A service with this name is already registered.
    #[error("Service '{name}' is already registered")]
    DuplicateService { name: String },

    /// No service with this name is registered.
    #[error("Unknown service '{name}'")]
    UnknownService { name: String },

    /// Service names travel comma-joined, so they must be non-empty and comma-free.
    #[error("Invalid service name '{name}': must be non-empty and must not contain ','")]
    InvalidServiceName { name: String },

    /// The three parallel handoff lists have different lengths.
    #[error(
        "Handoff mismatch: {descriptors} descriptors, {names} names, {display_names} display names"
    )]
    ProtocolMismatch {
        descriptors: usize,
        names: usize,
        display_names: usize,
    },

    /// A descriptor entry is not a decimal number.
    #[error("Invalid inherited descriptor '{value}'")]
    InvalidDescriptor { value: String },

    /// The same descriptor is listed for two services.
    #[error("Inherited descriptor {fd} is listed more than once")]
    DuplicateDescriptor { fd: RawFd },

    /// An inherited descriptor is not open, or duplicating or closing it failed.
    #[error("Failed to adopt inherited descriptor {fd}: {source}")]
    Inherit {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// The inherited descriptor is not a TCP or Unix stream socket.
    #[error(
        "Inherited descriptor {fd} (service '{name}') is {kind}, not a TCP or Unix stream listener"
    )]
    UnsupportedListener {
        name: String,
        fd: RawFd,
        kind: String,
    },

    /// The service's listener was already closed.
    #[error("Listener for service '{name}' is already closed")]
    ListenerClosed { name: String },

    /// Clearing close-on-exec failed.
    #[error("Failed to clear close-on-exec on fd {fd} (service '{name}'): {source}")]
    Cloexec {
        name: String,
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// `close(2)` on a listener descriptor failed.
    #[error("Failed to close fd {fd}: {source}")]
    CloseFd {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// Closing one or more listeners failed.
    #[error("Failed to close listeners:\n{0}")]
    Close(CloseFailures),

    /// Replace-in-place was called by the child of the restart it belongs to.
    #[error("Replace-in-place called by the spawned child of process {parent_pid}")]
    ReplaceFromChild { parent_pid: i32 },

    /// The current executable could not be located.
    #[error("Cannot locate current executable: {0}")]
    ProcessLookup(#[source] io::Error),

    /// `execve` returned.
    #[error("Failed to exec {exe}: {source}")]
    Exec {
        exe: String,
        #[source]
        source: io::Error,
    },

    /// Starting the replacement child failed.
    #[error("Failed to spawn replacement process: {0}")]
    Spawn(#[source] io::Error),

    /// Neither the current nor the previous pid is recorded in the environment.
    #[error("No process id recorded in the environment")]
    MissingPid,

    /// `kill(2)` failed.
    #[error("Failed to send signal {signal} to process {pid}: {source}")]
    SignalDelivery {
        pid: i32,
        signal: i32,
        #[source]
        source: io::Error,
    },

    /// Registering an OS signal handler failed.
    #[error("Failed to install signal handler: {0}")]
    SignalInstall(#[source] io::Error),

    /// Every sender of the signal queue went away.
    #[error("Signal queue closed")]
    SignalQueueClosed,
}

/// One listener that failed to close.
#[derive(Debug)]
pub struct CloseFailure {
    pub name: String,
    pub error: HandoffError,
}

/// Every failure collected by [`Registry::close_all`](crate::Registry::close_all).
#[derive(Debug, Default)]
pub struct CloseFailures(pub Vec<CloseFailure>);

impl CloseFailures {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CloseFailure> {
        self.0.iter()
    }
}

impl fmt::Display for CloseFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in &self.0 {
            writeln!(f, "{}: {}", failure.name, failure.error)?;
        }
        Ok(())
    }
}
