//! # waddle-handoff
//!
//! Zero-downtime restarts for Waddle servers: a running process hands its
//! bound listening sockets to a fresh copy of its own binary without closing
//! them, driven by signals.
//!
//! ## Overview
//!
//! 1. The application registers its listeners in a [`Registry`] (or, in a
//!    handoff child, rebuilds it with [`Registry::inherit`]) and attaches
//!    [`Hooks`].
//! 2. A [`Dispatcher`] waits for signals. The first `SIGUSR2` clears
//!    close-on-exec on every listener, writes the handoff into the child's
//!    environment and spawns the replacement; this process keeps serving.
//! 3. The replacement adopts the descriptors, starts accepting, and retires
//!    its parent with [`control::signal_recorded`] (`SIGQUIT` by default).
//! 4. The parent runs its quit hooks (drain) and returns from the loop.
//!
//! [`launcher::replace_in_place`] is the alternative for processes that may
//! simply re-exec themselves.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP`: reload hooks
//! - `SIGUSR1`: reopen hooks (log files)
//! - `SIGUSR2`: the first spawns a replacement, the second exits
//! - `SIGQUIT`: quit hooks, then exit
//! - `SIGINT` / `SIGTERM`: exit immediately
//!
//! ## Environment Variables
//!
//! - `WADDLE_HANDOFF_FDS` / `WADDLE_HANDOFF_SERVICES` / `WADDLE_HANDOFF_NAMES`:
//!   comma-joined descriptors, service names and display names
//! - `WADDLE_HANDOFF_PID` / `WADDLE_HANDOFF_PPID`: current and previous pid
//! - `WADDLE_HANDOFF_SIGNAL`: signal number used by external control
//! - `WADDLE_HANDOFF_QUEUE_CAPACITY`: signal queue capacity (default: 2)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("waddle-handoff requires a Unix platform (Linux or macOS)");

mod codec;
mod config;
pub mod control;
mod dispatcher;
mod error;
mod fd;
pub mod launcher;
mod registry;
mod signals;

pub use codec::{
    decode, HandoffLists, FDS_VAR, NAMES_VAR, PID_VAR, PPID_VAR, SERVICES_VAR, SIGNAL_VAR,
};
pub use config::{DispatchConfig, DEFAULT_QUEUE_CAPACITY, QUEUE_CAPACITY_VAR};
pub use control::ControlTarget;
pub use dispatcher::{ChildSpawner, Dispatcher, Exit, PreSpawnHook, Spawner};
pub use error::{CloseFailure, CloseFailures, HandoffError, HookError};
pub use registry::{AsyncListener, Hook, HookKind, Hooks, IntoListener, Listener, Registry, Service};
pub use signals::{Signal, SignalQueue};
