//! Starting the next process generation.
//!
//! Two strategies, both carrying the registry through the environment:
//!
//! - [`replace_in_place`]: `execve` the current binary over this process.
//!   The descriptor table survives as is.
//! - [`spawn_child`]: start the current binary as a child that inherits stdio
//!   and every registered descriptor, while this process keeps serving.
//!
//! `Registry::export` clears close-on-exec first; the registry stays locked
//! against `close` until the new image has the descriptors.

use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{debug, info};

use crate::codec::{HandoffLists, PID_VAR, PPID_VAR, SIGNAL_VAR};
use crate::error::HandoffError;
use crate::registry::Registry;
use crate::signals::Signal;

/// Replace this process image with a fresh copy of the current binary.
///
/// Returns only on failure. Refuses to run in the child spawned by the same
/// restart (the recorded previous pid is our parent), which would otherwise
/// loop forever re-executing itself.
pub fn replace_in_place(registry: &Registry, control_signal: Signal) -> HandoffError {
    if let Err(error) = ensure_not_spawned_child(|key| std::env::var(key).ok(), parent_pid()) {
        return error;
    }

    let exe = match current_exe() {
        Ok(exe) => exe,
        Err(error) => return error,
    };
    let args: Vec<OsString> = std::env::args_os().collect();

    let result = registry.with_export(|lists| {
        info!(
            exe = %exe.display(),
            listener_count = lists.len(),
            fds = ?lists.descriptors,
            names = ?lists.names,
            "Re-executing in place"
        );
        let env = exec_env(std::env::vars_os(), lists, control_signal);
        Ok(exec_with_env(&exe, &args, &env))
    });

    match result {
        Ok(error) | Err(error) => error,
    }
}

/// Spawn the current binary as a child that takes over the registry.
///
/// On success this process records the child as the current pid and itself
/// as the previous pid, so external control from here targets the child.
///
/// That bookkeeping goes through `std::env::set_var`. Rust's own env access
/// is locked, but C code reading the environment on another thread (e.g.
/// `getaddrinfo`, `localtime`) is not synchronised with it. The child itself
/// gets its environment through `Command`, never through `set_var`.
pub fn spawn_child(registry: &Registry, control_signal: Signal) -> Result<Child, HandoffError> {
    let exe = current_exe()?;
    let cwd = std::env::current_dir().map_err(HandoffError::Spawn)?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    let pid = std::process::id();

    let child = registry.with_export(|lists| {
        let mut command = child_command(&exe, &args, &cwd, lists, pid, control_signal);
        debug!(
            exe = %exe.display(),
            fds = ?lists.descriptors,
            names = ?lists.names,
            "Spawning replacement"
        );
        command.spawn().map_err(HandoffError::Spawn)
    })?;

    std::env::set_var(PID_VAR, child.id().to_string());
    std::env::set_var(PPID_VAR, pid.to_string());
    std::env::set_var(SIGNAL_VAR, control_signal.as_raw().to_string());

    info!(
        child_pid = child.id(),
        parent_pid = pid,
        listener_count = registry.len(),
        "Spawned replacement process"
    );
    Ok(child)
}

fn current_exe() -> Result<PathBuf, HandoffError> {
    std::env::current_exe().map_err(HandoffError::ProcessLookup)
}

fn parent_pid() -> i32 {
    unsafe { libc::getppid() }
}

/// Fail if the recorded previous pid is our actual parent.
fn ensure_not_spawned_child<F>(lookup: F, actual_parent: i32) -> Result<(), HandoffError>
where
    F: Fn(&str) -> Option<String>,
{
    let recorded = lookup(PPID_VAR).and_then(|v| v.trim().parse::<i32>().ok());
    match recorded {
        Some(parent_pid) if parent_pid == actual_parent => {
            Err(HandoffError::ReplaceFromChild { parent_pid })
        }
        _ => Ok(()),
    }
}

/// The child's command line: same binary, arguments and directory, stdio
/// inherited, handoff variables set, current pid cleared.
///
/// Registered descriptors are inherited at their own numbers because
/// `export` cleared close-on-exec on them.
fn child_command(
    exe: &Path,
    args: &[OsString],
    cwd: &Path,
    lists: &HandoffLists,
    pid: u32,
    control_signal: Signal,
) -> Command {
    let mut command = Command::new(exe);
    command
        .args(args)
        .current_dir(cwd)
        .envs(lists.encode())
        .env(PPID_VAR, pid.to_string())
        .env(SIGNAL_VAR, control_signal.as_raw().to_string())
        .env_remove(PID_VAR)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    command
}

/// Current environment plus the handoff entries.
fn exec_env<I>(
    base: I,
    lists: &HandoffLists,
    control_signal: Signal,
) -> HashMap<OsString, OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: HashMap<OsString, OsString> = base.into_iter().collect();
    for (key, value) in lists.encode() {
        env.insert(key.into(), value.into());
    }
    env.insert(SIGNAL_VAR.into(), control_signal.as_raw().to_string().into());
    env
}

fn c_string(value: &OsStr, exe: &Path) -> Result<CString, HandoffError> {
    CString::new(value.as_bytes()).map_err(|_| HandoffError::Exec {
        exe: exe.display().to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "argument contains a NUL byte"),
    })
}

/// Execute a new process image with an explicit environment.
///
/// Passing the environment to `execve` avoids mutating our own environment
/// while other threads may read it. Only returns on failure.
fn exec_with_env(
    exe: &Path,
    args: &[OsString],
    env: &HashMap<OsString, OsString>,
) -> HandoffError {
    let build = || -> Result<(CString, Vec<CString>, Vec<CString>), HandoffError> {
        let c_exe = c_string(exe.as_os_str(), exe)?;
        let c_args = args
            .iter()
            .map(|a| c_string(a, exe))
            .collect::<Result<Vec<_>, _>>()?;
        let c_env = env
            .iter()
            .map(|(k, v)| {
                let mut entry = k.clone();
                entry.push("=");
                entry.push(v);
                c_string(&entry, exe)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((c_exe, c_args, c_env))
    };
    let (c_exe, c_args, c_env) = match build() {
        Ok(parts) => parts,
        Err(error) => return error,
    };

    let c_arg_ptrs: Vec<*const libc::c_char> = c_args
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let c_env_ptrs: Vec<*const libc::c_char> = c_env
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    unsafe {
        libc::execve(c_exe.as_ptr(), c_arg_ptrs.as_ptr(), c_env_ptrs.as_ptr());
    }

    // execve only returns on error
    HandoffError::Exec {
        exe: exe.display().to_string(),
        source: io::Error::last_os_error(),
    }
}
