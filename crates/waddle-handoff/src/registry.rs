//! Named listening sockets owned by this process generation.
//!
//! The registry is populated at startup (either by [`Registry::register`] or by
//! [`Registry::inherit`] in a handoff child) and then read by the dispatcher
//! and the codec. It is a `DashMap`, so registration from several init paths
//! is safe. Iteration always works on a snapshot taken when the call starts:
//! services registered mid-iteration are not visited, and hooks may use the
//! registry freely without deadlocking.

use std::fmt;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::codec::{HandoffLists, LIST_SEPARATOR};
use crate::error::{CloseFailure, CloseFailures, HandoffError, HookError};
use crate::fd;

/// A listening socket the registry can hand off.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A [`Listener`] converted for use with tokio.
#[derive(Debug)]
pub enum AsyncListener {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl Listener {
    /// Diagnostic name in the handoff format, e.g. `tcp:127.0.0.1:8080->`.
    ///
    /// A `,` in a socket path is written as `;` since the names travel
    /// comma-joined.
    pub fn display_name(&self) -> String {
        match self {
            Listener::Tcp(l) => match l.local_addr() {
                Ok(addr) => format!("tcp:{}->", addr),
                Err(_) => "tcp:->".to_string(),
            },
            Listener::Unix(l) => {
                let path = l
                    .local_addr()
                    .ok()
                    .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                    .unwrap_or_default()
                    .replace(LIST_SEPARATOR, ";");
                format!("unix:{}->", path)
            }
        }
    }

    /// Duplicate the listener (a new descriptor onto the same socket).
    pub fn try_clone(&self) -> io::Result<Listener> {
        Ok(match self {
            Listener::Tcp(l) => Listener::Tcp(l.try_clone()?),
            Listener::Unix(l) => Listener::Unix(l.try_clone()?),
        })
    }

    /// Switch to non-blocking mode and register with the current tokio runtime.
    pub fn into_async(self) -> io::Result<AsyncListener> {
        Ok(match self {
            Listener::Tcp(l) => {
                l.set_nonblocking(true)?;
                AsyncListener::Tcp(tokio::net::TcpListener::from_std(l)?)
            }
            Listener::Unix(l) => {
                l.set_nonblocking(true)?;
                AsyncListener::Unix(tokio::net::UnixListener::from_std(l)?)
            }
        })
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl IntoRawFd for Listener {
    fn into_raw_fd(self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.into_raw_fd(),
            Listener::Unix(l) => l.into_raw_fd(),
        }
    }
}

/// Listener types accepted by [`Registry::register`].
pub trait IntoListener {
    fn into_listener(self) -> io::Result<Listener>;
}

impl IntoListener for Listener {
    fn into_listener(self) -> io::Result<Listener> {
        Ok(self)
    }
}

impl IntoListener for TcpListener {
    fn into_listener(self) -> io::Result<Listener> {
        Ok(Listener::Tcp(self))
    }
}

impl IntoListener for UnixListener {
    fn into_listener(self) -> io::Result<Listener> {
        Ok(Listener::Unix(self))
    }
}

impl IntoListener for tokio::net::TcpListener {
    fn into_listener(self) -> io::Result<Listener> {
        self.into_std().map(Listener::Tcp)
    }
}

impl IntoListener for tokio::net::UnixListener {
    fn into_listener(self) -> io::Result<Listener> {
        self.into_std().map(Listener::Unix)
    }
}

/// Callback attached to a service.
pub type Hook = Arc<dyn Fn(&Service) -> Result<(), HookError> + Send + Sync>;

/// Which hook a signal triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// SIGHUP: reload configuration.
    Reload,
    /// SIGUSR1: reopen resources such as log files.
    Reopen,
    /// SIGQUIT: drain and clean up before exit.
    Quit,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Reload => write!(f, "reload"),
            HookKind::Reopen => write!(f, "reopen"),
            HookKind::Quit => write!(f, "quit"),
        }
    }
}

/// Per-service callbacks, all optional.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_reload: Option<Hook>,
    pub on_reopen: Option<Hook>,
    pub on_quit: Option<Hook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_reload<F>(mut self, f: F) -> Self
    where
        F: Fn(&Service) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_reload = Some(Arc::new(f));
        self
    }

    pub fn on_reopen<F>(mut self, f: F) -> Self
    where
        F: Fn(&Service) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_reopen = Some(Arc::new(f));
        self
    }

    pub fn on_quit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Service) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_quit = Some(Arc::new(f));
        self
    }

    fn get(&self, kind: HookKind) -> Option<Hook> {
        match kind {
            HookKind::Reload => self.on_reload.clone(),
            HookKind::Reopen => self.on_reopen.clone(),
            HookKind::Quit => self.on_quit.clone(),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_reload", &self.on_reload.is_some())
            .field("on_reopen", &self.on_reopen.is_some())
            .field("on_quit", &self.on_quit.is_some())
            .finish()
    }
}

/// One listening socket under management.
pub struct Service {
    name: String,
    display_name: String,
    descriptor: RawFd,
    listener: Mutex<Option<Listener>>,
    hooks: RwLock<Hooks>,
}

impl Service {
    pub(crate) fn new(name: String, display_name: String, listener: Listener) -> Self {
        Self {
            name,
            display_name,
            descriptor: listener.as_raw_fd(),
            listener: Mutex::new(Some(listener)),
            hooks: RwLock::new(Hooks::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Raw descriptor of the listener. Only meaningful while [`is_open`](Self::is_open).
    pub fn descriptor(&self) -> RawFd {
        self.descriptor
    }

    pub fn is_open(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replace this service's hooks.
    pub fn set_hooks(&self, hooks: Hooks) {
        *self.hooks.write().unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    pub fn hooks(&self) -> Hooks {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A duplicate of the listener for an accept loop. The registry keeps the original.
    pub fn try_clone_listener(&self) -> Result<Listener, HandoffError> {
        let guard = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        let listener = guard.as_ref().ok_or_else(|| HandoffError::ListenerClosed {
            name: self.name.clone(),
        })?;
        listener
            .try_clone()
            .map_err(|source| HandoffError::DescriptorUnavailable {
                name: self.name.clone(),
                source,
            })
    }

    /// Invoke the hook of the given kind, if one is attached.
    ///
    /// The hook is cloned out of the lock first, so it may call `set_hooks`.
    pub(crate) fn run_hook(&self, kind: HookKind) -> Option<Result<(), HookError>> {
        let hook = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)?;
        Some(hook(self))
    }

    /// Close the listener, reporting the `close(2)` error instead of swallowing it.
    pub(crate) fn close(&self) -> Result<(), HandoffError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| HandoffError::ListenerClosed {
                name: self.name.clone(),
            })?;
        let raw = listener.into_raw_fd();
        fd::close(raw).map_err(|source| HandoffError::CloseFd { fd: raw, source })?;
        debug!(name = %self.name, fd = raw, "Closed listener");
        Ok(())
    }

    /// Clear close-on-exec while holding the listener lock.
    fn prepare_handoff(&self) -> Result<(), HandoffError> {
        let guard = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            return Err(HandoffError::ListenerClosed {
                name: self.name.clone(),
            });
        }
        fd::clear_cloexec(self.descriptor).map_err(|source| HandoffError::Cloexec {
            name: self.name.clone(),
            fd: self.descriptor,
            source,
        })
    }

    #[cfg(test)]
    pub(crate) fn take_listener(&self) -> Option<Listener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("descriptor", &self.descriptor)
            .field("open", &self.is_open())
            .field("hooks", &self.hooks())
            .finish()
    }
}

/// Mapping from service name to [`Service`].
#[derive(Default)]
pub struct Registry {
    services: DashMap<String, Arc<Service>>,
    /// Held while exporting and handing off, and while closing, so the
    /// descriptors cannot be closed between the flag change and the spawn.
    handoff: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-bound listener under `name`.
    ///
    /// The raw descriptor is read, not duplicated. Registering a name twice
    /// fails with [`HandoffError::DuplicateService`] and drops the new listener.
    pub fn register<L: IntoListener>(
        &self,
        name: impl Into<String>,
        listener: L,
    ) -> Result<Arc<Service>, HandoffError> {
        let name = name.into();
        if name.is_empty() || name.contains(LIST_SEPARATOR) {
            return Err(HandoffError::InvalidServiceName { name });
        }
        let listener = listener
            .into_listener()
            .map_err(|source| HandoffError::DescriptorUnavailable {
                name: name.clone(),
                source,
            })?;
        let display_name = listener.display_name();
        let service = self.insert(Service::new(name, display_name, listener))?;
        info!(
            name = %service.name,
            listener = %service.display_name,
            fd = service.descriptor,
            "Registered listener"
        );
        Ok(service)
    }

    pub(crate) fn insert(&self, service: Service) -> Result<Arc<Service>, HandoffError> {
        match self.services.entry(service.name.clone()) {
            Entry::Occupied(entry) => Err(HandoffError::DuplicateService {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                let service = Arc::new(service);
                entry.insert(Arc::clone(&service));
                Ok(service)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Service names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.name.clone()).collect()
    }

    /// Attach hooks to a registered service.
    pub fn set_hooks(&self, name: &str, hooks: Hooks) -> Result<(), HandoffError> {
        let service = self.get(name).ok_or_else(|| HandoffError::UnknownService {
            name: name.to_string(),
        })?;
        service.set_hooks(hooks);
        Ok(())
    }

    /// Services at this instant, sorted by name.
    pub fn snapshot(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<Arc<Service>> = self
            .services
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Apply `f` to every service of a snapshot.
    pub fn for_each<F: FnMut(&Service)>(&self, mut f: F) {
        for service in self.snapshot() {
            f(&service);
        }
    }

    /// Close one service's listener.
    pub fn close(&self, name: &str) -> Result<(), HandoffError> {
        let service = self.get(name).ok_or_else(|| HandoffError::UnknownService {
            name: name.to_string(),
        })?;
        let _guard = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
        service.close()
    }

    /// Close every listener. All are attempted; every failure is reported.
    pub fn close_all(&self) -> Result<(), HandoffError> {
        let _guard = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
        let mut failures = CloseFailures::default();
        for service in self.snapshot() {
            if let Err(error) = service.close() {
                failures.0.push(CloseFailure {
                    name: service.name.clone(),
                    error,
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(HandoffError::Close(failures))
        }
    }

    /// Clear close-on-exec on every descriptor and return the parallel lists.
    pub fn export(&self) -> Result<HandoffLists, HandoffError> {
        let _guard = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
        self.export_locked()
    }

    /// Export, then run `f` before any listener can be closed.
    pub(crate) fn with_export<T, F>(&self, f: F) -> Result<T, HandoffError>
    where
        F: FnOnce(&HandoffLists) -> Result<T, HandoffError>,
    {
        let _guard = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
        let lists = self.export_locked()?;
        f(&lists)
    }

    fn export_locked(&self) -> Result<HandoffLists, HandoffError> {
        let mut lists = HandoffLists::default();
        for service in self.snapshot() {
            service.prepare_handoff()?;
            lists.push(
                service.descriptor,
                service.name.clone(),
                service.display_name.clone(),
            );
        }
        debug!(count = lists.len(), "Exported listeners for handoff");
        Ok(lists)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.snapshot())
            .finish()
    }
}
