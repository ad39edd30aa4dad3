//! Signal-driven restart loop.
//!
//! | Signal  | Effect                                   | Returns |
//! |---------|------------------------------------------|---------|
//! | SIGHUP  | reload hooks                             | no      |
//! | SIGINT  | none                                     | yes     |
//! | SIGQUIT | quit hooks                               | yes     |
//! | SIGTERM | none                                     | yes     |
//! | SIGUSR1 | reopen hooks                             | no      |
//! | SIGUSR2 | first: spawn replacement; later: retire  | later   |
//!
//! The restart trigger is a two-step handoff. The first SIGUSR2 spawns a
//! replacement that inherits the listeners while this process keeps serving.
//! Any later SIGUSR2 (typically sent by the replacement once it is ready)
//! returns from the loop without spawning again.
//!
//! Hooks run one service at a time on the loop's task. A hook that hangs
//! holds up every queued signal; no timeout is applied.

use std::fmt;
use std::process::Child;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::DispatchConfig;
use crate::error::HandoffError;
use crate::launcher;
use crate::registry::{HookKind, Registry};
use crate::signals::{Signal, SignalQueue};

/// Starts the replacement process for a restart trigger.
pub trait Spawner: Send {
    /// Spawn the next generation and return its pid.
    fn spawn(&mut self, registry: &Registry) -> Result<u32, HandoffError>;
}

/// Spawns the current binary with [`launcher::spawn_child`].
#[derive(Debug)]
pub struct ChildSpawner {
    control_signal: Signal,
    children: Vec<Child>,
}

impl ChildSpawner {
    pub fn new(control_signal: Signal) -> Self {
        Self {
            control_signal,
            children: Vec::new(),
        }
    }
}

impl Spawner for ChildSpawner {
    fn spawn(&mut self, registry: &Registry) -> Result<u32, HandoffError> {
        let child = launcher::spawn_child(registry, self.control_signal)?;
        let pid = child.id();
        self.children.push(child);
        Ok(pid)
    }
}

/// Callback run right before the replacement is spawned.
pub type PreSpawnHook = Box<dyn FnMut() + Send>;

/// How the loop ended.
#[derive(Debug)]
pub struct Exit {
    /// The signal that ended the loop.
    pub signal: Signal,
    /// Set when spawning the replacement failed.
    pub error: Option<HandoffError>,
}

impl Exit {
    fn new(signal: Signal) -> Self {
        Self {
            signal,
            error: None,
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "{} ({})", self.signal, error),
            None => write!(f, "{}", self.signal),
        }
    }
}

/// One process generation's signal loop.
pub struct Dispatcher<S = ChildSpawner> {
    registry: Arc<Registry>,
    config: DispatchConfig,
    pre_spawn: Option<PreSpawnHook>,
    spawner: S,
    spawned_replacement: bool,
}

impl Dispatcher<ChildSpawner> {
    pub fn new(registry: Arc<Registry>, config: DispatchConfig) -> Self {
        Self {
            registry,
            config,
            pre_spawn: None,
            spawner: ChildSpawner::new(config.control_signal),
            spawned_replacement: false,
        }
    }
}

impl<S: Spawner> Dispatcher<S> {
    /// Use a different way of starting the replacement.
    pub fn with_spawner<T: Spawner>(self, spawner: T) -> Dispatcher<T> {
        Dispatcher {
            registry: self.registry,
            config: self.config,
            pre_spawn: self.pre_spawn,
            spawner,
            spawned_replacement: self.spawned_replacement,
        }
    }

    /// Run `hook` before spawning the replacement on the first restart trigger.
    pub fn pre_spawn<F>(mut self, hook: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.pre_spawn = Some(Box::new(hook));
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether a restart trigger already spawned a replacement.
    pub fn spawned_replacement(&self) -> bool {
        self.spawned_replacement
    }

    /// Install OS signal handlers and run until a terminal signal.
    pub async fn wait(self) -> Result<Exit, HandoffError> {
        let signals = SignalQueue::listen(self.config.queue_capacity)?;
        Ok(self.run(signals).await)
    }

    /// Consume signals from `signals` until a terminal one arrives.
    ///
    /// If the queue closes first, returns `SIGTERM` with
    /// [`HandoffError::SignalQueueClosed`].
    pub async fn run(mut self, mut signals: SignalQueue) -> Exit {
        info!(
            services = ?self.registry.names(),
            pid = std::process::id(),
            "Waiting for signals"
        );
        while let Some(signal) = signals.recv().await {
            if let Some(exit) = self.handle(signal) {
                info!(exit = %exit, "Signal loop finished");
                return exit;
            }
        }
        warn!("Signal queue closed");
        Exit {
            signal: Signal::Terminate,
            error: Some(HandoffError::SignalQueueClosed),
        }
    }

    /// React to one signal. Returns `Some` when the loop must end.
    pub fn handle(&mut self, signal: Signal) -> Option<Exit> {
        info!(signal = %signal, "Received signal");
        match signal {
            Signal::Hangup => {
                self.run_hooks(HookKind::Reload);
                None
            }
            Signal::Interrupt => Some(Exit::new(signal)),
            Signal::Quit => {
                self.run_hooks(HookKind::Quit);
                Some(Exit::new(signal))
            }
            Signal::Terminate => Some(Exit::new(signal)),
            Signal::User1 => {
                self.run_hooks(HookKind::Reopen);
                None
            }
            Signal::User2 => self.restart_trigger(),
        }
    }

    fn restart_trigger(&mut self) -> Option<Exit> {
        if self.spawned_replacement {
            info!("Replacement already spawned, retiring this process");
            return Some(Exit::new(Signal::User2));
        }

        if let Some(hook) = self.pre_spawn.as_mut() {
            hook();
        }
        self.spawned_replacement = true;

        match self.spawner.spawn(&self.registry) {
            Ok(pid) => {
                info!(child_pid = pid, "Replacement spawned, still serving until retired");
                None
            }
            Err(error) => {
                error!(error = %error, "Failed to spawn replacement");
                Some(Exit {
                    signal: Signal::User2,
                    error: Some(error),
                })
            }
        }
    }

    /// Best effort: a failing hook is logged and the next service still runs.
    fn run_hooks(&self, kind: HookKind) {
        self.registry.for_each(|service| {
            if let Some(Err(error)) = service.run_hook(kind) {
                warn!(
                    service = %service.name(),
                    hook = %kind,
                    error = %error,
                    "Service hook failed"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Hooks;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Counts spawns and reports each one on a channel.
    struct RecordingSpawner {
        spawns: Arc<AtomicUsize>,
        notify: Option<mpsc::UnboundedSender<()>>,
        fail: bool,
    }

    impl RecordingSpawner {
        fn new(spawns: Arc<AtomicUsize>) -> Self {
            Self {
                spawns,
                notify: None,
                fail: false,
            }
        }
    }

    impl Spawner for RecordingSpawner {
        fn spawn(&mut self, _registry: &Registry) -> Result<u32, HandoffError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            if let Some(notify) = &self.notify {
                let _ = notify.send(());
            }
            if self.fail {
                return Err(HandoffError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "not allowed",
                )));
            }
            Ok(4242)
        }
    }

    fn counting_hook(
        counter: &Arc<AtomicUsize>,
    ) -> impl Fn(&crate::Service) -> Result<(), crate::HookError> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_: &crate::Service| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry_with(names: &[&str]) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        for name in names {
            registry
                .register(*name, TcpListener::bind("127.0.0.1:0").unwrap())
                .unwrap();
        }
        registry
    }

    fn dispatcher(
        registry: Arc<Registry>,
        spawns: &Arc<AtomicUsize>,
    ) -> Dispatcher<RecordingSpawner> {
        Dispatcher::new(registry, DispatchConfig::default())
            .with_spawner(RecordingSpawner::new(Arc::clone(spawns)))
    }

    #[test]
    fn test_restart_trigger_spawns_once_then_retires() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let pre_spawn = Arc::new(AtomicUsize::new(0));
        let pre = Arc::clone(&pre_spawn);
        let mut dispatcher = dispatcher(registry_with(&["http"]), &spawns).pre_spawn(move || {
            pre.fetch_add(1, Ordering::SeqCst);
        });

        assert!(dispatcher.handle(Signal::User2).is_none());
        assert!(dispatcher.spawned_replacement());
        assert_eq!(spawns.load(Ordering::SeqCst), 1);
        assert_eq!(pre_spawn.load(Ordering::SeqCst), 1);

        let exit = dispatcher.handle(Signal::User2).unwrap();
        assert_eq!(exit.signal, Signal::User2);
        assert!(exit.error.is_none());
        assert_eq!(spawns.load(Ordering::SeqCst), 1);
        assert_eq!(pre_spawn.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_failure_is_terminal() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let mut spawner = RecordingSpawner::new(Arc::clone(&spawns));
        spawner.fail = true;
        let mut dispatcher = Dispatcher::new(registry_with(&["http"]), DispatchConfig::default())
            .with_spawner(spawner);

        let exit = dispatcher.handle(Signal::User2).unwrap();
        assert_eq!(exit.signal, Signal::User2);
        assert!(matches!(exit.error, Some(HandoffError::Spawn(_))));
        assert_eq!(spawns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_and_terminate_skip_hooks() {
        for signal in [Signal::Interrupt, Signal::Terminate] {
            for already_spawned in [false, true] {
                let spawns = Arc::new(AtomicUsize::new(0));
                let quits = Arc::new(AtomicUsize::new(0));
                let registry = registry_with(&["http"]);
                registry
                    .set_hooks("http", Hooks::new().on_quit(counting_hook(&quits)))
                    .unwrap();
                let mut dispatcher = dispatcher(registry, &spawns);
                if already_spawned {
                    assert!(dispatcher.handle(Signal::User2).is_none());
                }

                let exit = dispatcher.handle(signal).unwrap();
                assert_eq!(exit.signal, signal);
                assert!(exit.error.is_none());
                assert_eq!(quits.load(Ordering::SeqCst), 0);
            }
        }
    }

    #[test]
    fn test_quit_runs_hooks_then_exits() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let quits = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(&["a", "b", "c"]);
        for name in ["a", "b", "c"] {
            registry
                .set_hooks(name, Hooks::new().on_quit(counting_hook(&quits)))
                .unwrap();
        }

        let exit = dispatcher(registry, &spawns).handle(Signal::Quit).unwrap();
        assert_eq!(exit.signal, Signal::Quit);
        assert_eq!(quits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failing_hook_does_not_stop_others() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let reloads = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(&["a", "b", "c"]);
        for name in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            let reloads = Arc::clone(&reloads);
            registry
                .set_hooks(
                    name,
                    Hooks::new().on_reload(move |service| {
                        order.lock().unwrap().push(service.name().to_string());
                        if service.name() == "a" {
                            return Err("config parse error".into());
                        }
                        reloads.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .unwrap();
        }

        let mut dispatcher = dispatcher(registry, &spawns);
        assert!(dispatcher.handle(Signal::Hangup).is_none());
        assert_eq!(reloads.load(Ordering::SeqCst), 2);
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_reopen_runs_reopen_hooks_only() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let reopens = Arc::new(AtomicUsize::new(0));
        let reloads = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(&["http"]);
        registry
            .set_hooks(
                "http",
                Hooks::new()
                    .on_reopen(counting_hook(&reopens))
                    .on_reload(counting_hook(&reloads)),
            )
            .unwrap();

        let mut dispatcher = dispatcher(registry, &spawns);
        assert!(dispatcher.handle(Signal::User1).is_none());
        assert!(dispatcher.handle(Signal::User1).is_none());
        assert_eq!(reopens.load(Ordering::SeqCst), 2);
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    /// The async loop keeps running after the first trigger and returns on the second.
    #[tokio::test]
    async fn test_run_double_restart_trigger() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let mut spawner = RecordingSpawner::new(Arc::clone(&spawns));
        spawner.notify = Some(notify_tx);

        let dispatcher = Dispatcher::new(registry_with(&["http"]), DispatchConfig::default())
            .with_spawner(spawner);
        let (sender, queue) = SignalQueue::channel(2);
        let handle = tokio::spawn(dispatcher.run(queue));

        sender.send(Signal::User2).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        sender.send(Signal::User2).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.signal, Signal::User2);
        assert!(exit.error.is_none());
        assert_eq!(spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_reports_closed_queue() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let (sender, queue) = SignalQueue::channel(2);
        sender.send(Signal::Hangup).await.unwrap();
        drop(sender);

        let exit = dispatcher(registry_with(&["http"]), &spawns).run(queue).await;
        assert_eq!(exit.signal, Signal::Terminate);
        assert!(matches!(exit.error, Some(HandoffError::SignalQueueClosed)));
    }
}
