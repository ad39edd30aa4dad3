//! OS signals understood by the dispatcher, and the queue feeding it.
//!
//! A background task turns `tokio::signal::unix` streams into [`Signal`]
//! values on a bounded channel. The task stops when the [`SignalQueue`] is
//! dropped.

use std::fmt;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::error::HandoffError;

/// The signals the dispatcher reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGHUP: reload configuration.
    Hangup,
    /// SIGINT: exit now.
    Interrupt,
    /// SIGQUIT: graceful exit after quit hooks.
    Quit,
    /// SIGTERM: exit now, no hooks.
    Terminate,
    /// SIGUSR1: reopen resources (log files).
    User1,
    /// SIGUSR2: restart trigger.
    User2,
}

impl Signal {
    pub const ALL: [Signal; 6] = [
        Signal::Hangup,
        Signal::Interrupt,
        Signal::Quit,
        Signal::Terminate,
        Signal::User1,
        Signal::User2,
    ];

    /// The OS signal number.
    pub fn as_raw(self) -> i32 {
        match self {
            Signal::Hangup => libc::SIGHUP,
            Signal::Interrupt => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Terminate => libc::SIGTERM,
            Signal::User1 => libc::SIGUSR1,
            Signal::User2 => libc::SIGUSR2,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_raw() == raw)
    }

    fn kind(self) -> SignalKind {
        SignalKind::from_raw(self.as_raw())
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Hangup => "SIGHUP",
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Terminate => "SIGTERM",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
        };
        f.write_str(name)
    }
}

/// Bounded queue of received signals, consumed by the dispatcher.
pub struct SignalQueue {
    receiver: mpsc::Receiver<Signal>,
    _stop: DropGuard,
}

impl SignalQueue {
    /// A queue fed by hand instead of by the OS.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Signal>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queue = Self {
            receiver,
            _stop: CancellationToken::new().drop_guard(),
        };
        (sender, queue)
    }

    /// Install handlers for every [`Signal`] and forward them into a queue.
    ///
    /// Must be called inside a tokio runtime. The handlers stay installed
    /// for the life of the process; the forwarding task ends with the queue.
    pub fn listen(capacity: usize) -> Result<Self, HandoffError> {
        let mut hangup = signal(Signal::Hangup.kind()).map_err(HandoffError::SignalInstall)?;
        let mut interrupt =
            signal(Signal::Interrupt.kind()).map_err(HandoffError::SignalInstall)?;
        let mut quit = signal(Signal::Quit.kind()).map_err(HandoffError::SignalInstall)?;
        let mut terminate =
            signal(Signal::Terminate.kind()).map_err(HandoffError::SignalInstall)?;
        let mut user1 = signal(Signal::User1.kind()).map_err(HandoffError::SignalInstall)?;
        let mut user2 = signal(Signal::User2.kind()).map_err(HandoffError::SignalInstall)?;

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let token = CancellationToken::new();
        let stop = token.clone();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = stop.cancelled() => break,
                    Some(()) = hangup.recv() => Signal::Hangup,
                    Some(()) = interrupt.recv() => Signal::Interrupt,
                    Some(()) = quit.recv() => Signal::Quit,
                    Some(()) = terminate.recv() => Signal::Terminate,
                    Some(()) = user1.recv() => Signal::User1,
                    Some(()) = user2.recv() => Signal::User2,
                    else => break,
                };
                debug!(signal = %received, "Queueing signal");
                if sender.send(received).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            receiver,
            _stop: token.drop_guard(),
        })
    }

    /// Next signal, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.receiver.recv().await
    }
}
