//! Connectivity tracking and sync triggers.
//!
//! The platform reports connectivity through [`NetworkMonitor::set_online`].
//! Consumers either watch the raw state or pull debounced
//! [`TriggerReason`]s from a [`TriggerStream`].

use crate::config::NetworkConfig;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Why a sync should run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerReason {
    /// Connectivity came back and stayed up for the stability window.
    Reconnected,
    /// The periodic interval elapsed while online.
    Periodic,
    /// Someone called [`NetworkMonitor::request_sync`].
    Requested,
}

/// Holds the current connectivity state.
#[derive(Debug)]
pub struct NetworkMonitor {
    config: NetworkConfig,
    online_tx: watch::Sender<bool>,
    request_tx: watch::Sender<u64>,
}

impl NetworkMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(config: NetworkConfig, online: bool) -> Self {
        let (online_tx, _) = watch::channel(online);
        let (request_tx, _) = watch::channel(0);
        Self {
            config,
            online_tx,
            request_tx,
        }
    }

    /// Returns the monitor configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Records a connectivity change. Returns true if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online_tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "connectivity changed");
        }
        changed
    }

    /// Returns the current connectivity state.
    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Subscribes to raw connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    /// Asks every trigger stream for an immediate sync.
    pub fn request_sync(&self) {
        self.request_tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Creates a stream of sync triggers.
    ///
    /// A stream created while online produces a `Reconnected` trigger once
    /// the stability window has passed.
    pub fn triggers(&self) -> TriggerStream {
        let mut online_rx = self.online_tx.subscribe();
        let online = *online_rx.borrow_and_update();
        let request_rx = self.request_tx.subscribe();

        let mut stream = TriggerStream {
            config: self.config.clone(),
            online_rx,
            request_rx,
            online: false,
            reconnect_at: None,
            next_poll: None,
        };
        stream.observe(online);
        stream
    }
}

/// Debounced sync triggers from a [`NetworkMonitor`].
#[derive(Debug)]
pub struct TriggerStream {
    config: NetworkConfig,
    online_rx: watch::Receiver<bool>,
    request_rx: watch::Receiver<u64>,
    online: bool,
    reconnect_at: Option<Instant>,
    next_poll: Option<Instant>,
}

impl TriggerStream {
    /// Waits for the next trigger. Returns `None` once the monitor is gone.
    pub async fn next(&mut self) -> Option<TriggerReason> {
        loop {
            let reconnect_at = self.reconnect_at;
            let next_poll = if self.online { self.next_poll } else { None };

            tokio::select! {
                changed = self.online_rx.changed() => {
                    changed.ok()?;
                    let online = *self.online_rx.borrow_and_update();
                    self.observe(online);
                }
                changed = self.request_rx.changed() => {
                    changed.ok()?;
                    return Some(TriggerReason::Requested);
                }
                () = sleep_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.arm_poll();
                    return Some(TriggerReason::Reconnected);
                }
                () = sleep_opt(next_poll) => {
                    self.arm_poll();
                    return Some(TriggerReason::Periodic);
                }
            }
        }
    }

    /// Returns the connectivity state last seen by this stream.
    pub fn is_online(&self) -> bool {
        self.online
    }

    fn observe(&mut self, online: bool) {
        if online && !self.online {
            self.reconnect_at = Some(Instant::now() + self.config.stable_for);
        } else if !online {
            // A drop inside the window cancels the pending reconnect
            self.reconnect_at = None;
            self.next_poll = None;
        }
        self.online = online;
    }

    fn arm_poll(&mut self) {
        self.next_poll = self.config.poll_interval.map(|every| Instant::now() + every);
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
