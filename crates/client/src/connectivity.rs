//! Connectivity signal and the sync lock.
//!
//! [`SyncContext`] is the single source of truth for "are we online" and "is
//! a sync cycle running". It is a cheap handle; every component receives a
//! clone instead of reaching for process-wide state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::MIN_PROBE_INTERVAL;
use crate::sync_worker::{SyncHandle, SyncTrigger};
use crate::transport::Transport;
use crate::types::ConnectivityState;

/// Result of updating the online flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    WentOnline,
    WentOffline,
}

#[derive(Debug)]
struct Inner {
    online: watch::Sender<bool>,
    syncing: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct SyncContext {
    inner: Arc<Inner>,
}

impl SyncContext {
    pub fn new(online: bool) -> Self {
        let (online, _) = watch::channel(online);
        Self {
            inner: Arc::new(Inner {
                online,
                syncing: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    pub fn set_online(&self, online: bool) -> Transition {
        let previous = self.inner.online.send_replace(online);
        match (previous, online) {
            (false, true) => {
                tracing::info!("connectivity restored");
                Transition::WentOnline
            }
            (true, false) => {
                tracing::warn!("connectivity lost, switching to offline mode");
                Transition::WentOffline
            }
            _ => Transition::Unchanged,
        }
    }

    /// Watch online/offline transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    /// Take the sync lock. `None` while another cycle holds it.
    pub fn try_begin_sync(&self) -> Option<SyncGuard> {
        self.inner
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                context: self.clone(),
            })
    }

    pub fn state(&self) -> ConnectivityState {
        ConnectivityState {
            online: self.is_online(),
            syncing: self.is_syncing(),
        }
    }
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Holds the sync lock; released on drop, including during unwinding.
#[derive(Debug)]
pub struct SyncGuard {
    context: SyncContext,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.context.inner.syncing.store(false, Ordering::Release);
    }
}

/// Periodically probes the API and keeps the online flag current.
///
/// A false -> true transition posts a [`SyncTrigger::Reconnected`].
pub struct ConnectivityMonitor {
    transport: Arc<dyn Transport>,
    context: SyncContext,
    trigger: SyncHandle,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl ConnectivityMonitor {
    pub fn new(
        transport: Arc<dyn Transport>,
        context: SyncContext,
        trigger: SyncHandle,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            context,
            trigger,
            interval: interval.max(MIN_PROBE_INTERVAL),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Probe once and apply the result.
    pub async fn check_now(&self) -> Transition {
        let online = self.transport.probe().await;
        let transition = self.context.set_online(online);
        if transition == Transition::WentOnline {
            self.trigger.request(SyncTrigger::Reconnected);
        }
        transition
    }

    /// Spawn the probe loop. The first probe runs immediately.
    pub fn start(self) -> MonitorHandle {
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            tracing::info!(interval = ?self.interval, "connectivity monitor started");

            let mut probe_interval = tokio::time::interval(self.interval);
            probe_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        tracing::info!("connectivity monitor received shutdown signal");
                        break;
                    }
                    _ = probe_interval.tick() => {
                        let transition = self.check_now().await;
                        tracing::debug!(online = self.context.is_online(), ?transition, "connectivity probed");
                    }
                }
            }

            tracing::info!("connectivity monitor stopped");
        });

        MonitorHandle { shutdown, task }
    }
}

pub struct MonitorHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "connectivity monitor task failed");
        }
    }
}
