//! Background worker that turns sync triggers into sync cycles.
//!
//! Triggers are messages on an unbounded channel with a single consumer.
//! Triggers that pile up while a cycle runs are drained together, so a burst
//! costs one extra cycle at most.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::orchestrator::{SkipReason, SyncOrchestrator, SyncOutcome};
use crate::types::SyncReport;

/// Why a sync cycle was requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Startup,
    Reconnected,
    Enqueued,
    Manual,
}

/// Cheap handle for posting triggers.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncTrigger>,
}

impl SyncHandle {
    /// Returns `false` once the worker has stopped.
    pub fn request(&self, trigger: SyncTrigger) -> bool {
        self.tx.send(trigger).is_ok()
    }
}

pub fn trigger_channel() -> (SyncHandle, mpsc::UnboundedReceiver<SyncTrigger>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SyncHandle { tx }, rx)
}

/// Emitted after every handled trigger batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Completed {
        trigger: SyncTrigger,
        report: SyncReport,
    },
    Skipped {
        trigger: SyncTrigger,
        reason: SkipReason,
    },
    Failed {
        trigger: SyncTrigger,
        error: String,
    },
}

pub struct SyncWorker {
    orchestrator: Arc<SyncOrchestrator>,
    triggers: mpsc::UnboundedReceiver<SyncTrigger>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: Arc<Notify>,
}

impl SyncWorker {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> (Self, SyncHandle) {
        let (handle, triggers) = trigger_channel();
        (Self::with_receiver(orchestrator, triggers), handle)
    }

    /// Build around an existing channel, for when the handle is needed first.
    pub fn with_receiver(
        orchestrator: Arc<SyncOrchestrator>,
        triggers: mpsc::UnboundedReceiver<SyncTrigger>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            orchestrator,
            triggers,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Spawn the worker loop.
    ///
    /// Runs until shutdown is requested or every [`SyncHandle`] is dropped.
    pub fn start(self) -> SyncWorkerHandle {
        let shutdown = self.shutdown.clone();
        let events = self.events.clone();
        let SyncWorker {
            orchestrator,
            mut triggers,
            events: sender,
            shutdown: signal,
        } = self;

        let task = tokio::spawn(async move {
            tracing::info!("Background sync worker started");

            loop {
                tokio::select! {
                    _ = signal.notified() => {
                        tracing::info!("Background sync worker received shutdown signal");
                        break;
                    }
                    trigger = triggers.recv() => {
                        let Some(trigger) = trigger else {
                            tracing::debug!("all sync handles dropped");
                            break;
                        };

                        let mut coalesced = 0usize;
                        while triggers.try_recv().is_ok() {
                            coalesced += 1;
                        }
                        tracing::debug!(?trigger, coalesced, "sync requested");

                        let event = run_isolated(&orchestrator, trigger).await;
                        // No subscribers is fine.
                        let _ = sender.send(event);
                    }
                }
            }

            tracing::info!("Background sync worker stopped");
        });

        SyncWorkerHandle {
            shutdown,
            events,
            task,
        }
    }
}

/// Run a cycle on its own task so a panic is reported instead of killing the
/// worker. The sync guard clears the lock during unwinding.
async fn run_isolated(orchestrator: &Arc<SyncOrchestrator>, trigger: SyncTrigger) -> SyncEvent {
    let orchestrator = orchestrator.clone();
    match tokio::spawn(async move { orchestrator.run_cycle().await }).await {
        Ok(SyncOutcome::Completed(report)) => SyncEvent::Completed { trigger, report },
        Ok(SyncOutcome::Skipped(reason)) => SyncEvent::Skipped { trigger, reason },
        Err(e) => {
            tracing::error!(?trigger, error = %e, "sync cycle aborted");
            SyncEvent::Failed {
                trigger,
                error: e.to_string(),
            }
        }
    }
}

pub struct SyncWorkerHandle {
    shutdown: Arc<Notify>,
    events: broadcast::Sender<SyncEvent>,
    task: JoinHandle<()>,
}

impl SyncWorkerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Request graceful shutdown and wait for the current cycle to finish.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "sync worker task failed");
        }
    }
}
