//! Bounded, filtered delivery of events to registered handlers.
//!
//! Publishing never blocks the engine: events go through `try_send` into a
//! bounded queue and are rejected (and logged) when it is full. A fixed pool
//! of worker tasks drains the queue; a handler that errors or panics is logged
//! and skipped without affecting the other handlers or the worker.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::EventBus;
use crate::registry::HandlerRegistry;
use crate::types::EventEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Queued,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            capacity: 1024,
        }
    }
}

impl DispatcherConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

struct Shared {
    registry: HandlerRegistry,
    bus: EventBus,
    in_flight: AtomicUsize,
    idle: Notify,
    rejected: AtomicU64,
    handler_failures: AtomicU64,
}

impl Shared {
    fn settle_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct EventDispatcher {
    sender: mpsc::Sender<EventEnvelope>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EventDispatcher {
    /// Spawns the worker pool. Must be called inside a tokio runtime.
    pub fn start(registry: HandlerRegistry, config: DispatcherConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            registry,
            bus: EventBus::new(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            rejected: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        });
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    receiver.clone(),
                    shared.clone(),
                    shutdown.subscribe(),
                ))
            })
            .collect();

        Self {
            sender,
            shared,
            shutdown,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    pub fn publish(&self, envelope: EventEnvelope) -> PublishOutcome {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let projection = envelope.clone();
        match self.sender.try_send(envelope) {
            Ok(()) => {
                self.shared.bus.publish(projection);
                PublishOutcome::Queued
            }
            Err(err) => {
                self.shared.settle_one();
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                let reason = match err {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "dispatcher stopped",
                };
                warn!(
                    event_type = %projection.event_type(),
                    sequence = projection.sequence,
                    reason,
                    "Event rejected"
                );
                PublishOutcome::Rejected
            }
        }
    }

    /// Read-only stream of every accepted event.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.shared.bus.subscribe()
    }

    pub fn rejected_count(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }

    pub fn handler_failure_count(&self) -> u64 {
        self.shared.handler_failures.load(Ordering::Relaxed)
    }

    /// Waits until every accepted event has been handled.
    pub async fn flush(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Drains the queue and stops the workers.
    pub async fn shutdown(&self) {
        self.flush().await;
        let _ = self.shutdown.send(true);
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<EventEnvelope>>>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            if *shutdown.borrow() {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => None,
                    envelope = receiver.recv() => envelope,
                }
            }
        };
        let Some(envelope) = next else {
            debug!(worker, "Event worker stopping");
            return;
        };

        deliver(&shared, &envelope).await;
        shared.settle_one();
    }
}

async fn deliver(shared: &Shared, envelope: &EventEnvelope) {
    for subscription in shared.registry.matching(envelope) {
        let handled = AssertUnwindSafe(subscription.handler().handle(envelope))
            .catch_unwind()
            .await;
        match handled {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                shared.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    handler = subscription.name(),
                    event_type = %envelope.event_type(),
                    error = %err,
                    "Event handler failed"
                );
            }
            Err(_) => {
                shared.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    handler = subscription.name(),
                    event_type = %envelope.event_type(),
                    "Event handler panicked"
                );
            }
        }
    }
}
