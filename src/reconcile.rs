//! Polls the accrual provider for uploaded orders and persists what it says.
//!
//! Orders are queued on a bounded channel and drained by a fixed pool of
//! workers. Every worker shares one [`CooldownGate`], so a rate-limit response
//! seen by any of them pauses all provider traffic.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accrual::{AccrualOutcome, AccrualProvider};
use crate::cooldown::CooldownGate;
use crate::store::OrderStore;
use crate::types::OrderStatus;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub workers: usize,
    pub queue: usize,
    /// Rate-limited attempts allowed per dispatch before giving up.
    pub max_attempts: u32,
    /// Extra pause after a rate-limit response, on top of the gate.
    pub retry_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue: 1024,
            max_attempts: 10,
            retry_delay: Duration::from_secs(60),
        }
    }
}

/// How one reconciliation attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Provider answered and the order row changed.
    Updated(OrderStatus),
    /// Provider answered but the row was already terminal or missing.
    Unchanged,
    /// Provider does not know the order yet.
    NotYetKnown,
    /// Left for a later trigger: transport or persistence failure.
    Failed,
    /// Rate-limited on every allowed attempt.
    GaveUp,
    /// Shutdown arrived first.
    Cancelled,
}

/// Everything one reconciliation needs. Cheap to clone.
#[derive(Clone)]
pub struct ReconcileContext {
    pub provider: Arc<dyn AccrualProvider>,
    pub orders: Arc<dyn OrderStore>,
    pub gate: Arc<CooldownGate>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl ReconcileContext {
    /// Runs one reconciliation of `number` to completion.
    pub async fn reconcile(&self, number: &str, shutdown: &mut watch::Receiver<bool>) -> Reconciled {
        let mut attempts = 0;
        loop {
            if !self.gate.wait_ready(shutdown).await {
                return Reconciled::Cancelled;
            }

            let outcome = match self.provider.fetch(number).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(order = %number, error = %e, "accrual lookup failed");
                    return Reconciled::Failed;
                }
            };

            match outcome {
                AccrualOutcome::RateLimited(retry_after) => {
                    attempts += 1;
                    self.gate.signal_rate_limited(retry_after);
                    if attempts >= self.max_attempts {
                        warn!(order = %number, attempts, "accrual provider kept rate limiting, giving up");
                        return Reconciled::GaveUp;
                    }
                    debug!(order = %number, attempts, "rate limited, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        return Reconciled::Cancelled;
                    }
                }
                AccrualOutcome::NotYetKnown => {
                    debug!(order = %number, "order not registered with provider yet");
                    return Reconciled::NotYetKnown;
                }
                AccrualOutcome::Ready(acc) if acc.order.is_empty() => {
                    warn!(order = %number, "provider answered without an order number");
                    return Reconciled::Failed;
                }
                AccrualOutcome::Ready(acc) if acc.accrual.is_some_and(|a| a < Decimal::ZERO) => {
                    warn!(order = %number, accrual = ?acc.accrual, "provider answered with a negative accrual");
                    return Reconciled::Failed;
                }
                AccrualOutcome::Ready(acc) => {
                    let status = OrderStatus::from(acc.status);
                    // stored as NUMERIC(14,2)
                    let accrual = match status {
                        OrderStatus::Processed => acc.accrual.unwrap_or(Decimal::ZERO).round_dp(2),
                        _ => Decimal::ZERO,
                    };
                    return match self.orders.update_order_status(number, status, accrual).await {
                        Ok(true) => {
                            info!(order = %number, %status, %accrual, "order reconciled");
                            Reconciled::Updated(status)
                        }
                        Ok(false) => {
                            debug!(order = %number, %status, "order already final, nothing to update");
                            Reconciled::Unchanged
                        }
                        Err(e) => {
                            error!(order = %number, error = %e, "failed to persist accrual");
                            Reconciled::Failed
                        }
                    };
                }
            }
        }
    }
}

/// Handle to the worker pool. Clones share the same queue.
#[derive(Clone)]
pub struct Reconciler {
    tx: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
}

pub struct ReconcilerWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl Reconciler {
    /// Spawns the workers. Call [`Reconciler::shutdown`] and then await
    /// [`ReconcilerWorkers::join`] to stop them.
    pub fn start(
        provider: Arc<dyn AccrualProvider>,
        orders: Arc<dyn OrderStore>,
        gate: Arc<CooldownGate>,
        config: ReconcilerConfig,
    ) -> (Self, ReconcilerWorkers) {
        let (tx, rx) = mpsc::channel::<String>(config.queue.max(1));
        let (shutdown, _) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));
        let ctx = ReconcileContext {
            provider,
            orders,
            gate,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay,
        };

        let handles = (0..config.workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let ctx = ctx.clone();
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    debug!(worker = id, "reconcile worker started");
                    loop {
                        if *stop.borrow() {
                            break;
                        }
                        let next = tokio::select! {
                            number = async { rx.lock().await.recv().await } => number,
                            _ = stop.changed() => None,
                        };
                        let Some(number) = next else { break };
                        if *stop.borrow() {
                            break;
                        }
                        if ctx.reconcile(&number, &mut stop).await == Reconciled::Cancelled {
                            break;
                        }
                    }
                    debug!(worker = id, "reconcile worker stopped");
                })
            })
            .collect();
        info!(workers = config.workers.max(1), queue = config.queue, "reconciler started");

        (Self { tx, shutdown }, ReconcilerWorkers { handles })
    }

    /// Queues `number` without waiting. Returns `false` if it was dropped
    /// because the queue is full or the pool is shutting down.
    pub fn dispatch(&self, number: &str) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        match self.tx.try_send(number.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(order = %number, "reconcile queue full, order left for next trigger");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl ReconcilerWorkers {
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "reconcile worker panicked");
            }
        }
        info!("reconciler stopped");
    }
}
