//! Queue consumer: bounded worker pool that feeds deliveries to the
//! coordinator and settles each one (ack, retry, dead-letter).

use std::sync::Arc;
use std::time::Duration;

use provisioning_sdk::{DeadLetterReason, Delivery, ErrorClass, TaskQueue};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::domain::coordinator::{LifecycleCoordinator, Outcome};
use crate::domain::error::{DomainError, Step};
use crate::domain::retry::RetryPolicy;

/// What happened to a delivery after processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Retried { delay: Duration },
    DeadLettered(DeadLetterReason),
}

pub struct QueueConsumer {
    queue: Arc<dyn TaskQueue>,
    coordinator: Arc<LifecycleCoordinator>,
    policy: RetryPolicy,
    workers: usize,
    poll_interval: Duration,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        coordinator: Arc<LifecycleCoordinator>,
        policy: RetryPolicy,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            coordinator,
            policy,
            workers: config.workers.max(1),
            poll_interval: config.poll_interval,
        }
    }

    /// Consume until `cancel` fires, then wait for in-flight tasks.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut in_flight = JoinSet::new();

        info!(workers = self.workers, "queue consumer started");

        loop {
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            match self.queue.receive().await {
                Ok(Some(delivery)) => {
                    let this = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        this.handle(delivery).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if idle(&cancel, self.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "queue receive failed");
                    if idle(&cancel, self.poll_interval).await {
                        break;
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "waiting for in-flight tasks");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        info!("queue consumer stopped");
    }

    /// Process one delivery and settle it on the queue.
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let result = self.coordinator.process(&delivery.task).await;
        let disposition = self.decide(&delivery, &result);

        let settled = match &disposition {
            Disposition::Acked => self.queue.ack(&delivery).await,
            Disposition::Retried { delay } => self.queue.retry(&delivery, *delay).await,
            Disposition::DeadLettered(reason) => {
                let detail = result.as_ref().err().map(ToString::to_string).unwrap_or_default();
                self.queue.dead_letter(&delivery, *reason, &detail).await
            }
        };
        if let Err(e) = settled {
            error!(
                message_id = %delivery.id,
                user_id = %delivery.task.user_id,
                error = %e,
                "failed to settle delivery; message stays queued for redelivery"
            );
        }

        disposition
    }

    fn decide(&self, delivery: &Delivery, result: &Result<Outcome, DomainError>) -> Disposition {
        let task = &delivery.task;
        let err = match result {
            Ok(Outcome::Completed { .. }) => return Disposition::Acked,
            Ok(Outcome::Skipped(reason)) => {
                debug!(user_id = %task.user_id, task_type = %task.task_type, ?reason, "task skipped");
                return Disposition::Acked;
            }
            Err(err) => err,
        };

        let step = err.step().map_or("-", Step::as_str);
        match err.class() {
            ErrorClass::Transient if self.policy.should_retry(delivery.attempt) => {
                let delay = self.policy.backoff(delivery.attempt);
                warn!(
                    user_id = %task.user_id,
                    task_type = %task.task_type,
                    step,
                    attempt = delivery.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient failure, scheduling retry"
                );
                Disposition::Retried { delay }
            }
            ErrorClass::Transient => {
                error!(
                    user_id = %task.user_id,
                    task_type = %task.task_type,
                    step,
                    attempt = delivery.attempt,
                    error = %err,
                    "retries exhausted, dead-lettering task"
                );
                Disposition::DeadLettered(DeadLetterReason::RetriesExhausted)
            }
            ErrorClass::Permanent => {
                error!(
                    user_id = %task.user_id,
                    task_type = %task.task_type,
                    step,
                    attempt = delivery.attempt,
                    error = %err,
                    "task failed permanently"
                );
                Disposition::DeadLettered(DeadLetterReason::Permanent)
            }
            ErrorClass::Inconsistent => {
                error!(
                    alert = true,
                    user_id = %task.user_id,
                    task_type = %task.task_type,
                    step,
                    attempt = delivery.attempt,
                    error = %err,
                    "inconsistent state detected, manual reconciliation required"
                );
                Disposition::DeadLettered(DeadLetterReason::Inconsistent)
            }
        }
    }
}

/// Sleep for `interval` unless cancelled first. Returns `true` on cancel.
async fn idle(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(interval) => false,
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "worker task panicked");
    }
}
