//! In-process task queue for tests and `--mock` runs.
//!
//! Visibility delays use `tokio::time::Instant`, so tests running with a
//! paused clock can step through retries deterministically.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use provisioning_sdk::{
    DeadLetter, DeadLetterReason, Delivery, MessageId, ProvisioningTask, QueueError, TaskQueue,
};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Message {
    id: MessageId,
    task: ProvisioningTask,
    attempt: u32,
    not_before: Instant,
}

impl Message {
    fn delivery(&self) -> Delivery {
        Delivery {
            id: self.id,
            task: self.task.clone(),
            attempt: self.attempt,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    in_flight: HashMap<MessageId, Message>,
    dead: Vec<DeadLetter>,
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting for delivery, including delayed ones.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().ready.len()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

fn take_in_flight(state: &mut State, delivery: &Delivery) -> Result<Message, QueueError> {
    state
        .in_flight
        .remove(&delivery.id)
        .ok_or_else(|| QueueError::UnknownDelivery {
            id: delivery.id.to_string(),
        })
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: ProvisioningTask) -> Result<(), QueueError> {
        self.state.lock().ready.push_back(Message {
            id: Uuid::new_v4(),
            task,
            attempt: 1,
            not_before: Instant::now(),
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let Some(pos) = state.ready.iter().position(|m| m.not_before <= now) else {
            return Ok(None);
        };
        let Some(message) = state.ready.remove(pos) else {
            return Ok(None);
        };

        let delivery = message.delivery();
        state.in_flight.insert(message.id, message);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        take_in_flight(&mut state, delivery)?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let mut message = take_in_flight(&mut state, delivery)?;
        message.attempt = message.attempt.saturating_add(1);
        message.not_before = Instant::now() + delay;
        state.ready.push_back(message);
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let message = take_in_flight(&mut state, delivery)?;
        state.dead.push(DeadLetter {
            id: message.id,
            task: message.task,
            attempts: message.attempt,
            reason,
            detail: detail.to_owned(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.state.lock().dead.clone())
    }
}
