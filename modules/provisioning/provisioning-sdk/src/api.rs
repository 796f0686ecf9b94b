//! Contracts the lifecycle pipeline requires of its external collaborators.
//!
//! The coordinator depends only on these traits. Concrete adapters (SSH,
//! proxy file provider, HTTP directory, spool queue) live in the
//! `provisioning` crate and can be swapped for fakes in tests.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DirectoryError, ExecutorError, QueueError, RouteError};
use crate::models::{
    DeadLetter, DeadLetterReason, Delivery, ProvisioningTask, RouteKey, User, UserId, UserPatch,
};
use crate::username::Username;

/// Identity directory: the system of record for user status and port.
///
/// Reads are assumed to be at least read-after-write consistent for a single
/// record. No atomicity is assumed across calls.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Fetch the current record.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the record does not exist
    /// - `Unavailable` on connectivity problems
    async fn get_user(&self, id: &UserId) -> Result<User, DirectoryError>;

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the record does not exist
    /// - `Unavailable` / `Rejected` on transport or validation failure
    async fn update_user(&self, id: &UserId, patch: &UserPatch) -> Result<(), DirectoryError>;

    /// Remove the record. Removing an absent record succeeds.
    ///
    /// # Errors
    ///
    /// - `Unavailable` / `Rejected` on transport or validation failure
    async fn delete_user(&self, id: &UserId) -> Result<(), DirectoryError>;
}

/// Runs lifecycle commands for a user's workload on the managed host.
///
/// Both operations are idempotent at the remote side.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Start the workload bound to `port`. An already running workload is success.
    ///
    /// # Errors
    /// `Transient` for connectivity/timeouts, `Permanent` for definitive failures.
    async fn bring_up(&self, username: &Username, port: u16) -> Result<(), ExecutorError>;

    /// Stop and remove the workload's running state, keeping its data.
    /// An absent workload is success.
    ///
    /// # Errors
    /// `Transient` for connectivity/timeouts, `Permanent` for definitive failures.
    async fn tear_down(&self, username: &Username) -> Result<(), ExecutorError>;
}

/// Maintains the reverse proxy's dynamic routing table.
///
/// Changes must take effect without restarting the proxy.
#[async_trait]
pub trait RouteRegistrar: Send + Sync {
    /// Insert or overwrite the route. Re-adding the same mapping is a no-op.
    ///
    /// # Errors
    /// `Transient` when the table cannot be written right now.
    async fn add_route(&self, key: &RouteKey, port: u16) -> Result<(), RouteError>;

    /// Remove the route. Removing a nonexistent route succeeds.
    ///
    /// # Errors
    /// `Transient` when the table cannot be written right now.
    async fn remove_route(&self, key: &RouteKey) -> Result<(), RouteError>;
}

/// At-least-once task transport with explicit acknowledgement.
///
/// A received message stays owned by the queue until it is acked, scheduled
/// for retry, or dead-lettered. No ordering is guaranteed across messages.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a task.
    ///
    /// # Errors
    /// `Unavailable` when the transport cannot accept the message.
    async fn enqueue(&self, task: ProvisioningTask) -> Result<(), QueueError>;

    /// Take the next visible message, if any.
    ///
    /// # Errors
    /// `Unavailable` when the transport cannot be read.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Remove a processed message.
    ///
    /// Settling (`ack`, `retry`, `dead_letter`) ends the delivery even when
    /// it fails; a message that could not be settled is delivered again.
    ///
    /// # Errors
    /// `UnknownDelivery` if the delivery is not in flight.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Make the message visible again after `delay`, with `attempt + 1`.
    ///
    /// # Errors
    /// `UnknownDelivery` if the delivery is not in flight.
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Park the message for operator attention.
    ///
    /// # Errors
    /// `UnknownDelivery` if the delivery is not in flight.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<(), QueueError>;

    /// List parked messages.
    ///
    /// # Errors
    /// `Unavailable` when the transport cannot be read.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;
}
