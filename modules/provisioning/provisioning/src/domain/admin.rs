//! Administrative lifecycle transitions.
//!
//! These are the entry points used by the admin surface. They only touch the
//! directory and the queue; environment changes happen asynchronously in the
//! consumer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use provisioning_sdk::{
    IdentityDirectory, ProvisioningTask, TaskQueue, User, UserId, UserPatch, UserStatus, Username,
};
use tracing::info;

use crate::domain::error::{DomainError, Step};

pub struct LifecycleAdmin {
    directory: Arc<dyn IdentityDirectory>,
    queue: Arc<dyn TaskQueue>,
    call_timeout: Duration,
}

impl LifecycleAdmin {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        queue: Arc<dyn TaskQueue>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            queue,
            call_timeout,
        }
    }

    /// `pending -> approved`, then enqueue `provision`.
    ///
    /// Approving an already approved user only re-enqueues the task, which
    /// recovers from an enqueue that failed after the status update.
    ///
    /// # Errors
    /// - [`DomainError::InvalidTransition`] from any other status
    /// - [`DomainError::InvalidTask`] if the record has no valid username
    pub async fn approve(&self, id: &UserId) -> Result<ProvisioningTask, DomainError> {
        let user = self.fetch(id).await?;
        if !matches!(user.status, UserStatus::Pending | UserStatus::Approved) {
            return Err(invalid_transition(&user, "approve"));
        }
        let username = username_of(&user)?;

        if user.status == UserStatus::Pending {
            self.directory_call(
                Step::ApproveIdentity,
                self.directory
                    .update_user(id, &UserPatch::status(UserStatus::Approved)),
            )
            .await?;
        }

        let task = ProvisioningTask::provision(id.clone(), username);
        self.enqueue(task.clone()).await?;
        info!(user_id = %id, username = %task.username, "user approved, provision queued");
        Ok(task)
    }

    /// `pending -> deleted`.
    ///
    /// # Errors
    /// [`DomainError::InvalidTransition`] from any other status.
    pub async fn reject(&self, id: &UserId) -> Result<(), DomainError> {
        let user = self.fetch(id).await?;
        if user.status != UserStatus::Pending {
            return Err(invalid_transition(&user, "reject"));
        }
        self.directory_call(Step::DeleteIdentity, self.directory.delete_user(id))
            .await?;
        info!(user_id = %id, "user rejected");
        Ok(())
    }

    /// Enqueue `deprovision` for an active user. The status flips to
    /// `revoked` once the consumer completes the task.
    ///
    /// # Errors
    /// [`DomainError::InvalidTransition`] unless the user is active.
    pub async fn revoke(&self, id: &UserId) -> Result<ProvisioningTask, DomainError> {
        let user = self.fetch(id).await?;
        if user.status != UserStatus::Active {
            return Err(invalid_transition(&user, "revoke"));
        }
        let username = username_of(&user)?;

        let task = ProvisioningTask::deprovision(id.clone(), username);
        self.enqueue(task.clone()).await?;
        info!(user_id = %id, username = %task.username, "deprovision queued");
        Ok(task)
    }

    /// `revoked -> deleted`.
    ///
    /// # Errors
    /// [`DomainError::InvalidTransition`] unless the user is revoked.
    pub async fn delete(&self, id: &UserId) -> Result<(), DomainError> {
        let user = self.fetch(id).await?;
        if user.status != UserStatus::Revoked {
            return Err(invalid_transition(&user, "delete"));
        }
        self.directory_call(Step::DeleteIdentity, self.directory.delete_user(id))
            .await?;
        info!(user_id = %id, "user deleted");
        Ok(())
    }

    async fn fetch(&self, id: &UserId) -> Result<User, DomainError> {
        self.directory_call(Step::FetchUser, self.directory.get_user(id))
            .await
    }

    async fn enqueue(&self, task: ProvisioningTask) -> Result<(), DomainError> {
        match tokio::time::timeout(self.call_timeout, self.queue.enqueue(task)).await {
            Ok(result) => result.map_err(|source| DomainError::Queue {
                step: Step::Enqueue,
                source,
            }),
            Err(_) => Err(self.timeout(Step::Enqueue)),
        }
    }

    async fn directory_call<T>(
        &self,
        step: Step,
        call: impl Future<Output = Result<T, provisioning_sdk::DirectoryError>>,
    ) -> Result<T, DomainError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result.map_err(|source| DomainError::Directory { step, source }),
            Err(_) => Err(self.timeout(step)),
        }
    }

    fn timeout(&self, step: Step) -> DomainError {
        DomainError::Timeout {
            step,
            timeout_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

fn invalid_transition(user: &User, action: &'static str) -> DomainError {
    DomainError::InvalidTransition {
        id: user.id.clone(),
        status: user.status,
        action,
    }
}

fn username_of(user: &User) -> Result<Username, DomainError> {
    let raw = user
        .username
        .as_deref()
        .ok_or_else(|| DomainError::invalid_task(format!("user {} has no username", user.id)))?;
    Username::parse(raw).map_err(|e| DomainError::invalid_task(e.to_string()))
}
