//! Lifecycle coordinator: drives one task through the ordered
//! directory / allocator / executor / registrar protocol.
//!
//! Each step is idempotent and the directory record is re-read first, so a
//! redelivered task simply re-runs from the top. Steps that already took
//! effect become no-ops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use provisioning_sdk::{
    DirectoryError, ErrorClass, IdentityDirectory, ProvisioningTask, RemoteExecutor, RouteKey,
    RouteRegistrar, TaskType, User, UserId, UserPatch, UserStatus, Username,
};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::domain::allocator::PortAllocator;
use crate::domain::error::{DomainError, Step};
use crate::domain::locks::UserLocks;

/// Why a task was discarded without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The record no longer exists.
    UserNotFound,
    /// The record is not in the status the task expects; an earlier delivery
    /// already handled it or an admin action superseded it.
    StatusMismatch(UserStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every step ran; the carried port was activated or released.
    Completed { port: u16 },
    Skipped(SkipReason),
}

/// Port found for a deprovision and whether this user still holds it.
#[derive(Debug, Clone, Copy)]
struct ResolvedPort {
    port: u16,
    held: bool,
}

pub struct LifecycleCoordinator {
    directory: Arc<dyn IdentityDirectory>,
    executor: Arc<dyn RemoteExecutor>,
    registrar: Arc<dyn RouteRegistrar>,
    allocator: Arc<PortAllocator>,
    locks: UserLocks,
    call_timeout: Duration,
}

impl LifecycleCoordinator {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        executor: Arc<dyn RemoteExecutor>,
        registrar: Arc<dyn RouteRegistrar>,
        allocator: Arc<PortAllocator>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            executor,
            registrar,
            allocator,
            locks: UserLocks::new(),
            call_timeout,
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    /// Run `task` to completion while holding the user's lock.
    ///
    /// # Errors
    /// Returns [`DomainError`]; its [`DomainError::class`] tells the caller
    /// whether to retry, dead-letter or alert.
    pub async fn process(&self, task: &ProvisioningTask) -> Result<Outcome, DomainError> {
        let span = info_span!(
            "provisioning_task",
            user_id = %task.user_id,
            username = %task.username,
            task_type = %task.task_type,
        );

        async {
            let _guard = self.locks.acquire(&task.user_id).await;
            match task.task_type {
                TaskType::Provision => self.provision(&task.user_id, &task.username).await,
                TaskType::Deprovision => self.deprovision(&task.user_id, &task.username).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Bring an approved user's environment up and mark the user active.
    ///
    /// # Errors
    /// See [`LifecycleCoordinator::process`].
    pub async fn provision(
        &self,
        user_id: &UserId,
        username: &Username,
    ) -> Result<Outcome, DomainError> {
        let Some(user) = self.fetch(user_id).await? else {
            info!("user no longer exists, discarding provision");
            return Ok(Outcome::Skipped(SkipReason::UserNotFound));
        };
        if user.status != UserStatus::Approved {
            info!(status = %user.status, "user not approved, discarding provision");
            return Ok(Outcome::Skipped(SkipReason::StatusMismatch(user.status)));
        }
        check_username(&user, username)?;

        let port = match self.allocator.assigned_to(user_id) {
            Some(port) => {
                debug!(port, "reusing port from earlier attempt");
                port
            }
            None => self.allocator.allocate(user_id)?,
        };

        let brought_up = self
            .bounded(Step::BringUp, self.executor.bring_up(username, port), |step, source| {
                DomainError::Executor { step, source }
            })
            .await;
        if let Err(e) = brought_up {
            if e.class() == ErrorClass::Permanent {
                warn!(port, error = %e, "bring-up failed permanently, releasing port");
                self.allocator.release(port)?;
            }
            return Err(e);
        }
        debug!(port, "workload up");

        let key = RouteKey::for_username(username);
        let routed = self
            .bounded(Step::AddRoute, self.registrar.add_route(&key, port), |step, source| {
                DomainError::Route { step, source }
            })
            .await;
        if let Err(e) = routed {
            if e.class() == ErrorClass::Permanent {
                return Err(self.roll_back_workload(username, port, e).await);
            }
            return Err(e);
        }
        debug!(port, route = %key, "route added");

        self.bounded(
            Step::ActivateIdentity,
            self.directory
                .update_user(user_id, &UserPatch::activated(port)),
            |step, source| DomainError::Directory { step, source },
        )
        .await?;

        info!(port, "user provisioned");
        Ok(Outcome::Completed { port })
    }

    /// Tear an active user's environment down and mark the user revoked.
    ///
    /// # Errors
    /// See [`LifecycleCoordinator::process`].
    pub async fn deprovision(
        &self,
        user_id: &UserId,
        username: &Username,
    ) -> Result<Outcome, DomainError> {
        let Some(user) = self.fetch(user_id).await? else {
            info!("user no longer exists, discarding deprovision");
            return Ok(Outcome::Skipped(SkipReason::UserNotFound));
        };
        if user.status != UserStatus::Active {
            info!(status = %user.status, "user not active, discarding deprovision");
            return Ok(Outcome::Skipped(SkipReason::StatusMismatch(user.status)));
        }
        check_username(&user, username)?;

        let ResolvedPort { port, held } = self.resolve_port(&user)?;

        let key = RouteKey::for_username(username);
        self.bounded(Step::RemoveRoute, self.registrar.remove_route(&key), |step, source| {
            DomainError::Route { step, source }
        })
        .await?;
        debug!(route = %key, "route removed");

        self.bounded(Step::TearDown, self.executor.tear_down(username), |step, source| {
            DomainError::Executor { step, source }
        })
        .await?;
        debug!("workload down");

        if held {
            self.allocator.release(port)?;
        }

        self.bounded(
            Step::RevokeIdentity,
            self.directory.update_user(user_id, &UserPatch::revoked()),
            |step, source| DomainError::Directory { step, source },
        )
        .await?;

        info!(port, "user deprovisioned");
        Ok(Outcome::Completed { port })
    }

    /// The port an active user's environment is bound to, cross-checked
    /// between the directory and the allocation table.
    ///
    /// The allocation table is authoritative: a directory port the table no
    /// longer assigns to this user was released by an earlier attempt and may
    /// already belong to someone else, so it must not be released again.
    fn resolve_port(&self, user: &User) -> Result<ResolvedPort, DomainError> {
        let held = self.allocator.assigned_to(&user.id);

        match (user.container_port, held) {
            (Some(port), Some(held)) if port == held => Ok(ResolvedPort { port, held: true }),
            (Some(port), Some(held)) => Err(DomainError::inconsistent(
                Step::ResolvePort,
                format!(
                    "directory port {port} differs from port {held} in the allocation table"
                ),
            )),
            (Some(port), None) => {
                warn!(
                    port,
                    owner = ?self.allocator.owner(port),
                    "port already released by an earlier attempt, skipping release"
                );
                Ok(ResolvedPort { port, held: false })
            }
            (None, Some(port)) => {
                warn!(port, "directory has no port for active user, using allocation table");
                Ok(ResolvedPort { port, held: true })
            }
            (None, None) => Err(DomainError::inconsistent(
                Step::ResolvePort,
                "active user has no port in the directory or the allocation table",
            )),
        }
    }

    /// Tear the workload down after the proxy definitively refused the route.
    /// Returns the error the task should fail with.
    async fn roll_back_workload(
        &self,
        username: &Username,
        port: u16,
        cause: DomainError,
    ) -> DomainError {
        warn!(port, error = %cause, "route rejected, rolling back workload");

        let torn_down = self
            .bounded(Step::TearDown, self.executor.tear_down(username), |step, source| {
                DomainError::Executor { step, source }
            })
            .await;

        match torn_down {
            Ok(()) => match self.allocator.release(port) {
                Ok(()) => cause,
                Err(e) => e,
            },
            Err(e) => DomainError::inconsistent(
                Step::AddRoute,
                format!(
                    "route rejected ({cause}) and rollback failed ({e}); workload may still run on port {port}"
                ),
            ),
        }
    }

    async fn fetch(&self, user_id: &UserId) -> Result<Option<User>, DomainError> {
        let fetched = tokio::time::timeout(self.call_timeout, self.directory.get_user(user_id)).await;
        match fetched {
            Ok(Ok(user)) => Ok(Some(user)),
            Ok(Err(DirectoryError::NotFound { .. })) => Ok(None),
            Ok(Err(source)) => Err(DomainError::Directory {
                step: Step::FetchUser,
                source,
            }),
            Err(_) => Err(self.timeout(Step::FetchUser)),
        }
    }

    async fn bounded<T, E, F>(
        &self,
        step: Step,
        call: F,
        wrap: impl FnOnce(Step, E) -> DomainError,
    ) -> Result<T, DomainError>
    where
        F: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result.map_err(|e| wrap(step, e)),
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

fn check_username(user: &User, expected: &Username) -> Result<(), DomainError> {
    match user.username.as_deref() {
        Some(name) if name == expected.as_str() => Ok(()),
        Some(name) => Err(DomainError::invalid_task(format!(
            "task username '{expected}' does not match record username '{name}'"
        ))),
        None => Err(DomainError::invalid_task("user record has no username")),
    }
}
