//! Provisioning Module Implementation
//!
//! Drives per-user environments through their lifecycle: a queue consumer
//! hands tasks to the [`LifecycleCoordinator`], which keeps the identity
//! directory, the managed host, the proxy routing table and the port
//! allocation table consistent.
//!
//! The collaborator contracts are defined in `provisioning-sdk` and
//! re-exported here.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use provisioning_sdk::{
    DeadLetter, DeadLetterReason, Delivery, DirectoryError, ErrorClass, ExecutorError,
    IdentityDirectory, ProvisioningTask, QueueError, RemoteExecutor, RouteError, RouteKey,
    RouteRegistrar, TaskQueue, TaskType, User, UserId, UserPatch, UserRole, UserStatus, Username,
};

pub mod config;
pub mod domain;
pub mod infra;
pub mod module;

pub use config::ProvisioningConfig;
pub use domain::{
    Disposition, DomainError, LifecycleAdmin, LifecycleCoordinator, Outcome, PortAllocator,
    PortOwner, QueueConsumer, RetryPolicy, SkipReason, Step,
};
pub use module::{Collaborators, ProvisioningModule};
