//! Provisioning SDK
//!
//! This crate provides the public contract of the `provisioning` module:
//!
//! - [`IdentityDirectory`], [`RemoteExecutor`], [`RouteRegistrar`], [`TaskQueue`] -
//!   the external collaborators the lifecycle pipeline drives
//! - [`User`], [`ProvisioningTask`], [`Delivery`], [`DeadLetter`] - transport-agnostic models
//! - [`Username`], [`RouteKey`] - validated identifiers
//! - [`ErrorClass`] and the per-collaborator error enums
//!
//! ## Usage
//!
//! An upstream caller (the admin API) only ever enqueues work:
//!
//! ```ignore
//! use provisioning_sdk::{ProvisioningTask, TaskQueue, Username};
//!
//! let username = Username::parse("alice")?;
//! queue.enqueue(ProvisioningTask::provision(user_id, username)).await?;
//! ```
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod api;
pub mod error;
pub mod models;
pub mod username;

pub use api::{IdentityDirectory, RemoteExecutor, RouteRegistrar, TaskQueue};
pub use error::{
    DirectoryError, ErrorClass, ExecutorError, QueueError, RouteError, ValidationError,
};
pub use models::{
    DeadLetter, DeadLetterReason, Delivery, MessageId, ProvisioningTask, RouteKey, TaskType, User,
    UserId, UserPatch, UserRole, UserStatus,
};
pub use username::Username;
