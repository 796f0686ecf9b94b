use std::fmt;

use provisioning_sdk::{
    DirectoryError, ErrorClass, ExecutorError, QueueError, RouteError, UserId, UserStatus,
};
use thiserror::Error;

use crate::infra::allocation_store::StoreError;

/// Protocol step, carried by errors and log fields for operator triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    FetchUser,
    AllocatePort,
    BringUp,
    AddRoute,
    ActivateIdentity,
    ResolvePort,
    RemoveRoute,
    TearDown,
    ReleasePort,
    RevokeIdentity,
    ApproveIdentity,
    DeleteIdentity,
    Enqueue,
}

impl Step {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FetchUser => "fetch_user",
            Self::AllocatePort => "allocate_port",
            Self::BringUp => "bring_up",
            Self::AddRoute => "add_route",
            Self::ActivateIdentity => "activate_identity",
            Self::ResolvePort => "resolve_port",
            Self::RemoveRoute => "remove_route",
            Self::TearDown => "tear_down",
            Self::ReleasePort => "release_port",
            Self::RevokeIdentity => "revoke_identity",
            Self::ApproveIdentity => "approve_identity",
            Self::DeleteIdentity => "delete_identity",
            Self::Enqueue => "enqueue",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level errors of the lifecycle pipeline.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("port pool exhausted")]
    PoolExhausted,

    #[error("allocation table could not be persisted: {0}")]
    Store(#[from] StoreError),

    #[error("{step}: {source}")]
    Directory {
        step: Step,
        #[source]
        source: DirectoryError,
    },

    #[error("{step}: {source}")]
    Executor {
        step: Step,
        #[source]
        source: ExecutorError,
    },

    #[error("{step}: {source}")]
    Route {
        step: Step,
        #[source]
        source: RouteError,
    },

    #[error("{step}: {source}")]
    Queue {
        step: Step,
        #[source]
        source: QueueError,
    },

    #[error("{step}: call timed out after {timeout_ms}ms")]
    Timeout { step: Step, timeout_ms: u64 },

    #[error("invalid task: {message}")]
    InvalidTask { message: String },

    #[error("user {id} cannot {action} from status {status}")]
    InvalidTransition {
        id: UserId,
        status: UserStatus,
        action: &'static str,
    },

    #[error("inconsistent state at {step}: {message}")]
    Inconsistent { step: Step, message: String },
}

impl DomainError {
    pub fn invalid_task(message: impl Into<String>) -> Self {
        Self::InvalidTask {
            message: message.into(),
        }
    }

    pub fn inconsistent(step: Step, message: impl Into<String>) -> Self {
        Self::Inconsistent {
            step,
            message: message.into(),
        }
    }

    /// Retry classification of this failure.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PoolExhausted | Self::Store(_) | Self::Timeout { .. } | Self::Queue { .. } => {
                ErrorClass::Transient
            }
            Self::Directory { source, .. } => source.class(),
            Self::Executor { source, .. } => source.class(),
            Self::Route { source, .. } => source.class(),
            Self::InvalidTask { .. } | Self::InvalidTransition { .. } => ErrorClass::Permanent,
            Self::Inconsistent { .. } => ErrorClass::Inconsistent,
        }
    }

    /// Step at which the failure happened, when known.
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::PoolExhausted | Self::Store(_) => Some(Step::AllocatePort),
            Self::Directory { step, .. }
            | Self::Executor { step, .. }
            | Self::Route { step, .. }
            | Self::Queue { step, .. }
            | Self::Timeout { step, .. }
            | Self::Inconsistent { step, .. } => Some(*step),
            Self::InvalidTask { .. } | Self::InvalidTransition { .. } => None,
        }
    }
}
