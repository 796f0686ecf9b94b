//! Error types for the provisioning collaborators.
//!
//! Every collaborator reports failures already classified: the lifecycle
//! coordinator decides whether to retry purely from [`ErrorClass`].

use thiserror::Error;

use crate::models::UserId;

/// Retry classification shared by every failure in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network, timeout or temporarily exhausted resource. Retried with backoff.
    Transient,
    /// Invalid input or a definitive failure reported by a remote system. Never retried.
    Permanent,
    /// External systems disagree in a way no retry can fix. Needs an operator.
    Inconsistent,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Inconsistent => "inconsistent",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("username length {len} outside {min}..={max}")]
    UsernameLength { len: usize, min: usize, max: usize },

    #[error("username '{username}' must be lowercase alphanumeric with internal hyphens")]
    UsernameFormat { username: String },

    #[error("username '{username}' is reserved")]
    UsernameReserved { username: String },
}

/// Errors reported by the identity directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The user record does not exist (never created, or deleted).
    #[error("user not found: {id}")]
    NotFound { id: UserId },

    /// The directory could not be reached or asked us to back off.
    #[error("identity directory unavailable: {message}")]
    Unavailable { message: String },

    /// The directory rejected the request.
    #[error("identity directory rejected request: {message}")]
    Rejected { message: String },
}

impl DirectoryError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable { .. } => ErrorClass::Transient,
            Self::NotFound { .. } | Self::Rejected { .. } => ErrorClass::Permanent,
        }
    }
}

/// Errors reported by the remote executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Connectivity problem or timeout; the command may or may not have run.
    #[error("remote command failed transiently: {message}")]
    Transient { message: String },

    /// The command ran and reported an unrecoverable failure.
    #[error("remote command failed: {message}")]
    Permanent { message: String },
}

impl ExecutorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } => ErrorClass::Transient,
            Self::Permanent { .. } => ErrorClass::Permanent,
        }
    }
}

/// Errors reported by the route registrar.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route update failed transiently: {message}")]
    Transient { message: String },

    #[error("route update rejected: {message}")]
    Permanent { message: String },
}

impl RouteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } => ErrorClass::Transient,
            Self::Permanent { .. } => ErrorClass::Permanent,
        }
    }
}

/// Errors reported by the queue transport.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The transport is temporarily unusable (I/O error, broker down).
    #[error("queue unavailable: {message}")]
    Unavailable { message: String },

    /// A stored message could not be decoded.
    #[error("malformed queue message {id}: {message}")]
    Malformed { id: String, message: String },

    /// The delivery is not in flight (already acked, retried or dead-lettered).
    #[error("unknown delivery: {id}")]
    UnknownDelivery { id: String },
}

impl QueueError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}
