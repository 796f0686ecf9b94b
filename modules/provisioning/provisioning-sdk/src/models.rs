//! Domain models for the provisioning module.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::username::Username;

/// Opaque, immutable identifier assigned by the identity directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// User lifecycle status, owned by the identity directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    /// Signed up, waiting for an administrator.
    #[default]
    Pending,
    /// Approved; a provision task is queued or in flight.
    Approved,
    /// Environment is running and routed.
    Active,
    /// Environment torn down; persistent data kept.
    Revoked,
}

impl UserStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    /// Parse the wire representation used by the directory.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

impl UserRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// User record as seen in the identity directory.
///
/// `container_port` is present iff `status == Active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Raw username as stored; validated by consumers before use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub status: UserStatus,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
}

/// Partial update of a user record.
///
/// `None` fields are left untouched. For `container_port`, `Some(None)`
/// clears the attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub status: Option<UserStatus>,
    pub container_port: Option<Option<u16>>,
}

impl UserPatch {
    /// `status=active`, `containerPort=port`.
    #[must_use]
    pub fn activated(port: u16) -> Self {
        Self {
            status: Some(UserStatus::Active),
            container_port: Some(Some(port)),
        }
    }

    /// `status=revoked`, `containerPort` cleared.
    #[must_use]
    pub fn revoked() -> Self {
        Self {
            status: Some(UserStatus::Revoked),
            container_port: Some(None),
        }
    }

    #[must_use]
    pub fn status(status: UserStatus) -> Self {
        Self {
            status: Some(status),
            container_port: None,
        }
    }

    /// Apply the patch to a record in place.
    pub fn apply_to(&self, user: &mut User) {
        if let Some(status) = self.status {
            user.status = status;
        }
        if let Some(port) = self.container_port {
            user.container_port = port;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Provision,
    Deprovision,
}

impl TaskType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable queue message.
///
/// Carries identity only; everything else is fetched from the directory when
/// the task is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningTask {
    pub task_type: TaskType,
    #[serde(alias = "user_id")]
    pub user_id: UserId,
    pub username: Username,
}

impl ProvisioningTask {
    #[must_use]
    pub fn provision(user_id: UserId, username: Username) -> Self {
        Self {
            task_type: TaskType::Provision,
            user_id,
            username,
        }
    }

    #[must_use]
    pub fn deprovision(user_id: UserId, username: Username) -> Self {
        Self {
            task_type: TaskType::Deprovision,
            user_id,
            username,
        }
    }
}

/// Queue-assigned message identifier.
pub type MessageId = Uuid;

/// One delivery of a queued task.
///
/// `attempt` starts at 1 and grows with every redelivery of the same message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: MessageId,
    pub task: ProvisioningTask,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Transient failures exceeded the retry ceiling.
    RetriesExhausted,
    /// A non-retryable failure.
    Permanent,
    /// External systems disagree; manual reconciliation required.
    Inconsistent,
}

impl DeadLetterReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::Permanent => "permanent",
            Self::Inconsistent => "inconsistent",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task parked for operator attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: MessageId,
    pub task: ProvisioningTask,
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub detail: String,
    pub at: DateTime<Utc>,
}

const ROUTE_KEY_PREFIX: &str = "user-";

/// Proxy routing key derived from a username.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey(String);

impl RouteKey {
    #[must_use]
    pub fn for_username(username: &Username) -> Self {
        Self(format!("{ROUTE_KEY_PREFIX}{username}"))
    }

    /// Username the key was derived from.
    #[must_use]
    pub fn username(&self) -> &str {
        self.0.strip_prefix(ROUTE_KEY_PREFIX).unwrap_or(&self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
