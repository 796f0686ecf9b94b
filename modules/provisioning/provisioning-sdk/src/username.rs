//! Validated username type.
//!
//! A username is chosen once by the user and never changes afterwards. It is
//! embedded in container names, route hostnames and remote command arguments,
//! so it is restricted to a shell- and DNS-safe alphabet.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Minimum username length (inclusive).
pub const USERNAME_MIN_LENGTH: usize = 4;

/// Maximum username length (inclusive).
pub const USERNAME_MAX_LENGTH: usize = 10;

/// Names that collide with platform hostnames or system accounts.
pub const RESERVED_USERNAMES: &[&str] = &[
    "admin", "app", "www", "api", "mail", "portal", "system", "root", "public", "static", "login",
    "dev",
];

/// A username that passed validation.
///
/// Lowercase ASCII letters, digits and internal hyphens; must start and end
/// with a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    /// Validate and wrap a username.
    ///
    /// # Errors
    /// Returns [`ValidationError`] when the length, alphabet or reserved-word
    /// rules are violated.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let len = raw.len();
        if !(USERNAME_MIN_LENGTH..=USERNAME_MAX_LENGTH).contains(&len) {
            return Err(ValidationError::UsernameLength {
                len,
                min: USERNAME_MIN_LENGTH,
                max: USERNAME_MAX_LENGTH,
            });
        }

        let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
        let edges_ok = raw.starts_with(allowed) && raw.ends_with(allowed);
        let body_ok = raw.chars().all(|c| allowed(c) || c == '-');
        if !edges_ok || !body_ok {
            return Err(ValidationError::UsernameFormat {
                username: raw.to_owned(),
            });
        }

        if RESERVED_USERNAMES.contains(&raw) {
            return Err(ValidationError::UsernameReserved {
                username: raw.to_owned(),
            });
        }

        Ok(Self(raw.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Username {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
