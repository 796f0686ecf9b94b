//! In-process identity directory for tests and `--mock` runs.

use async_trait::async_trait;
use dashmap::DashMap;
use provisioning_sdk::{DirectoryError, IdentityDirectory, User, UserId, UserPatch};

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, User>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn insert(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    #[must_use]
    pub fn user(&self, id: &UserId) -> Option<User> {
        self.users.get(id).map(|u| u.clone())
    }

    /// All records, ordered by id.
    #[must_use]
    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryDirectory {
    async fn get_user(&self, id: &UserId) -> Result<User, DirectoryError> {
        self.user(id)
            .ok_or_else(|| DirectoryError::NotFound { id: id.clone() })
    }

    async fn update_user(&self, id: &UserId, patch: &UserPatch) -> Result<(), DirectoryError> {
        let mut user = self
            .users
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound { id: id.clone() })?;
        patch.apply_to(&mut user);
        Ok(())
    }

    async fn delete_user(&self, id: &UserId) -> Result<(), DirectoryError> {
        self.users.remove(id);
        Ok(())
    }
}
