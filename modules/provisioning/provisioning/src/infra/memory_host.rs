//! In-process stand-ins for the managed host and the proxy, used by `--mock`
//! runs and tests. Both keep their state so callers can inspect it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use provisioning_sdk::{ExecutorError, RemoteExecutor, RouteError, RouteKey, RouteRegistrar, Username};
use tracing::info;

/// Tracks which workloads are running and on which port.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    running: DashMap<Username, u16>,
}

impl InMemoryHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn port_of(&self, username: &Username) -> Option<u16> {
        self.running.get(username).map(|p| *p)
    }

    #[must_use]
    pub fn running(&self) -> BTreeMap<Username, u16> {
        self.running
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for InMemoryHost {
    async fn bring_up(&self, username: &Username, port: u16) -> Result<(), ExecutorError> {
        self.running.insert(username.clone(), port);
        info!(%username, port, "mock workload up");
        Ok(())
    }

    async fn tear_down(&self, username: &Username) -> Result<(), ExecutorError> {
        self.running.remove(username);
        info!(%username, "mock workload down");
        Ok(())
    }
}

/// Routing table kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryRoutes {
    routes: DashMap<RouteKey, u16>,
}

impl InMemoryRoutes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn port_of(&self, key: &RouteKey) -> Option<u16> {
        self.routes.get(key).map(|p| *p)
    }

    #[must_use]
    pub fn routes(&self) -> BTreeMap<RouteKey, u16> {
        self.routes
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

#[async_trait]
impl RouteRegistrar for InMemoryRoutes {
    async fn add_route(&self, key: &RouteKey, port: u16) -> Result<(), RouteError> {
        self.routes.insert(key.clone(), port);
        info!(route = %key, port, "mock route added");
        Ok(())
    }

    async fn remove_route(&self, key: &RouteKey) -> Result<(), RouteError> {
        self.routes.remove(key);
        info!(route = %key, "mock route removed");
        Ok(())
    }
}
