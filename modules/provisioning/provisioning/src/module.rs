//! Wiring: builds the allocator, coordinator, consumer and admin surface
//! from configuration and a set of collaborators.

use std::sync::Arc;

use anyhow::Context;
use provisioning_sdk::{IdentityDirectory, RemoteExecutor, RouteRegistrar, TaskQueue};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProvisioningConfig;
use crate::domain::{LifecycleAdmin, LifecycleCoordinator, PortAllocator, QueueConsumer, RetryPolicy};
use crate::infra::{
    AllocationStore, FileRouteRegistrar, GraphDirectory, InMemoryDirectory, InMemoryHost,
    InMemoryRoutes, JsonFileStore, MemoryQueue, MemoryStore, SpoolQueue, SshExecutor,
};

/// External systems the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn IdentityDirectory>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub registrar: Arc<dyn RouteRegistrar>,
    pub queue: Arc<dyn TaskQueue>,
    pub store: Arc<dyn AllocationStore>,
}

impl Collaborators {
    /// Real adapters: Graph directory, SSH, proxy file provider, spool queue.
    ///
    /// # Errors
    /// Fails when an adapter cannot be configured.
    pub fn live(config: &ProvisioningConfig) -> anyhow::Result<Self> {
        let directory =
            GraphDirectory::new(&config.directory).context("failed to configure identity directory")?;
        let queue = SpoolQueue::open(&config.queue.spool_dir).with_context(|| {
            format!("failed to open spool at {}", config.queue.spool_dir.display())
        })?;

        Ok(Self {
            directory: Arc::new(directory),
            executor: Arc::new(SshExecutor::new(config.ssh.clone())),
            registrar: Arc::new(FileRouteRegistrar::new(config.routes.clone())),
            queue: Arc::new(queue),
            store: allocation_store(config),
        })
    }

    /// In-memory adapters for `--mock` runs.
    #[must_use]
    pub fn mock() -> Self {
        Self {
            directory: Arc::new(InMemoryDirectory::new()),
            executor: Arc::new(InMemoryHost::new()),
            registrar: Arc::new(InMemoryRoutes::new()),
            queue: Arc::new(MemoryQueue::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }
}

fn allocation_store(config: &ProvisioningConfig) -> Arc<dyn AllocationStore> {
    if let Some(path) = &config.ports.store_path {
        Arc::new(JsonFileStore::new(path))
    } else {
        warn!("ports.store_path not set, port allocations will not survive a restart");
        Arc::new(MemoryStore::new())
    }
}

pub struct ProvisioningModule {
    allocator: Arc<PortAllocator>,
    coordinator: Arc<LifecycleCoordinator>,
    consumer: Arc<QueueConsumer>,
    admin: LifecycleAdmin,
    queue: Arc<dyn TaskQueue>,
}

impl ProvisioningModule {
    /// # Errors
    /// Fails on invalid configuration or an unreadable allocation table.
    pub fn new(config: &ProvisioningConfig, parts: Collaborators) -> anyhow::Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;

        let allocator = Arc::new(
            PortAllocator::load(config.ports.start..=config.ports.end, parts.store)
                .context("failed to load port allocation table")?,
        );

        let coordinator = Arc::new(LifecycleCoordinator::new(
            parts.directory.clone(),
            parts.executor,
            parts.registrar,
            allocator.clone(),
            config.call_timeout,
        ));

        let consumer = Arc::new(QueueConsumer::new(
            parts.queue.clone(),
            coordinator.clone(),
            RetryPolicy::from(&config.retry),
            &config.consumer,
        ));

        let admin = LifecycleAdmin::new(parts.directory, parts.queue.clone(), config.call_timeout);

        info!(
            ports = %format!("{}-{}", config.ports.start, config.ports.end),
            workers = config.consumer.workers,
            max_retries = config.retry.max_retries,
            "provisioning module initialized"
        );

        Ok(Self {
            allocator,
            coordinator,
            consumer,
            admin,
            queue: parts.queue,
        })
    }

    /// Consume the queue until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        self.consumer.clone().run(cancel).await;
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn consumer(&self) -> &Arc<QueueConsumer> {
        &self.consumer
    }

    #[must_use]
    pub fn admin(&self) -> &LifecycleAdmin {
        &self.admin
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }
}
