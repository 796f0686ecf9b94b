#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

//! Common test utilities for provisioning integration tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use provisioning::config::ProvisioningConfig;
use provisioning::infra::{
    AllocationStore, InMemoryDirectory, InMemoryHost, InMemoryRoutes, MemoryQueue, MemoryStore,
};
use provisioning::{
    Collaborators, DirectoryError, DomainError, ExecutorError, IdentityDirectory, Outcome,
    ProvisioningModule, ProvisioningTask, RemoteExecutor, RouteError, RouteKey, RouteRegistrar,
    User, UserId, UserPatch, UserRole, UserStatus, Username,
};

/// Directory backed by [`InMemoryDirectory`] whose next N updates can be
/// scripted to fail without touching the record.
#[derive(Default)]
pub struct ScriptedDirectory {
    pub records: InMemoryDirectory,
    update_errors: Mutex<VecDeque<DirectoryError>>,
    pub update_calls: AtomicUsize,
}

impl ScriptedDirectory {
    pub fn fail_update(&self, err: DirectoryError) {
        self.update_errors.lock().push_back(err);
    }

    pub fn updates(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn insert(&self, user: User) {
        self.records.insert(user);
    }

    pub fn user(&self, id: &UserId) -> Option<User> {
        self.records.user(id)
    }

    pub fn users(&self) -> Vec<User> {
        self.records.users()
    }
}

#[async_trait]
impl IdentityDirectory for ScriptedDirectory {
    async fn get_user(&self, id: &UserId) -> Result<User, DirectoryError> {
        self.records.get_user(id).await
    }

    async fn update_user(&self, id: &UserId, patch: &UserPatch) -> Result<(), DirectoryError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.update_errors.lock().pop_front() {
            return Err(err);
        }
        self.records.update_user(id, patch).await
    }

    async fn delete_user(&self, id: &UserId) -> Result<(), DirectoryError> {
        self.records.delete_user(id).await
    }
}

/// Executor that keeps real state in an [`InMemoryHost`] but can be scripted
/// to fail the next N calls.
#[derive(Default)]
pub struct ScriptedExecutor {
    pub host: InMemoryHost,
    bring_up_errors: Mutex<VecDeque<ExecutorError>>,
    tear_down_errors: Mutex<VecDeque<ExecutorError>>,
    bring_up_delay: Mutex<Option<Duration>>,
    pub bring_up_calls: AtomicUsize,
    pub tear_down_calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn fail_bring_up(&self, err: ExecutorError) {
        self.bring_up_errors.lock().push_back(err);
    }

    pub fn fail_tear_down(&self, err: ExecutorError) {
        self.tear_down_errors.lock().push_back(err);
    }

    pub fn slow_bring_up(&self, delay: Duration) {
        *self.bring_up_delay.lock() = Some(delay);
    }

    pub fn bring_ups(&self) -> usize {
        self.bring_up_calls.load(Ordering::SeqCst)
    }

    pub fn tear_downs(&self) -> usize {
        self.tear_down_calls.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.host.port_of(&username(name)).is_some()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn bring_up(&self, username: &Username, port: u16) -> Result<(), ExecutorError> {
        self.bring_up_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.bring_up_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.bring_up_errors.lock().pop_front() {
            return Err(err);
        }
        self.host.bring_up(username, port).await
    }

    async fn tear_down(&self, username: &Username) -> Result<(), ExecutorError> {
        self.tear_down_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.tear_down_errors.lock().pop_front() {
            return Err(err);
        }
        self.host.tear_down(username).await
    }
}

/// Registrar backed by [`InMemoryRoutes`] with scripted failures.
#[derive(Default)]
pub struct ScriptedRegistrar {
    pub routes: InMemoryRoutes,
    add_errors: Mutex<VecDeque<RouteError>>,
    remove_errors: Mutex<VecDeque<RouteError>>,
    pub add_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
}

impl ScriptedRegistrar {
    pub fn fail_add(&self, err: RouteError) {
        self.add_errors.lock().push_back(err);
    }

    pub fn fail_remove(&self, err: RouteError) {
        self.remove_errors.lock().push_back(err);
    }

    pub fn adds(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn route_port(&self, name: &str) -> Option<u16> {
        self.routes.port_of(&RouteKey::for_username(&username(name)))
    }
}

#[async_trait]
impl RouteRegistrar for ScriptedRegistrar {
    async fn add_route(&self, key: &RouteKey, port: u16) -> Result<(), RouteError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.add_errors.lock().pop_front() {
            return Err(err);
        }
        self.routes.add_route(key, port).await
    }

    async fn remove_route(&self, key: &RouteKey) -> Result<(), RouteError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.remove_errors.lock().pop_front() {
            return Err(err);
        }
        self.routes.remove_route(key).await
    }
}

pub struct Harness {
    pub directory: Arc<ScriptedDirectory>,
    pub executor: Arc<ScriptedExecutor>,
    pub registrar: Arc<ScriptedRegistrar>,
    pub queue: Arc<MemoryQueue>,
    pub module: ProvisioningModule,
}

pub fn test_config(start: u16, end: u16) -> ProvisioningConfig {
    let mut cfg = ProvisioningConfig::default();
    cfg.ports.start = start;
    cfg.ports.end = end;
    cfg.retry.max_retries = 3;
    cfg.retry.base_backoff = Duration::from_millis(10);
    cfg.retry.max_backoff = Duration::from_millis(40);
    cfg.consumer.workers = 4;
    cfg.consumer.poll_interval = Duration::from_millis(5);
    cfg.call_timeout = Duration::from_secs(2);
    cfg
}

pub fn harness(start: u16, end: u16) -> Harness {
    harness_with(&test_config(start, end), Arc::new(MemoryStore::new()))
}

pub fn harness_with(config: &ProvisioningConfig, store: Arc<dyn AllocationStore>) -> Harness {
    let directory = Arc::new(ScriptedDirectory::default());
    let executor = Arc::new(ScriptedExecutor::default());
    let registrar = Arc::new(ScriptedRegistrar::default());
    let queue = Arc::new(MemoryQueue::new());

    let module = ProvisioningModule::new(
        config,
        Collaborators {
            directory: directory.clone(),
            executor: executor.clone(),
            registrar: registrar.clone(),
            queue: queue.clone(),
            store,
        },
    )
    .unwrap();

    Harness {
        directory,
        executor,
        registrar,
        queue,
        module,
    }
}

pub fn username(name: &str) -> Username {
    Username::parse(name).unwrap()
}

pub fn user(id: &str, name: &str, status: UserStatus, port: Option<u16>) -> User {
    User {
        id: UserId::from(id),
        email: Some(format!("{name}@example.com")),
        username: Some(name.to_owned()),
        status,
        role: UserRole::User,
        container_port: port,
    }
}

impl Harness {
    pub fn seed(&self, id: &str, name: &str, status: UserStatus, port: Option<u16>) {
        self.directory.insert(user(id, name, status, port));
    }

    pub fn record(&self, id: &str) -> User {
        self.directory.user(&UserId::from(id)).unwrap()
    }

    pub async fn provision(&self, id: &str, name: &str) -> Result<Outcome, DomainError> {
        let task = ProvisioningTask::provision(UserId::from(id), username(name));
        self.module.coordinator().process(&task).await
    }

    pub async fn deprovision(&self, id: &str, name: &str) -> Result<Outcome, DomainError> {
        let task = ProvisioningTask::deprovision(UserId::from(id), username(name));
        self.module.coordinator().process(&task).await
    }

    pub fn port_of(&self, id: &str) -> Option<u16> {
        self.module.allocator().assigned_to(&UserId::from(id))
    }

    /// `containerPort` is set iff the record is active.
    pub fn assert_port_invariant(&self) {
        for u in self.directory.users() {
            assert_eq!(
                u.container_port.is_some(),
                u.status == UserStatus::Active,
                "port/status invariant violated for {}: {:?}",
                u.id,
                u
            );
        }
    }
}
