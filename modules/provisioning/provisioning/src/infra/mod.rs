pub mod allocation_store;
pub mod graph_directory;
pub mod memory_directory;
pub mod memory_host;
pub mod memory_queue;
pub mod ssh_executor;
pub mod spool_queue;
pub mod traefik_registrar;

pub use allocation_store::{AllocationStore, JsonFileStore, MemoryStore, PortRecord, StoreError};
pub use graph_directory::GraphDirectory;
pub use memory_directory::InMemoryDirectory;
pub use memory_host::{InMemoryHost, InMemoryRoutes};
pub use memory_queue::MemoryQueue;
pub use ssh_executor::SshExecutor;
pub use spool_queue::SpoolQueue;
pub use traefik_registrar::FileRouteRegistrar;
