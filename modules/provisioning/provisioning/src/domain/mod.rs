pub mod admin;
pub mod allocator;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod locks;
pub mod retry;

pub use admin::LifecycleAdmin;
pub use allocator::{PortAllocator, PortOwner};
pub use consumer::{Disposition, QueueConsumer};
pub use coordinator::{LifecycleCoordinator, Outcome, SkipReason};
pub use error::{DomainError, Step};
pub use locks::UserLocks;
pub use retry::RetryPolicy;
