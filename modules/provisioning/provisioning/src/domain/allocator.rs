//! Port allocator.
//!
//! Hands out host ports from a fixed inclusive range, at most one per user.
//! The table lives behind a synchronous mutex; every mutation is written
//! through the [`AllocationStore`] before the lock is released and rolled
//! back if the write fails.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use provisioning_sdk::UserId;
use tracing::{debug, warn};

use crate::domain::error::DomainError;
use crate::infra::allocation_store::{AllocationStore, PortRecord, StoreError};

/// Who holds a port right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOwner {
    Free,
    Assigned(UserId),
    /// The port is neither in the configured range nor in the table.
    NotInPool,
}

type Table = BTreeMap<u16, Option<UserId>>;

pub struct PortAllocator {
    range: RangeInclusive<u16>,
    table: Mutex<Table>,
    store: Arc<dyn AllocationStore>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

impl PortAllocator {
    /// Build the allocator from the stored table, reconciled with `range`.
    ///
    /// Ports of the range missing from the table are added as free. Free
    /// ports outside the range are dropped; assigned ones are kept until
    /// released so no running environment loses its port.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the stored table cannot be read or the
    /// reconciled table cannot be written back.
    pub fn load(
        range: RangeInclusive<u16>,
        store: Arc<dyn AllocationStore>,
    ) -> Result<Self, StoreError> {
        let stored = store.load()?.unwrap_or_default();

        let mut table: Table = range.clone().map(|port| (port, None)).collect();
        for record in stored {
            match record.user_id {
                Some(user_id) => {
                    if !range.contains(&record.port) {
                        warn!(
                            port = record.port,
                            user_id = %user_id,
                            "assigned port outside configured range, keeping until released"
                        );
                    }
                    table.insert(record.port, Some(user_id));
                }
                None => {
                    if !range.contains(&record.port) {
                        debug!(port = record.port, "dropping free port outside configured range");
                    }
                }
            }
        }

        store.save(&to_records(&table))?;

        let assigned = table.values().filter(|owner| owner.is_some()).count();
        debug!(
            start = range.start(),
            end = range.end(),
            assigned,
            "port allocator loaded"
        );

        Ok(Self {
            range,
            table: Mutex::new(table),
            store,
        })
    }

    /// Assign a port to `user_id`, or return the one it already holds.
    ///
    /// # Errors
    /// - [`DomainError::PoolExhausted`] when every port is taken
    /// - [`DomainError::Store`] when the table cannot be persisted
    pub fn allocate(&self, user_id: &UserId) -> Result<u16, DomainError> {
        let mut table = self.table.lock();

        if let Some(port) = find_assigned(&table, user_id) {
            return Ok(port);
        }

        let port = table
            .iter()
            .find(|(port, owner)| owner.is_none() && self.range.contains(port))
            .map(|(port, _)| *port)
            .ok_or(DomainError::PoolExhausted)?;

        table.insert(port, Some(user_id.clone()));
        if let Err(e) = self.store.save(&to_records(&table)) {
            table.insert(port, None);
            return Err(e.into());
        }

        debug!(port, user_id = %user_id, "port allocated");
        Ok(port)
    }

    /// Return `port` to the pool. Releasing a free or unknown port is a no-op.
    ///
    /// # Errors
    /// Returns [`DomainError::Store`] when the table cannot be persisted.
    pub fn release(&self, port: u16) -> Result<(), DomainError> {
        let mut table = self.table.lock();

        let Some(previous) = table.get(&port).cloned().flatten() else {
            return Ok(());
        };

        if self.range.contains(&port) {
            table.insert(port, None);
        } else {
            table.remove(&port);
        }

        if let Err(e) = self.store.save(&to_records(&table)) {
            table.insert(port, Some(previous));
            return Err(e.into());
        }

        debug!(port, user_id = %previous, "port released");
        Ok(())
    }

    /// Port currently held by `user_id`, if any.
    #[must_use]
    pub fn assigned_to(&self, user_id: &UserId) -> Option<u16> {
        find_assigned(&self.table.lock(), user_id)
    }

    #[must_use]
    pub fn owner(&self, port: u16) -> PortOwner {
        match self.table.lock().get(&port) {
            Some(Some(user_id)) => PortOwner::Assigned(user_id.clone()),
            Some(None) => PortOwner::Free,
            None => PortOwner::NotInPool,
        }
    }

    /// Copy of the table, ordered by port.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PortRecord> {
        to_records(&self.table.lock())
    }

    #[must_use]
    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }
}

fn find_assigned(table: &Table, user_id: &UserId) -> Option<u16> {
    table
        .iter()
        .find(|(_, owner)| owner.as_ref() == Some(user_id))
        .map(|(port, _)| *port)
}

fn to_records(table: &Table) -> Vec<PortRecord> {
    table
        .iter()
        .map(|(port, user_id)| PortRecord {
            port: *port,
            user_id: user_id.clone(),
        })
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::infra::allocation_store::{JsonFileStore, MemoryStore};

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::load(start..=end, Arc::new(MemoryStore::new())).unwrap()
    }

    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail: AtomicBool,
    }

    impl AllocationStore for FlakyStore {
        fn load(&self) -> Result<Option<Vec<PortRecord>>, StoreError> {
            self.inner.load()
        }

        fn save(&self, records: &[PortRecord]) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io {
                    path: "flaky".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.save(records)
        }
    }

    #[test]
    fn allocates_lowest_free_port() {
        let alloc = allocator(9001, 9003);
        assert_eq!(alloc.allocate(&UserId::from("a")).unwrap(), 9001);
        assert_eq!(alloc.allocate(&UserId::from("b")).unwrap(), 9002);
    }

    #[test]
    fn same_user_gets_same_port() {
        let alloc = allocator(9001, 9003);
        let u = UserId::from("a");
        let first = alloc.allocate(&u).unwrap();
        assert_eq!(alloc.allocate(&u).unwrap(), first);
        assert_eq!(alloc.assigned_to(&u), Some(first));
    }

    #[test]
    fn exhausted_pool_is_reported() {
        let alloc = allocator(9001, 9001);
        alloc.allocate(&UserId::from("a")).unwrap();
        assert!(matches!(
            alloc.allocate(&UserId::from("b")),
            Err(DomainError::PoolExhausted)
        ));
    }

    #[test]
    fn release_is_idempotent_and_frees_port() {
        let alloc = allocator(9001, 9002);
        let port = alloc.allocate(&UserId::from("a")).unwrap();

        alloc.release(port).unwrap();
        alloc.release(port).unwrap();
        alloc.release(1).unwrap();

        assert_eq!(alloc.owner(port), PortOwner::Free);
        assert_eq!(alloc.allocate(&UserId::from("b")).unwrap(), port);
    }

    #[test]
    fn owner_distinguishes_out_of_pool() {
        let alloc = allocator(9001, 9002);
        alloc.allocate(&UserId::from("a")).unwrap();
        assert_eq!(alloc.owner(9001), PortOwner::Assigned(UserId::from("a")));
        assert_eq!(alloc.owner(9002), PortOwner::Free);
        assert_eq!(alloc.owner(8080), PortOwner::NotInPool);
    }

    #[test]
    fn failed_save_rolls_back_allocation() {
        let store = Arc::new(FlakyStore::default());
        let alloc = PortAllocator::load(9001..=9002, store.clone()).unwrap();
        store.fail.store(true, Ordering::SeqCst);

        assert!(matches!(
            alloc.allocate(&UserId::from("a")),
            Err(DomainError::Store(_))
        ));
        assert_eq!(alloc.owner(9001), PortOwner::Free);
        assert_eq!(alloc.assigned_to(&UserId::from("a")), None);
    }

    #[test]
    fn failed_save_rolls_back_release() {
        let store = Arc::new(FlakyStore::default());
        let alloc = PortAllocator::load(9001..=9002, store.clone()).unwrap();
        alloc.allocate(&UserId::from("a")).unwrap();
        store.fail.store(true, Ordering::SeqCst);

        assert!(alloc.release(9001).is_err());
        assert_eq!(alloc.owner(9001), PortOwner::Assigned(UserId::from("a")));
    }

    #[test]
    fn reconciles_stored_table_with_new_range() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(&[
                PortRecord {
                    port: 8000,
                    user_id: Some(UserId::from("old")),
                },
                PortRecord {
                    port: 8001,
                    user_id: None,
                },
                PortRecord {
                    port: 9001,
                    user_id: Some(UserId::from("a")),
                },
            ])
            .unwrap();

        let alloc = PortAllocator::load(9001..=9002, store).unwrap();
        assert_eq!(alloc.owner(8000), PortOwner::Assigned(UserId::from("old")));
        assert_eq!(alloc.owner(8001), PortOwner::NotInPool);
        assert_eq!(alloc.owner(9001), PortOwner::Assigned(UserId::from("a")));
        assert_eq!(alloc.owner(9002), PortOwner::Free);

        // Out-of-range ports are never handed out again.
        alloc.release(8000).unwrap();
        assert_eq!(alloc.owner(8000), PortOwner::NotInPool);
        assert_eq!(alloc.allocate(&UserId::from("b")).unwrap(), 9002);
    }

    #[test]
    fn table_survives_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");

        let alloc = PortAllocator::load(9001..=9003, Arc::new(JsonFileStore::new(&path))).unwrap();
        alloc.allocate(&UserId::from("a")).unwrap();
        alloc.allocate(&UserId::from("b")).unwrap();
        alloc.release(9001).unwrap();
        drop(alloc);

        let alloc = PortAllocator::load(9001..=9003, Arc::new(JsonFileStore::new(&path))).unwrap();
        assert_eq!(alloc.assigned_to(&UserId::from("b")), Some(9002));
        assert_eq!(alloc.owner(9001), PortOwner::Free);
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let alloc = Arc::new(allocator(9001, 9100));
        let handles: Vec<_> = (0..50)
            .map(|i| {
                let alloc = alloc.clone();
                std::thread::spawn(move || alloc.allocate(&UserId::new(format!("u{i}"))).unwrap())
            })
            .collect();

        let ports: HashSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ports.len(), 50);
    }
}
