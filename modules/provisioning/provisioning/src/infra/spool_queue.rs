//! Durable task queue on the local filesystem.
//!
//! ```text
//! <root>/queue/<id>.json         pending and in-flight messages
//! <root>/dead-letter/<id>.json   parked messages
//! ```
//!
//! A message file is removed only when the message is acked or parked, so a
//! crash between receive and ack redelivers it after restart. In-flight state
//! is process-local.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use provisioning_sdk::{
    DeadLetter, DeadLetterReason, Delivery, MessageId, ProvisioningTask, QueueError, TaskQueue,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

const QUEUE_DIR: &str = "queue";
const DEAD_LETTER_DIR: &str = "dead-letter";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    id: MessageId,
    task: ProvisioningTask,
    attempt: u32,
    not_before: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
}

/// On-disk layout. Every method does blocking file I/O and runs on the
/// blocking pool.
#[derive(Debug)]
struct Spool {
    queue_dir: PathBuf,
    dead_dir: PathBuf,
}

impl Spool {
    fn message_path(&self, id: MessageId) -> PathBuf {
        self.queue_dir.join(format!("{id}.json"))
    }

    fn read_envelope(&self, id: MessageId) -> Result<Envelope, QueueError> {
        let path = self.message_path(id);
        let raw = fs::read(&path).map_err(|e| io_unavailable(&path, &e))?;
        serde_json::from_slice(&raw).map_err(|e| QueueError::Malformed {
            id: id.to_string(),
            message: e.to_string(),
        })
    }

    fn write_envelope(&self, envelope: &Envelope) -> Result<(), QueueError> {
        write_json_atomic(&self.queue_dir, &self.message_path(envelope.id), envelope)
    }

    fn remove_message(&self, id: MessageId) -> Result<(), QueueError> {
        let path = self.message_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_unavailable(&path, &e)),
        }
    }

    /// Move an undecodable file out of the way so it stops blocking the queue.
    fn quarantine(&self, path: &Path, err: &dyn std::fmt::Display) {
        let name = path
            .file_name()
            .map_or_else(|| "unknown".into(), |n| n.to_string_lossy().into_owned());
        let target = self.dead_dir.join(format!("{name}.malformed"));
        warn!(path = %path.display(), error = %err, "quarantining malformed queue file");
        if let Err(e) = fs::rename(path, &target) {
            warn!(path = %path.display(), error = %e, "failed to quarantine queue file");
        }
    }

    /// Decodable messages on disk, oldest first.
    fn scan(&self) -> Result<Vec<Envelope>, QueueError> {
        let entries =
            fs::read_dir(&self.queue_dir).map_err(|e| io_unavailable(&self.queue_dir, &e))?;

        let mut envelopes = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_unavailable(&self.queue_dir, &e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                // Acked by a concurrent worker between listing and reading.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_unavailable(&path, &e)),
            };
            match serde_json::from_slice::<Envelope>(&raw) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => self.quarantine(&path, &e),
            }
        }
        envelopes.sort_by_key(|e| (e.not_before, e.enqueued_at));
        Ok(envelopes)
    }

    fn park(&self, letter: &DeadLetter) -> Result<(), QueueError> {
        let target = self.dead_dir.join(format!("{}.json", letter.id));
        write_json_atomic(&self.dead_dir, &target, letter)?;
        self.remove_message(letter.id)
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let entries =
            fs::read_dir(&self.dead_dir).map_err(|e| io_unavailable(&self.dead_dir, &e))?;

        let mut letters = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_unavailable(&self.dead_dir, &e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let raw = fs::read(&path).map_err(|e| io_unavailable(&path, &e))?;
            match serde_json::from_slice::<DeadLetter>(&raw) {
                Ok(letter) => letters.push(letter),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable dead letter"),
            }
        }
        letters.sort_by_key(|l| l.at);
        Ok(letters)
    }
}

#[derive(Debug)]
pub struct SpoolQueue {
    spool: Arc<Spool>,
    in_flight: Mutex<HashSet<MessageId>>,
}

impl SpoolQueue {
    /// Open (and create if needed) a spool rooted at `root`.
    ///
    /// # Errors
    /// Returns [`QueueError::Unavailable`] when the directories cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, QueueError> {
        let root = root.as_ref();
        let queue_dir = root.join(QUEUE_DIR);
        let dead_dir = root.join(DEAD_LETTER_DIR);
        for dir in [&queue_dir, &dead_dir] {
            fs::create_dir_all(dir).map_err(|e| io_unavailable(dir, &e))?;
        }
        Ok(Self {
            spool: Arc::new(Spool {
                queue_dir,
                dead_dir,
            }),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&Spool) -> Result<T, QueueError> + Send + 'static,
    {
        let spool = Arc::clone(&self.spool);
        tokio::task::spawn_blocking(move || op(&spool))
            .await
            .map_err(|e| QueueError::unavailable(format!("spool task failed: {e}")))?
    }

    /// Run a settle operation for an in-flight delivery. The delivery leaves
    /// the in-flight set whatever the outcome; after a failure the file is
    /// still in the queue and gets redelivered.
    async fn settle<F>(&self, delivery: &Delivery, op: F) -> Result<(), QueueError>
    where
        F: FnOnce(&Spool) -> Result<(), QueueError> + Send + 'static,
    {
        if !self.in_flight.lock().contains(&delivery.id) {
            return Err(QueueError::UnknownDelivery {
                id: delivery.id.to_string(),
            });
        }
        let result = self.blocking(op).await;
        self.in_flight.lock().remove(&delivery.id);
        result
    }
}

#[async_trait]
impl TaskQueue for SpoolQueue {
    async fn enqueue(&self, task: ProvisioningTask) -> Result<(), QueueError> {
        let now = Utc::now();
        let envelope = Envelope {
            id: Uuid::new_v4(),
            task,
            attempt: 1,
            not_before: now,
            enqueued_at: now,
        };
        let (id, task_type) = (envelope.id, envelope.task.task_type);
        self.blocking(move |spool| spool.write_envelope(&envelope))
            .await?;
        debug!(message_id = %id, %task_type, "task spooled");
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now();
        let envelopes = self.blocking(Spool::scan).await?;

        let mut in_flight = self.in_flight.lock();
        let next = envelopes
            .into_iter()
            .find(|e| e.not_before <= now && !in_flight.contains(&e.id));

        Ok(next.map(|e| {
            in_flight.insert(e.id);
            Delivery {
                id: e.id,
                task: e.task,
                attempt: e.attempt,
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let id = delivery.id;
        self.settle(delivery, move |spool| spool.remove_message(id))
            .await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let (id, attempt) = (delivery.id, delivery.attempt.saturating_add(1));
        let not_before = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));

        self.settle(delivery, move |spool| {
            let mut envelope = spool.read_envelope(id)?;
            envelope.attempt = attempt;
            envelope.not_before = not_before;
            spool.write_envelope(&envelope)
        })
        .await
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<(), QueueError> {
        let letter = DeadLetter {
            id: delivery.id,
            task: delivery.task.clone(),
            attempts: delivery.attempt,
            reason,
            detail: detail.to_owned(),
            at: Utc::now(),
        };
        self.settle(delivery, move |spool| spool.park(&letter))
            .await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.blocking(Spool::dead_letters).await
    }
}

fn write_json_atomic<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), QueueError> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| QueueError::unavailable(format!("cannot encode {}: {e}", path.display())))?;

    let write = || -> io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".spool-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    };
    write().map_err(|e| io_unavailable(path, &e))
}

fn io_unavailable(path: &Path, e: &io::Error) -> QueueError {
    QueueError::unavailable(format!("{}: {e}", path.display()))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use provisioning_sdk::{UserId, Username};

    use super::*;

    fn task(name: &str) -> ProvisioningTask {
        ProvisioningTask::provision(UserId::new(format!("id-{name}")), Username::parse(name).unwrap())
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_after_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let queue = SpoolQueue::open(dir.path()).unwrap();
        queue.enqueue(task("alice")).await.unwrap();
        let first = queue.receive().await.unwrap().unwrap();
        assert!(queue.receive().await.unwrap().is_none());
        drop(queue);

        let queue = SpoolQueue::open(dir.path()).unwrap();
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempt, 1);

        queue.ack(&again).await.unwrap();
        drop(queue);

        let queue = SpoolQueue::open(dir.path()).unwrap();
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_persists_attempt_and_delay() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path()).unwrap();
        queue.enqueue(task("alice")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.retry(&first, Duration::from_secs(3600)).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());

        let queue = SpoolQueue::open(dir.path()).unwrap();
        assert!(queue.receive().await.unwrap().is_none());

        let envelope = queue.spool.read_envelope(first.id).unwrap();
        assert_eq!(envelope.attempt, 2);
    }

    #[tokio::test]
    async fn zero_delay_retry_is_visible_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path()).unwrap();
        queue.enqueue(task("alice")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.retry(&first, Duration::ZERO).await.unwrap();
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn dead_letters_are_listed_and_removed_from_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path()).unwrap();
        queue.enqueue(task("alice")).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        queue
            .dead_letter(&delivery, DeadLetterReason::Inconsistent, "port owned by another user")
            .await
            .unwrap();

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::Inconsistent);
        assert_eq!(dead[0].task.username.as_str(), "alice");
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path()).unwrap();
        fs::write(dir.path().join(QUEUE_DIR).join("broken.json"), b"{").unwrap();
        queue.enqueue(task("bob1")).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.task.username.as_str(), "bob1");
        assert!(dir.path().join(DEAD_LETTER_DIR).join("broken.json.malformed").exists());
    }

    #[tokio::test]
    async fn failed_retry_leaves_nothing_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path()).unwrap();
        queue.enqueue(task("alice")).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        fs::remove_file(queue.spool.message_path(delivery.id)).unwrap();

        assert!(matches!(
            queue.retry(&delivery, Duration::ZERO).await,
            Err(QueueError::Unavailable { .. })
        ));
        assert!(queue.in_flight.lock().is_empty());
        assert!(matches!(
            queue.ack(&delivery).await,
            Err(QueueError::UnknownDelivery { .. })
        ));
    }

    #[tokio::test]
    async fn failed_dead_letter_is_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path()).unwrap();
        queue.enqueue(task("alice")).await.unwrap();
        let delivery = queue.receive().await.unwrap().unwrap();

        // A plain file where the dead-letter directory should be.
        let dead_dir = dir.path().join(DEAD_LETTER_DIR);
        fs::remove_dir(&dead_dir).unwrap();
        fs::write(&dead_dir, b"").unwrap();

        assert!(
            queue
                .dead_letter(&delivery, DeadLetterReason::Permanent, "boom")
                .await
                .is_err()
        );

        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.id, delivery.id);
        assert_eq!(again.attempt, delivery.attempt);
    }

    #[tokio::test]
    async fn settling_unknown_delivery_fails() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path()).unwrap();
        let bogus = Delivery {
            id: Uuid::new_v4(),
            task: task("alice"),
            attempt: 1,
        };
        assert!(matches!(
            queue.ack(&bogus).await,
            Err(QueueError::UnknownDelivery { .. })
        ));
    }
}
