use std::{collections::HashMap, sync::Arc, thread, time::Duration};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use super::BulkStats;

/// A bulk run packaged for a background worker.
pub type BulkJob = Box<dyn FnOnce() -> BulkStats + Send + 'static>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue is not accepting work: {0}")]
    Unavailable(String),
}

/// Something that can run bulk jobs off the request path.
pub trait TaskQueue: Send + Sync {
    fn submit(&self, job: BulkJob) -> Result<Uuid, QueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed { stats: BulkStats },
    Failed { reason: String },
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed { .. } | TaskStatus::Failed { .. })
    }
}

#[derive(Default)]
struct Board {
    tasks: Mutex<HashMap<Uuid, TaskStatus>>,
    changed: Condvar,
}

impl Board {
    fn set(&self, id: Uuid, status: TaskStatus) {
        self.tasks.lock().insert(id, status);
        self.changed.notify_all();
    }
}

/// Runs each job on its own named thread and records its status.
#[derive(Clone, Default)]
pub struct ThreadTaskQueue {
    board: Arc<Board>,
}

impl std::fmt::Debug for ThreadTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTaskQueue")
            .field("tasks", &self.board.tasks.lock().len())
            .finish()
    }
}

impl ThreadTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, id: Uuid) -> Option<TaskStatus> {
        self.board.tasks.lock().get(&id).cloned()
    }

    /// Block until `id` finishes or `timeout` passes; returns the last status seen.
    pub fn wait(&self, id: Uuid, timeout: Duration) -> Option<TaskStatus> {
        let mut tasks = self.board.tasks.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match tasks.get(&id) {
                Some(status) if status.is_finished() => return Some(status.clone()),
                None => return None,
                Some(_) => {}
            }
            if self.board.changed.wait_until(&mut tasks, deadline).timed_out() {
                return tasks.get(&id).cloned();
            }
        }
    }
}

impl TaskQueue for ThreadTaskQueue {
    fn submit(&self, job: BulkJob) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        self.board.set(id, TaskStatus::Pending);

        let board = Arc::clone(&self.board);
        let spawned = thread::Builder::new()
            .name(format!("stowage-bulk-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                board.set(id, TaskStatus::Running);
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                    Ok(stats) => {
                        debug!(task = %id, succeeded = stats.succeeded, failed = stats.failed, "bulk task finished");
                        board.set(id, TaskStatus::Completed { stats });
                    }
                    Err(_) => {
                        error!(task = %id, "bulk task panicked");
                        board.set(id, TaskStatus::Failed {
                            reason: "worker panicked".to_string(),
                        });
                    }
                }
            });

        match spawned {
            Ok(_) => Ok(id),
            Err(e) => {
                self.board.tasks.lock().remove(&id);
                Err(QueueError::Unavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkOperation;

    fn stats() -> BulkStats {
        BulkStats::new(BulkOperation::Delete)
    }

    #[test]
    fn runs_job_and_reports_completion() {
        let queue = ThreadTaskQueue::new();
        let id = queue.submit(Box::new(stats)).unwrap();
        let status = queue.wait(id, Duration::from_secs(10)).unwrap();
        assert!(matches!(status, TaskStatus::Completed { .. }));
        assert_eq!(queue.status(id), Some(status));
    }

    #[test]
    fn panicking_job_is_reported() {
        let queue = ThreadTaskQueue::new();
        let id = queue
            .submit(Box::new(|| -> BulkStats { panic!("boom") }))
            .unwrap();
        let status = queue.wait(id, Duration::from_secs(10)).unwrap();
        assert!(matches!(status, TaskStatus::Failed { .. }));
    }

    #[test]
    fn unknown_task_has_no_status() {
        let queue = ThreadTaskQueue::new();
        assert!(queue.status(Uuid::new_v4()).is_none());
        assert!(queue.wait(Uuid::new_v4(), Duration::from_millis(1)).is_none());
    }
}
