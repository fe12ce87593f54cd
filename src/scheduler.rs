//! Bounded task scheduler.
//!
//! At most `limit` pipeline jobs run at once; the rest wait in FIFO order.
//! A finished job hands its slot to a job chained onto the same task, or
//! else to the head of the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use crate::task::TaskId;

/// Unit of pipeline work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Job {
    /// Stages 1-4, ending at the human gate
    Discover,
    /// Verification and report after approval
    Verify,
}

/// Outcome of [`Scheduler::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    /// Waiting for a slot; 1-based position in the queue
    Queued { position: usize },
    /// The task already holds a slot or a queue entry
    AlreadyActive,
}

#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn execute(&self, task_id: TaskId, job: Job);
}

#[derive(Debug, Default)]
struct Inner {
    running: usize,
    active: HashSet<TaskId>,
    queue: VecDeque<(TaskId, Job)>,
    /// Jobs that take over the slot of a running job for the same task
    follow_ups: HashMap<TaskId, Job>,
}

#[derive(Clone)]
pub struct Scheduler {
    limit: usize,
    inner: Arc<Mutex<Inner>>,
    runner: Arc<dyn JobRunner>,
}

impl Scheduler {
    pub fn new(limit: usize, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            limit: limit.max(1),
            inner: Arc::new(Mutex::new(Inner::default())),
            runner,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `job` now if a slot is free, otherwise queue it.
    pub fn submit(&self, task_id: TaskId, job: Job) -> Admission {
        let admission = {
            let mut inner = self.lock();
            if inner.active.contains(&task_id) {
                return Admission::AlreadyActive;
            }
            inner.active.insert(task_id.clone());
            if inner.running < self.limit {
                inner.running += 1;
                Admission::Started
            } else {
                inner.queue.push_back((task_id.clone(), job));
                Admission::Queued {
                    position: inner.queue.len(),
                }
            }
        };

        match admission {
            Admission::Started => {
                tracing::info!(task_id = %task_id, ?job, "Job started");
                self.spawn(task_id, job);
            }
            Admission::Queued { position } => {
                tracing::info!(task_id = %task_id, ?job, position, "Job queued");
            }
            Admission::AlreadyActive => {}
        }
        admission
    }

    /// Like [`Scheduler::submit`], but when the task's previous job is still
    /// winding down `job` runs in its slot as soon as it finishes.
    pub fn chain(&self, task_id: TaskId, job: Job) -> Admission {
        {
            let mut inner = self.lock();
            let queued = inner.queue.iter().any(|(id, _)| *id == task_id);
            if inner.active.contains(&task_id) && !queued {
                if inner.follow_ups.contains_key(&task_id) {
                    return Admission::AlreadyActive;
                }
                inner.follow_ups.insert(task_id.clone(), job);
                tracing::info!(task_id = %task_id, ?job, "Job chained");
                return Admission::Started;
            }
        }
        self.submit(task_id, job)
    }

    /// 1-based queue position, `None` when the task is not waiting.
    pub fn position(&self, task_id: &TaskId) -> Option<usize> {
        self.lock()
            .queue
            .iter()
            .position(|(id, _)| id == task_id)
            .map(|i| i + 1)
    }

    pub fn is_active(&self, task_id: &TaskId) -> bool {
        self.lock().active.contains(task_id)
    }

    /// Drop a queued job. Returns false when the task is running or unknown.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let mut inner = self.lock();
        let before = inner.queue.len();
        inner.queue.retain(|(id, _)| id != task_id);
        if inner.queue.len() == before {
            return false;
        }
        inner.active.remove(task_id);
        true
    }

    pub fn running(&self) -> usize {
        self.lock().running
    }

    fn spawn(&self, task_id: TaskId, job: Job) {
        let scheduler = self.clone();
        let runner = self.runner.clone();
        tokio::spawn(async move {
            let id = task_id.clone();
            let handle = tokio::spawn(async move { runner.execute(id, job).await });
            if let Err(e) = handle.await {
                tracing::error!(task_id = %task_id, ?job, "Job panicked: {}", e);
            }
            scheduler.release(&task_id);
        });
    }

    /// Free the slot held by `task_id` and start the next queued job on it.
    fn release(&self, task_id: &TaskId) {
        let next = {
            let mut inner = self.lock();
            if let Some(job) = inner.follow_ups.remove(task_id) {
                Some((task_id.clone(), job))
            } else {
                inner.active.remove(task_id);
                match inner.queue.pop_front() {
                    Some(next) => Some(next),
                    None => {
                        inner.running = inner.running.saturating_sub(1);
                        None
                    }
                }
            }
        };

        if let Some((next_id, job)) = next {
            tracing::info!(task_id = %next_id, ?job, "Job started from queue");
            self.spawn(next_id, job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    /// Runner whose jobs block until the test releases a permit.
    struct GatedRunner {
        gate: Arc<Semaphore>,
        started: mpsc::UnboundedSender<(TaskId, Job)>,
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn execute(&self, task_id: TaskId, job: Job) {
            let _ = self.started.send((task_id, job));
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
    }

    fn id(n: u32) -> TaskId {
        format!("t_{:08x}", n).parse().unwrap()
    }

    fn gated(limit: usize) -> (Scheduler, Arc<Semaphore>, mpsc::UnboundedReceiver<(TaskId, Job)>) {
        let gate = Arc::new(Semaphore::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Arc::new(GatedRunner {
            gate: gate.clone(),
            started: tx,
        });
        (Scheduler::new(limit, runner), gate, rx)
    }

    async fn next_started(rx: &mut mpsc::UnboundedReceiver<(TaskId, Job)>) -> TaskId {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn test_limit_is_respected_and_queue_is_fifo() {
        let (scheduler, gate, mut rx) = gated(2);

        assert_eq!(scheduler.submit(id(1), Job::Discover), Admission::Started);
        assert_eq!(scheduler.submit(id(2), Job::Discover), Admission::Started);
        assert_eq!(
            scheduler.submit(id(3), Job::Discover),
            Admission::Queued { position: 1 }
        );
        assert_eq!(
            scheduler.submit(id(4), Job::Discover),
            Admission::Queued { position: 2 }
        );
        assert_eq!(scheduler.running(), 2);

        let mut first = vec![next_started(&mut rx).await, next_started(&mut rx).await];
        first.sort();
        assert_eq!(first, vec![id(1), id(2)]);
        assert_eq!(scheduler.position(&id(4)), Some(2));

        gate.add_permits(1);
        assert_eq!(next_started(&mut rx).await, id(3));
        assert_eq!(scheduler.position(&id(4)), Some(1));
        assert_eq!(scheduler.running(), 2);

        gate.add_permits(3);
        assert_eq!(next_started(&mut rx).await, id(4));

        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.running() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!scheduler.is_active(&id(4)));
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_rejected() {
        let (scheduler, gate, mut rx) = gated(1);
        assert_eq!(scheduler.submit(id(1), Job::Discover), Admission::Started);
        assert_eq!(scheduler.submit(id(1), Job::Verify), Admission::AlreadyActive);
        assert_eq!(scheduler.submit(id(2), Job::Discover), Admission::Queued { position: 1 });
        assert_eq!(scheduler.submit(id(2), Job::Discover), Admission::AlreadyActive);
        next_started(&mut rx).await;
        gate.add_permits(2);
    }

    #[tokio::test]
    async fn test_cancel_removes_queued_job() {
        let (scheduler, gate, mut rx) = gated(1);
        scheduler.submit(id(1), Job::Discover);
        scheduler.submit(id(2), Job::Discover);
        scheduler.submit(id(3), Job::Discover);

        assert!(scheduler.cancel(&id(2)));
        assert!(!scheduler.cancel(&id(1)));
        assert!(!scheduler.is_active(&id(2)));
        assert_eq!(scheduler.position(&id(3)), Some(1));

        assert_eq!(next_started(&mut rx).await, id(1));
        gate.add_permits(1);
        assert_eq!(next_started(&mut rx).await, id(3));
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_chained_job_reuses_slot() {
        let (scheduler, gate, mut rx) = gated(1);
        scheduler.submit(id(1), Job::Discover);
        assert_eq!(next_started(&mut rx).await, id(1));
        scheduler.submit(id(2), Job::Discover);

        assert_eq!(scheduler.chain(id(1), Job::Verify), Admission::Started);
        assert_eq!(scheduler.chain(id(1), Job::Verify), Admission::AlreadyActive);

        gate.add_permits(1);
        let (next, job) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((next, job), (id(1), Job::Verify));
        assert_eq!(scheduler.position(&id(2)), Some(1));

        gate.add_permits(1);
        assert_eq!(next_started(&mut rx).await, id(2));
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_chain_without_running_job_submits() {
        let (scheduler, gate, mut rx) = gated(1);
        assert_eq!(scheduler.chain(id(7), Job::Verify), Admission::Started);
        assert_eq!(next_started(&mut rx).await, id(7));
        gate.add_permits(1);
    }

    struct PanickingRunner;

    #[async_trait]
    impl JobRunner for PanickingRunner {
        async fn execute(&self, task_id: TaskId, _job: Job) {
            if task_id.as_str() == "t_00000001" {
                panic!("boom");
            }
        }
    }

    #[tokio::test]
    async fn test_panicking_job_releases_its_slot() {
        let scheduler = Scheduler::new(1, Arc::new(PanickingRunner));
        scheduler.submit(id(1), Job::Discover);
        scheduler.submit(id(2), Job::Discover);

        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.running() > 0 || scheduler.is_active(&id(2)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!scheduler.is_active(&id(1)));
    }
}
