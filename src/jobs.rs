//! Single-slot coalescing job queue.
//!
//! Used for work where only the newest request matters (theme regeneration
//! and similar): one job runs, at most one replacement waits, and a newer
//! submission preempts the waiting one. The preempted submitter is notified
//! with a cancelled result rather than left hanging.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Outcome delivered to each submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Done,
    Failed(String),
    Cancelled,
}

type JobFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type JobFactory = Box<dyn FnOnce() -> JobFuture + Send>;

struct QueuedJob {
    run: JobFactory,
    done: oneshot::Sender<JobResult>,
}

#[derive(Default)]
struct Slots {
    running: bool,
    pending: Option<QueuedJob>,
}

/// The queue itself. Cheap to clone; all clones share the slots.
#[derive(Clone, Default)]
pub struct Queue {
    slots: Arc<Mutex<Slots>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits a job, preempting any job still waiting to run. Returns a
    /// receiver for the job's outcome.
    pub fn submit<F, Fut>(&self, job: F) -> oneshot::Receiver<JobResult>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedJob {
            run: Box::new(move || Box::pin(job())),
            done: done_tx,
        };

        let start_worker = {
            let mut slots = self.slots.lock().unwrap();

            if let Some(preempted) = slots.pending.take() {
                info!("cancelling pending job in favor of a newer one");
                let _ = preempted.done.send(JobResult::Cancelled);
            }

            if slots.running {
                slots.pending = Some(queued);
                false
            } else {
                slots.running = true;
                slots.pending = Some(queued);
                true
            }
        };

        if start_worker {
            let queue = self.clone();
            tokio::spawn(async move { queue.run_worker().await });
        }

        done_rx
    }

    pub fn is_running(&self) -> bool {
        self.slots.lock().unwrap().running
    }

    pub fn has_pending(&self) -> bool {
        self.slots.lock().unwrap().pending.is_some()
    }

    async fn run_worker(&self) {
        loop {
            let job = {
                let mut slots = self.slots.lock().unwrap();
                match slots.pending.take() {
                    Some(job) => job,
                    None => {
                        slots.running = false;
                        return;
                    }
                }
            };

            let result = match (job.run)().await {
                Ok(()) => JobResult::Done,
                Err(err) => JobResult::Failed(err),
            };
            let _ = job.done.send(result);
        }
    }
}
