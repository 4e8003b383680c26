//! Runs copy tasks on the tokio worker pool with a hard cap on how many are in flight.
//!
//! Every submitted task is recorded in the scheduler's registry under a fresh [`TaskId`] before
//! it is allowed to start. A task reports its terminal outcome over a completion channel; the
//! reclaim step removes the registry entry and folds the outcome into the running [`Report`] in
//! one locked step, so an entry is either present and pending or gone and accounted for.
//!
//! Submission waits for a permit from the scheduler's own [`throttle::Semaphore`], reclaiming
//! finished tasks while it waits. [`Scheduler::drain`] returns only once the registry is empty.

use tracing::instrument;

use crate::copy::{self, CopyTask, Failure, Summary};
use crate::progress;

pub type TaskId = u64;

type Outcome = (TaskId, Result<u64, Failure>);

struct Entry {
    task: CopyTask,
    // kept so the registry owns the running task until it is reclaimed
    _handle: tokio::task::JoinHandle<()>,
}

/// Delivers the task's outcome when dropped, including when the task unwinds (in builds that
/// unwind on panic).
struct CompletionSignal {
    id: TaskId,
    task: CopyTask,
    outcome: Option<Result<u64, Failure>>,
    done: tokio::sync::mpsc::UnboundedSender<Outcome>,
}

impl CompletionSignal {
    fn complete(mut self, result: Result<u64, Failure>) {
        self.outcome = Some(result);
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(Failure::Panicked {
                src: self.task.src().to_path_buf(),
                dst: self.task.dst().to_path_buf(),
                reason: "task ended without reporting an outcome".to_string(),
            })
        });
        // the receiver lives as long as the scheduler, which outlives all of its tasks
        let _ = self.done.send((self.id, outcome));
    }
}

/// Aggregated outcome of every task a scheduler ran.
#[derive(Debug, Default)]
pub struct Report {
    pub summary: Summary,
    pub failures: Vec<(CopyTask, Failure)>,
}

pub struct Scheduler {
    prog_track: &'static progress::Progress,
    limit: throttle::Semaphore,
    registry: std::sync::Mutex<std::collections::HashMap<TaskId, Entry>>,
    done_tx: tokio::sync::mpsc::UnboundedSender<Outcome>,
    done_rx: tokio::sync::mpsc::UnboundedReceiver<Outcome>,
    next_id: TaskId,
    report: Report,
}

impl Scheduler {
    /// # Panics
    ///
    /// Panics if `max_concurrency` is zero.
    #[must_use]
    pub fn new(prog_track: &'static progress::Progress, max_concurrency: usize) -> Self {
        let (done_tx, done_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            prog_track,
            limit: throttle::Semaphore::new(max_concurrency),
            registry: std::sync::Mutex::new(std::collections::HashMap::new()),
            done_tx,
            done_rx,
            next_id: 0,
            report: Report::default(),
        }
    }

    fn registry(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<TaskId, Entry>> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of registered tasks that have not been reclaimed yet.
    pub fn in_flight(&self) -> usize {
        self.registry().len()
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.limit.limit()
    }

    /// Registers `task` and starts it, waiting for a free slot first if the pool is saturated.
    #[instrument(skip(self))]
    pub async fn submit(&mut self, task: CopyTask) -> TaskId {
        self.reclaim_ready();
        let permit = loop {
            tokio::select! {
                biased;
                Some((id, result)) = self.done_rx.recv() => self.reclaim(id, result),
                permit = self.limit.acquire_owned() => break permit,
            }
        };
        let id = self.next_id;
        self.next_id += 1;
        let (start_tx, start_rx) = tokio::sync::oneshot::channel::<()>();
        let signal = CompletionSignal {
            id,
            task: task.clone(),
            outcome: None,
            done: self.done_tx.clone(),
        };
        let prog_track = self.prog_track;
        let run = task.clone();
        let handle = tokio::spawn(async move {
            if start_rx.await.is_err() {
                return;
            }
            let result = copy::copy_file(prog_track, &run).await;
            // free the slot before reporting, so a waiting submitter can proceed right away
            drop(permit);
            signal.complete(result);
        });
        self.registry().insert(
            id,
            Entry {
                task,
                _handle: handle,
            },
        );
        // registered, now let it run
        let _ = start_tx.send(());
        tracing::trace!("task {} submitted", id);
        id
    }

    fn reclaim_ready(&mut self) {
        while let Ok((id, result)) = self.done_rx.try_recv() {
            self.reclaim(id, result);
        }
    }

    fn reclaim(&mut self, id: TaskId, result: Result<u64, Failure>) {
        let Some(entry) = self.registry().remove(&id) else {
            tracing::error!("completion for unknown task {}", id);
            return;
        };
        match result {
            Ok(bytes) => {
                tracing::debug!("copied {:?} -> {:?}", entry.task.src(), entry.task.dst());
                self.prog_track.files_copied.inc();
                self.report.summary.files_copied += 1;
                self.report.summary.bytes_copied += bytes;
            }
            Err(failure) => {
                tracing::error!("{}", &failure);
                self.prog_track.files_failed.inc();
                self.report.summary.files_failed += 1;
                self.report.failures.push((entry.task, failure));
            }
        }
    }

    /// Waits until every submitted task has reached a terminal state and been reclaimed.
    #[instrument(skip(self))]
    pub async fn drain(mut self) -> Report {
        self.reclaim_ready();
        while self.in_flight() > 0 {
            match self.done_rx.recv().await {
                Some((id, result)) => self.reclaim(id, result),
                // unreachable while `self.done_tx` is alive
                None => break,
            }
        }
        tracing::debug!(
            "drained: {} copied, {} failed",
            self.report.summary.files_copied,
            self.report.summary.files_failed
        );
        self.report
    }
}
