//! Bounded-concurrency stage executor.
//!
//! A stage is a batch of independent [`Job`]s. The pool starts a fixed number
//! of scoped worker threads that drain a shared queue, enqueues one `Stop`
//! sentinel per worker after the real jobs, and collects one completion per
//! job on a second channel. `run_stage` returns only when every worker has
//! exited, which is the barrier between stages.

use crate::events::{ReportHandle, Stage};
use crate::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use tracing::{debug, span, Level};

type Work<'env, T> = Box<dyn FnOnce() -> Result<T> + Send + 'env>;

/// One unit of work in a stage
pub struct Job<'env, T> {
    id: String,
    work: Work<'env, T>,
}

impl<'env, T> Job<'env, T> {
    pub fn new<F>(id: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'env,
    {
        Self {
            id: id.into(),
            work: Box::new(work),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

enum Message<'env, T> {
    Run(Job<'env, T>),
    Stop,
}

struct Completion<T> {
    id: String,
    result: Result<T>,
}

/// Results of one stage, in completion order
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub outputs: Vec<(String, T)>,
    pub failures: Vec<(String, Error)>,
}

impl<T> Default for StageOutcome<T> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> StageOutcome<T> {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.outputs.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-size pool of worker threads
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every job of `stage` and wait for all of them.
    ///
    /// Per-job errors are collected in the outcome. A fatal error stops
    /// queued jobs from starting and is returned once the workers are joined.
    pub fn run_stage<'env, T>(
        &self,
        stage: Stage,
        jobs: Vec<Job<'env, T>>,
        reporter: &ReportHandle,
    ) -> Result<StageOutcome<T>>
    where
        T: Send + 'env,
    {
        let span = span!(Level::INFO, "stage", %stage);
        let _enter = span.enter();

        let total = jobs.len();
        reporter.stage_started(stage, total);
        if total == 0 {
            return Ok(StageOutcome::default());
        }
        let workers = self.workers.min(total);
        debug!("Running {} jobs on {} workers", total, workers);

        let cancelled = AtomicBool::new(false);
        let mut outcome = thread::scope(|scope| -> Result<StageOutcome<T>> {
            let (job_tx, job_rx) = unbounded::<Message<'env, T>>();
            let (done_tx, done_rx) = unbounded::<Completion<T>>();

            let mut handles = Vec::with_capacity(workers);
            for n in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let cancelled = &cancelled;
                let handle = thread::Builder::new()
                    .name(format!("tapestry-{}-{}", stage, n))
                    .spawn_scoped(scope, move || worker_loop(job_rx, done_tx, cancelled))?;
                handles.push(handle);
            }
            drop(done_tx);

            for job in jobs {
                job_tx.send(Message::Run(job)).map_err(|_| Error::WorkerPool {
                    reason: format!("{} queue closed", stage),
                })?;
            }
            for _ in 0..workers {
                job_tx.send(Message::Stop).map_err(|_| Error::WorkerPool {
                    reason: format!("{} queue closed", stage),
                })?;
            }

            let mut outcome = StageOutcome::default();
            // ends once every worker has dropped its completion sender
            for completion in done_rx.iter() {
                reporter.task_done(stage);
                match completion.result {
                    Ok(value) => outcome.outputs.push((completion.id, value)),
                    Err(e) => {
                        if e.is_fatal() {
                            cancelled.store(true, Ordering::SeqCst);
                        }
                        outcome.failures.push((completion.id, e));
                    }
                }
            }

            for handle in handles {
                handle.join().map_err(|_| Error::WorkerPool {
                    reason: format!("{} worker exited abnormally", stage),
                })?;
            }
            Ok(outcome)
        })?;

        if let Some(index) = outcome.failures.iter().position(|(_, e)| e.is_fatal()) {
            let (id, error) = outcome.failures.swap_remove(index);
            debug!("Stage aborted by task {}", id);
            return Err(error);
        }
        Ok(outcome)
    }
}

fn worker_loop<T>(
    jobs: Receiver<Message<'_, T>>,
    done: Sender<Completion<T>>,
    cancelled: &AtomicBool,
) {
    while let Ok(Message::Run(job)) = jobs.recv() {
        let Job { id, work } = job;
        let result = if cancelled.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else {
            panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
                Err(Error::WorkerPool {
                    reason: format!("task {} panicked: {}", id, panic_message(payload.as_ref())),
                })
            })
        };
        if done.send(Completion { id, result }).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One mutex per archive file
#[derive(Debug, Default)]
pub struct ArchiveLocks {
    locks: HashMap<String, Mutex<()>>,
}

impl ArchiveLocks {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            locks: names
                .into_iter()
                .map(|n| (n.into(), Mutex::new(())))
                .collect(),
        }
    }

    /// Run `f` while holding the archive's mutex
    pub fn with_lock<R>(&self, archive: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let lock = self.locks.get(archive).ok_or_else(|| Error::WorkerPool {
            reason: format!("no lock registered for archive {}", archive),
        })?;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}
