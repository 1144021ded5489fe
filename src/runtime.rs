//! Bounded concurrency runtime.
//!
//! Two kinds of pool drive a run:
//!
//! - a [`DbPool`] per database side, whose worker count is the side's
//!   connection budget. Workers pull query jobs, run them against the
//!   adapter (retrying transient failures per the job's policy), and reply
//!   on a per-job channel.
//! - one [`TaskPool`] for orchestration. Segment tasks run here; they
//!   block only on DbPool replies and on the bounded result channel, and
//!   DbPool workers never wait on the task pool, so there is no wait
//!   cycle.
//!
//! A two-sided task always submits its left query before its right one —
//! a fixed acquisition order, so two tasks cannot deadlock on the two
//! connection budgets.
//!
//! A single [`CancelToken`] propagates to every worker; a worker observes
//! cancellation before executing, so no new query is issued once the token
//! is set.

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::db::Database;
use crate::error::{DiffError, RetryPolicy};
use crate::plan::{QueryOutput, QueryPlan};

// ── Cancellation ───────────────────────────────────────────────────────────

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The configured diff limit was reached. Reported as success.
    LimitReached,
    /// The consumer dropped the result stream.
    StreamClosed,
    /// A segment failed under `strict_errors`.
    Failed,
}

/// Shared cancellation flag. The first cancel wins; later reasons are
/// ignored.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        if let Ok(mut slot) = self.reason.lock()
            && slot.is_none()
        {
            *slot = Some(reason);
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.lock().ok().and_then(|slot| *slot)
    }

    /// The error a task should propagate when it observes cancellation.
    pub fn as_error(&self) -> DiffError {
        match self.reason() {
            Some(CancelReason::LimitReached) => DiffError::LimitReached,
            _ => DiffError::Cancelled,
        }
    }
}

// ── Database pools ─────────────────────────────────────────────────────────

struct DbJob {
    plan: QueryPlan,
    retry: RetryPolicy,
    reply: Sender<Result<QueryOutput, DiffError>>,
}

/// Reply handle for one submitted query.
pub struct PendingQuery(Receiver<Result<QueryOutput, DiffError>>);

impl PendingQuery {
    /// Block until the query finishes. A dropped pool reads as
    /// cancellation.
    pub fn wait(self) -> Result<QueryOutput, DiffError> {
        self.0.recv().unwrap_or(Err(DiffError::Cancelled))
    }
}

/// Bounded worker pool over one database side.
pub struct DbPool {
    tx: Option<Sender<DbJob>>,
    db: Arc<dyn Database>,
}

impl DbPool {
    /// Spawn `workers` threads over the adapter. Workers exit when the
    /// pool is dropped and the queue drains.
    pub fn new(db: Arc<dyn Database>, workers: usize, cancel: CancelToken) -> Self {
        let (tx, rx) = unbounded::<DbJob>();
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let db = db.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                for job in rx.iter() {
                    if cancel.is_cancelled() {
                        let _ = job.reply.send(Err(cancel.as_error()));
                        continue;
                    }
                    let _ = job.reply.send(run_with_retry(&*db, &job, &cancel));
                }
            });
        }
        DbPool { tx: Some(tx), db }
    }

    /// Queue a plan for execution on this side.
    pub fn submit(&self, plan: QueryPlan, retry: RetryPolicy) -> PendingQuery {
        let (reply_tx, reply_rx) = bounded(1);
        let job = DbJob {
            plan,
            retry,
            reply: reply_tx,
        };
        if let Some(tx) = &self.tx {
            // A send failure means the pool already shut down; the reply
            // channel then reads as cancelled.
            let _ = tx.send(job);
        }
        PendingQuery(reply_rx)
    }

    /// Ask the adapter to cancel whatever is in flight. Best-effort.
    pub fn cancel_inflight(&self) {
        self.db.cancel_inflight();
    }
}

impl Drop for DbPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain and exit on their own.
        self.tx.take();
    }
}

fn run_with_retry(
    db: &dyn Database,
    job: &DbJob,
    cancel: &CancelToken,
) -> Result<QueryOutput, DiffError> {
    let mut attempt = 0usize;
    loop {
        match db.execute(&job.plan) {
            Ok(output) => return Ok(output),
            Err(DiffError::TransientBackend(msg)) => match job.retry.delay(attempt) {
                Some(delay) if !cancel.is_cancelled() => {
                    tracing::debug!(
                        plan = job.plan.label(),
                        attempt,
                        "transient backend error, retrying: {msg}"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                _ => return Err(DiffError::FatalBackend(msg)),
            },
            Err(e) => return Err(e),
        }
    }
}

// ── Orchestration pool ─────────────────────────────────────────────────────

#[derive(Default)]
struct TaskCount {
    active: Mutex<usize>,
    idle: Condvar,
}

type Task = Box<dyn FnOnce() + Send>;

/// Unbounded task pool for segment orchestration. Tracks outstanding work
/// so the coordinator can wait for the whole segment tree to terminate.
pub struct TaskPool {
    tx: Option<Sender<Task>>,
    count: Arc<TaskCount>,
}

impl TaskPool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let count = Arc::new(TaskCount::default());
        for _ in 0..threads.max(1) {
            let rx: Receiver<Task> = rx.clone();
            let count = count.clone();
            thread::spawn(move || {
                for task in rx.iter() {
                    task();
                    let mut active = count.active.lock().expect("task count poisoned");
                    *active -= 1;
                    if *active == 0 {
                        count.idle.notify_all();
                    }
                }
            });
        }
        TaskPool {
            tx: Some(tx),
            count,
        }
    }

    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut active = self.count.active.lock().expect("task count poisoned");
            *active += 1;
        }
        if let Some(tx) = &self.tx
            && tx.send(Box::new(task)).is_ok()
        {
            return;
        }
        // Pool already shut down; undo the reservation.
        let mut active = self.count.active.lock().expect("task count poisoned");
        *active -= 1;
        if *active == 0 {
            self.count.idle.notify_all();
        }
    }

    /// Block until every spawned task (including ones spawned by tasks)
    /// has finished.
    pub fn wait_idle(&self) {
        let mut active = self.count.active.lock().expect("task count poisoned");
        while *active > 0 {
            active = self
                .count
                .idle
                .wait(active)
                .expect("task count poisoned");
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.tx.take();
    }
}
