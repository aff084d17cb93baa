//! The background work queue
//!
//! Jobs run one at a time, in submission order, either on a dedicated thread (see [WorkQueue::run])
//! or on whichever caller thread drives the queue with [WorkQueue::do_work]. Every job is shared
//! through an [Arc]'d [Work], so any number of threads can wait for its result.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::{Error, Pnum, Result};

/// What a job does
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WorkKind {
    Erase { pnum: Pnum, torture: bool },
    WearLevel,
    Consolidate,
}

/// Executes jobs on behalf of the queue
pub trait Worker {
    /// Run a job. In `cancel` mode no I/O may be done; the job only gives back what it holds.
    fn execute(&self, kind: &WorkKind, cancel: bool) -> Result<()>;

    fn is_read_only(&self) -> bool;

    fn set_read_only(&self);
}

/// A queued job and its eventual result
#[derive(Debug)]
pub struct Work {
    kind: WorkKind,
    done: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

impl Work {
    fn new(kind: WorkKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            done: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    pub fn kind(&self) -> &WorkKind {
        &self.kind
    }

    pub fn is_done(&self) -> bool {
        self.done.lock().is_some()
    }

    /// Block until the job has completed, returning its result
    pub fn wait(&self) -> Result<()> {
        let mut done = self.done.lock();
        loop {
            if let Some(result) = done.as_ref() {
                return result.clone();
            }
            self.cv.wait(&mut done);
        }
    }

    fn complete(&self, result: Result<()>) {
        *self.done.lock() = Some(result);
        self.cv.notify_all();
    }
}

#[derive(Debug, Default)]
struct QueueState {
    works: VecDeque<Arc<Work>>,

    /// The job being executed right now
    current: Option<Arc<Work>>,

    suspended: bool,
    disabled: bool,
    stop: bool,

    /// Consecutive failed jobs
    failures: u32,
}

#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
    max_failures: u32,
}

/// Resumes the queue when dropped; see [WorkQueue::suspend]
#[must_use]
pub struct SuspendGuard<'a> {
    queue: &'a WorkQueue,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.queue.resume();
    }
}

impl WorkQueue {
    pub fn new(max_failures: u32) -> Self {
        Self {
            state: Default::default(),
            cv: Condvar::new(),
            max_failures,
        }
    }

    /// Number of jobs queued or running
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.works.len() + usize::from(state.current.is_some())
    }

    /// Queue a job. If the queue no longer dispatches, the job is cancelled on the spot and
    /// completes with [Error::ReadOnly].
    pub fn schedule<W: Worker + ?Sized>(&self, worker: &W, kind: WorkKind) -> Arc<Work> {
        let work = Work::new(kind);

        let mut state = self.state.lock();
        if state.disabled || worker.is_read_only() {
            drop(state);
            debug!(?kind, "queue disabled, cancelling job");
            Self::cancel(worker, &work, Error::ReadOnly);
            return work;
        }

        state.works.push_back(work.clone());
        drop(state);
        self.cv.notify_all();

        work
    }

    /// Queue a job and wait for it; `inline` drives the queue from this thread
    pub fn schedule_sync<W: Worker + ?Sized>(
        &self,
        worker: &W,
        kind: WorkKind,
        inline: bool,
    ) -> Result<()> {
        let work = self.schedule(worker, kind);
        if inline {
            while !work.is_done() && self.do_work(worker).is_some() {}
        }
        work.wait()
    }

    /// Run the job at the head of the queue on this thread
    ///
    /// Returns `None` when there is nothing to run (empty, suspended, or no longer dispatching).
    pub fn do_work<W: Worker + ?Sized>(&self, worker: &W) -> Option<Result<()>> {
        if worker.is_read_only() {
            self.disable(worker);
            return None;
        }

        let work = {
            let mut state = self.state.lock();
            while state.current.is_some() {
                self.cv.wait(&mut state);
            }
            if state.suspended || state.disabled {
                return None;
            }
            let work = state.works.pop_front()?;
            state.current = Some(work.clone());
            work
        };

        let result = worker.execute(&work.kind, false);

        let tripped = {
            let mut state = self.state.lock();
            state.current = None;
            match &result {
                Ok(()) => state.failures = 0,
                Err(err) => {
                    state.failures += 1;
                    debug!(kind = ?work.kind, %err, failures = state.failures, "job failed");
                }
            }
            state.failures > self.max_failures
        };
        work.complete(result.clone());
        self.cv.notify_all();

        if tripped {
            error!(
                failures = self.max_failures,
                "too many consecutive job failures, switching to read-only mode"
            );
            worker.set_read_only();
        }
        if worker.is_read_only() {
            self.disable(worker);
        }

        Some(result)
    }

    /// Wait for the running job, or the one at the head of the queue, to finish
    ///
    /// Returns `None` if there was no job to wait for.
    pub fn join_one<W: Worker + ?Sized>(&self, worker: &W, inline: bool) -> Option<Result<()>> {
        if inline {
            return self.do_work(worker);
        }

        let work = {
            let state = self.state.lock();
            state.current.clone().or_else(|| state.works.front().cloned())
        }?;
        Some(work.wait())
    }

    /// Wait until every job queued so far has completed, returning the result of the last one
    pub fn flush<W: Worker + ?Sized>(&self, worker: &W, inline: bool) -> Result<()> {
        let tail = {
            let state = self.state.lock();
            state.works.back().cloned().or_else(|| state.current.clone())
        };
        let Some(tail) = tail else { return Ok(()) };

        if inline {
            while !tail.is_done() && self.do_work(worker).is_some() {}
        }
        tail.wait()
    }

    /// Stop dispatching new jobs, after the running one (if any) finishes
    pub fn suspend(&self) -> SuspendGuard<'_> {
        let mut state = self.state.lock();
        state.suspended = true;
        while state.current.is_some() {
            self.cv.wait(&mut state);
        }
        SuspendGuard { queue: self }
    }

    pub fn resume(&self) {
        self.state.lock().suspended = false;
        self.cv.notify_all();
    }

    /// Stop dispatching for good, cancelling everything still queued with [Error::ReadOnly]
    pub fn disable<W: Worker + ?Sized>(&self, worker: &W) {
        let works = {
            let mut state = self.state.lock();
            state.disabled = true;
            std::mem::take(&mut state.works)
        };
        self.cv.notify_all();
        Self::cancel_all(worker, works, Error::ReadOnly);
    }

    /// Stop the queue: the worker thread (if any) exits, and every queued job is run in cancel
    /// mode and completed with `result`
    pub fn shutdown<W: Worker + ?Sized>(&self, worker: &W, result: Error) {
        let works = {
            let mut state = self.state.lock();
            state.stop = true;
            state.disabled = true;
            std::mem::take(&mut state.works)
        };
        self.cv.notify_all();
        Self::cancel_all(worker, works, result);
    }

    fn cancel_all<W: Worker + ?Sized>(worker: &W, works: VecDeque<Arc<Work>>, result: Error) {
        if !works.is_empty() {
            debug!(count = works.len(), "cancelling queued jobs");
        }
        for work in works {
            Self::cancel(worker, &work, result.clone());
        }
    }

    /// Let the worker clean up after a job that will not run, then complete it with `result`
    fn cancel<W: Worker + ?Sized>(worker: &W, work: &Work, result: Error) {
        if let Err(err) = worker.execute(&work.kind, true) {
            warn!(kind = ?work.kind, %err, "cancelled job failed to clean up");
        }
        work.complete(Err(result));
    }

    /// The body of the worker thread; returns once [WorkQueue::shutdown] is called
    pub fn run<W: Worker + ?Sized>(&self, worker: &W) {
        debug!("background worker started");
        loop {
            {
                let mut state = self.state.lock();
                while !state.stop
                    && (state.works.is_empty()
                        || state.suspended
                        || state.disabled
                        || state.current.is_some())
                {
                    self.cv.wait(&mut state);
                }
                if state.stop {
                    break;
                }
            }
            self.do_work(worker);
        }
        debug!("background worker stopped");
    }
}
