//! The asynchronous work engine.
//!
//! Collective calls construct a work item, enqueue it, and hand the caller
//! a shared handle. A small pool of worker threads pops items in FIFO
//! order and executes them; completion (or a captured failure) is
//! observed through `wait()`. The queue tracks in-progress items per
//! worker so a barrier can fence against everything submitted before it.

use crate::error::{PlexusError, Result};
use crate::tensor::Tensor;
use crate::types::{Rank, Tag};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};

/// A unit of collective work executed on a worker thread.
///
/// `run` does the blocking transport call; `synchronize` is invoked on the
/// caller's thread after completion to fence caller-visible ordering with
/// any internal device streams.
pub(crate) trait Collective: Send + Sync {
    fn run(&self) -> Result<()>;

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    /// Output tensor handles captured by this work, when applicable.
    fn result(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Common handle surface for all work kinds.
pub trait Work: Send + Sync {
    /// Block until the work has finished. Idempotent: every call reports
    /// the same terminal state, re-raising any captured failure.
    fn wait(&self) -> Result<()>;

    fn is_completed(&self) -> bool;

    /// Fence the caller's device stream against the work's internal
    /// streams. No-op for host work.
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    /// The rank a receive completed from, once known.
    fn source_rank(&self) -> Option<Rank> {
        None
    }

    /// Output tensor handles captured by this work, when applicable.
    fn result(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

struct CompletionState {
    completed: bool,
    failure: Option<PlexusError>,
}

/// A queued collective work item shared between the caller and the engine.
pub struct AsyncWork {
    tag: Tag,
    task: Box<dyn Collective>,
    state: Mutex<CompletionState>,
    cv: Condvar,
}

impl std::fmt::Debug for AsyncWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncWork").field("tag", &self.tag).finish()
    }
}

impl AsyncWork {
    pub(crate) fn new(tag: Tag, task: Box<dyn Collective>) -> Arc<Self> {
        Arc::new(Self {
            tag,
            task,
            state: Mutex::new(CompletionState {
                completed: false,
                failure: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// The tag allocated to this collective invocation. Tags strictly
    /// increase in submission order, wrapping modulo 2^32.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Run the task and publish the outcome. Called exactly once, on a
    /// worker thread; any failure is captured rather than propagated so
    /// the worker can move on to the next item.
    pub(crate) fn execute(work: &Arc<AsyncWork>) {
        let outcome = work.task.run();
        if let Err(e) = &outcome {
            tracing::warn!(tag = work.tag, error = %e, "collective work failed");
        }
        let mut state = work.state.lock().expect("work lock poisoned");
        debug_assert!(!state.completed, "work executed twice");
        state.failure = outcome.err();
        state.completed = true;
        work.cv.notify_all();
    }
}

impl Work for AsyncWork {
    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().expect("work lock poisoned");
        while !state.completed {
            state = self.cv.wait(state).expect("work lock poisoned");
        }
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        drop(state);
        self.task.synchronize()
    }

    fn is_completed(&self) -> bool {
        self.state.lock().expect("work lock poisoned").completed
    }

    fn synchronize(&self) -> Result<()> {
        self.task.synchronize()
    }

    fn result(&self) -> Vec<Tensor> {
        self.task.result()
    }
}

struct QueueState {
    pending: VecDeque<Arc<AsyncWork>>,
    /// One slot per worker holding the item it is currently executing.
    in_progress: Vec<Option<Arc<AsyncWork>>>,
    stop: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    /// Signalled on enqueue; workers wait here when the deque is empty.
    produce_cv: Condvar,
    /// Signalled on dequeue; shutdown waits here for the deque to drain.
    consume_cv: Condvar,
}

/// FIFO work queue with a fixed pool of worker threads.
///
/// Dropping the queue drains it: shutdown waits until the deque is empty,
/// then stops and joins the workers, so every enqueued item runs before
/// the queue goes away. Items still executing at that point are finished,
/// not cancelled.
pub(crate) struct WorkQueue {
    shared: Arc<QueueShared>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_progress: (0..threads).map(|_| None).collect(),
                stop: false,
            }),
            produce_cv: Condvar::new(),
            consume_cv: Condvar::new(),
        });
        let workers = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("plexus-worker-{index}"))
                    .spawn(move || run_loop(index, shared))
                    .expect("spawn worker thread")
            })
            .collect();
        Self { shared, workers }
    }

    pub fn enqueue(&self, work: Arc<AsyncWork>) {
        let mut state = self.shared.state.lock().expect("queue lock poisoned");
        state.pending.push_back(work);
        self.shared.produce_cv.notify_one();
    }

    /// Weak references to everything pending or in progress right now.
    /// Used by the barrier to fence against prior submissions.
    pub fn snapshot(&self) -> Vec<Weak<AsyncWork>> {
        let state = self.shared.state.lock().expect("queue lock poisoned");
        state
            .in_progress
            .iter()
            .flatten()
            .chain(state.pending.iter())
            .map(Arc::downgrade)
            .collect()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("queue lock poisoned");
            while !state.pending.is_empty() {
                state = self
                    .shared
                    .consume_cv
                    .wait(state)
                    .expect("queue lock poisoned");
            }
            state.stop = true;
            self.shared.produce_cv.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_loop(index: usize, shared: Arc<QueueShared>) {
    tracing::debug!(worker = index, "worker started");
    let mut state = shared.state.lock().expect("queue lock poisoned");
    loop {
        while state.pending.is_empty() && !state.stop {
            state = shared.produce_cv.wait(state).expect("queue lock poisoned");
        }
        let Some(work) = state.pending.pop_front() else {
            break; // stop with an empty deque
        };
        shared.consume_cv.notify_one();
        state.in_progress[index] = Some(Arc::clone(&work));
        drop(state);
        AsyncWork::execute(&work);
        state = shared.state.lock().expect("queue lock poisoned");
        state.in_progress[index] = None;
    }
    drop(state);
    tracing::debug!(worker = index, "worker stopped");
}
