//! Execution contexts for running timer completions.
//!
//! A completion never runs on the coordinator thread; it is enqueued onto a
//! caller-chosen [`ExecutionContext`] so that a slow or reentrant completion
//! cannot stall other timers' state transitions.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};

/// A unit of work submitted to an execution context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere a timer completion can run.
///
/// `dispatch` must enqueue the task and return without blocking the
/// submitter. Tasks submitted from one thread are delivered in submission
/// order, but the context itself decides when (and on what thread) they run.
pub trait ExecutionContext: Send + Sync {
    /// Enqueues `task` for execution. Must not block.
    fn dispatch(&self, task: Task);
}

/// An execution context backed by a single named thread draining a FIFO
/// queue.
///
/// Dropping the context shuts the thread down after the queued tasks have
/// drained.
pub struct WorkerContext {
    tasks: Option<Sender<Task>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerContext {
    /// Spawns a worker thread with the given name.
    ///
    /// # Panics
    ///
    /// Panics if the thread cannot be spawned.
    #[must_use]
    pub fn spawn(name: impl Into<String>) -> Self {
        let (tasks, queue) = unbounded::<Task>();
        let join = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                while let Ok(task) = queue.recv() {
                    task();
                }
            })
            .expect("failed to spawn worker thread");

        Self {
            tasks: Some(tasks),
            join: Some(join),
        }
    }
}

impl ExecutionContext for WorkerContext {
    fn dispatch(&self, task: Task) {
        if let Some(tasks) = &self.tasks {
            let _ = tasks.send(task);
        }
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        // Close the queue so the worker exits once drained.
        drop(self.tasks.take());

        if let Some(join) = self.join.take() {
            // A queued task may own the last handle to its own context;
            // the worker must not try to join itself.
            if thread::current().id() != join.thread().id() {
                let _ = join.join();
            }
        }
    }
}
