//! Reusable, cancelable, pausable interval timers.
//!
//! A [`Scheduler`] runs one coordinator thread that serializes all timer
//! state transitions. An [`IntervalTimer`] fires a completion on a
//! caller-chosen [`ExecutionContext`] every time its interval elapses,
//! can be paused and later resumed with its elapsed progress preserved,
//! and stops itself once its repeat budget is exhausted.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pulse::{IntervalTimer, Scheduler, WorkerContext};
//!
//! let scheduler = Scheduler::spawn();
//! let ctx = Arc::new(WorkerContext::spawn("completions"));
//!
//! // Fire five times, 250ms apart, then auto-stop.
//! let timer = IntervalTimer::from_millis(&scheduler, 250, 5, ctx, |timer| {
//!     println!("tick {}", timer.id());
//! })
//! .unwrap();
//! assert!(timer.start());
//! ```

pub mod context;
pub mod scheduler;
pub mod timer;
mod trace;

pub use context::{ExecutionContext, Task, WorkerContext};
pub use scheduler::Scheduler;
pub use timer::{IntervalTimer, MAX_INTERVAL_NANOS, TimerCreateError, TimerId, TimerState};
pub use trace::init_tracing;
