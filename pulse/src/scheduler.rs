//! Timer scheduling: one coordinator thread per [`Scheduler`].
//!
//! The coordinator thread is the sole writer of all timer state. Every
//! control operation (`start`/`pause`/`stop`/`state`) round-trips through
//! its command queue, which gives a total order across all timers created
//! against the same scheduler: each critical section is O(1) with no I/O,
//! so callers block only briefly.
//!
//! The coordinator also owns the registry of armed timers. The registry
//! holds a handle to every Running timer, so a caller is free to drop its
//! own handle; the timer keeps firing until it stops or auto-stops.

pub(crate) mod coordinator;

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded, unbounded};

use crate::timer::TimerId;
use crate::trace::{debug, info};

use coordinator::{Command, Coordinator};

/// Owns the coordinator thread that drives a set of timers.
///
/// Dropping the scheduler (or calling [`shutdown`](Self::shutdown)) disarms
/// every registered timer and joins the thread. Operations on timers that
/// outlive their scheduler degrade to no-ops.
pub struct Scheduler {
    commands: Sender<Command>,
    next_timer_id: AtomicU64,
    join: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the coordinator thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread cannot be spawned.
    #[must_use]
    pub fn spawn() -> Self {
        debug!("spawning coordinator thread");
        let (commands, queue) = unbounded();
        let join = thread::Builder::new()
            .name("pulse-coordinator".into())
            .spawn(move || {
                info!("coordinator thread started");
                Coordinator::new(queue).run();
                info!("coordinator thread exiting");
            })
            .expect("failed to spawn coordinator thread");

        Self {
            commands,
            next_timer_id: AtomicU64::new(1),
            join: Some(join),
        }
    }

    /// Number of currently armed timers.
    ///
    /// A timer is counted exactly while it is Running; paused and stopped
    /// timers are not registered.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        let (reply, response) = bounded(1);
        if self.commands.send(Command::ArmedCount { reply }).is_err() {
            return 0;
        }
        response.recv().unwrap_or(0)
    }

    /// Initiates shutdown and waits for the coordinator to exit.
    ///
    /// All registered timers are disarmed; pending firings are discarded.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            debug!("waiting for coordinator thread to exit");
            let _ = join.join();
        }
    }

    pub(crate) fn command_sender(&self) -> Sender<Command> {
        self.commands.clone()
    }

    pub(crate) fn allocate_timer_id(&self) -> TimerId {
        TimerId::new(self.next_timer_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
