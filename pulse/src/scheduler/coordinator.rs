//! The coordinator loop: command handling, the armed-timer registry, and
//! the firing schedule.
//!
//! The schedule is a min-heap of `(due, seq)`-ordered entries. Entries are
//! never removed eagerly on cancel; instead pause/stop/re-arm bump the
//! timer's generation and a popped entry whose generation no longer matches
//! is discarded. That makes cancellation best-effort (a firing that came
//! due before the cancel was processed still completes) and keeps cancel
//! O(1).

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use minstant::Instant;

use crate::timer::{FireOutcome, IntervalTimer, StartAction, TimerId, TimerState};
use crate::trace::{debug, trace};

/// Control operations submitted to the coordinator.
///
/// Each variant that produces a result carries a bounded(1) reply channel;
/// the submitter blocks on it, which is what makes the public control
/// methods synchronous.
pub(crate) enum Command {
    /// Arm the timer (or resume it from where it was paused).
    Start {
        timer: IntervalTimer,
        reply: Sender<bool>,
    },
    /// Disarm the timer, preserving elapsed progress.
    Pause {
        timer: IntervalTimer,
        reply: Sender<bool>,
    },
    /// Disarm and reset the timer.
    Stop {
        timer: IntervalTimer,
        reply: Sender<()>,
    },
    /// Read the timer's state.
    State {
        timer: IntervalTimer,
        reply: Sender<TimerState>,
    },
    /// Report the number of registered (armed) timers.
    ArmedCount { reply: Sender<usize> },
    /// Exit the loop, disarming everything.
    Shutdown,
}

/// A pending firing in the schedule.
struct Firing {
    due: Instant,
    /// Tie-breaker so same-deadline firings pop in submission order.
    seq: u64,
    timer: TimerId,
    generation: u64,
}

impl PartialEq for Firing {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Firing {}

impl PartialOrd for Firing {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Firing {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

pub(crate) struct Coordinator {
    commands: Receiver<Command>,
    /// Armed timers, keyed by identity. A timer is present iff Running;
    /// the held handle is what keeps an armed timer alive when the caller
    /// drops its own.
    registry: HashMap<TimerId, IntervalTimer>,
    schedule: BinaryHeap<Reverse<Firing>>,
    next_seq: u64,
}

impl Coordinator {
    pub(crate) fn new(commands: Receiver<Command>) -> Self {
        Self {
            commands,
            registry: HashMap::new(),
            schedule: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            self.fire_due(Instant::now());

            // Wait for the next command, bounded by the next deadline. The
            // timeout may be zero (a zero-interval timer, or a deadline
            // that just passed); polling the queue once per firing pass
            // keeps control operations from being starved.
            let command = if let Some(due) = self.next_due() {
                let timeout = due
                    .checked_duration_since(Instant::now())
                    .unwrap_or(Duration::ZERO);
                match self.commands.recv_timeout(timeout) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                }
            };

            match command {
                Command::Start { timer, reply } => {
                    let started = self.start_timer(&timer);
                    let _ = reply.send(started);
                }
                Command::Pause { timer, reply } => {
                    let paused = timer.begin_pause(Instant::now());
                    if paused {
                        self.registry.remove(&timer.id());
                        debug!(timer = %timer.id(), "paused");
                    }
                    let _ = reply.send(paused);
                }
                Command::Stop { timer, reply } => {
                    if timer.begin_stop() {
                        self.registry.remove(&timer.id());
                        debug!(timer = %timer.id(), "stopped");
                    }
                    let _ = reply.send(());
                }
                Command::State { timer, reply } => {
                    let _ = reply.send(timer.current_state());
                }
                Command::ArmedCount { reply } => {
                    let _ = reply.send(self.registry.len());
                }
                Command::Shutdown => break,
            }
        }

        let Coordinator {
            commands,
            mut registry,
            schedule,
            ..
        } = self;
        drop(schedule);
        // Close the command queue before releasing registry handles: a
        // reentrant completion blocked on a reply unblocks when its queued
        // command is dropped, and releasing a handle below may transitively
        // join that completion's context.
        drop(commands);
        for (_, timer) in registry.drain() {
            let _ = timer.begin_stop();
        }
    }

    fn start_timer(&mut self, timer: &IntervalTimer) -> bool {
        let now = Instant::now();
        match timer.begin_start(now) {
            StartAction::AlreadyRunning => false,
            StartAction::Armed {
                delay_ns,
                generation,
            } => {
                self.registry.insert(timer.id(), timer.clone());
                self.push_firing(now + Duration::from_nanos(delay_ns), timer.id(), generation);
                debug!(timer = %timer.id(), delay_ns, "armed");
                true
            }
        }
    }

    fn fire_due(&mut self, now: Instant) {
        // Drain the due entries before firing any of them: a reschedule may
        // come due immediately (zero interval), and pushing it back while
        // still draining would keep this pass alive forever and starve the
        // command queue. Deferred entries land in the next pass, after the
        // loop in `run` has polled for commands.
        let mut due = Vec::new();
        while self
            .schedule
            .peek()
            .is_some_and(|entry| entry.0.due <= now)
        {
            if let Some(Reverse(firing)) = self.schedule.pop() {
                due.push(firing);
            }
        }

        for firing in due {
            // Registry miss means the timer was stopped or paused after
            // this entry was scheduled; its generation is stale anyway.
            let Some(timer) = self.registry.get(&firing.timer).cloned() else {
                continue;
            };
            match timer.on_fire(firing.generation, now) {
                FireOutcome::Stale => {
                    trace!(timer = %firing.timer, "discarding stale firing");
                }
                FireOutcome::AutoStopped => {
                    self.registry.remove(&firing.timer);
                    debug!(timer = %firing.timer, "fired; repeat budget exhausted");
                    timer.dispatch_completion();
                }
                FireOutcome::Rescheduled { generation } => {
                    self.push_firing(now + timer.interval(), firing.timer, generation);
                    trace!(timer = %firing.timer, "fired");
                    timer.dispatch_completion();
                }
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.schedule.peek().map(|entry| entry.0.due)
    }

    fn push_firing(&mut self, due: Instant, timer: TimerId, generation: u64) {
        self.next_seq += 1;
        self.schedule.push(Reverse(Firing {
            due,
            seq: self.next_seq,
            timer,
            generation,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Commands cross the channel into the coordinator thread.
    fn _assert_send<T: Send>() {}

    #[test]
    fn commands_are_send() {
        _assert_send::<Command>();
    }

    #[test]
    fn firings_order_by_deadline_then_sequence() {
        let now = Instant::now();
        let later = now + Duration::from_millis(10);

        let a = Firing {
            due: later,
            seq: 1,
            timer: TimerId::new(1),
            generation: 1,
        };
        let b = Firing {
            due: now,
            seq: 2,
            timer: TimerId::new(2),
            generation: 1,
        };
        let c = Firing {
            due: now,
            seq: 3,
            timer: TimerId::new(3),
            generation: 1,
        };

        let mut heap = BinaryHeap::new();
        heap.push(Reverse(a));
        heap.push(Reverse(c));
        heap.push(Reverse(b));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(f)| f.seq)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }
}
