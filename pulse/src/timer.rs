//! Interval timers: the state machine, repeat bookkeeping, and pause/resume
//! arithmetic.
//!
//! An [`IntervalTimer`] is a cheap-to-clone handle; all clones refer to the
//! same underlying timer. Control methods (`start`/`pause`/`stop`/`state`)
//! may be called from any thread, including reentrantly from the timer's
//! own completion. Every state mutation is serialized on the owning
//! scheduler's coordinator thread, so the methods here only describe the
//! transitions; the coordinator drives them.
//!
//! A timer that is running does not need to be kept alive by the caller:
//! the scheduler's registry holds a handle until the timer stops or
//! auto-stops.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use minstant::Instant;
use parking_lot::Mutex;
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::scheduler::Scheduler;
use crate::scheduler::coordinator::Command;

const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Maximum interval, in nanoseconds, that a timer can be created with.
///
/// The scheduling offset must fit a signed 64-bit nanosecond count.
pub const MAX_INTERVAL_NANOS: u64 = i64::MAX as u64;

/// The current state of a timer.
///
/// Valid transitions: Stopped→Running, Running→Paused, Paused→Running,
/// Running→Stopped, Paused→Stopped. A timer never goes directly from
/// Stopped to Paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Not armed. A fresh start re-arms with the full repeat budget.
    Stopped,
    /// Armed; the next firing is scheduled.
    Running,
    /// Disarmed, but elapsed progress and the remaining repeat count are
    /// preserved; `start` resumes where the timer left off.
    Paused,
}

/// Stable opaque identity for a timer.
///
/// Equality and hashing of [`IntervalTimer`] delegate to this token, never
/// to the interval value (same-interval timers are distinct).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error constructing a timer. The only recoverable failure in the crate;
/// all runtime control operations are total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerCreateError {
    /// The interval exceeds [`MAX_INTERVAL_NANOS`].
    #[error("interval of {0} ns exceeds the maximum schedulable offset")]
    IntervalTooLarge(u64),
    /// Converting the interval to nanoseconds overflowed.
    #[error("interval overflows the nanosecond range")]
    IntervalOverflow,
}

type Completion = Box<dyn Fn(&IntervalTimer) + Send + Sync>;

/// Mutable timer state. Written only on the coordinator thread.
#[derive(Debug)]
struct TimerCore {
    state: TimerState,
    /// Live countdown. Reloaded from the original repeat budget on every
    /// fresh start from Stopped; preserved across pause/resume.
    remaining: i64,
    /// Set on every (re)arm and after every firing.
    started_at: Option<Instant>,
    /// Run time accumulated since the last firing, credited on pause.
    paused_elapsed_ns: u64,
    /// Bumped on every arm and every cancel. A scheduled firing whose
    /// generation no longer matches is stale and is discarded, which is
    /// what makes cancellation best-effort rather than instant.
    generation: u64,
}

impl TimerCore {
    fn new(repeats: i64) -> Self {
        Self {
            state: TimerState::Stopped,
            remaining: repeats,
            started_at: None,
            paused_elapsed_ns: 0,
            generation: 0,
        }
    }
}

struct Shared {
    id: TimerId,
    interval_ns: u64,
    repeats: i64,
    context: Arc<dyn ExecutionContext>,
    completion: Completion,
    commands: Sender<Command>,
    core: Mutex<TimerCore>,
}

/// A reusable, cancelable, pausable interval timer.
///
/// Created against a [`Scheduler`]; fires its completion on the execution
/// context supplied at construction. The completion receives the timer
/// handle so it may stop or pause the timer from within.
///
/// Repeat semantics: a repeat count of `0` fires exactly once, a positive
/// `N` fires exactly `N` times then auto-stops, and a negative count
/// repeats until [`stop`](Self::stop) is called.
#[derive(Clone)]
pub struct IntervalTimer {
    shared: Arc<Shared>,
}

/// What the coordinator must do after a start transition.
pub(crate) enum StartAction {
    AlreadyRunning,
    Armed { delay_ns: u64, generation: u64 },
}

/// What the coordinator must do after a firing.
pub(crate) enum FireOutcome {
    /// The firing was canceled (or superseded) before it came due.
    Stale,
    /// The repeat budget is exhausted; the timer stopped itself.
    AutoStopped,
    /// The next period is due `interval` from now.
    Rescheduled { generation: u64 },
}

impl IntervalTimer {
    /// Creates a timer with an interval in nanoseconds, without starting it.
    ///
    /// `repeats` of `0` fires once, positive `N` fires `N` times, negative
    /// repeats until stopped.
    ///
    /// # Errors
    ///
    /// Returns [`TimerCreateError::IntervalTooLarge`] if `nanos` exceeds
    /// [`MAX_INTERVAL_NANOS`].
    pub fn from_nanos<F>(
        scheduler: &Scheduler,
        nanos: u64,
        repeats: i64,
        context: Arc<dyn ExecutionContext>,
        completion: F,
    ) -> Result<Self, TimerCreateError>
    where
        F: Fn(&IntervalTimer) + Send + Sync + 'static,
    {
        if nanos > MAX_INTERVAL_NANOS {
            return Err(TimerCreateError::IntervalTooLarge(nanos));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                id: scheduler.allocate_timer_id(),
                interval_ns: nanos,
                repeats,
                context,
                completion: Box::new(completion),
                commands: scheduler.command_sender(),
                core: Mutex::new(TimerCore::new(repeats)),
            }),
        })
    }

    /// Creates a timer with an interval in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`TimerCreateError::IntervalOverflow`] if the conversion to
    /// nanoseconds overflows, or [`TimerCreateError::IntervalTooLarge`] if
    /// the result exceeds [`MAX_INTERVAL_NANOS`].
    pub fn from_millis<F>(
        scheduler: &Scheduler,
        millis: u64,
        repeats: i64,
        context: Arc<dyn ExecutionContext>,
        completion: F,
    ) -> Result<Self, TimerCreateError>
    where
        F: Fn(&IntervalTimer) + Send + Sync + 'static,
    {
        let nanos = millis_to_nanos(millis)?;
        Self::from_nanos(scheduler, nanos, repeats, context, completion)
    }

    /// Creates a timer with an interval in seconds.
    ///
    /// # Errors
    ///
    /// Same as [`from_millis`](Self::from_millis).
    pub fn from_secs<F>(
        scheduler: &Scheduler,
        secs: u64,
        repeats: i64,
        context: Arc<dyn ExecutionContext>,
        completion: F,
    ) -> Result<Self, TimerCreateError>
    where
        F: Fn(&IntervalTimer) + Send + Sync + 'static,
    {
        let nanos = secs_to_nanos(secs)?;
        Self::from_nanos(scheduler, nanos, repeats, context, completion)
    }

    /// Creates a timer from a [`Duration`].
    ///
    /// # Errors
    ///
    /// Same as [`from_millis`](Self::from_millis).
    pub fn from_duration<F>(
        scheduler: &Scheduler,
        interval: Duration,
        repeats: i64,
        context: Arc<dyn ExecutionContext>,
        completion: F,
    ) -> Result<Self, TimerCreateError>
    where
        F: Fn(&IntervalTimer) + Send + Sync + 'static,
    {
        let nanos =
            u64::try_from(interval.as_nanos()).map_err(|_| TimerCreateError::IntervalOverflow)?;
        Self::from_nanos(scheduler, nanos, repeats, context, completion)
    }

    /// Starts the timer, or resumes it if paused.
    ///
    /// A resumed timer fires its next event after `interval - elapsed`,
    /// where `elapsed` is the run time accumulated before the pause; a
    /// fresh start from Stopped waits the full interval and restores the
    /// full repeat budget.
    ///
    /// Returns `true` if the timer was armed, `false` if it was already
    /// running (the existing schedule is unaffected) or its scheduler has
    /// shut down.
    pub fn start(&self) -> bool {
        self.submit(|reply| Command::Start {
            timer: self.clone(),
            reply,
        })
        .unwrap_or(false)
    }

    /// Pauses the timer, preserving elapsed progress and the remaining
    /// repeat count.
    ///
    /// Returns `true` if the timer was running. A firing already in flight
    /// may still complete; cancellation is best-effort.
    pub fn pause(&self) -> bool {
        self.submit(|reply| Command::Pause {
            timer: self.clone(),
            reply,
        })
        .unwrap_or(false)
    }

    /// Stops and resets the timer, even if it is paused.
    ///
    /// Safe to call in any state; stopping a stopped timer is a no-op. A
    /// firing already in flight may still complete.
    pub fn stop(&self) {
        let _ = self.submit(|reply| Command::Stop {
            timer: self.clone(),
            reply,
        });
    }

    /// The current state of the timer.
    #[must_use]
    pub fn state(&self) -> TimerState {
        self.submit(|reply| Command::State {
            timer: self.clone(),
            reply,
        })
        .unwrap_or_else(|| self.current_state())
    }

    /// The timer's identity token.
    #[must_use]
    pub fn id(&self) -> TimerId {
        self.shared.id
    }

    /// The firing interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.shared.interval_ns)
    }

    /// The repeat budget the timer was created with.
    #[must_use]
    pub fn repeats(&self) -> i64 {
        self.shared.repeats
    }

    /// Sends a command to the coordinator and blocks until it has been
    /// applied. `None` if the scheduler has shut down.
    fn submit<R>(&self, build: impl FnOnce(Sender<R>) -> Command) -> Option<R> {
        let (reply, response) = bounded(1);
        self.shared.commands.send(build(reply)).ok()?;
        response.recv().ok()
    }

    // ---- transitions, invoked only on the coordinator thread ----

    pub(crate) fn begin_start(&self, now: Instant) -> StartAction {
        let mut core = self.shared.core.lock();
        if core.state == TimerState::Running {
            return StartAction::AlreadyRunning;
        }
        if core.state == TimerState::Stopped {
            // Fresh start: restore the original repeat budget.
            core.remaining = self.shared.repeats;
            core.paused_elapsed_ns = 0;
        }
        let delay_ns = self.shared.interval_ns.saturating_sub(core.paused_elapsed_ns);
        core.generation += 1;
        core.state = TimerState::Running;
        core.started_at = Some(now);
        StartAction::Armed {
            delay_ns,
            generation: core.generation,
        }
    }

    /// Returns `true` if the timer was running and is now paused (the
    /// caller must deregister it).
    pub(crate) fn begin_pause(&self, now: Instant) -> bool {
        let mut core = self.shared.core.lock();
        if core.state != TimerState::Running {
            return false;
        }
        if let Some(started_at) = core.started_at.take() {
            // Cumulative: supports several pause/resume cycles per period.
            core.paused_elapsed_ns = core
                .paused_elapsed_ns
                .saturating_add(nanos_between(started_at, now));
        }
        core.generation += 1;
        core.state = TimerState::Paused;
        true
    }

    /// Returns `true` if the timer was armed (the caller must deregister
    /// it).
    pub(crate) fn begin_stop(&self) -> bool {
        let mut core = self.shared.core.lock();
        if core.state == TimerState::Stopped {
            return false;
        }
        let was_armed = core.state == TimerState::Running;
        core.generation += 1;
        core.state = TimerState::Stopped;
        core.started_at = None;
        core.paused_elapsed_ns = 0;
        // `remaining` is deliberately left alone; the budget reload
        // happens on the next fresh start.
        was_armed
    }

    pub(crate) fn on_fire(&self, generation: u64, now: Instant) -> FireOutcome {
        let mut core = self.shared.core.lock();
        if core.state != TimerState::Running || core.generation != generation {
            return FireOutcome::Stale;
        }
        if core.remaining > 0 {
            core.remaining -= 1;
        }
        if core.remaining == 0 {
            // Budget exhausted. A zero repeat count lands here on the very
            // first firing: the timer fires exactly once.
            core.generation += 1;
            core.state = TimerState::Stopped;
            core.started_at = None;
            core.paused_elapsed_ns = 0;
            FireOutcome::AutoStopped
        } else {
            core.paused_elapsed_ns = 0;
            core.started_at = Some(now);
            FireOutcome::Rescheduled {
                generation: core.generation,
            }
        }
    }

    /// Enqueues the completion onto the timer's execution context.
    pub(crate) fn dispatch_completion(&self) {
        let timer = self.clone();
        self.shared
            .context
            .dispatch(Box::new(move || (timer.shared.completion)(&timer)));
    }

    /// Direct state read; used by the coordinator and as a fallback after
    /// scheduler shutdown (when the state can no longer change).
    pub(crate) fn current_state(&self) -> TimerState {
        self.shared.core.lock().state
    }
}

impl PartialEq for IntervalTimer {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for IntervalTimer {}

impl Hash for IntervalTimer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl fmt::Debug for IntervalTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalTimer")
            .field("id", &self.shared.id)
            .field("interval_ns", &self.shared.interval_ns)
            .field("repeats", &self.shared.repeats)
            .field("state", &self.current_state())
            .finish()
    }
}

fn millis_to_nanos(millis: u64) -> Result<u64, TimerCreateError> {
    millis
        .checked_mul(NANOS_PER_MILLI)
        .ok_or(TimerCreateError::IntervalOverflow)
}

fn secs_to_nanos(secs: u64) -> Result<u64, TimerCreateError> {
    secs.checked_mul(NANOS_PER_SEC)
        .ok_or(TimerCreateError::IntervalOverflow)
}

/// Nanoseconds from `earlier` to `now`, saturating at the bounds.
fn nanos_between(earlier: Instant, now: Instant) -> u64 {
    let nanos = now
        .checked_duration_since(earlier)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::context::Task;

    /// Context that drops every task; transitions are exercised directly,
    /// no completion ever needs to run.
    struct NullContext;

    impl ExecutionContext for NullContext {
        fn dispatch(&self, _task: Task) {}
    }

    /// Builds a timer wired to a dangling command channel so the state
    /// machine can be driven synchronously from the test thread.
    fn detached_timer(interval_ns: u64, repeats: i64) -> IntervalTimer {
        let (commands, _) = unbounded();
        IntervalTimer {
            shared: Arc::new(Shared {
                id: TimerId::new(1),
                interval_ns,
                repeats,
                context: Arc::new(NullContext),
                completion: Box::new(|_| {}),
                commands,
                core: Mutex::new(TimerCore::new(repeats)),
            }),
        }
    }

    fn arm(timer: &IntervalTimer, now: Instant) -> (u64, u64) {
        match timer.begin_start(now) {
            StartAction::Armed {
                delay_ns,
                generation,
            } => (delay_ns, generation),
            StartAction::AlreadyRunning => panic!("timer unexpectedly running"),
        }
    }

    #[test]
    fn fresh_start_waits_the_full_interval() {
        let timer = detached_timer(500, 0);
        let (delay, _) = arm(&timer, Instant::now());
        assert_eq!(delay, 500);
        assert_eq!(timer.current_state(), TimerState::Running);
    }

    #[test]
    fn start_while_running_is_rejected() {
        let timer = detached_timer(500, -1);
        let now = Instant::now();
        arm(&timer, now);
        assert!(matches!(
            timer.begin_start(now),
            StartAction::AlreadyRunning
        ));
    }

    #[test]
    fn pause_credits_elapsed_and_resume_uses_the_remainder() {
        let interval = 300 * NANOS_PER_MILLI;
        let timer = detached_timer(interval, -1);
        let t0 = Instant::now();
        arm(&timer, t0);

        let t1 = t0 + Duration::from_millis(60);
        assert!(timer.begin_pause(t1));
        assert_eq!(timer.current_state(), TimerState::Paused);

        let (delay, _) = arm(&timer, t1 + Duration::from_millis(500));
        assert_eq!(delay, interval - 60 * NANOS_PER_MILLI);
    }

    #[test]
    fn repeated_pause_resume_accumulates_elapsed() {
        let interval = 300 * NANOS_PER_MILLI;
        let timer = detached_timer(interval, -1);
        let t0 = Instant::now();

        arm(&timer, t0);
        assert!(timer.begin_pause(t0 + Duration::from_millis(50)));
        arm(&timer, t0 + Duration::from_millis(100));
        assert!(timer.begin_pause(t0 + Duration::from_millis(170)));

        // 50ms + 70ms of run time already served.
        let (delay, _) = arm(&timer, t0 + Duration::from_millis(200));
        assert_eq!(delay, interval - 120 * NANOS_PER_MILLI);
    }

    #[test]
    fn pause_when_not_running_is_a_no_op() {
        let timer = detached_timer(500, -1);
        let now = Instant::now();
        assert!(!timer.begin_pause(now));

        arm(&timer, now);
        assert!(timer.begin_pause(now));
        assert!(!timer.begin_pause(now), "already paused");
    }

    #[test]
    fn stop_resets_progress_but_not_the_budget_source() {
        let interval = 100 * NANOS_PER_MILLI;
        let timer = detached_timer(interval, 5);
        let t0 = Instant::now();
        let (_, generation) = arm(&timer, t0);

        // Burn one firing, then stop.
        assert!(matches!(
            timer.on_fire(generation, t0 + Duration::from_millis(100)),
            FireOutcome::Rescheduled { .. }
        ));
        assert!(timer.begin_stop());
        assert!(!timer.begin_stop(), "stop on Stopped is a no-op");

        // Fresh start reloads the original budget: five more firings.
        let (delay, mut generation) = arm(&timer, t0);
        assert_eq!(delay, interval, "stop cleared the pause credit");
        let mut fired = 0;
        loop {
            match timer.on_fire(generation, Instant::now()) {
                FireOutcome::Rescheduled { generation: g } => {
                    fired += 1;
                    generation = g;
                }
                FireOutcome::AutoStopped => {
                    fired += 1;
                    break;
                }
                FireOutcome::Stale => panic!("live firing treated as stale"),
            }
        }
        assert_eq!(fired, 5);
    }

    #[test]
    fn zero_repeats_fires_exactly_once() {
        let timer = detached_timer(500, 0);
        let now = Instant::now();
        let (_, generation) = arm(&timer, now);
        assert!(matches!(
            timer.on_fire(generation, now),
            FireOutcome::AutoStopped
        ));
        assert_eq!(timer.current_state(), TimerState::Stopped);
    }

    #[test]
    fn negative_repeats_never_auto_stop() {
        let timer = detached_timer(500, -1);
        let now = Instant::now();
        let (_, mut generation) = arm(&timer, now);
        for _ in 0..100 {
            match timer.on_fire(generation, now) {
                FireOutcome::Rescheduled { generation: g } => generation = g,
                _ => panic!("indefinite timer stopped itself"),
            }
        }
    }

    #[test]
    fn stale_generation_is_discarded() {
        let timer = detached_timer(500, -1);
        let now = Instant::now();
        let (_, generation) = arm(&timer, now);

        // Pause bumps the generation; the old firing must be dropped.
        assert!(timer.begin_pause(now));
        assert!(matches!(
            timer.on_fire(generation, now),
            FireOutcome::Stale
        ));
        assert_eq!(timer.current_state(), TimerState::Paused);
    }

    #[test]
    fn firing_resets_the_pause_credit() {
        let interval = 200 * NANOS_PER_MILLI;
        let timer = detached_timer(interval, -1);
        let t0 = Instant::now();
        arm(&timer, t0);
        assert!(timer.begin_pause(t0 + Duration::from_millis(80)));
        let (_, generation) = arm(&timer, t0 + Duration::from_millis(100));

        // A firing starts the next full period from scratch.
        let t_fire = t0 + Duration::from_millis(220);
        assert!(matches!(
            timer.on_fire(generation, t_fire),
            FireOutcome::Rescheduled { .. }
        ));
        assert!(timer.begin_pause(t_fire + Duration::from_millis(30)));
        let (delay, _) = arm(&timer, t_fire + Duration::from_millis(40));
        assert_eq!(delay, interval - 30 * NANOS_PER_MILLI);
    }

    #[test]
    fn unit_conversions_detect_overflow() {
        assert_eq!(millis_to_nanos(1), Ok(NANOS_PER_MILLI));
        assert_eq!(secs_to_nanos(2), Ok(2 * NANOS_PER_SEC));
        assert_eq!(
            millis_to_nanos(u64::MAX),
            Err(TimerCreateError::IntervalOverflow)
        );
        assert_eq!(
            secs_to_nanos(u64::MAX),
            Err(TimerCreateError::IntervalOverflow)
        );
    }
}
