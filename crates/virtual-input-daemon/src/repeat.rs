//! Software key repeat
//!
//! The engine owns exactly one [`RepeatScheduler`] and therefore one repeat
//! slot. Arming it spawns a timer task on the tokio runtime; the task wakes at
//! `start` and then every `interval` after the previous deadline, and hands a
//! [`RepeatTick`] to the callback the scheduler was built with.
//!
//! The armed code sits behind its own small lock. That lock is never held
//! while spawning or aborting the timer task, nor while the callback runs.
//! A task that wakes after [`RepeatScheduler::reset`] cleared the slot finds it
//! empty (or armed for a newer generation) and exits without firing, so a
//! release races with at most one extra repeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::InputError;
use crate::lock;

/// Shortest spacing between two repeats; a zero interval is raised to this
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Delivered to the scheduler callback for every timer expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatTick {
    /// Repeat the armed code; more repeats follow
    Repeat(u32),
    /// Final repeat of the armed code; the repeat budget is spent and the slot
    /// has already been cleared
    Last(u32),
}

/// Observable state of the repeat slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatState {
    Idle,
    /// Armed, first repeat not yet fired (or repeat disabled)
    Armed(u32),
    /// At least one repeat fired
    Repeating(u32),
}

/// Timing applied to the next [`RepeatScheduler::arm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepeatTiming {
    /// Zero keeps the slot armed without ever firing
    pub start: Duration,
    pub interval: Duration,
    /// Repeats before the sequence ends on its own; `None` repeats until reset
    pub limit: Option<u16>,
}

impl RepeatTiming {
    /// Build timing from millisecond values; `limit == 0` means unlimited.
    pub fn from_millis(start_ms: u16, interval_ms: u16, limit: u16) -> Self {
        Self {
            start: Duration::from_millis(u64::from(start_ms)),
            interval: Duration::from_millis(u64::from(interval_ms)),
            limit: (limit != 0).then_some(limit),
        }
    }
}

#[derive(Debug)]
struct ArmedSlot {
    code: u32,
    generation: u64,
    remaining: Option<u16>,
    fired: bool,
}

type TickCallback = Box<dyn Fn(RepeatTick) + Send + Sync>;

struct Shared {
    slot: Mutex<Option<ArmedSlot>>,
    on_tick: TickCallback,
}

/// Single-slot arm/reset repeat timer
pub struct RepeatScheduler {
    shared: Arc<Shared>,
    timing: Mutex<RepeatTiming>,
    generation: AtomicU64,
    task: Mutex<Option<AbortHandle>>,
    runtime: Handle,
}

impl RepeatScheduler {
    /// Create an idle scheduler whose timer tasks run on `runtime`.
    pub fn new<F>(runtime: Handle, on_tick: F) -> Self
    where
        F: Fn(RepeatTick) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                on_tick: Box::new(on_tick),
            }),
            timing: Mutex::new(RepeatTiming::default()),
            generation: AtomicU64::new(0),
            task: Mutex::new(None),
            runtime,
        }
    }

    /// Set the timing used by future arms
    pub fn configure(&self, timing: RepeatTiming) {
        *lock(&self.timing) = timing;
    }

    pub fn timing(&self) -> RepeatTiming {
        *lock(&self.timing)
    }

    /// Arm the slot for `code`.
    ///
    /// The slot must be idle; callers reset it first. Arming an armed slot is
    /// a caller bug: it asserts in debug builds and is rejected otherwise.
    pub fn arm(&self, code: u32) -> Result<(), InputError> {
        let timing = self.timing();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let already = {
            let mut slot = lock(&self.shared.slot);
            match slot.as_ref() {
                Some(armed) => Some(armed.code),
                None => {
                    *slot = Some(ArmedSlot {
                        code,
                        generation,
                        remaining: timing.limit,
                        fired: false,
                    });
                    None
                }
            }
        };

        if let Some(armed) = already {
            tracing::error!("Repeat slot armed twice (armed {:#x}, new {:#x})", armed, code);
            debug_assert!(false, "repeat slot already armed");
            return Err(InputError::RepeatAlreadyArmed { armed });
        }

        if timing.start.is_zero() {
            tracing::trace!("Repeat disabled, code {:#x} armed without timer", code);
            return Ok(());
        }

        let deadline = Instant::now() + timing.start;
        let task = self.runtime.spawn(run_timer(
            Arc::clone(&self.shared),
            generation,
            deadline,
            timing.interval.max(MIN_INTERVAL),
        ));

        if let Some(stale) = lock(&self.task).replace(task.abort_handle()) {
            stale.abort();
        }

        Ok(())
    }

    /// Clear the slot and cancel its timer.
    ///
    /// Returns the code that was armed, if any, so the caller can decide
    /// whether a completion must be announced. Safe to call while idle.
    pub fn reset(&self) -> Option<u32> {
        let code = lock(&self.shared.slot).take().map(|armed| armed.code);

        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }

        code
    }

    pub fn state(&self) -> RepeatState {
        match lock(&self.shared.slot).as_ref() {
            None => RepeatState::Idle,
            Some(armed) if armed.fired => RepeatState::Repeating(armed.code),
            Some(armed) => RepeatState::Armed(armed.code),
        }
    }
}

impl Drop for RepeatScheduler {
    fn drop(&mut self) {
        self.reset();
    }
}

async fn run_timer(shared: Arc<Shared>, generation: u64, mut deadline: Instant, interval: Duration) {
    loop {
        tokio::time::sleep_until(deadline).await;

        let tick = {
            let mut slot = lock(&shared.slot);
            let armed = match slot.as_mut() {
                Some(armed) if armed.generation == generation => armed,
                // Reset (or re-armed) while this task was waking up
                _ => return,
            };

            armed.fired = true;
            match armed.remaining {
                None => RepeatTick::Repeat(armed.code),
                Some(remaining) if remaining > 1 => {
                    armed.remaining = Some(remaining - 1);
                    RepeatTick::Repeat(armed.code)
                }
                Some(_) => {
                    let code = armed.code;
                    *slot = None;
                    RepeatTick::Last(code)
                }
            }
        };

        (shared.on_tick)(tick);

        if let RepeatTick::Last(_) = tick {
            return;
        }

        deadline += interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording_scheduler() -> (RepeatScheduler, Arc<StdMutex<Vec<(u64, RepeatTick)>>>) {
        let start = Instant::now();
        let ticks = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        let scheduler = RepeatScheduler::new(Handle::current(), move |tick| {
            let elapsed = start.elapsed().as_millis() as u64;
            sink.lock().unwrap().push((elapsed, tick));
        });
        (scheduler, ticks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_sequence_timing() {
        let (scheduler, ticks) = recording_scheduler();
        scheduler.configure(RepeatTiming::from_millis(50, 20, 3));

        scheduler.arm(7).unwrap();
        assert_eq!(scheduler.state(), RepeatState::Armed(7));

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(
            *ticks.lock().unwrap(),
            vec![
                (50, RepeatTick::Repeat(7)),
                (70, RepeatTick::Repeat(7)),
                (90, RepeatTick::Last(7)),
            ]
        );
        assert_eq!(scheduler.state(), RepeatState::Idle);
        assert_eq!(scheduler.reset(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_repeats_until_reset() {
        let (scheduler, ticks) = recording_scheduler();
        scheduler.configure(RepeatTiming::from_millis(100, 10, 0));

        scheduler.arm(3).unwrap();
        tokio::time::sleep(Duration::from_millis(135)).await;
        assert_eq!(scheduler.state(), RepeatState::Repeating(3));

        assert_eq!(scheduler.reset(), Some(3));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ticks = ticks.lock().unwrap();
        assert_eq!(ticks.len(), 4, "fires at 100, 110, 120, 130 only");
        assert!(ticks.iter().all(|(_, t)| *t == RepeatTick::Repeat(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_start_never_fires() {
        let (scheduler, ticks) = recording_scheduler();
        scheduler.configure(RepeatTiming::from_millis(0, 10, 0));

        scheduler.arm(9).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(ticks.lock().unwrap().is_empty());
        assert_eq!(scheduler.state(), RepeatState::Armed(9));
        assert_eq!(scheduler.reset(), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_before_first_fire_cancels() {
        let (scheduler, ticks) = recording_scheduler();
        scheduler.configure(RepeatTiming::from_millis(50, 20, 0));

        scheduler.arm(1).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.reset(), Some(1));

        // Re-arm with a different code; only the new generation may fire
        scheduler.arm(2).unwrap();
        tokio::time::sleep(Duration::from_millis(55)).await;

        assert_eq!(*ticks.lock().unwrap(), vec![(60, RepeatTick::Repeat(2))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let (scheduler, ticks) = recording_scheduler();
        scheduler.configure(RepeatTiming::from_millis(50, 0, 0));

        scheduler.arm(4).unwrap();
        tokio::time::sleep(Duration::from_millis(55)).await;
        assert_eq!(scheduler.reset(), Some(4));

        let ticks = ticks.lock().unwrap();
        assert!(ticks.len() >= 5 && ticks.len() <= 6, "got {} ticks", ticks.len());
        assert_eq!(
            ticks[..3],
            [
                (50, RepeatTick::Repeat(4)),
                (51, RepeatTick::Repeat(4)),
                (52, RepeatTick::Repeat(4)),
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_when_idle_returns_none() {
        let (scheduler, _) = recording_scheduler();
        assert_eq!(scheduler.reset(), None);
        assert_eq!(scheduler.state(), RepeatState::Idle);
    }

    #[cfg(not(debug_assertions))]
    #[tokio::test]
    async fn test_double_arm_is_rejected() {
        let (scheduler, _) = recording_scheduler();
        scheduler.configure(RepeatTiming::from_millis(0, 0, 0));
        scheduler.arm(1).unwrap();

        assert!(matches!(
            scheduler.arm(2),
            Err(InputError::RepeatAlreadyArmed { armed: 1 })
        ));
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "repeat slot already armed")]
    async fn test_double_arm_asserts_in_debug() {
        let (scheduler, _) = recording_scheduler();
        scheduler.configure(RepeatTiming::from_millis(0, 0, 0));
        scheduler.arm(1).unwrap();
        let _ = scheduler.arm(2);
    }
}
