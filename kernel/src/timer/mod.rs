//! The timer subsystem: hardware one-shot below, software deadline queue
//! above.
//!
//! Every hardware interrupt advances the tick counter, delivers all due
//! timers as messages to their owning tasks, and rearms the one-shot for
//! the next tick. Preemption is itself just a timer: a kernel-internal
//! entry with a reserved value that re-adds itself every
//! [`TASK_TIMER_PERIOD`] ticks and asks the scheduler to switch.
//!
//! ## Sign convention
//!
//! The `value` of a timer is an opaque signed tag for its owner. The
//! application-facing `create_timer` syscall negates the value it is
//! given, so application timers are stored negative; the event dispatcher
//! (`read_event`) recognizes them by sign and negates back before
//! delivery. Kernel-owned timers (cursor blink and friends) use positive
//! values and never collide with application tags.

pub mod lapic;

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;

use crate::logger::LogLevel;
use crate::message::{Message, MessageKind};
use crate::sync::InterruptSafeLock;
use crate::task::{TaskId, MAIN_TASK_ID};

/// Software tick rate, Hz
pub const TIMER_FREQ: u64 = 100;

/// Preemption quantum in ticks (20 ms at 100 Hz)
pub const TASK_TIMER_PERIOD: u64 = TIMER_FREQ / 50;

/// Reserved value of the scheduler's own timer; never delivered as a
/// message
const TASK_TIMER_VALUE: i32 = i32::MIN;

/// Hardware countdown per software tick. The divide ratio is fixed at
/// 1:1 and bus-frequency calibration lives outside the core, so this is a
/// build-time constant.
const COUNTS_PER_TICK: u32 = 10_000_000;

/// A one-shot deadline request. Destroyed on delivery; only the resulting
/// message persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    timeout: u64,
    value: i32,
    task: TaskId,
    /// Insertion order, breaks deadline ties first-registered-first
    seq: u64,
}

impl Timer {
    pub const fn new(timeout: u64, value: i32, task: TaskId) -> Self {
        Self {
            timeout,
            value,
            task,
            seq: 0,
        }
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn task(&self) -> TaskId {
        self.task
    }
}

// BinaryHeap is a max-heap; invert the ordering so the earliest deadline
// (and among equals, the earliest registration) surfaces first.
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        other
            .timeout
            .cmp(&self.timeout)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerManager {
    tick: u64,
    timers: BinaryHeap<Timer>,
    next_seq: u64,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            tick: 0,
            timers: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn add_timer(&mut self, mut timer: Timer) {
        timer.seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(timer);
    }

    /// Advance one tick and pop everything that is now due, in deadline
    /// order. The scheduler's own timer is consumed and re-added here;
    /// the second return slot says whether its quantum elapsed.
    pub fn tick(&mut self) -> (Vec<Timer>, bool) {
        self.tick += 1;
        let mut due = Vec::new();
        let mut task_timer_timeout = false;

        while let Some(t) = self.timers.peek() {
            if t.timeout > self.tick {
                break;
            }
            let t = match self.timers.pop() {
                Some(t) => t,
                None => break,
            };
            if t.value == TASK_TIMER_VALUE {
                task_timer_timeout = true;
                self.add_timer(Timer::new(self.tick + TASK_TIMER_PERIOD, TASK_TIMER_VALUE, t.task));
            } else {
                due.push(t);
            }
        }

        (due, task_timer_timeout)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

static TIMER: InterruptSafeLock<Option<TimerManager>> = InterruptSafeLock::new(None);

fn with_timer_manager<R>(f: impl FnOnce(&mut TimerManager) -> R) -> R {
    let mut guard = TIMER.lock();
    let manager = guard.as_mut().expect("timer system not initialized");
    f(manager)
}

/// Bring up the timer subsystem and arm the first tick.
pub fn init(timer_vector: u8) {
    *TIMER.lock() = Some(TimerManager::new());
    lapic::initialize(timer_vector);
    lapic::start_oneshot(COUNTS_PER_TICK);
}

/// Ticks elapsed since boot. Read under the interrupt mask so the value
/// cannot tear against a concurrent tick.
pub fn current_tick() -> u64 {
    with_timer_manager(|m| m.current_tick())
}

/// Register a one-shot timer.
pub fn add_timer(timeout: u64, value: i32, task: TaskId) {
    with_timer_manager(|m| m.add_timer(Timer::new(timeout, value, task)));
}

/// Kick off the preemption quantum; called once the task system is up.
pub fn start_preemption_timer() {
    with_timer_manager(|m| {
        let t = m.current_tick() + TASK_TIMER_PERIOD;
        m.add_timer(Timer::new(t, TASK_TIMER_VALUE, MAIN_TASK_ID));
    });
}

/// The hardware interrupt path: advance the queue, deliver expirations to
/// their owners, rearm the one-shot. Returns whether the scheduler should
/// preempt.
///
/// Expiration messages are delivered after the timer lock is dropped, so
/// this never holds two subsystem locks at once.
pub fn handle_timer_interrupt() -> bool {
    let (due, need_switch) = with_timer_manager(|m| m.tick());

    for t in due {
        let msg = Message::from_kernel(MessageKind::TimerTimeout {
            timeout: t.timeout(),
            value: t.value(),
        });
        if crate::task::send_message(t.task(), msg).is_err() {
            crate::log!(
                LogLevel::Warn,
                "timer expiry for task {} dropped",
                t.task().0
            );
        }
    }

    lapic::start_oneshot(COUNTS_PER_TICK);
    need_switch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance(m: &mut TimerManager, ticks: u64) -> Vec<Timer> {
        let mut all = Vec::new();
        for _ in 0..ticks {
            all.extend(m.tick().0);
        }
        all
    }

    #[test]
    fn test_delivery_in_deadline_order() {
        let mut m = TimerManager::new();
        // Deadlines {5, 2, 8, 2}: delivery order {2, 2, 5, 8}, the tied
        // pair in registration order
        m.add_timer(Timer::new(5, 10, TaskId(1)));
        m.add_timer(Timer::new(2, 20, TaskId(1)));
        m.add_timer(Timer::new(8, 30, TaskId(1)));
        m.add_timer(Timer::new(2, 40, TaskId(1)));

        let delivered = advance(&mut m, 8);
        let order: Vec<(u64, i32)> = delivered.iter().map(|t| (t.timeout(), t.value())).collect();
        assert_eq!(order, alloc::vec![(2, 20), (2, 40), (5, 10), (8, 30)]);
    }

    #[test]
    fn test_no_timer_fires_early() {
        let mut m = TimerManager::new();
        m.add_timer(Timer::new(3, 1, TaskId(1)));
        assert!(m.tick().0.is_empty()); // tick 1
        assert!(m.tick().0.is_empty()); // tick 2
        let due = m.tick().0; // tick 3
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].timeout(), 3);
        assert_eq!(m.pending_timers(), 0);
    }

    #[test]
    fn test_tick_counter_is_monotonic() {
        let mut m = TimerManager::new();
        assert_eq!(m.current_tick(), 0);
        m.tick();
        m.tick();
        assert_eq!(m.current_tick(), 2);
    }

    #[test]
    fn test_preemption_timer_reloads_itself() {
        let mut m = TimerManager::new();
        m.add_timer(Timer::new(TASK_TIMER_PERIOD, TASK_TIMER_VALUE, TaskId(1)));

        let (due, switch) = m.tick(); // tick 1
        assert!(due.is_empty());
        assert!(!switch);

        let (due, switch) = m.tick(); // tick 2 = period
        assert!(due.is_empty(), "scheduler timer must not surface as a message");
        assert!(switch);
        // Re-armed for one period later
        assert_eq!(m.pending_timers(), 1);

        let (_, switch) = m.tick(); // tick 3
        assert!(!switch);
        let (_, switch) = m.tick(); // tick 4
        assert!(switch);
    }

    #[test]
    fn test_late_registration_fires_on_next_tick() {
        let mut m = TimerManager::new();
        m.tick();
        m.tick();
        // Deadline already in the past relative to the next tick
        m.add_timer(Timer::new(1, 7, TaskId(2)));
        let due = m.tick().0;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].value(), 7);
    }
}
