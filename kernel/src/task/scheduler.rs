//! The task manager: registry, priority run queues and switch decisions.
//!
//! Scheduling is round-robin within the highest non-empty priority level.
//! The manager never performs the register switch itself; it mutates queue
//! state under the registry lock and hands context pointers back to the
//! wrappers in `task::mod`, which drop the lock before switching. That
//! split keeps the lock from being held across a context switch.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use super::context::TaskContext;
use super::mailbox::MailboxError;
use super::task::{Task, TaskEntry, TaskId, TaskState};
use crate::memory::paging::NodeHandle;
use crate::message::Message;

/// Highest priority level; level 0 is reserved for the idle task
pub const MAX_LEVEL: usize = 3;
pub const PRIORITY_LEVELS: usize = MAX_LEVEL + 1;
/// Level newly spawned tasks default to
pub const DEFAULT_LEVEL: usize = 1;

/// The boot task: created by the manager itself, runs the main event loop
pub const MAIN_TASK_ID: TaskId = TaskId(1);
/// The always-runnable idle task at level 0
pub const IDLE_TASK_ID: TaskId = TaskId(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    NoSuchTask,
    MailboxFull,
    InvalidLevel,
    OutOfMemory,
}

impl From<MailboxError> for TaskError {
    fn from(_: MailboxError) -> Self {
        TaskError::MailboxFull
    }
}

/// Context pointers for a pending switch, produced under the lock and
/// consumed after it is released
#[derive(Debug, Clone, Copy)]
pub struct SwitchPair {
    pub current: *mut TaskContext,
    pub next: *const TaskContext,
    /// Kernel stack top of the incoming task, for the TSS RSP0 slot
    pub next_stack_top: u64,
}

pub struct TaskManager {
    tasks: BTreeMap<TaskId, Box<Task>>,
    run_queues: [VecDeque<TaskId>; PRIORITY_LEVELS],
    current_level: usize,
    level_changed: bool,
    next_id: u64,
    reap_list: Vec<TaskId>,
}

impl TaskManager {
    /// Create the manager with the boot task (current, running on the
    /// loader's stack) and the idle task already registered.
    pub fn new(idle_entry: TaskEntry) -> Self {
        let mut manager = Self {
            tasks: BTreeMap::new(),
            run_queues: [const { VecDeque::new() }; PRIORITY_LEVELS],
            current_level: DEFAULT_LEVEL,
            level_changed: false,
            next_id: 1,
            reap_list: Vec::new(),
        };

        let main_id = manager.new_task().id();
        debug_assert_eq!(main_id, MAIN_TASK_ID);
        manager.task_mut_internal(main_id).set_state(TaskState::Runnable);
        manager.run_queues[DEFAULT_LEVEL].push_back(main_id);

        let idle_id = {
            let idle = manager.new_task();
            idle.init_context(idle_entry, 0);
            idle.id()
        };
        debug_assert_eq!(idle_id, IDLE_TASK_ID);
        manager.task_mut_internal(idle_id).set_level(0);
        manager.task_mut_internal(idle_id).set_state(TaskState::Runnable);
        manager.run_queues[0].push_back(idle_id);

        manager
    }

    /// Register a new task in a non-runnable state and return it for
    /// builder-style configuration. It joins a run queue only on wakeup.
    pub fn new_task(&mut self) -> &mut Task {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, Box::new(Task::new(id, DEFAULT_LEVEL)));
        self.task_mut_internal(id)
    }

    pub fn task(&self, id: TaskId) -> Result<&Task, TaskError> {
        self.tasks.get(&id).map(|t| &**t).ok_or(TaskError::NoSuchTask)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, TaskError> {
        self.tasks
            .get_mut(&id)
            .map(|t| &mut **t)
            .ok_or(TaskError::NoSuchTask)
    }

    // Registry lookups for ids the manager itself placed in a queue; a
    // miss would mean the queues and the registry disagree.
    fn task_mut_internal(&mut self, id: TaskId) -> &mut Task {
        match self.tasks.get_mut(&id) {
            Some(t) => &mut **t,
            None => panic!("run queue references unknown task {}", id.0),
        }
    }

    /// The task at the front of the current level's queue is the one
    /// whose registers are live.
    pub fn current_task_id(&self) -> TaskId {
        self.run_queues[self.current_level]
            .front()
            .copied()
            // The idle task is always queued, so every level scan
            // terminates at a non-empty queue.
            .unwrap_or(IDLE_TASK_ID)
    }

    pub fn current_task(&self) -> &Task {
        let id = self.current_task_id();
        &self.tasks[&id]
    }

    pub fn current_task_mut(&mut self) -> &mut Task {
        let id = self.current_task_id();
        self.task_mut_internal(id)
    }

    /// Make a task runnable, optionally re-homing it to `level`.
    ///
    /// Waking a task that is already running only adjusts its level; a
    /// sleeping task is appended at the tail of its level's queue.
    pub fn wakeup(&mut self, id: TaskId, level: Option<usize>) -> Result<(), TaskError> {
        if let Some(l) = level {
            if l > MAX_LEVEL {
                return Err(TaskError::InvalidLevel);
            }
        }

        let state = self.task(id)?.state();
        match state {
            TaskState::Exited => Err(TaskError::NoSuchTask),
            TaskState::Runnable => {
                if let Some(l) = level {
                    self.change_level_running(id, l);
                }
                Ok(())
            }
            TaskState::Sleeping => {
                let level = match level {
                    Some(l) => l,
                    None => self.task(id)?.level(),
                };
                let task = self.task_mut_internal(id);
                task.set_level(level);
                task.set_state(TaskState::Runnable);
                self.run_queues[level].push_back(id);
                if level > self.current_level {
                    self.level_changed = true;
                }
                Ok(())
            }
        }
    }

    /// Adjust the priority of a task that is already in a run queue.
    fn change_level_running(&mut self, id: TaskId, level: usize) {
        let old_level = self.task_mut_internal(id).level();
        if level == old_level {
            return;
        }

        if id != self.current_task_id() {
            // Re-home a task that is queued but not running
            self.run_queues[old_level].retain(|&t| t != id);
            self.run_queues[level].push_back(id);
            self.task_mut_internal(id).set_level(level);
            if level > self.current_level {
                self.level_changed = true;
            }
            return;
        }

        // Re-home the running task: it keeps the CPU, so it goes to the
        // front of its new queue and the current level follows it. A
        // demotion flags level_changed so the next rotation re-scans for
        // newly outranking work.
        let demoted = level < self.current_level;
        self.run_queues[self.current_level].pop_front();
        self.run_queues[level].push_front(id);
        self.task_mut_internal(id).set_level(level);
        self.current_level = level;
        if demoted {
            self.level_changed = true;
        }
    }

    /// Take a task out of the running set.
    ///
    /// Sleeping the current task returns the context pair for the switch
    /// the caller must now perform; sleeping any other task just marks it
    /// non-runnable.
    pub fn sleep(&mut self, id: TaskId) -> Result<Option<SwitchPair>, TaskError> {
        // The idle task is what guarantees forward progress; it never
        // leaves its queue.
        if id == IDLE_TASK_ID {
            return Ok(None);
        }
        if self.task(id)?.state() != TaskState::Runnable {
            return Ok(None);
        }

        if id != self.current_task_id() {
            let level = self.task(id)?.level();
            self.run_queues[level].retain(|&t| t != id);
            self.task_mut_internal(id).set_state(TaskState::Sleeping);
            return Ok(None);
        }

        self.task_mut_internal(id).set_state(TaskState::Sleeping);
        let (prev, next) = self.rotate_run_queue(true);
        Ok(Some(self.switch_pair(prev, next)))
    }

    /// Advance round-robin: requeue (or drop) the front task, then make
    /// the front of the highest non-empty level current.
    ///
    /// Returns (outgoing, incoming); they are equal when no switch is due.
    pub fn rotate_run_queue(&mut self, current_sleep: bool) -> (TaskId, TaskId) {
        let prev = self.current_task_id();
        let queue = &mut self.run_queues[self.current_level];
        queue.pop_front();
        if !current_sleep {
            queue.push_back(prev);
        }
        if queue.is_empty() {
            self.level_changed = true;
        }

        if self.level_changed {
            self.level_changed = false;
            for level in (0..PRIORITY_LEVELS).rev() {
                if !self.run_queues[level].is_empty() {
                    self.current_level = level;
                    break;
                }
            }
        }

        (prev, self.current_task_id())
    }

    fn switch_pair(&mut self, prev: TaskId, next: TaskId) -> SwitchPair {
        let current = self.task_mut_internal(prev).context_mut() as *mut TaskContext;
        let next_task = self.task_mut_internal(next);
        SwitchPair {
            current,
            next: next_task.context() as *const TaskContext,
            next_stack_top: next_task.kernel_stack_top(),
        }
    }

    /// Preemption step, called with the interrupted context already
    /// captured: save it into the outgoing task and pick the next one.
    /// Returns the context to restore, or `None` to resume the interrupted
    /// task.
    pub fn preempt(&mut self, interrupted: &TaskContext) -> Option<(*const TaskContext, u64)> {
        let prev = self.current_task_id();
        *self.task_mut_internal(prev).context_mut() = *interrupted;

        let (prev, next) = self.rotate_run_queue(false);
        if prev == next {
            return None;
        }
        let next_task = self.task_mut_internal(next);
        Some((
            next_task.context() as *const TaskContext,
            next_task.kernel_stack_top(),
        ))
    }

    /// Append to the target's mailbox and wake it if it was sleeping.
    ///
    /// Unknown ids are an error for the caller to report; a full mailbox
    /// likewise. Neither is fatal to the kernel.
    pub fn send_message(&mut self, id: TaskId, msg: Message) -> Result<(), TaskError> {
        let task = self.task_mut(id)?;
        if task.state() == TaskState::Exited {
            return Err(TaskError::NoSuchTask);
        }
        task.send_message(msg)?;
        self.wakeup(id, None)
    }

    /// Terminate the current task: release what it owns, pull it from the
    /// queues and hand back (its address space, the incoming context).
    /// The task struct itself (and the stack we are still executing on)
    /// stays behind until [`TaskManager::reap`].
    pub fn exit_current(&mut self, code: i32) -> (Option<NodeHandle>, *const TaskContext, u64) {
        let id = self.current_task_id();
        let task = self.task_mut_internal(id);
        task.set_exit_code(code);
        task.set_state(TaskState::Exited);
        let space = task.release_resources();

        let (_prev, next) = self.rotate_run_queue(true);
        self.reap_list.push(id);

        let next_task = self.task_mut_internal(next);
        (
            space,
            next_task.context() as *const TaskContext,
            next_task.kernel_stack_top(),
        )
    }

    /// Drop exited tasks. Only safe once execution has left their stacks,
    /// so this runs from the timer switch path, never from exit itself.
    pub fn reap(&mut self) {
        for id in core::mem::take(&mut self.reap_list) {
            self.tasks.remove(&id);
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    extern "C" fn test_entry(_id: u64, _arg: u64) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn manager() -> TaskManager {
        TaskManager::new(test_entry)
    }

    fn spawn_at(m: &mut TaskManager, level: usize) -> TaskId {
        let id = {
            let t = m.new_task();
            t.init_context(test_entry, 0);
            t.id()
        };
        m.wakeup(id, Some(level)).unwrap();
        id
    }

    #[test]
    fn test_boot_state() {
        let m = manager();
        assert_eq!(m.current_task_id(), MAIN_TASK_ID);
        assert_eq!(m.task(IDLE_TASK_ID).unwrap().level(), 0);
        assert_eq!(m.task_count(), 2);
    }

    #[test]
    fn test_priority_strictness() {
        let mut m = manager();
        let a = spawn_at(&mut m, 1);
        let b = spawn_at(&mut m, 2);

        // B outranks the main task and A: every rotation picks B while it
        // stays runnable.
        for _ in 0..5 {
            let (_, next) = m.rotate_run_queue(false);
            assert_eq!(next, b);
        }

        // B sleeps: scheduling falls back to level 1 (main task and A).
        m.sleep(b).unwrap();
        let (_, next) = m.rotate_run_queue(false);
        assert!(next == a || next == MAIN_TASK_ID);
        assert_eq!(m.task(next).unwrap().level(), 1);
    }

    #[test]
    fn test_woken_task_is_scheduled_within_bounded_rounds() {
        let mut m = manager();
        let ids: Vec<TaskId> = (0..3).map(|_| spawn_at(&mut m, 1)).collect();
        let target = ids[1];

        // target is runnable among 4 level-1 tasks (main + 3): it must
        // become current within that many rotations.
        let runnable_at_level = 4;
        let mut seen = false;
        for _ in 0..runnable_at_level {
            let (_, next) = m.rotate_run_queue(false);
            if next == target {
                seen = true;
                break;
            }
        }
        assert!(seen, "woken task not scheduled within one round-robin lap");
    }

    #[test]
    fn test_sleep_other_task_marks_without_switch() {
        let mut m = manager();
        let a = spawn_at(&mut m, 1);
        let pair = m.sleep(a).unwrap();
        assert!(pair.is_none());
        assert_eq!(m.task(a).unwrap().state(), TaskState::Sleeping);
        // Sleeping an already sleeping task is a no-op
        assert!(m.sleep(a).unwrap().is_none());
    }

    #[test]
    fn test_sleep_current_switches() {
        let mut m = manager();
        let _a = spawn_at(&mut m, 1);
        let current = m.current_task_id();
        let pair = m.sleep(current).unwrap().expect("self-sleep must switch");
        assert!(!pair.current.is_null());
        assert!(!pair.next.is_null());
        assert_ne!(m.current_task_id(), current);
    }

    #[test]
    fn test_wakeup_requeues_at_tail() {
        let mut m = manager();
        let a = spawn_at(&mut m, 1);
        let b = spawn_at(&mut m, 1);
        m.sleep(a).unwrap();
        m.wakeup(a, None).unwrap();

        // Order at level 1 is now [main, b, a]
        let order: Vec<TaskId> = m.run_queues[1].iter().copied().collect();
        assert_eq!(order, alloc::vec![MAIN_TASK_ID, b, a]);
    }

    #[test]
    fn test_change_level_of_running_task() {
        let mut m = manager();
        let current = m.current_task_id();
        m.wakeup(current, Some(2)).unwrap();
        assert_eq!(m.task(current).unwrap().level(), 2);
        // It keeps the CPU at the new level
        assert_eq!(m.current_task_id(), current);

        // Demote it below a runnable level-1 task: the next rotation must
        // re-evaluate levels.
        let a = spawn_at(&mut m, 1);
        m.wakeup(current, Some(0)).unwrap();
        let (_, next) = m.rotate_run_queue(false);
        assert_eq!(next, a);
    }

    #[test]
    fn test_send_message_wakes_sleeper() {
        let mut m = manager();
        let a = spawn_at(&mut m, 1);
        m.sleep(a).unwrap();

        m.send_message(a, Message::from_kernel(MessageKind::LayerFinish))
            .unwrap();
        assert_eq!(m.task(a).unwrap().state(), TaskState::Runnable);
        assert_eq!(m.task_mut(a).unwrap().receive_message().map(|m| m.kind),
                   Some(MessageKind::LayerFinish));
    }

    #[test]
    fn test_send_message_unknown_task_is_reported() {
        let mut m = manager();
        let err = m
            .send_message(TaskId(999), Message::from_kernel(MessageKind::LayerFinish))
            .unwrap_err();
        assert_eq!(err, TaskError::NoSuchTask);
    }

    #[test]
    fn test_mailbox_fifo_through_manager() {
        let mut m = manager();
        let a = spawn_at(&mut m, 1);
        for i in 0..5 {
            m.send_message(
                a,
                Message::from_kernel(MessageKind::TimerTimeout { timeout: i, value: 1 }),
            )
            .unwrap();
        }
        for i in 0..5 {
            let msg = m.task_mut(a).unwrap().receive_message().unwrap();
            assert_eq!(msg.kind, MessageKind::TimerTimeout { timeout: i, value: 1 });
        }
    }

    #[test]
    fn test_exit_current_releases_and_reaps_once() {
        let mut m = manager();
        let a = spawn_at(&mut m, 2); // outranks main; becomes current next rotate
        let (_, next) = m.rotate_run_queue(false);
        assert_eq!(next, a);

        let count_before = m.task_count();
        let (space, next_ctx, _stack) = m.exit_current(0);
        assert!(space.is_none());
        assert!(!next_ctx.is_null());
        assert_eq!(m.task(a).unwrap().state(), TaskState::Exited);
        // Exited tasks cannot be woken or messaged
        assert_eq!(m.wakeup(a, None).unwrap_err(), TaskError::NoSuchTask);
        assert_eq!(
            m.send_message(a, Message::from_kernel(MessageKind::LayerFinish))
                .unwrap_err(),
            TaskError::NoSuchTask
        );

        m.reap();
        assert_eq!(m.task_count(), count_before - 1);
        assert_eq!(m.task(a).unwrap_err(), TaskError::NoSuchTask);
    }

    #[test]
    fn test_preempt_round_robins_equal_level() {
        let mut m = manager();
        let a = spawn_at(&mut m, 1);
        let b = spawn_at(&mut m, 1);

        let frame = TaskContext::empty();
        // main -> a -> b -> main ...
        let (next, _) = m.preempt(&frame).expect("switch to a");
        assert_eq!(next, m.task(a).unwrap().context() as *const _);
        let (next, _) = m.preempt(&frame).expect("switch to b");
        assert_eq!(next, m.task(b).unwrap().context() as *const _);
        let (next, _) = m.preempt(&frame).expect("switch back to main");
        assert_eq!(next, m.task(MAIN_TASK_ID).unwrap().context() as *const _);
    }

    #[test]
    fn test_idle_runs_when_everyone_sleeps() {
        let mut m = manager();
        let current = m.current_task_id();
        let pair = m.sleep(current).unwrap().unwrap();
        // Only the idle task is left runnable
        assert_eq!(m.current_task_id(), IDLE_TASK_ID);
        assert_eq!(pair.next, m.task(IDLE_TASK_ID).unwrap().context() as *const _);
    }
}
