//! Task management: the global manager and the switch entry points.
//!
//! The registry lives behind one interrupt-safe lock. The wrappers here
//! follow a strict shape for anything that switches contexts: mask
//! interrupts, take the lock, mutate queue state and extract raw context
//! pointers, release the lock, then switch. The lock is never held across
//! a switch, and the mask is never released between checking a condition
//! and descheduling on its result - that window is where wakeups would be
//! lost.

pub mod context;
pub mod mailbox;
pub mod scheduler;
pub mod stack;
#[allow(clippy::module_inception)]
pub mod task;

pub use context::TaskContext;
pub use mailbox::{MailboxError, MAILBOX_CAPACITY};
pub use scheduler::{
    SwitchPair, TaskError, TaskManager, DEFAULT_LEVEL, IDLE_TASK_ID, MAIN_TASK_ID, MAX_LEVEL,
};
pub use task::{Task, TaskEntry, TaskId, TaskState};

use alloc::vec::Vec;

use crate::files::FileMapping;
use crate::logger::LogLevel;
use crate::memory::paging::NodeHandle;
use crate::message::Message;
use crate::sync::{self, InterruptSafeLock};

static TASKS: InterruptSafeLock<Option<TaskManager>> = InterruptSafeLock::new(None);

/// Everything the page-fault handler needs to know about the current task
pub struct FaultContext {
    pub root: Option<NodeHandle>,
    pub dpaging_begin: u64,
    pub dpaging_end: u64,
    pub file_maps: Vec<FileMapping>,
}

extern "C" fn idle_main(_id: u64, _arg: u64) -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Bring up the task system: the boot task becomes the main task, the
/// idle task is registered, and the preemption timer starts ticking.
pub fn init() {
    *TASKS.lock() = Some(TaskManager::new(idle_main));
    crate::timer::start_preemption_timer();
}

/// Whether [`init`] has run; interrupt handlers check before posting.
pub fn is_initialized() -> bool {
    TASKS.lock().is_some()
}

/// Run `f` on the global manager.
pub fn with_manager<R>(f: impl FnOnce(&mut TaskManager) -> R) -> R {
    let mut guard = TASKS.lock();
    let manager = guard.as_mut().expect("task system not initialized");
    f(manager)
}

/// Create, configure and wake a kernel task in one step.
pub fn spawn(entry: TaskEntry, arg: u64, level: usize) -> Result<TaskId, TaskError> {
    with_manager(|m| {
        let id = {
            let t = m.new_task();
            t.init_context(entry, arg);
            t.id()
        };
        m.wakeup(id, Some(level))?;
        Ok(id)
    })
}

/// Like [`spawn`], but with a private address space cloned from the
/// kernel's identity mapping.
pub fn spawn_user(entry: TaskEntry, arg: u64, level: usize) -> Result<TaskId, TaskError> {
    if level > MAX_LEVEL {
        return Err(TaskError::InvalidLevel);
    }
    let root = crate::memory::new_address_space().map_err(|_| TaskError::OutOfMemory)?;
    with_manager(|m| {
        let id = {
            let t = m.new_task();
            t.init_context(entry, arg);
            t.set_address_space(root);
            t.id()
        };
        m.wakeup(id, Some(level))?;
        Ok(id)
    })
}

/// Make a task runnable.
pub fn wakeup(id: TaskId) -> Result<(), TaskError> {
    with_manager(|m| m.wakeup(id, None))
}

/// Take a task out of the running set. Directed at the caller's own task
/// this yields immediately; directed at another task it only marks it
/// non-runnable.
pub fn sleep(id: TaskId) {
    if current_task_id() == id {
        sleep_current();
    } else {
        let _ = with_manager(|m| m.sleep(id));
    }
}

/// Append to a task's mailbox, waking it if necessary.
pub fn send_message(id: TaskId, msg: Message) -> Result<(), TaskError> {
    with_manager(|m| m.send_message(id, msg))
}

/// Id of the task whose registers are live.
pub fn current_task_id() -> TaskId {
    with_manager(|m| m.current_task_id())
}

/// Run `f` on the current task.
pub fn with_current_task<R>(f: impl FnOnce(&mut Task) -> R) -> R {
    with_manager(|m| f(m.current_task_mut()))
}

/// Non-blocking receive on the current task's mailbox.
pub fn try_receive_message() -> Option<Message> {
    with_manager(|m| m.current_task_mut().receive_message())
}

/// Put the current task to sleep and switch away. Returns when woken.
pub fn sleep_current() {
    let were_enabled = sync::interrupts_enabled();
    sync::disable_interrupts();

    let pair = with_manager(|m| {
        let id = m.current_task_id();
        match m.sleep(id) {
            Ok(pair) => {
                if let Some(p) = pair {
                    crate::gdt::set_kernel_stack(p.next_stack_top);
                }
                pair
            }
            Err(_) => None,
        }
    });

    if let Some(p) = pair {
        // Lock released above; interrupts still masked until the incoming
        // context's RFLAGS are restored.
        unsafe { context::switch_context(p.next, p.current) };
    }

    if were_enabled {
        sync::enable_interrupts();
    }
}

/// Blocking receive: the check-then-sleep sequence runs entirely under
/// the interrupt mask, so a wakeup delivered between observing an empty
/// mailbox and descheduling cannot be lost.
pub fn wait_message() -> Message {
    loop {
        let were_enabled = sync::interrupts_enabled();
        sync::disable_interrupts();

        let msg = try_receive_message();
        if let Some(m) = msg {
            if were_enabled {
                sync::enable_interrupts();
            }
            return m;
        }

        // Still masked: nothing can slip in before we are off the queue.
        sleep_current();
        if were_enabled {
            sync::enable_interrupts();
        }
    }
}

/// Preemption entry, called from the timer interrupt with the interrupted
/// task's full context captured from the interrupt frame. Does not return
/// if a switch happens.
pub fn switch_on_tick(interrupted: &TaskContext) {
    let next = with_manager(|m| {
        // Stacks of previously exited tasks are free now: execution is on
        // the dedicated interrupt stack.
        m.reap();
        let next = m.preempt(interrupted);
        if let Some((_, stack_top)) = next {
            crate::gdt::set_kernel_stack(stack_top);
        }
        next
    });

    if let Some((ctx, _)) = next {
        unsafe { context::restore_context(ctx) };
    }
}

/// Terminate the calling task. Its address space, descriptor table and
/// (after the next timer switch) stack are released exactly once.
pub fn exit_current(code: i32) -> ! {
    sync::disable_interrupts();

    let (space, next_ctx) = with_manager(|m| {
        let (space, next_ctx, next_stack) = m.exit_current(code);
        crate::gdt::set_kernel_stack(next_stack);
        (space, next_ctx)
    });

    if let Some(root) = space {
        if crate::memory::free_address_space(root).is_err() {
            crate::log!(LogLevel::Error, "leaked address space of exited task");
        }
    }

    crate::log!(LogLevel::Debug, "task exited with code {}", code);
    unsafe { context::restore_context(next_ctx) }
}

/// Snapshot of the current task's fault-relevant state, for the page
/// fault handler. `None` before the task system is initialized.
pub fn current_fault_context() -> Option<FaultContext> {
    let mut guard = TASKS.lock();
    let manager = guard.as_mut()?;
    let task = manager.current_task_mut();
    Some(FaultContext {
        root: task.address_space(),
        dpaging_begin: task.dpaging_begin(),
        dpaging_end: task.dpaging_end(),
        file_maps: task.file_maps().to_vec(),
    })
}
