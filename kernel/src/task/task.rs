//! The task: unit of scheduling.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::context::TaskContext;
use super::mailbox::{Mailbox, MailboxError};
use super::stack::{TaskStack, DEFAULT_STACK_BYTES};
use crate::files::{FileDescriptor, FileMapping};
use crate::memory::paging::NodeHandle;
use crate::message::Message;

/// Unique task identifier; never reused within one boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// In a run queue (or currently executing)
    Runnable,
    /// Off the run queues, waiting for a wakeup
    Sleeping,
    /// Finished; resources released, awaiting reap
    Exited,
}

/// Entry point of a task: receives its own id and an opaque argument
pub type TaskEntry = extern "C" fn(u64, u64) -> !;

/// Start of the growable demand-paged region of every task
pub const DEMAND_PAGING_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Upper end from which file mappings grow downwards
pub const FILE_MAP_TOP: u64 = 0xFFFF_FFFF_FFFF_E000;

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

pub struct Task {
    id: TaskId,
    level: usize,
    state: TaskState,
    context: TaskContext,
    stack: TaskStack,
    mailbox: Mailbox,
    files: Vec<Option<Box<dyn FileDescriptor>>>,
    /// Private address-space root for user tasks; kernel tasks run on the
    /// shared identity mapping and have none
    address_space: Option<NodeHandle>,
    dpaging_begin: u64,
    dpaging_end: u64,
    file_map_end: u64,
    file_maps: Vec<FileMapping>,
    exit_code: i32,
}

impl Task {
    /// A freshly registered task: not runnable until woken.
    pub fn new(id: TaskId, level: usize) -> Self {
        Self {
            id,
            level,
            state: TaskState::Sleeping,
            context: TaskContext::empty(),
            stack: TaskStack::empty(),
            mailbox: Mailbox::new(),
            files: Vec::new(),
            address_space: None,
            dpaging_begin: DEMAND_PAGING_BASE,
            dpaging_end: DEMAND_PAGING_BASE,
            file_map_end: FILE_MAP_TOP,
            file_maps: Vec::new(),
            exit_code: 0,
        }
    }

    /// Builder step: give the task a stack and an initial context so the
    /// first switch onto it lands in `entry(id, arg)`.
    pub fn init_context(&mut self, entry: TaskEntry, arg: u64) -> &mut Self {
        self.stack = TaskStack::new(DEFAULT_STACK_BYTES);
        self.context = TaskContext::new_for_task(entry as u64, self.stack.top(), self.id.0, arg);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub(super) fn set_level(&mut self, level: usize) {
        self.level = level;
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(super) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TaskContext {
        &mut self.context
    }

    /// Top of the kernel stack, for the TSS RSP0 slot during switches
    pub fn kernel_stack_top(&self) -> u64 {
        self.stack.top()
    }

    pub fn send_message(&mut self, msg: Message) -> Result<(), MailboxError> {
        self.mailbox.push(msg)
    }

    /// Oldest pending message, or `None` without blocking
    pub fn receive_message(&mut self) -> Option<Message> {
        self.mailbox.pop()
    }

    pub fn pending_messages(&self) -> usize {
        self.mailbox.len()
    }

    // --- file descriptors -------------------------------------------------

    pub fn file(&mut self, fd: usize) -> Option<&mut dyn FileDescriptor> {
        match self.files.get_mut(fd) {
            Some(Some(f)) => Some(f.as_mut()),
            _ => None,
        }
    }

    /// Lowest free slot in the descriptor table, growing it if needed
    pub fn allocate_fd(&mut self, file: Box<dyn FileDescriptor>) -> usize {
        for (i, slot) in self.files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return i;
            }
        }
        self.files.push(Some(file));
        self.files.len() - 1
    }

    // --- demand paging / file mapping regions ----------------------------

    pub fn dpaging_begin(&self) -> u64 {
        self.dpaging_begin
    }

    pub fn dpaging_end(&self) -> u64 {
        self.dpaging_end
    }

    pub fn set_dpaging_end(&mut self, end: u64) {
        self.dpaging_end = end;
    }

    pub fn file_map_end(&self) -> u64 {
        self.file_map_end
    }

    pub fn set_file_map_end(&mut self, end: u64) {
        self.file_map_end = end;
    }

    pub fn file_maps(&self) -> &[FileMapping] {
        &self.file_maps
    }

    pub fn add_file_map(&mut self, mapping: FileMapping) {
        self.file_maps.push(mapping);
    }

    pub fn address_space(&self) -> Option<NodeHandle> {
        self.address_space
    }

    pub fn set_address_space(&mut self, root: NodeHandle) {
        self.context.set_page_map_root(root.address());
        self.address_space = Some(root);
    }

    pub(super) fn set_exit_code(&mut self, code: i32) {
        self.exit_code = code;
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Drop everything the task owns besides its stack and context.
    ///
    /// The address space is handed back to the caller so the memory
    /// subsystem can release it outside the task registry lock; the stack
    /// survives until the reap pass because the task may still be
    /// executing on it.
    pub(super) fn release_resources(&mut self) -> Option<NodeHandle> {
        self.files.clear();
        self.file_maps.clear();
        self.address_space.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::MemFile;
    use alloc::vec;

    extern "C" fn noop_entry(_id: u64, _arg: u64) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn test_new_task_is_not_runnable() {
        let t = Task::new(TaskId(5), 1);
        assert_eq!(t.state(), TaskState::Sleeping);
        assert!(t.address_space().is_none());
        assert_eq!(t.dpaging_begin(), t.dpaging_end());
    }

    #[test]
    fn test_init_context_allocates_stack() {
        let mut t = Task::new(TaskId(5), 1);
        t.init_context(noop_entry, 99);
        assert!(t.kernel_stack_top() > 0);
    }

    #[test]
    fn test_fd_allocation_reuses_slots() {
        let mut t = Task::new(TaskId(1), 1);
        let a = t.allocate_fd(Box::new(MemFile::new(vec![1])));
        let b = t.allocate_fd(Box::new(MemFile::new(vec![2])));
        assert_eq!((a, b), (0, 1));

        t.files[0] = None;
        let c = t.allocate_fd(Box::new(MemFile::new(vec![3])));
        assert_eq!(c, 0);
        assert!(t.file(0).is_some());
        assert!(t.file(5).is_none());
    }

    #[test]
    fn test_release_resources_clears_tables_once() {
        let mut t = Task::new(TaskId(1), 1);
        t.allocate_fd(Box::new(MemFile::new(vec![0])));
        t.add_file_map(FileMapping {
            fd: 0,
            vaddr_begin: 0,
            vaddr_end: 4096,
        });

        assert!(t.release_resources().is_none()); // no address space to return
        assert!(t.file(0).is_none());
        assert!(t.file_maps().is_empty());
    }
}
