//! Saved execution context and the switch primitives.
//!
//! [`TaskContext`] is an opaque value to the scheduler: it is produced by
//! the constructors here and consumed by the two naked switch routines,
//! and no scheduling logic ever looks inside. Exactly one task's register
//! state is live in the CPU at any moment; everyone else's is fully
//! captured in their context record.
//!
//! Both switch routines must be entered with interrupts masked. The mask
//! falls away only when `iretq` restores the incoming task's RFLAGS.

/// Complete CPU state of a suspended task.
///
/// The field order is load-bearing: the naked routines below address the
/// struct by fixed offsets (noted per field).
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct TaskContext {
    cr3: u64,           // 0x00 - page-map base; 0 = keep the current one
    rip: u64,           // 0x08
    rflags: u64,        // 0x10
    reserved1: u64,     // 0x18
    cs: u64,            // 0x20
    ss: u64,            // 0x28
    fs: u64,            // 0x30
    gs: u64,            // 0x38
    rax: u64,           // 0x40
    rbx: u64,           // 0x48
    rcx: u64,           // 0x50
    rdx: u64,           // 0x58
    rdi: u64,           // 0x60
    rsi: u64,           // 0x68
    rsp: u64,           // 0x70
    rbp: u64,           // 0x78
    r8: u64,            // 0x80
    r9: u64,            // 0x88
    r10: u64,           // 0x90
    r11: u64,           // 0x98
    r12: u64,           // 0xa0
    r13: u64,           // 0xa8
    r14: u64,           // 0xb0
    r15: u64,           // 0xb8
    fxsave_area: [u8; 512], // 0xc0
}

impl TaskContext {
    pub const fn empty() -> Self {
        Self {
            cr3: 0,
            rip: 0,
            rflags: 0,
            reserved1: 0,
            cs: 0,
            ss: 0,
            fs: 0,
            gs: 0,
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rdi: 0,
            rsi: 0,
            rsp: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            fxsave_area: [0; 512],
        }
    }

    /// Context for a task that has never run: begins at `entry` with the
    /// task id and an argument in the first two parameter registers.
    pub fn new_for_task(entry: u64, stack_top: u64, task_id: u64, arg: u64) -> Self {
        let mut ctx = Self::empty();
        ctx.rip = entry;
        ctx.rdi = task_id;
        ctx.rsi = arg;
        ctx.cr3 = 0; // share the current page maps until given its own
        ctx.rflags = 0x202; // IF set
        ctx.cs = crate::gdt::KERNEL_CS as u64;
        ctx.ss = crate::gdt::KERNEL_SS as u64;
        // ABI: RSP ≡ 8 (mod 16) at function entry, as after a call
        ctx.rsp = (stack_top & !0xF) - 8;
        // MXCSR: mask all SSE exceptions
        ctx.fxsave_area[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
        ctx
    }

    /// Point an existing context at a different page-map root.
    pub fn set_page_map_root(&mut self, root_addr: u64) {
        self.cr3 = root_addr;
    }
}

impl core::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskContext")
            .field("rip", &format_args!("{:#x}", self.rip))
            .field("rsp", &format_args!("{:#x}", self.rsp))
            .field("cr3", &format_args!("{:#x}", self.cr3))
            .finish_non_exhaustive()
    }
}

/// Save the running state into `current` and resume `next`.
///
/// Returns (to the saved RIP of `current`) only when some later switch
/// restores `current` again.
///
/// # Safety
/// Both pointers must reference live, properly initialized contexts and
/// interrupts must be masked by the caller.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_next: *const TaskContext, _current: *mut TaskContext) {
    core::arch::naked_asm!(
        // rdi = next, rsi = current
        //
        // Capture the full register file of the caller into *current.
        "mov [rsi + 0x40], rax",
        "mov [rsi + 0x48], rbx",
        "mov [rsi + 0x50], rcx",
        "mov [rsi + 0x58], rdx",
        "mov [rsi + 0x60], rdi",
        "mov [rsi + 0x68], rsi",
        // RSP as it will be once our return address is popped
        "lea rax, [rsp + 8]",
        "mov [rsi + 0x70], rax",
        "mov [rsi + 0x78], rbp",
        "mov [rsi + 0x80], r8",
        "mov [rsi + 0x88], r9",
        "mov [rsi + 0x90], r10",
        "mov [rsi + 0x98], r11",
        "mov [rsi + 0xa0], r12",
        "mov [rsi + 0xa8], r13",
        "mov [rsi + 0xb0], r14",
        "mov [rsi + 0xb8], r15",
        // RIP = our return address
        "mov rax, [rsp]",
        "mov [rsi + 0x08], rax",
        "pushfq",
        "pop qword ptr [rsi + 0x10]",
        "mov rax, cs",
        "mov [rsi + 0x20], rax",
        "mov rax, ss",
        "mov [rsi + 0x28], rax",
        "mov rax, fs",
        "mov [rsi + 0x30], rax",
        "mov rax, gs",
        "mov [rsi + 0x38], rax",
        "mov rax, cr3",
        "mov [rsi + 0x00], rax",
        "fxsave [rsi + 0xc0]",
        // Hand over to the restore half with rdi = next
        "jmp {restore}",
        restore = sym restore_context,
    );
}

/// Resume `next` without saving anything. Used for the very first switch
/// onto a task, for preemption (the outgoing state was already captured
/// from the interrupt frame) and for task exit.
///
/// # Safety
/// `next` must reference a live, fully initialized context and interrupts
/// must be masked by the caller. Never returns.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(_next: *const TaskContext) -> ! {
    core::arch::naked_asm!(
        // rdi = next
        //
        // Build the iretq frame on the current stack: SS, RSP, RFLAGS,
        // CS, RIP. iretq pops all five, which also restores the
        // interrupt-enable flag atomically with the jump.
        "push qword ptr [rdi + 0x28]",
        "push qword ptr [rdi + 0x70]",
        "push qword ptr [rdi + 0x10]",
        "push qword ptr [rdi + 0x20]",
        "push qword ptr [rdi + 0x08]",

        "fxrstor [rdi + 0xc0]",

        // 0 means "stay in the current address space"
        "mov rax, [rdi + 0x00]",
        "test rax, rax",
        "jz 2f",
        "mov cr3, rax",
        "2:",

        "mov rax, [rdi + 0x30]",
        "mov fs, ax",
        "mov rax, [rdi + 0x38]",
        "mov gs, ax",

        "mov rax, [rdi + 0x40]",
        "mov rbx, [rdi + 0x48]",
        "mov rcx, [rdi + 0x50]",
        "mov rdx, [rdi + 0x58]",
        "mov rsi, [rdi + 0x68]",
        "mov rbp, [rdi + 0x78]",
        "mov r8,  [rdi + 0x80]",
        "mov r9,  [rdi + 0x88]",
        "mov r10, [rdi + 0x90]",
        "mov r11, [rdi + 0x98]",
        "mov r12, [rdi + 0xa0]",
        "mov r13, [rdi + 0xa8]",
        "mov r14, [rdi + 0xb0]",
        "mov r15, [rdi + 0xb8]",
        // rdi last - it is the context pointer until here
        "mov rdi, [rdi + 0x60]",

        "iretq",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_layout_matches_switch_offsets() {
        // The naked routines address these fields by constant; a layout
        // change must fail loudly.
        assert_eq!(offset_of!(TaskContext, cr3), 0x00);
        assert_eq!(offset_of!(TaskContext, rip), 0x08);
        assert_eq!(offset_of!(TaskContext, rflags), 0x10);
        assert_eq!(offset_of!(TaskContext, cs), 0x20);
        assert_eq!(offset_of!(TaskContext, ss), 0x28);
        assert_eq!(offset_of!(TaskContext, rax), 0x40);
        assert_eq!(offset_of!(TaskContext, rdi), 0x60);
        assert_eq!(offset_of!(TaskContext, rsp), 0x70);
        assert_eq!(offset_of!(TaskContext, r8), 0x80);
        assert_eq!(offset_of!(TaskContext, r15), 0xb8);
        assert_eq!(offset_of!(TaskContext, fxsave_area), 0xc0);
        assert_eq!(size_of::<TaskContext>(), 0x2c0);
    }

    #[test]
    fn test_new_task_context() {
        let ctx = TaskContext::new_for_task(0x1000, 0x9000, 7, 42);
        assert_eq!(ctx.rip, 0x1000);
        assert_eq!(ctx.rdi, 7);
        assert_eq!(ctx.rsi, 42);
        assert_ne!(ctx.rflags & 0x200, 0); // IF set
        // Entry alignment: rsp ≡ 8 (mod 16)
        assert_eq!(ctx.rsp % 16, 8);
        assert!(ctx.rsp < 0x9000);
    }

    #[test]
    fn test_fxsave_mxcsr_masks_exceptions() {
        let ctx = TaskContext::new_for_task(0, 0x2000, 1, 0);
        let mxcsr = u32::from_le_bytes(ctx.fxsave_area[24..28].try_into().unwrap());
        assert_eq!(mxcsr, 0x1F80);
    }
}
