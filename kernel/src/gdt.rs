//! GDT, TSS and the dedicated interrupt stack.
//!
//! The segment layout is fixed and load-bearing: the syscall MSRs encode
//! selector arithmetic (sysret derives SS = base + 8, CS = base + 16) and
//! the context-switch code stores the raw selector values, so the
//! constants below must match the order segments are added in `init`.

use core::mem::MaybeUninit;
use core::ptr::{addr_of, addr_of_mut};

use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PrivilegeLevel, VirtAddr};

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_SS: u16 = 0x10;
pub const USER_SS: u16 = 0x18 | 3;
pub const USER_CS: u16 = 0x20 | 3;

/// IST slot of the timer vector (hardware IST 1). The timer interrupt
/// drives context switches, so it must run on a stack that is sound even
/// if the interrupted task's stack is not.
pub const TIMER_IST_INDEX: u16 = 0;

const TIMER_INTERRUPT_STACK_SIZE: usize = 4096 * 2;

static mut TIMER_INTERRUPT_STACK: [u8; TIMER_INTERRUPT_STACK_SIZE] =
    [0; TIMER_INTERRUPT_STACK_SIZE];

static mut TSS: TaskStateSegment = TaskStateSegment::new();
static mut GDT: MaybeUninit<GlobalDescriptorTable> = MaybeUninit::uninit();

/// Build and load the GDT and TSS; reload all segment registers.
///
/// Must run before interrupts are enabled and before the syscall MSRs are
/// configured.
pub fn init() {
    unsafe {
        let stack_top =
            addr_of!(TIMER_INTERRUPT_STACK) as u64 + TIMER_INTERRUPT_STACK_SIZE as u64;
        (*addr_of_mut!(TSS)).interrupt_stack_table[TIMER_IST_INDEX as usize] =
            VirtAddr::new(stack_top);

        let tss_ref: &'static TaskStateSegment = &*addr_of!(TSS);

        let mut gdt = GlobalDescriptorTable::new();
        let kernel_cs = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_ss = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_ss = gdt.add_entry(Descriptor::user_data_segment());
        let user_cs = gdt.add_entry(Descriptor::user_code_segment());
        let tss_sel = gdt.add_entry(Descriptor::tss_segment(tss_ref));

        debug_assert_eq!(kernel_cs.0, KERNEL_CS);
        debug_assert_eq!(kernel_ss.0, KERNEL_SS);
        debug_assert_eq!(user_ss.0, USER_SS);
        debug_assert_eq!(user_cs.0, USER_CS);

        (*addr_of_mut!(GDT)).write(gdt);
        let gdt_ref: &'static GlobalDescriptorTable = (*addr_of!(GDT)).assume_init_ref();
        gdt_ref.load();

        CS::set_reg(kernel_cs);
        SS::set_reg(kernel_ss);
        let null = SegmentSelector::new(0, PrivilegeLevel::Ring0);
        DS::set_reg(null);
        ES::set_reg(null);
        FS::set_reg(null);
        GS::set_reg(null);

        load_tss(tss_sel);
    }
}

/// Re-point the privileged stack slot at the incoming task's kernel
/// stack. Called on every context switch so a trap taken in the new task
/// lands on its own stack.
pub fn set_kernel_stack(stack_top: u64) {
    unsafe {
        (*addr_of_mut!(TSS)).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Selector set for the syscall MSRs: (kernel CS, kernel SS, user CS,
/// user SS).
pub fn selectors() -> (
    SegmentSelector,
    SegmentSelector,
    SegmentSelector,
    SegmentSelector,
) {
    (
        SegmentSelector(KERNEL_CS),
        SegmentSelector(KERNEL_SS),
        SegmentSelector(USER_CS),
        SegmentSelector(USER_SS),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysret_selector_arithmetic() {
        // sysret loads SS = base + 8 and CS = base + 16 with RPL forced
        // to 3; the user segments must sit exactly there.
        let base = 0x10u16;
        assert_eq!(USER_SS & !3, base + 8);
        assert_eq!(USER_CS & !3, base + 16);
        assert_eq!(USER_SS & 3, 3);
        assert_eq!(USER_CS & 3, 3);
    }

    #[test]
    fn test_syscall_selector_arithmetic() {
        // syscall loads CS = kernel CS and SS = kernel CS + 8
        assert_eq!(KERNEL_SS, KERNEL_CS + 8);
    }
}
