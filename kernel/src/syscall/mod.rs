//! System call entry and dispatch.
//!
//! User mode enters through the `syscall` instruction, which lands on
//! [`syscall_entry`]. The stub validates the number, indexes the fixed
//! handler table and forwards up to six register arguments; every handler
//! returns the two-part (value, errno) result in RAX:RDX and `sysretq`
//! takes the caller straight back.

pub mod handlers;

use corelib::syscalls::{SyscallResult, ENOSYS, SYSCALL_TABLE_LEN};
use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use crate::logger::LogLevel;

pub type SyscallFn = extern "C" fn(u64, u64, u64, u64, u64, u64) -> SyscallResult;

/// The fixed table; a syscall number is `0x8000_0000` plus an index here.
static SYSCALL_TABLE: [SyscallFn; SYSCALL_TABLE_LEN] = [
    /* 0x00 */ handlers::log_string,
    /* 0x01 */ handlers::put_string,
    /* 0x02 */ handlers::exit,
    /* 0x03 */ handlers::open_window,
    /* 0x04 */ handlers::win_write_string,
    /* 0x05 */ handlers::win_fill_rectangle,
    /* 0x06 */ handlers::get_current_tick,
    /* 0x07 */ handlers::win_redraw,
    /* 0x08 */ handlers::win_draw_line,
    /* 0x09 */ handlers::close_window,
    /* 0x0a */ handlers::read_event,
    /* 0x0b */ handlers::create_timer,
    /* 0x0c */ handlers::open_file,
    /* 0x0d */ handlers::read_file,
    /* 0x0e */ handlers::demand_pages,
    /* 0x0f */ handlers::map_file,
];

/// Configure the MSRs that make `syscall`/`sysret` work: enable the
/// extension, point the entry stub, set the segment bases and mask
/// interrupts for the duration of the stub.
///
/// Must run after [`crate::gdt::init`].
pub fn init() {
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));

        let (kernel_cs, kernel_ss, user_cs, user_ss) = crate::gdt::selectors();
        if Star::write(user_cs, user_ss, kernel_cs, kernel_ss).is_err() {
            crate::log!(LogLevel::Error, "syscall selector layout rejected");
        }

        SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::DIRECTION_FLAG | RFlags::TRAP_FLAG);
    }
}

/// The single entry stub. Saves what `sysretq` needs (RCX = return RIP,
/// R11 = RFLAGS), moves the fourth argument out of R10 into the System V
/// slot, bounds-checks the table index and calls through.
#[unsafe(naked)]
extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "push rbp",
        "push rcx",
        "push r11",
        "mov rcx, r10",
        "and eax, 0x7fffffff",
        "mov rbp, rsp",
        "and rsp, -16",
        "cmp rax, {len}",
        "jae 2f",
        "lea r11, [rip + {table}]",
        "call qword ptr [r11 + rax * 8]",
        "jmp 3f",
        // Out-of-range number: no side effects, just the error code
        "2:",
        "xor eax, eax",
        "mov edx, {enosys}",
        "3:",
        "mov rsp, rbp",
        "pop r11",
        "pop rcx",
        "pop rbp",
        "sysretq",
        len = const SYSCALL_TABLE_LEN,
        enosys = const ENOSYS,
        table = sym SYSCALL_TABLE,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_layout_matches_numbers() {
        assert_eq!(SYSCALL_TABLE.len(), SYSCALL_TABLE_LEN);
        // Spot-check the documented indices
        assert_eq!(SYSCALL_TABLE[0x00] as usize, handlers::log_string as usize);
        assert_eq!(SYSCALL_TABLE[0x02] as usize, handlers::exit as usize);
        assert_eq!(SYSCALL_TABLE[0x0a] as usize, handlers::read_event as usize);
        assert_eq!(SYSCALL_TABLE[0x0f] as usize, handlers::map_file as usize);
    }
}
