//! # The RowanOS Kernel Library
//!
//! Core kernel functionality, exported as a library so the boot binary
//! links against it and the logic-level modules are testable on the host.
//!
//! The kernel is a small monolith around four pillars:
//! - task scheduling and context switching ([`task`])
//! - virtual memory with demand paging ([`memory`])
//! - the timer queue driving preemption and timeouts ([`timer`])
//! - interrupt/exception dispatch and the syscall surface
//!   ([`interrupts`], [`syscall`])

#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

/// Kernel heap. Initialized by `memory::init` from frames handed over by
/// the frame allocator; any allocation before that is a bug.
#[cfg(not(test))]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

pub mod boot;
pub mod files;
pub mod gdt;
pub mod interrupts;
pub mod layers;
pub mod logger;
pub mod memory;
pub mod message;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod timer;

// Re-export the types that cross module boundaries most often
pub use logger::LogLevel;
pub use message::{Message, MessageKind};
pub use task::{TaskError, TaskId, TaskState};

/// Panic is fatal to the whole kernel: unexpected exceptions and violated
/// invariants have no recovery policy above this point.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    sync::disable_interrupts();
    serial_println!("[PANIC] {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
