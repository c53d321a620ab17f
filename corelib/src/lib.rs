//! # Corelib
//!
//! The shared kernel/application ABI for RowanOS: system call numbers,
//! POSIX-style error codes, application event types and the raw syscall
//! wrappers user programs link against.
//!
//! The kernel depends on this crate so both sides of the syscall boundary
//! agree on one definition of every number and structure.

#![no_std]

pub mod events;
pub mod syscalls;

pub use events::{AppEvent, AppEventArg, AppEventKind};
pub use syscalls::SyscallResult;
