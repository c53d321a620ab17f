//! Local APIC one-shot timer.
//!
//! The hardware is a countdown register: program an initial count and it
//! fires one interrupt on reaching zero, then stays idle until rearmed.
//! The tick handler rearms it on every interrupt.

use core::ptr::NonNull;

use volatile::VolatilePtr;

/// Local Vector Table entry for the timer: interrupt configuration
const LVT_TIMER: u64 = 0xFEE0_0320;
/// Countdown start value; writing begins a new countdown
const INITIAL_COUNT: u64 = 0xFEE0_0380;
/// Divide configuration: how many bus clocks per counter decrement
const DIVIDE_CONFIG: u64 = 0xFEE0_03E0;
/// End-of-interrupt register; any write acknowledges
const END_OF_INTERRUPT: u64 = 0xFEE0_00B0;

/// Divide 1:1
const DIVIDE_1_1: u32 = 0b1011;

fn reg(addr: u64) -> VolatilePtr<'static, u32> {
    unsafe { VolatilePtr::new(NonNull::new_unchecked(addr as *mut u32)) }
}

/// Program the timer: one-shot mode, divide 1:1, delivering the given
/// vector. The countdown does not start until [`start_oneshot`].
pub fn initialize(vector: u8) {
    #[cfg(not(test))]
    {
        reg(DIVIDE_CONFIG).write(DIVIDE_1_1);
        // Bits 18:17 = 00 selects one-shot; mask bit 16 left clear
        reg(LVT_TIMER).write(vector as u32);
    }
    #[cfg(test)]
    let _ = vector;
}

/// Arm the countdown; the interrupt fires once when it hits zero.
pub fn start_oneshot(count: u32) {
    #[cfg(not(test))]
    reg(INITIAL_COUNT).write(count);
    #[cfg(test)]
    let _ = count;
}

/// Cancel a running countdown.
pub fn stop() {
    #[cfg(not(test))]
    reg(INITIAL_COUNT).write(0);
}

/// Acknowledge the in-service interrupt to the local APIC.
pub fn end_of_interrupt() {
    #[cfg(not(test))]
    reg(END_OF_INTERRUPT).write(0);
}
