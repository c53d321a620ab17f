#![no_std]
#![no_main]

//! # RowanOS
//!
//! The boot binary: initialization in dependency order, then the main
//! task's event loop. The loop is the hub the rest of the system posts
//! to - device interrupts, timer expirations, key input and layer
//! operations all arrive here as messages.

extern crate alloc;

use rowan_kernel::boot::BootInfo;
use rowan_kernel::layers;
use rowan_kernel::logger::{self, LogLevel};
use rowan_kernel::message::{Message, MessageKind};
use rowan_kernel::{gdt, interrupts, log, memory, serial_println, sync, syscall, task, timer};

/// Kernel-owned cursor-blink timer: positive value, never visible to
/// applications.
const CURSOR_TIMER_VALUE: i32 = 1;
const CURSOR_BLINK_TICKS: u64 = timer::TIMER_FREQ / 2;

#[no_mangle]
pub extern "C" fn _start(boot_info: &'static BootInfo) -> ! {
    serial_println!("RowanOS booting");
    logger::set_log_level(LogLevel::Warn);

    // Segments and the dedicated interrupt stack come first; everything
    // after may take a trap.
    gdt::init();
    interrupts::init();

    let memory_map = unsafe { boot_info.memory_map() };
    if memory::init(memory_map).is_err() {
        panic!("not enough physical memory to bring up the kernel");
    }

    timer::init(interrupts::TIMER_INTERRUPT_VECTOR);
    syscall::init();
    task::init();

    sync::enable_interrupts();

    let now = timer::current_tick();
    timer::add_timer(now + CURSOR_BLINK_TICKS, CURSOR_TIMER_VALUE, task::MAIN_TASK_ID);

    log!(LogLevel::Info, "kernel up, entering main loop");
    main_loop()
}

/// The main task: drain the mailbox forever. Receiving blocks via the
/// masked check-then-sleep path in `task::wait_message`, so an empty
/// mailbox costs nothing and no wakeup can be lost.
fn main_loop() -> ! {
    let mut cursor_visible = false;

    loop {
        let msg = task::wait_message();
        match msg.kind {
            MessageKind::DeviceInterrupt => {
                // Drain the controller's event ring outside interrupt
                // context; the driver registered the callback at boot.
                interrupts::run_device_event_handler();
            }

            MessageKind::TimerTimeout { timeout, value } => {
                if value == CURSOR_TIMER_VALUE {
                    timer::add_timer(
                        timeout + CURSOR_BLINK_TICKS,
                        CURSOR_TIMER_VALUE,
                        task::MAIN_TASK_ID,
                    );
                    cursor_visible = !cursor_visible;
                    blink_cursor(cursor_visible);
                }
            }

            MessageKind::KeyPush { keycode, ascii, .. } => {
                match layers::active_task() {
                    Some(target) => {
                        if task::send_message(target, msg).is_err() {
                            log!(LogLevel::Warn, "key input dropped: mailbox of task full");
                        }
                    }
                    None => {
                        log!(
                            LogLevel::Warn,
                            "key push not handled: keycode {:02x}, ascii {:02x}",
                            keycode,
                            ascii
                        );
                    }
                }
            }

            MessageKind::Layer { op, layer_id } => {
                // Apply on the compositor, then confirm to the requester
                // so it can continue past its blocking wait.
                if let Err(e) = layers::with_service(|s| s.apply(layer_id, &op)) {
                    log!(LogLevel::Error, "layer operation failed: {:?}", e);
                }
                let reply = Message::new(task::MAIN_TASK_ID, MessageKind::LayerFinish);
                if task::send_message(msg.src_task, reply).is_err() {
                    log!(LogLevel::Warn, "layer reply dropped for task {}", msg.src_task.0);
                }
            }

            MessageKind::WindowClose { layer_id } => {
                if let Some(owner) = layers::task_for_layer(layer_id) {
                    if task::send_message(owner, msg).is_err() {
                        log!(LogLevel::Warn, "window-close notification dropped");
                    }
                }
                layers::unregister_layer(layer_id);
            }

            other => {
                log!(LogLevel::Error, "unknown message type: {:?}", other);
            }
        }
    }
}

/// Repaint the focused layer on each blink edge; the compositor decides
/// what a cursor looks like.
fn blink_cursor(_visible: bool) {
    if let Some(layer) = layers::active_layer() {
        let _ = layers::with_service(|s| s.draw(layer));
    }
}
