//! The syscall handlers, one per table slot.
//!
//! Every handler validates its arguments - pointer range against the
//! kernel/user split, length bounds, descriptor bounds - before the first
//! side effect. Violations return an errno with nothing changed.

use corelib::events::AppEvent;
use corelib::syscalls::{
    SyscallResult, E2BIG, EBADF, EFAULT, EINVAL, ENOENT, ENOSYS, EPERM,
};

use crate::files::{self, FileMapping};
use crate::layers::{self, LayerError, LayerId, PixelColor};
use crate::logger::LogLevel;
use crate::memory::paging::USER_ADDRESS_BASE;
use crate::message::MessageKind;
use crate::task;
use crate::timer::{self, TIMER_FREQ};

/// Longest string a single syscall will read from user memory
const MAX_STRING_LEN: usize = 1024;

// Keyboard modifier bits, as delivered in key-push messages
const L_CONTROL_BIT: u8 = 0b0000_0001;
const R_CONTROL_BIT: u8 = 0b0001_0000;
/// Keycode of 'Q'
const KEYCODE_Q: u8 = 20;

fn check_user_ptr(addr: u64) -> Result<(), i32> {
    if addr < USER_ADDRESS_BASE {
        return Err(EFAULT);
    }
    Ok(())
}

/// Read a NUL-terminated string out of user memory.
///
/// # Safety
/// The pointer must have passed [`check_user_ptr`]; the task's mapping
/// backs the read.
unsafe fn read_user_str(ptr: u64) -> Result<&'static str, i32> {
    let base = ptr as *const u8;
    let mut len = 0;
    while len <= MAX_STRING_LEN {
        if *base.add(len) == 0 {
            break;
        }
        len += 1;
    }
    if len > MAX_STRING_LEN {
        return Err(E2BIG);
    }
    core::str::from_utf8(core::slice::from_raw_parts(base, len)).map_err(|_| EINVAL)
}

fn layer_errno(e: LayerError) -> i32 {
    match e {
        LayerError::NoSuchLayer => EBADF,
        LayerError::NoCompositor => ENOSYS,
    }
}

/// Common shape of the window syscalls: the low 32 bits of the first
/// argument are the layer id, bit 32 set suppresses the redraw.
fn with_layer(
    layer_id_flags: u64,
    f: impl FnOnce(&mut dyn layers::LayerService, LayerId) -> Result<(), LayerError>,
) -> SyscallResult {
    let flags = (layer_id_flags >> 32) as u32;
    let layer = LayerId(layer_id_flags as u32);

    let result = layers::with_service(|s| {
        f(s, layer)?;
        if flags & 1 == 0 {
            s.draw(layer)?;
        }
        Ok(())
    });

    match result {
        Ok(()) => SyscallResult::ok(0),
        Err(e) => SyscallResult::err(layer_errno(e)),
    }
}

/// 0x00: write a string to the kernel log.
pub extern "C" fn log_string(
    arg1: u64,
    arg2: u64,
    _arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    let Some(level) = LogLevel::from_raw(arg1) else {
        return SyscallResult::err(EPERM);
    };
    if let Err(e) = check_user_ptr(arg2) {
        return SyscallResult::err(e);
    }
    match unsafe { read_user_str(arg2) } {
        Ok(s) => {
            crate::log!(level, "{}", s);
            SyscallResult::ok(s.len() as u64)
        }
        Err(e) => SyscallResult::err(e),
    }
}

/// 0x01: write bytes to one of the caller's descriptors.
pub extern "C" fn put_string(
    arg1: u64,
    arg2: u64,
    arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    let fd = arg1 as usize;
    let len = arg3 as usize;
    if len > MAX_STRING_LEN {
        return SyscallResult::err(E2BIG);
    }
    if let Err(e) = check_user_ptr(arg2) {
        return SyscallResult::err(e);
    }

    let bytes = unsafe { core::slice::from_raw_parts(arg2 as *const u8, len) };
    task::with_current_task(|t| match t.file(fd) {
        Some(f) => SyscallResult::ok(f.write(bytes) as u64),
        None => SyscallResult::err(EBADF),
    })
}

/// 0x02: terminate the calling task.
pub extern "C" fn exit(
    arg1: u64,
    _arg2: u64,
    _arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    task::exit_current(arg1 as i32)
}

/// 0x03: open a window; the new layer becomes active and its input is
/// routed to the caller.
pub extern "C" fn open_window(
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    if let Err(e) = check_user_ptr(arg5) {
        return SyscallResult::err(e);
    }
    let title = match unsafe { read_user_str(arg5) } {
        Ok(s) => s,
        Err(e) => return SyscallResult::err(e),
    };

    let opened = layers::with_service(|s| {
        s.open_window(arg1 as u32, arg2 as u32, arg3 as i32, arg4 as i32, title)
    });
    match opened {
        Ok(layer) => {
            layers::activate(layer);
            layers::register_layer_task(layer, task::current_task_id());
            SyscallResult::ok(layer.0 as u64)
        }
        Err(e) => SyscallResult::err(layer_errno(e)),
    }
}

/// 0x04: draw a string into a window.
pub extern "C" fn win_write_string(
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    if let Err(e) = check_user_ptr(arg5) {
        return SyscallResult::err(e);
    }
    let s = match unsafe { read_user_str(arg5) } {
        Ok(s) => s,
        Err(e) => return SyscallResult::err(e),
    };
    with_layer(arg1, |svc, layer| {
        svc.write_string(
            layer,
            arg2 as i32,
            arg3 as i32,
            PixelColor::from_u32(arg4 as u32),
            s,
        )
    })
}

/// 0x05: fill a rectangle in a window.
pub extern "C" fn win_fill_rectangle(
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
    arg6: u64,
) -> SyscallResult {
    with_layer(arg1, |svc, layer| {
        svc.fill_rectangle(
            layer,
            arg2 as i32,
            arg3 as i32,
            arg4 as i32,
            arg5 as i32,
            PixelColor::from_u32(arg6 as u32),
        )
    })
}

/// 0x06: current tick count; the second result slot carries the tick
/// frequency so applications can convert to wall time.
pub extern "C" fn get_current_tick(
    _arg1: u64,
    _arg2: u64,
    _arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    SyscallResult {
        value: timer::current_tick(),
        error: TIMER_FREQ as i32,
    }
}

/// 0x07: redraw a layer without touching its contents.
pub extern "C" fn win_redraw(
    arg1: u64,
    _arg2: u64,
    _arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    with_layer(arg1, |_svc, _layer| Ok(()))
}

/// 0x08: draw a line between two points.
pub extern "C" fn win_draw_line(
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
    arg6: u64,
) -> SyscallResult {
    with_layer(arg1, |svc, layer| {
        svc.draw_line(
            layer,
            arg2 as i32,
            arg3 as i32,
            arg4 as i32,
            arg5 as i32,
            PixelColor::from_u32(arg6 as u32),
        )
    })
}

/// 0x09: close a window by layer id.
pub extern "C" fn close_window(
    arg1: u64,
    _arg2: u64,
    _arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    let layer = LayerId(arg1 as u32);
    match layers::with_service(|s| s.close_layer(layer)) {
        Ok(()) => {
            layers::unregister_layer(layer);
            SyscallResult::ok(0)
        }
        Err(e) => SyscallResult::err(layer_errno(e)),
    }
}

/// Map one kernel message onto an application event, or drop it.
fn translate_event(kind: &MessageKind) -> Option<AppEvent> {
    match *kind {
        MessageKind::KeyPush {
            modifier,
            keycode,
            ascii,
            press,
        } => {
            if keycode == KEYCODE_Q && modifier & (L_CONTROL_BIT | R_CONTROL_BIT) != 0 {
                Some(AppEvent::quit())
            } else {
                Some(AppEvent::key_push(modifier, keycode, ascii, press))
            }
        }
        MessageKind::MouseMove { x, y, dx, dy, buttons } => {
            Some(AppEvent::mouse_move(x, y, dx, dy, buttons))
        }
        MessageKind::MouseButton { x, y, press, button } => {
            Some(AppEvent::mouse_button(x, y, press as i32, button as i32))
        }
        MessageKind::TimerTimeout { timeout, value } => {
            // Application timers were registered with a negated value;
            // restore the sign on the way out. Kernel timers stay inside.
            if value < 0 {
                Some(AppEvent::timer_timeout(timeout, -value))
            } else {
                None
            }
        }
        MessageKind::WindowClose { .. } => Some(AppEvent::quit()),
        ref other => {
            crate::log!(LogLevel::Info, "uncaught event type: {:?}", other);
            None
        }
    }
}

/// 0x0a: block until at least one event is available, then drain without
/// blocking into the caller's buffer.
pub extern "C" fn read_event(
    arg1: u64,
    arg2: u64,
    _arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    if let Err(e) = check_user_ptr(arg1) {
        return SyscallResult::err(e);
    }
    let events = arg1 as *mut AppEvent;
    let len = arg2 as usize;

    let mut i = 0;
    while i < len {
        let msg = if i == 0 {
            // Blocks under the interrupt mask until something arrives
            task::wait_message()
        } else {
            match task::try_receive_message() {
                Some(m) => m,
                None => break,
            }
        };

        if let Some(ev) = translate_event(&msg.kind) {
            unsafe { events.add(i).write(ev) };
            i += 1;
        }
    }

    SyscallResult::ok(i as u64)
}

/// 0x0b: register an application timer. The stored value is negated so
/// the dispatcher can tell application timers from kernel ones.
pub extern "C" fn create_timer(
    arg1: u64,
    arg2: u64,
    arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    let mode = arg1;
    let timer_value = arg2 as i64;
    if timer_value <= 0 || timer_value > i32::MAX as i64 {
        return SyscallResult::err(EINVAL);
    }

    let task_id = task::current_task_id();
    let mut timeout = arg3 * TIMER_FREQ / 1000;
    if mode & corelib::syscalls::TIMER_RELATIVE != 0 {
        timeout += timer::current_tick();
    }
    timer::add_timer(timeout, -(timer_value as i32), task_id);

    SyscallResult::ok(timeout * 1000 / TIMER_FREQ)
}

/// 0x0c: open a file by path. `@stdin` is the conventional name for the
/// caller's descriptor 0.
pub extern "C" fn open_file(
    arg1: u64,
    _arg2: u64,
    _arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    if let Err(e) = check_user_ptr(arg1) {
        return SyscallResult::err(e);
    }
    let path = match unsafe { read_user_str(arg1) } {
        Ok(s) => s,
        Err(e) => return SyscallResult::err(e),
    };

    if path == "@stdin" {
        return SyscallResult::ok(0);
    }

    match files::open(path) {
        Some(file) => {
            let fd = task::with_current_task(|t| t.allocate_fd(file));
            SyscallResult::ok(fd as u64)
        }
        None => SyscallResult::err(ENOENT),
    }
}

/// 0x0d: read from an open descriptor into a user buffer.
pub extern "C" fn read_file(
    arg1: u64,
    arg2: u64,
    arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    let fd = arg1 as usize;
    if let Err(e) = check_user_ptr(arg2) {
        return SyscallResult::err(e);
    }
    let buf = unsafe { core::slice::from_raw_parts_mut(arg2 as *mut u8, arg3 as usize) };

    task::with_current_task(|t| match t.file(fd) {
        Some(f) => SyscallResult::ok(f.read(buf) as u64),
        None => SyscallResult::err(EBADF),
    })
}

/// 0x0e: extend the caller's demand-paging region. To the application
/// this is memory allocation; frames are committed on first touch.
pub extern "C" fn demand_pages(
    arg1: u64,
    _arg2: u64,
    _arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    let num_pages = arg1;
    let Some(bytes) = num_pages.checked_mul(4096) else {
        return SyscallResult::err(EINVAL);
    };

    task::with_current_task(|t| {
        let old_end = t.dpaging_end();
        let Some(new_end) = old_end.checked_add(bytes) else {
            return SyscallResult::err(EINVAL);
        };
        t.set_dpaging_end(new_end);
        SyscallResult::ok(old_end)
    })
}

/// 0x0f: register a lazily populated file mapping; the pages fill in on
/// first fault.
pub extern "C" fn map_file(
    arg1: u64,
    arg2: u64,
    _arg3: u64,
    _arg4: u64,
    _arg5: u64,
    _arg6: u64,
) -> SyscallResult {
    let fd = arg1 as usize;
    if let Err(e) = check_user_ptr(arg2) {
        return SyscallResult::err(e);
    }

    task::with_current_task(|t| {
        let size = match t.file(fd) {
            Some(f) => f.size(),
            None => return SyscallResult::err(EBADF),
        };

        unsafe { (arg2 as *mut usize).write(size) };

        let vaddr_end = t.file_map_end();
        let vaddr_begin = (vaddr_end - size as u64) & !0xFFF;
        t.set_file_map_end(vaddr_begin);
        t.add_file_map(FileMapping {
            fd,
            vaddr_begin,
            vaddr_end,
        });
        SyscallResult::ok(vaddr_begin)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNEL_PTR: u64 = 0x1000;
    const USER_PTR: u64 = 0xFFFF_8000_0000_0000;

    #[test]
    fn test_log_string_rejects_bad_level_first() {
        let r = log_string(0, KERNEL_PTR, 0, 0, 0, 0);
        assert_eq!(r.error, EPERM);
        let r = log_string(5, USER_PTR, 0, 0, 0, 0);
        assert_eq!(r.error, EPERM);
    }

    #[test]
    fn test_log_string_rejects_kernel_pointer() {
        let r = log_string(3, KERNEL_PTR, 0, 0, 0, 0);
        assert_eq!(r.error, EFAULT);
        assert_eq!(r.value, 0);
    }

    #[test]
    fn test_put_string_bounds() {
        let r = put_string(1, USER_PTR, (MAX_STRING_LEN + 1) as u64, 0, 0, 0);
        assert_eq!(r.error, E2BIG);
        let r = put_string(1, KERNEL_PTR, 4, 0, 0, 0);
        assert_eq!(r.error, EFAULT);
    }

    #[test]
    fn test_read_event_rejects_kernel_buffer() {
        let r = read_event(KERNEL_PTR, 16, 0, 0, 0, 0);
        assert_eq!(r.error, EFAULT);
    }

    #[test]
    fn test_create_timer_rejects_nonpositive_value() {
        assert_eq!(create_timer(1, 0, 100, 0, 0, 0).error, EINVAL);
        assert_eq!(create_timer(1, (-5i64) as u64, 100, 0, 0, 0).error, EINVAL);
    }

    #[test]
    fn test_window_syscalls_without_compositor() {
        assert_eq!(win_redraw(7, 0, 0, 0, 0, 0).error, ENOSYS);
        assert_eq!(close_window(7, 0, 0, 0, 0, 0).error, ENOSYS);
        assert_eq!(
            win_fill_rectangle(7, 0, 0, 10, 10, 0xffffff).error,
            ENOSYS
        );
    }

    #[test]
    fn test_translate_event_timer_sign_restoration() {
        // Application timer: stored negative, delivered positive
        let ev = translate_event(&MessageKind::TimerTimeout { timeout: 50, value: -3 })
            .expect("app timer must be delivered");
        assert_eq!(ev.kind, corelib::events::AppEventKind::TimerTimeout);
        let arg = unsafe { ev.arg.timer };
        assert_eq!(arg.timeout, 50);
        assert_eq!(arg.value, 3);

        // Kernel timer: never surfaces to applications
        assert!(translate_event(&MessageKind::TimerTimeout { timeout: 50, value: 3 }).is_none());
    }

    #[test]
    fn test_translate_event_ctrl_q_quits() {
        let ev = translate_event(&MessageKind::KeyPush {
            modifier: L_CONTROL_BIT,
            keycode: KEYCODE_Q,
            ascii: 0,
            press: true,
        })
        .unwrap();
        assert_eq!(ev.kind, corelib::events::AppEventKind::Quit);

        // Plain Q is an ordinary key push
        let ev = translate_event(&MessageKind::KeyPush {
            modifier: 0,
            keycode: KEYCODE_Q,
            ascii: b'q',
            press: true,
        })
        .unwrap();
        assert_eq!(ev.kind, corelib::events::AppEventKind::KeyPush);
    }

    #[test]
    fn test_window_close_translates_to_quit() {
        let ev = translate_event(&MessageKind::WindowClose {
            layer_id: crate::layers::LayerId(1),
        })
        .unwrap();
        assert_eq!(ev.kind, corelib::events::AppEventKind::Quit);
    }
}
