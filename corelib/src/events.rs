//! Application events delivered by the `read_event` syscall.
//!
//! The kernel translates its internal messages into these fixed-shape
//! structures and writes them into a buffer the application provides. The
//! layout is `repr(C)` so the same definition serves both sides of the
//! boundary.

/// Discriminant for [`AppEvent`]
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEventKind {
    /// The application should terminate (window closed or Ctrl-Q)
    Quit = 0,
    /// The mouse moved over the application's window
    MouseMove = 1,
    /// A mouse button was pressed or released
    MouseButton = 2,
    /// A timer created via `create_timer` expired
    TimerTimeout = 3,
    /// A key was pressed or released
    KeyPush = 4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MouseMoveArg {
    pub x: i32,
    pub y: i32,
    pub dx: i32,
    pub dy: i32,
    pub buttons: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MouseButtonArg {
    pub x: i32,
    pub y: i32,
    pub press: i32,
    pub button: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TimerTimeoutArg {
    /// Absolute tick at which the timer expired
    pub timeout: u64,
    /// The (positive) value passed to `create_timer`
    pub value: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KeyPushArg {
    pub modifier: u8,
    pub keycode: u8,
    pub ascii: u8,
    pub press: bool,
}

/// Payload of an [`AppEvent`]; which field is valid depends on the kind
#[repr(C)]
#[derive(Clone, Copy)]
pub union AppEventArg {
    pub mouse_move: MouseMoveArg,
    pub mouse_button: MouseButtonArg,
    pub timer: TimerTimeoutArg,
    pub keypush: KeyPushArg,
}

/// One event as seen by an application
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AppEvent {
    pub kind: AppEventKind,
    pub arg: AppEventArg,
}

impl AppEvent {
    pub const fn quit() -> Self {
        Self {
            kind: AppEventKind::Quit,
            // Any field initializes the union; timer is the widest
            arg: AppEventArg {
                timer: TimerTimeoutArg { timeout: 0, value: 0 },
            },
        }
    }

    pub const fn key_push(modifier: u8, keycode: u8, ascii: u8, press: bool) -> Self {
        Self {
            kind: AppEventKind::KeyPush,
            arg: AppEventArg {
                keypush: KeyPushArg {
                    modifier,
                    keycode,
                    ascii,
                    press,
                },
            },
        }
    }

    pub const fn timer_timeout(timeout: u64, value: i32) -> Self {
        Self {
            kind: AppEventKind::TimerTimeout,
            arg: AppEventArg {
                timer: TimerTimeoutArg { timeout, value },
            },
        }
    }

    pub const fn mouse_move(x: i32, y: i32, dx: i32, dy: i32, buttons: u8) -> Self {
        Self {
            kind: AppEventKind::MouseMove,
            arg: AppEventArg {
                mouse_move: MouseMoveArg { x, y, dx, dy, buttons },
            },
        }
    }

    pub const fn mouse_button(x: i32, y: i32, press: i32, button: i32) -> Self {
        Self {
            kind: AppEventKind::MouseButton,
            arg: AppEventArg {
                mouse_button: MouseButtonArg { x, y, press, button },
            },
        }
    }
}
