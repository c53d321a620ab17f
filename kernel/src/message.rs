//! Messages - the unit of communication between interrupt handlers, the
//! kernel's own services and tasks.
//!
//! A message is created by its producer, enqueued on exactly one task's
//! mailbox and consumed exactly once by that task. Payloads are small and
//! fixed-shape so the whole value is `Copy` and mailboxes can be
//! fixed-capacity rings.

use crate::layers::{LayerId, LayerOperation};
use crate::task::TaskId;

/// A message together with its sender
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Message {
    /// Task that produced the message; [`Message::KERNEL_SRC`] for
    /// interrupt handlers and kernel services
    pub src_task: TaskId,
    pub kind: MessageKind,
}

impl Message {
    /// Pseudo-sender for messages originating inside the kernel
    pub const KERNEL_SRC: TaskId = TaskId(0);

    pub const fn from_kernel(kind: MessageKind) -> Self {
        Self {
            src_task: Self::KERNEL_SRC,
            kind,
        }
    }

    pub const fn new(src_task: TaskId, kind: MessageKind) -> Self {
        Self { src_task, kind }
    }
}

/// The type and payload of a message
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageKind {
    /// The device (xHCI) interrupt fired; the driver should drain its
    /// event ring
    DeviceInterrupt,

    /// A timer registered with the timer queue expired
    TimerTimeout {
        /// Absolute tick deadline the timer was registered for
        timeout: u64,
        /// Opaque signed value; negative values are application timers
        /// (see the timer module for the sign convention)
        value: i32,
    },

    /// A key was pressed or released
    KeyPush {
        modifier: u8,
        keycode: u8,
        ascii: u8,
        press: bool,
    },

    /// The mouse moved
    MouseMove {
        x: i32,
        y: i32,
        dx: i32,
        dy: i32,
        buttons: u8,
    },

    /// A mouse button changed state
    MouseButton {
        x: i32,
        y: i32,
        press: bool,
        button: u8,
    },

    /// Request to the main task to apply a layer operation on the
    /// compositor; answered with [`MessageKind::LayerFinish`]
    Layer {
        op: LayerOperation,
        layer_id: LayerId,
    },

    /// A previously requested layer operation completed
    LayerFinish,

    /// The window belonging to a layer was closed
    WindowClose { layer_id: LayerId },
}
