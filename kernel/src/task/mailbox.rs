//! Per-task message mailbox: a fixed-capacity FIFO ring.
//!
//! Overflow is a reportable error at the sender, never silent loss or
//! corruption of what is already queued.

use heapless::Deque;

use crate::message::Message;

/// Messages a mailbox can hold before senders see [`MailboxError::Full`]
pub const MAILBOX_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    Full,
}

pub struct Mailbox {
    queue: Deque<Message, MAILBOX_CAPACITY>,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self { queue: Deque::new() }
    }

    /// Append at the tail. The queue contents are untouched on overflow.
    pub fn push(&mut self, msg: Message) -> Result<(), MailboxError> {
        self.queue.push_back(msg).map_err(|_| MailboxError::Full)
    }

    /// Pop the oldest message, if any. Never blocks.
    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::task::TaskId;

    fn timer_msg(value: i32) -> Message {
        Message::from_kernel(MessageKind::TimerTimeout { timeout: 0, value })
    }

    #[test]
    fn test_fifo_order() {
        let mut mb = Mailbox::new();
        for i in 0..10 {
            mb.push(timer_msg(i)).unwrap();
        }
        for i in 0..10 {
            let msg = mb.pop().unwrap();
            assert_eq!(msg.kind, MessageKind::TimerTimeout { timeout: 0, value: i });
        }
        assert!(mb.pop().is_none());
    }

    #[test]
    fn test_overflow_rejects_and_preserves_contents() {
        let mut mb = Mailbox::new();
        for i in 0..MAILBOX_CAPACITY {
            mb.push(timer_msg(i as i32)).unwrap();
        }
        assert_eq!(mb.push(timer_msg(-1)), Err(MailboxError::Full));
        assert_eq!(mb.len(), MAILBOX_CAPACITY);

        // The queued messages are intact and still in order
        for i in 0..MAILBOX_CAPACITY {
            let msg = mb.pop().unwrap();
            assert_eq!(
                msg.kind,
                MessageKind::TimerTimeout { timeout: 0, value: i as i32 }
            );
        }
    }

    #[test]
    fn test_sender_identity_travels_with_message() {
        let mut mb = Mailbox::new();
        mb.push(Message::new(TaskId(3), MessageKind::LayerFinish)).unwrap();
        assert_eq!(mb.pop().unwrap().src_task, TaskId(3));
    }
}
