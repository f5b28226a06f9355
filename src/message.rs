//! Bus messages and the queue that buffers them between reception and consumption.

use std::{
    collections::VecDeque,
    fmt::{Display, Formatter},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// One complete unit received from or sent to the bus.
///
/// The contents are opaque to this crate; interpreting them
/// (headers, modes, payloads) is left to higher layers.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Message(Box<[u8]>);

impl Message {
    /// Returns the message bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the message length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the message has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the message and returns its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self(data.into_boxed_slice())
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Self(data.into())
    }
}

impl<const N: usize> From<[u8; N]> for Message {
    fn from(data: [u8; N]) -> Self {
        Self(Box::new(data))
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }

            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

/// First-in, first-out queue of received messages.
///
/// Cloning the queue yields another handle to the same messages, so a
/// producer running on a different task or thread can enqueue while the
/// owning device dequeues. All operations lock the whole queue.
#[derive(Clone, Default, Debug)]
pub struct MessageQueue(Arc<Mutex<VecDeque<Message>>>);

impl MessageQueue {
    /// Constructs an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to the tail of the queue.
    pub fn enqueue(&self, msg: Message) {
        self.lock().push_back(msg);
    }

    /// Removes and returns the oldest message, if any.
    #[must_use]
    pub fn dequeue(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    /// Removes all messages.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns the number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether the queue holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        // The deque is never left half-modified, so a poisoned lock is still usable
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
