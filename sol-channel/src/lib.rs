//! Lock-free task inboxes.
//!
//! [`inbox()`] creates the two halves of a task's message queue: a
//! [`Mailbox`] that any number of threads can send through, and the single
//! [`Inbox`] the owning task receives from. Sending never blocks and never
//! takes a lock.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::task::{Wake, Waker};
//!
//! use sol_channel::inbox;
//! use sol_lang::runtime::value::Value;
//!
//! struct Ignore;
//!
//! impl Wake for Ignore {
//!     fn wake(self: Arc<Self>) {}
//! }
//!
//! let (mailbox, mut inbox) = inbox(Waker::from(Arc::new(Ignore)));
//! mailbox.send(Value::Number(1.), None);
//! assert_eq!(inbox.try_recv().unwrap().value, Value::Number(1.));
//! assert!(inbox.try_recv().is_none());
//! ```

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::task::Waker;

use sol_lang::runtime::value::Value;
use sol_lang::vm::TaskId;

use crate::queue::MessageQueue;

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

mod queue;

/// A value delivered to a task's inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The value that was sent.
    pub value: Value,
    /// The task that sent the message, or `None` if the embedder sent it.
    pub sender: Option<TaskId>,
}

/// Returns a new, empty inbox.
///
/// `waker` is invoked each time a message is sent to an empty inbox.
#[must_use]
pub fn inbox(waker: Waker) -> (Mailbox, Inbox) {
    let data = Arc::new(InboxData {
        queue: MessageQueue::new(),
        waker,
    });
    (Mailbox { data: data.clone() }, Inbox { data })
}

struct InboxData {
    queue: MessageQueue,
    waker: Waker,
}

/// The sending half of an inbox.
#[derive(Clone)]
pub struct Mailbox {
    data: Arc<InboxData>,
}

impl Mailbox {
    /// Delivers `value` to this mailbox's inbox.
    pub fn send(&self, value: Value, sender: Option<TaskId>) {
        if self.data.queue.enqueue(Message { value, sender }) {
            trace!(?sender, "waking empty inbox");
            self.data.waker.wake_by_ref();
        }
    }

    /// Returns true if both mailboxes deliver to the same inbox.
    #[must_use]
    pub fn same_inbox(&self, other: &Mailbox) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("inbox", &Arc::as_ptr(&self.data))
            .finish()
    }
}

/// The receiving half of an inbox.
///
/// There is exactly one `Inbox` per queue, and receiving requires exclusive
/// access to it.
pub struct Inbox {
    data: Arc<InboxData>,
}

#[allow(unsafe_code)]
impl Inbox {
    /// Removes the oldest available message.
    ///
    /// Returns `None` without blocking if no message is available, including
    /// when a sender is part way through delivering one.
    pub fn try_recv(&mut self) -> Option<Message> {
        // SAFETY: `Inbox` is the only consumer of the queue, and `&mut self`
        // prevents concurrent calls.
        unsafe { self.data.queue.dequeue() }
    }

    /// Returns true if no messages are waiting to be received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        // SAFETY: Only the `Inbox` reads the consumer side of the queue, and
        // `try_recv` cannot run while this shared borrow exists.
        unsafe { self.data.queue.is_empty() }
    }

    /// Returns a new mailbox that delivers to this inbox.
    #[must_use]
    pub fn mailbox(&self) -> Mailbox {
        Mailbox {
            data: self.data.clone(),
        }
    }
}

impl Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("inbox", &Arc::as_ptr(&self.data))
            .field("empty", &self.is_empty())
            .finish()
    }
}
