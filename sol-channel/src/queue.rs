//! An intrusive, lock-free, multi-producer single-consumer queue.
//!
//! The queue always contains a stub node that never carries a message.
//! Producers publish with a single atomic swap of `head`, consumers walk from
//! `tail`. A producer that has swapped `head` but not yet linked its
//! predecessor leaves a gap that the consumer reports as empty rather than
//! waiting on.
#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::Message;

struct Node {
    next: AtomicPtr<Node>,
    message: Option<Message>,
}

impl Node {
    fn allocate(message: Option<Message>) -> *mut Node {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            message,
        }))
    }
}

pub struct MessageQueue {
    head: CachePadded<AtomicPtr<Node>>,
    tail: UnsafeCell<*mut Node>,
    stub: *mut Node,
}

// SAFETY: Nodes are only reachable through the queue. `enqueue` only touches
// `head` atomically and the `next` pointer of the node it swapped out, which no
// other producer can observe. `tail` is only accessed by `dequeue`, whose
// callers guarantee a single consumer.
unsafe impl Send for MessageQueue {}
// SAFETY: See above.
unsafe impl Sync for MessageQueue {}

impl MessageQueue {
    pub fn new() -> Self {
        let stub = Node::allocate(None);
        Self {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: UnsafeCell::new(stub),
            stub,
        }
    }

    /// Pushes `message` onto the queue, returning true if the queue was
    /// empty before the push.
    pub fn enqueue(&self, message: Message) -> bool {
        self.push(Node::allocate(Some(message)))
    }

    fn push(&self, node: *mut Node) -> bool {
        // SAFETY: `node` is a live allocation owned by this queue.
        unsafe { (*node).next.store(ptr::null_mut(), Ordering::Relaxed) };
        let previous = self.head.swap(node, Ordering::AcqRel);
        // SAFETY: `previous` cannot be freed until the consumer has observed
        // its `next` pointer, which is only set here.
        unsafe { (*previous).next.store(node, Ordering::Release) };
        previous == self.stub
    }

    /// Removes the oldest message from the queue.
    ///
    /// Returns `None` if the queue is empty or if a producer is in the middle
    /// of publishing the next message.
    ///
    /// # Safety
    ///
    /// Only one thread may call `dequeue` or `is_empty` at any given time.
    pub unsafe fn dequeue(&self) -> Option<Message> {
        let tail_slot = self.tail.get();
        let mut tail = *tail_slot;
        let mut next = (*tail).next.load(Ordering::Acquire);

        if tail == self.stub {
            if next.is_null() {
                return None;
            }
            // Skip past the stub.
            *tail_slot = next;
            tail = next;
            next = (*next).next.load(Ordering::Acquire);
        }

        if !next.is_null() {
            *tail_slot = next;
            return Self::take(tail);
        }

        let head = self.head.load(Ordering::Acquire);
        if tail != head {
            // A producer has swapped `head` but has not linked its node yet.
            return None;
        }

        // `tail` is the last node. Push the stub behind it so that `tail` can
        // be released without racing producers.
        self.push(self.stub);
        next = (*tail).next.load(Ordering::Acquire);
        if next.is_null() {
            return None;
        }

        *tail_slot = next;
        Self::take(tail)
    }

    unsafe fn take(node: *mut Node) -> Option<Message> {
        let node = Box::from_raw(node);
        node.message
    }

    /// Returns true if no messages are currently published.
    ///
    /// # Safety
    ///
    /// Only the consumer may call this function.
    pub unsafe fn is_empty(&self) -> bool {
        let tail = *self.tail.get();
        tail == self.stub
            && (*tail).next.load(Ordering::Acquire).is_null()
            && self.head.load(Ordering::Acquire) == self.stub
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        let mut node = *self.tail.get_mut();
        while !node.is_null() {
            // SAFETY: `drop` has exclusive access and every node reachable
            // from `tail` is owned by the queue.
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if node != self.stub {
                // SAFETY: See above.
                drop(unsafe { Box::from_raw(node) });
            }
            node = next;
        }
        // SAFETY: The stub is allocated in `new` and only freed here.
        drop(unsafe { Box::from_raw(self.stub) });
    }
}
