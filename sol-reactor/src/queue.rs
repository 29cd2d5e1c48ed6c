use alot::{LotId, Lots};

use crate::task::{QueueKind, Task};

/// A doubly-linked list of tasks, threaded through [`Task::links`].
#[derive(Debug)]
pub(crate) struct TaskQueue {
    kind: QueueKind,
    head: Option<LotId>,
    tail: Option<LotId>,
    len: usize,
}

impl TaskQueue {
    pub const fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub const fn head(&self) -> Option<LotId> {
        self.head
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_tail(&mut self, tasks: &mut Lots<Task>, id: LotId) {
        let task = &mut tasks[id];
        assert!(
            task.queue.is_none(),
            "task {} is already enqueued in the {:?} queue",
            task.id,
            task.queue
        );
        task.queue = Some(self.kind);
        task.links.prev = self.tail;
        task.links.next = None;

        match self.tail {
            Some(tail) => tasks[tail].links.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub fn remove(&mut self, tasks: &mut Lots<Task>, id: LotId) {
        let task = &mut tasks[id];
        assert_eq!(task.queue, Some(self.kind), "task is not in this queue");
        task.queue = None;
        let links = std::mem::take(&mut task.links);

        match links.prev {
            Some(prev) => tasks[prev].links.next = links.next,
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => tasks[next].links.prev = links.prev,
            None => self.tail = links.prev,
        }
        self.len -= 1;
    }

    /// Moves the head of the queue to its tail.
    pub fn rotate(&mut self, tasks: &mut Lots<Task>) {
        if let Some(head) = self.head {
            if self.len > 1 {
                self.remove(tasks, head);
                self.push_tail(tasks, head);
            }
        }
    }

    pub fn iter<'a>(&self, tasks: &'a Lots<Task>) -> impl Iterator<Item = LotId> + 'a {
        let mut next = self.head;
        std::iter::from_fn(move || {
            let current = next?;
            next = tasks[current].links.next;
            Some(current)
        })
    }
}
