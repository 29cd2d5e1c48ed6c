use std::fmt::{self, Debug};

use alot::LotId;
use serde::{Deserialize, Serialize};
use sol_channel::Inbox;
use sol_lang::runtime::value::Value;
use sol_lang::vm::{Fault, Frame, TaskId};

use crate::timer::TimerId;

pub(crate) type Watcher = Box<dyn FnOnce(TaskId, &Exit) + Send>;

pub(crate) struct Task {
    pub id: TaskId,
    pub frame: Option<Box<Frame>>,
    pub parent: Option<LotId>,
    pub refs: usize,
    pub life: Life,
    pub flags: TaskFlags,
    pub wait: Option<TaskWait>,
    pub links: Links,
    pub queue: Option<QueueKind>,
    pub inbox: Inbox,
    pub watchers: Vec<Watcher>,
}

impl Task {
    pub fn new(id: TaskId, frame: Frame, parent: Option<LotId>, inbox: Inbox) -> Self {
        Self {
            id,
            frame: Some(Box::new(frame)),
            parent,
            refs: 1,
            life: Life::Alive,
            flags: TaskFlags::empty(),
            wait: None,
            links: Links::default(),
            queue: None,
            inbox,
            watchers: Vec::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        match (self.life, self.queue) {
            (Life::Zombie, _) => TaskState::Zombie,
            (Life::Alive, Some(QueueKind::Wait)) => TaskState::Waiting,
            (Life::Alive, Some(QueueKind::Run)) if self.frame.is_some() => TaskState::Ready,
            (Life::Alive, Some(QueueKind::Run)) => TaskState::Running,
            (Life::Alive, None) if self.frame.is_some() => TaskState::Created,
            (Life::Alive, None) => TaskState::Running,
        }
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("refs", &self.refs)
            .field("flags", &self.flags)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Life {
    Alive,
    Zombie,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum TaskWait {
    Timer(TimerId),
    Message,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum QueueKind {
    Run,
    Wait,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Links {
    pub next: Option<LotId>,
    pub prev: Option<LotId>,
}

/// The lifecycle state of a task.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    /// The task exists but has not been scheduled.
    Created,
    /// The task is executing.
    Running,
    /// The task is in the run queue.
    Ready,
    /// The task is in the wait queue, blocked on a timer or a message.
    Waiting,
    /// The task has ended, but references to it remain.
    Zombie,
    /// The task has ended and has been freed.
    Destroyed,
}

/// Options that change how a task is managed by its scheduler.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskFlags(u8);

impl TaskFlags {
    /// When a child of this task ends, a message is delivered to this task
    /// describing how it ended.
    ///
    /// The message's sender is the child, and its value is `0` if the child
    /// returned or `1` if it faulted. A descendant ended because its own
    /// parent had ended reports `2` to its nearest living ancestor.
    pub const TRAP_EXIT: Self = Self(1);

    /// Returns flags with nothing set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true if every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TaskFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for TaskFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit {
    /// The task's entry function returned these values.
    Returned(Vec<Value>),
    /// The task faulted.
    Faulted(Fault),
    /// The task was ended because its parent ended first.
    Orphaned,
}

impl Exit {
    /// Returns the value delivered to parents that trap exits.
    #[must_use]
    pub fn code(&self) -> Value {
        Value::Number(match self {
            Exit::Returned(_) => 0.,
            Exit::Faulted(_) => 1.,
            Exit::Orphaned => 2.,
        })
    }
}
