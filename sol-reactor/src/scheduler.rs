//! A single-threaded cooperative task scheduler.

use std::fmt::{self, Debug, Write};
use std::mem;
use std::sync::Arc;
use std::task::{Wake, Waker};

use alot::{LotId, Lots};
use crossbeam_utils::sync::{Parker, Unparker};
use kempt::{Map, Set};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sol_channel::{inbox, Inbox, Mailbox};
use sol_lang::runtime::value::{Hook, Value};
use sol_lang::vm::{
    self, Frame, Function, HookContext, Host, Status, TaskId, Wait, DEFAULT_EXEC_LIMIT,
};

use crate::queue::TaskQueue;
use crate::task::{Exit, Life, QueueKind, Task, TaskFlags, TaskState, TaskWait};
use crate::timer::{TimerFacility, TimerId, TimerQueue};

/// Settings for a [`Scheduler`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SchedulerConfig {
    /// The number of instructions a task may execute before it is forced to
    /// yield. 0 disables the limit.
    pub exec_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerConfig {
    /// Returns the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exec_limit: DEFAULT_EXEC_LIMIT,
        }
    }

    /// Sets the number of instructions a task may execute each turn.
    #[must_use]
    pub const fn with_exec_limit(mut self, exec_limit: usize) -> Self {
        self.exec_limit = exec_limit;
        self
    }
}

/// The result of [`Scheduler::tick`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Tick {
    /// Tasks are ready to run.
    Busy,
    /// No tasks are ready, but some are waiting on timers or messages.
    Waiting,
    /// No tasks are ready or waiting.
    Idle,
}

struct WokenTasks {
    tasks: Mutex<Set<TaskId>>,
    unparker: Unparker,
}

struct TaskWaker {
    task: TaskId,
    woken: Arc<WokenTasks>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.woken.tasks.lock().insert(self.task) {
            self.woken.unparker.unpark();
        }
    }
}

/// Creates wakers that resume tasks in a [`Scheduler`] from any thread.
#[derive(Clone)]
pub struct WakeHandle(Arc<WokenTasks>);

impl Debug for WakeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeHandle")
            .field("woken", &self.0.tasks.lock().len())
            .finish()
    }
}

impl WakeHandle {
    /// Returns a waker that resumes `task` if it is waiting for a message.
    #[must_use]
    pub fn waker(&self, task: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            task,
            woken: self.0.clone(),
        }))
    }

    /// Wakes the scheduler's thread if it is parked.
    pub fn unpark(&self) {
        self.0.unparker.unpark();
    }
}

/// Runs many tasks cooperatively on the current thread.
///
/// Tasks in the run queue are executed in order, each for at most
/// [`SchedulerConfig::exec_limit`] instructions per turn. Tasks that suspend
/// move to the wait queue until their timer fires or a message arrives.
///
/// When a task ends while other tasks still reference it, it becomes a
/// zombie. Any task whose parent is a zombie is ended the next time the
/// scheduler encounters it in either queue.
pub struct Scheduler<Timers = TimerQueue> {
    tasks: Lots<Task>,
    registered: Map<TaskId, LotId>,
    run_queue: TaskQueue,
    wait_queue: TaskQueue,
    timers: Timers,
    config: SchedulerConfig,
    woken: Arc<WokenTasks>,
    parker: Parker,
    pending_deaths: bool,
}

impl Default for Scheduler<TimerQueue> {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler<TimerQueue> {
    /// Returns a scheduler with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Returns a scheduler using `config`.
    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::with_timers(TimerQueue::new(), config)
    }
}

impl<Timers> Scheduler<Timers>
where
    Timers: TimerFacility,
{
    /// Returns a scheduler that waits on `timers`.
    pub fn with_timers(timers: Timers, config: SchedulerConfig) -> Self {
        let parker = Parker::new();
        Self {
            tasks: Lots::new(),
            registered: Map::new(),
            run_queue: TaskQueue::new(QueueKind::Run),
            wait_queue: TaskQueue::new(QueueKind::Wait),
            timers,
            config,
            woken: Arc::new(WokenTasks {
                tasks: Mutex::default(),
                unparker: parker.unparker().clone(),
            }),
            parker,
            pending_deaths: false,
        }
    }

    /// Returns this scheduler's configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns a handle for waking this scheduler's tasks.
    #[must_use]
    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle(self.woken.clone())
    }

    /// Returns the unparker for the thread blocked in [`Self::wait`] or
    /// [`Self::park`].
    #[must_use]
    pub fn unparker(&self) -> &Unparker {
        self.parker.unparker()
    }

    /// Creates a task that executes `function`. The task does not run until
    /// it is passed to [`Self::schedule`].
    ///
    /// If `parent` is provided, the new task holds a reference to it and is
    /// ended if the parent ends first.
    pub fn create_task(&mut self, function: Arc<Function>, parent: Option<TaskId>) -> TaskId {
        let id = TaskId::next();
        let (_mailbox, inbox) = inbox(self.wake_handle().waker(id));
        self.insert_task(id, function, parent, inbox);
        id
    }

    /// Creates and schedules a task that executes `function`.
    pub fn spawn(&mut self, function: Arc<Function>, parent: Option<TaskId>) -> TaskId {
        let id = self.create_task(function, parent);
        self.schedule(id);
        id
    }

    /// Inserts a task with an existing id and inbox. The inbox's waker should
    /// come from this scheduler's [`WakeHandle`].
    ///
    /// # Panics
    ///
    /// Panics if `id` is already in use or `parent` has been destroyed.
    pub fn insert_task(
        &mut self,
        id: TaskId,
        function: Arc<Function>,
        parent: Option<TaskId>,
        inbox: Inbox,
    ) {
        assert!(
            self.registered.get(&id).is_none(),
            "task {id} already exists"
        );
        let parent = parent.map(|parent| self.lot(parent));
        self.insert(id, Frame::new(function), parent, inbox);
    }

    fn insert(&mut self, id: TaskId, frame: Frame, parent: Option<LotId>, inbox: Inbox) -> LotId {
        if let Some(parent) = parent {
            self.tasks[parent].refs += 1;
        }
        let lot = self.tasks.push(Task::new(id, frame, parent, inbox));
        self.registered.insert(id, lot);
        debug!(task = %id, "created");
        lot
    }

    fn spawn_child(&mut self, function: Arc<Function>, parent: LotId) -> TaskId {
        let id = TaskId::next();
        let (_mailbox, inbox) = inbox(self.wake_handle().waker(id));
        let lot = self.insert(id, Frame::new(function), Some(parent), inbox);
        self.run_queue.push_tail(&mut self.tasks, lot);
        id
    }

    fn lot(&self, id: TaskId) -> LotId {
        match self.registered.get(&id) {
            Some(lot) => *lot,
            None => panic!("task {id} has been destroyed"),
        }
    }

    /// Appends `task` to the end of the run queue.
    ///
    /// # Panics
    ///
    /// Panics if the task is already enqueued, has ended, or has been
    /// destroyed.
    pub fn schedule(&mut self, task: TaskId) {
        let lot = self.lot(task);
        assert_eq!(
            self.tasks[lot].life,
            Life::Alive,
            "task {task} has already ended"
        );
        self.run_queue.push_tail(&mut self.tasks, lot);
    }

    /// Sets the flags for `task`.
    pub fn set_flags(&mut self, task: TaskId, flags: TaskFlags) {
        let lot = self.lot(task);
        self.tasks[lot].flags = flags;
    }

    /// Adds a reference to `task`, preventing it from being destroyed when it
    /// ends until [`Self::release`] is called.
    pub fn retain(&mut self, task: TaskId) {
        let lot = self.lot(task);
        self.tasks[lot].refs += 1;
    }

    /// Releases a reference acquired with [`Self::retain`].
    ///
    /// # Panics
    ///
    /// Panics if this would release a running task's own reference.
    pub fn release(&mut self, task: TaskId) {
        let lot = self.lot(task);
        let task = &self.tasks[lot];
        assert!(
            task.life == Life::Zombie || task.refs > 1,
            "task {} was released more times than it was retained",
            task.id
        );
        self.release_lot(lot);
    }

    fn release_lot(&mut self, lot: LotId) {
        let mut next = Some(lot);
        while let Some(lot) = next.take() {
            let task = &mut self.tasks[lot];
            task.refs = task
                .refs
                .checked_sub(1)
                .unwrap_or_else(|| unreachable!("task reference count underflow"));
            if task.refs > 0 {
                continue;
            }

            let Some(task) = self.tasks.remove(lot) else {
                unreachable!("task was just accessed")
            };
            debug_assert!(task.queue.is_none());
            self.registered.remove(&task.id);
            debug!(task = %task.id, "destroyed");
            next = task.parent;
        }
    }

    /// Registers `watcher` to be invoked when `task` ends. Returns false if
    /// the task has already ended.
    pub fn watch<F>(&mut self, task: TaskId, watcher: F) -> bool
    where
        F: FnOnce(TaskId, &Exit) + Send + 'static,
    {
        let Some(task) = self
            .registered
            .get(&task)
            .and_then(|lot| self.tasks.get_mut(*lot))
        else {
            return false;
        };
        if task.life == Life::Zombie {
            return false;
        }
        task.watchers.push(Box::new(watcher));
        true
    }

    /// Returns a mailbox that delivers to `task`'s inbox.
    #[must_use]
    pub fn mailbox(&self, task: TaskId) -> Option<Mailbox> {
        self.registered
            .get(&task)
            .and_then(|lot| self.tasks.get(*lot))
            .map(|task| task.inbox.mailbox())
    }

    /// Sends `value` to `task`. Returns false if the task has been destroyed.
    pub fn send(&self, task: TaskId, value: Value, sender: Option<TaskId>) -> bool {
        if let Some(mailbox) = self.mailbox(task) {
            mailbox.send(value, sender);
            true
        } else {
            false
        }
    }

    /// Returns the current state of `task`.
    #[must_use]
    pub fn state(&self, task: TaskId) -> TaskState {
        self.registered
            .get(&task)
            .and_then(|lot| self.tasks.get(*lot))
            .map_or(TaskState::Destroyed, Task::state)
    }

    /// Returns the top activation record of `task`, if it has not ended.
    #[must_use]
    pub fn frame(&self, task: TaskId) -> Option<&Frame> {
        self.registered
            .get(&task)
            .and_then(|lot| self.tasks.get(*lot))
            .and_then(|task| task.frame.as_deref())
    }

    /// Returns the number of references held to `task`.
    #[must_use]
    pub fn references(&self, task: TaskId) -> usize {
        self.registered
            .get(&task)
            .and_then(|lot| self.tasks.get(*lot))
            .map_or(0, |task| task.refs)
    }

    /// Returns the number of tasks that have not been destroyed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    /// Returns true if there are no tasks that have not been destroyed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Returns the ids of the tasks in the run queue, in order.
    #[must_use]
    pub fn run_queue(&self) -> Vec<TaskId> {
        self.queued(&self.run_queue)
    }

    /// Returns the ids of the tasks in the wait queue, in order.
    #[must_use]
    pub fn wait_queue(&self) -> Vec<TaskId> {
        self.queued(&self.wait_queue)
    }

    fn queued(&self, queue: &TaskQueue) -> Vec<TaskId> {
        queue
            .iter(&self.tasks)
            .map(|lot| self.tasks[lot].id)
            .collect()
    }

    /// Returns true if no tasks are ready or waiting, and no timers are
    /// pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.run_queue.is_empty() && self.wait_queue.is_empty() && !self.timers.has_pending()
    }

    /// Renders the contents of both queues for debugging.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (name, queue) in [("run", &self.run_queue), ("wait", &self.wait_queue)] {
            let _ = writeln!(out, "{name} queue ({}):", queue.len());
            for lot in queue.iter(&self.tasks) {
                let task = &self.tasks[lot];
                let _ = write!(
                    out,
                    "  {} {:?} refs={}",
                    task.id,
                    task.state(),
                    task.refs
                );
                if let Some(parent) = task.parent {
                    let _ = write!(out, " parent={}", self.tasks[parent].id);
                }
                if let Some(wait) = task.wait {
                    let _ = write!(out, " wait={wait:?}");
                }
                if let Some(frame) = &task.frame {
                    let _ = write!(out, " pc={} depth={}", frame.pc(), frame.depth());
                }
                out.push('\n');
            }
        }
        out
    }

    /// Runs tasks until no tasks remain ready or waiting.
    ///
    /// While only waiting tasks remain, the current thread blocks until a
    /// timer fires or a message is delivered.
    pub fn run(&mut self) {
        loop {
            match self.tick() {
                Tick::Busy => {}
                Tick::Waiting => self.wait(),
                Tick::Idle => break,
            }
        }
    }

    /// Resumes woken tasks, then runs each task that is ready for one turn.
    pub fn tick(&mut self) -> Tick {
        self.wake_woken();
        self.poll_timers();

        for _ in 0..self.run_queue.len() {
            if !self.step() {
                break;
            }
        }

        if !self.run_queue.is_empty() {
            Tick::Busy
        } else if !self.wait_queue.is_empty() || self.timers.has_pending() {
            Tick::Waiting
        } else {
            Tick::Idle
        }
    }

    /// Blocks until a timer is due or a task is woken, then moves the tasks
    /// whose timers fired into the run queue.
    pub fn wait(&mut self) {
        if self.timers.has_pending() {
            let mut fired = Vec::new();
            self.timers
                .wait(&self.parker, &mut |timer, task| fired.push((timer, task)));
            self.timers_fired(fired);
        } else {
            self.parker.park();
        }
    }

    /// Blocks the current thread until this scheduler is unparked.
    pub fn park(&self) {
        self.parker.park();
    }

    fn poll_timers(&mut self) {
        let mut fired = Vec::new();
        self.timers.poll(&mut |timer, task| fired.push((timer, task)));
        self.timers_fired(fired);
    }

    fn timers_fired(&mut self, fired: Vec<(TimerId, TaskId)>) {
        for (timer, task) in fired {
            let Some(lot) = self.registered.get(&task).copied() else {
                continue;
            };
            if self.tasks[lot].wait == Some(TaskWait::Timer(timer)) {
                self.resume(lot);
            }
        }
    }

    fn wake_woken(&mut self) {
        let woken = mem::take(&mut *self.woken.tasks.lock());
        for task in woken.iter().copied() {
            let Some(lot) = self.registered.get(&task).copied() else {
                continue;
            };
            if self.tasks[lot].wait == Some(TaskWait::Message) {
                self.resume(lot);
            }
        }
    }

    fn resume(&mut self, lot: LotId) {
        trace!(task = %self.tasks[lot].id, "resuming");
        self.wait_queue.remove(&mut self.tasks, lot);
        self.tasks[lot].wait = None;
        self.run_queue.push_tail(&mut self.tasks, lot);
    }

    /// Runs the task at the head of the run queue for one turn. Returns false
    /// if the run queue is empty.
    pub fn step(&mut self) -> bool {
        let Some(lot) = self.run_queue.head() else {
            return false;
        };

        if self.parent_is_zombie(lot) {
            self.end_task(lot, Exit::Orphaned);
            self.sweep_orphans();
            return true;
        }

        let task = &mut self.tasks[lot];
        let Some(mut frame) = task.frame.take() else {
            unreachable!("scheduled task {} has no frame", task.id)
        };
        let id = task.id;
        trace!(task = %id, "running");
        let exec_limit = self.config.exec_limit;
        let status = vm::execute(
            &mut frame,
            &mut Running {
                scheduler: self,
                task: lot,
            },
            exec_limit,
        );

        match status {
            Status::Yield => {
                self.tasks[lot].frame = Some(frame);
                self.requeue(lot);
            }
            Status::Suspend(Wait::Timer(after)) => {
                self.tasks[lot].frame = Some(frame);
                let timer = self.timers.start_timer(after, None, id);
                self.suspend(lot, TaskWait::Timer(timer));
            }
            Status::Suspend(Wait::Message) => {
                self.tasks[lot].frame = Some(frame);
                if self.tasks[lot].inbox.is_empty() {
                    self.suspend(lot, TaskWait::Message);
                } else {
                    // A message arrived after the task checked its inbox.
                    self.requeue(lot);
                }
            }
            Status::End(values) => {
                debug!(task = %id, "ended");
                self.end_task(lot, Exit::Returned(values));
                self.sweep_orphans();
            }
            Status::Error(fault) => {
                warn!(task = %id, %fault, "task faulted");
                self.end_task(lot, Exit::Faulted(fault));
                self.sweep_orphans();
            }
        }
        true
    }

    fn requeue(&mut self, lot: LotId) {
        if self.run_queue.head() == Some(lot) {
            self.run_queue.rotate(&mut self.tasks);
        } else {
            self.run_queue.remove(&mut self.tasks, lot);
            self.run_queue.push_tail(&mut self.tasks, lot);
        }
    }

    fn suspend(&mut self, lot: LotId, wait: TaskWait) {
        trace!(task = %self.tasks[lot].id, ?wait, "suspending");
        self.run_queue.remove(&mut self.tasks, lot);
        self.tasks[lot].wait = Some(wait);
        self.wait_queue.push_tail(&mut self.tasks, lot);
    }

    fn parent_is_zombie(&self, lot: LotId) -> bool {
        self.tasks[lot]
            .parent
            .is_some_and(|parent| self.tasks[parent].life == Life::Zombie)
    }

    fn nearest_living(&self, mut lot: Option<LotId>) -> Option<&Task> {
        while let Some(current) = lot {
            let task = &self.tasks[current];
            match task.life {
                Life::Alive => return Some(task),
                Life::Zombie => lot = task.parent,
            }
        }
        None
    }

    fn end_task(&mut self, lot: LotId, exit: Exit) {
        let queue = self.tasks[lot].queue;
        match queue {
            Some(QueueKind::Run) => self.run_queue.remove(&mut self.tasks, lot),
            Some(QueueKind::Wait) => self.wait_queue.remove(&mut self.tasks, lot),
            None => {}
        }

        let task = &mut self.tasks[lot];
        if let Some(TaskWait::Timer(timer)) = task.wait.take() {
            self.timers.cancel_timer(timer);
        }
        task.frame = None;
        task.life = Life::Zombie;
        let id = task.id;
        let parent = task.parent;
        // References beyond the task's own mean children may now be orphans.
        if task.refs > 1 {
            self.pending_deaths = true;
        }
        debug!(task = %id, ?exit, "ending");

        for watcher in mem::take(&mut task.watchers) {
            watcher(id, &exit);
        }

        // Orphans report to the nearest ancestor that is still alive.
        if let Some(ancestor) = self.nearest_living(parent) {
            if ancestor.flags.contains(TaskFlags::TRAP_EXIT) {
                ancestor.inbox.mailbox().send(exit.code(), Some(id));
            }
        }

        self.release_lot(lot);
    }

    /// Ends every queued task whose parent is a zombie, repeating until a
    /// full pass over both queues ends nothing.
    fn sweep_orphans(&mut self) {
        if !mem::take(&mut self.pending_deaths) {
            return;
        }

        loop {
            let mut ended = false;
            let queued = self
                .wait_queue
                .iter(&self.tasks)
                .chain(self.run_queue.iter(&self.tasks))
                .collect::<Vec<_>>();
            for lot in queued {
                let still_queued = self.tasks.get(lot).is_some_and(|task| task.queue.is_some());
                if still_queued && self.parent_is_zombie(lot) {
                    self.end_task(lot, Exit::Orphaned);
                    ended = true;
                }
            }
            self.pending_deaths = false;
            if !ended {
                break;
            }
        }
    }
}

struct Running<'a, Timers> {
    scheduler: &'a mut Scheduler<Timers>,
    task: LotId,
}

impl<Timers> Host for Running<'_, Timers>
where
    Timers: TimerFacility,
{
    fn spawn(&mut self, function: Arc<Function>) -> TaskId {
        let child = self.scheduler.spawn_child(function, self.task);
        trace!(parent = %self.scheduler.tasks[self.task].id, %child, "spawned");
        child
    }

    fn receive(&mut self) -> Option<Value> {
        self.scheduler.tasks[self.task]
            .inbox
            .try_recv()
            .map(|message| message.value)
    }

    fn hook(&mut self, hook: &Hook, frame: &Frame) {
        let run_queue = self.scheduler.run_queue();
        let wait_queue = self.scheduler.wait_queue();
        hook.invoke(&HookContext {
            task: self.scheduler.tasks[self.task].id,
            frame,
            run_queue: &run_queue,
            wait_queue: &wait_queue,
        });
    }
}
