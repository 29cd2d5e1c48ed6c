//! # sol-reactor
//!
//! `sol-reactor` schedules Sol tasks. It provides:
//!
//! - [`Scheduler`], a single-threaded cooperative scheduler with run and wait
//!   queues, timers, and parent/child lifetimes.
//! - [`Reactor`], a pool of threads that each drive their own scheduler.
//!
//! # Basic Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sol_lang::runtime::value::Value;
//! use sol_lang::vm::{Function, Instruction, RK_CONSTANT};
//! use sol_reactor::Reactor;
//!
//! // Create a new reactor for tasks to run in.
//! let reactor = Reactor::new();
//!
//! // Spawn a task that computes 1 + 2.
//! let task = reactor
//!     .spawn(Arc::new(Function::new(
//!         [Value::Number(1.), Value::Number(2.)],
//!         [
//!             Instruction::add(0, RK_CONSTANT, RK_CONSTANT + 1),
//!             Instruction::return_values(0, 1),
//!         ],
//!     )))
//!     .unwrap();
//!
//! // Wait for the result and verify it's 3.
//! assert_eq!(task.join().unwrap(), [Value::Number(3.)]);
//! ```
//!
//! [`TaskHandle`] is also a future that can be awaited to wait for the task to
//! complete.
//!
//! # Messages
//!
//! Every task has an inbox. Tasks block in `YIELD 2` until a message arrives,
//! which can be sent from any thread.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sol_lang::runtime::value::Value;
//! use sol_lang::vm::{Function, Instruction};
//! use sol_reactor::Reactor;
//!
//! let reactor = Reactor::new();
//! let echo = reactor
//!     .spawn(Arc::new(Function::new(
//!         [],
//!         [Instruction::receive(0), Instruction::return_values(0, 1)],
//!     )))
//!     .unwrap();
//!
//! echo.send(Value::Number(42.));
//! assert_eq!(echo.join().unwrap(), [Value::Number(42.)]);
//! ```
#![allow(missing_docs)]
use std::any::Any;
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use sol_channel::{Inbox, Mailbox};
use sol_lang::runtime::value::Value;
use sol_lang::vm::{Fault, Function, TaskId};

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

mod queue;
mod scheduler;
mod task;
mod timer;

pub use scheduler::{Scheduler, SchedulerConfig, Tick, WakeHandle};
pub use task::{Exit, TaskFlags, TaskState};
pub use timer::{TimerFacility, TimerId, TimerQueue};

pub struct Builder {
    threads: usize,
    thread_name: Option<String>,
    config: SchedulerConfig,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            threads: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            thread_name: None,
            config: SchedulerConfig::default(),
        }
    }

    #[must_use]
    pub fn threads(mut self, thread_count: usize) -> Self {
        self.threads = thread_count.max(1);
        self
    }

    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn exec_limit(mut self, exec_limit: usize) -> Self {
        self.config.exec_limit = exec_limit;
        self
    }

    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts the reactor's threads.
    ///
    /// # Panics
    ///
    /// Panics if a thread cannot be spawned.
    #[must_use]
    pub fn finish(self) -> ReactorHandle {
        let thread_name = self
            .thread_name
            .unwrap_or_else(|| String::from("sol-reactor"));

        let shared = Arc::new(SharedReactorData {
            shutdown: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(self.threads);
        for num in 0..self.threads {
            let (spawn_send, spawn_recv) = flume::unbounded();
            let scheduler = Scheduler::with_config(self.config);
            let data = Arc::new(PerThreadData::new(num, scheduler.wake_handle()));
            let reactor = Reactor {
                receiver: spawn_recv,
                scheduler,
                data: data.clone(),
                shared: shared.clone(),
            };
            threads.push(PerThread {
                data,
                spawner: spawn_send,
                handle: thread::Builder::new()
                    .name(thread_name.clone())
                    .spawn(move || reactor.run())
                    .expect("error spawning thread"),
            });
        }

        ReactorHandle {
            data: Arc::new(HandleData {
                threads: Mutex::new(threads),
                shared,
            }),
        }
    }
}

enum ThreadCommand {
    Spawn(Spawn),
}

struct Spawn {
    id: TaskId,
    function: Arc<Function>,
    inbox: Inbox,
    completion: Completion,
}

/// A thread in a reactor's pool, driving its own [`Scheduler`].
pub struct Reactor {
    receiver: Receiver<ThreadCommand>,
    scheduler: Scheduler,
    data: Arc<PerThreadData>,
    shared: Arc<SharedReactorData>,
}

impl Reactor {
    #[must_use]
    pub fn new() -> ReactorHandle {
        Self::build().finish()
    }

    #[must_use]
    pub fn build() -> Builder {
        Builder::new()
    }

    fn run(mut self) {
        debug!(thread = self.data.num, "reactor thread started");
        'outer: while !self.shared.shutdown.load(Ordering::Relaxed) {
            loop {
                match self.receiver.try_recv() {
                    Ok(ThreadCommand::Spawn(spawn)) => self.spawn(spawn),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }

            match self.scheduler.tick() {
                Tick::Busy => {}
                Tick::Waiting => self.scheduler.wait(),
                Tick::Idle => self.scheduler.park(),
            }
        }

        while let Ok(ThreadCommand::Spawn(spawn)) = self.receiver.try_recv() {
            spawn.completion.complete(Err(TaskError::Shutdown));
        }
        debug!(thread = self.data.num, "reactor thread stopping");
    }

    fn spawn(&mut self, spawn: Spawn) {
        self.scheduler
            .insert_task(spawn.id, spawn.function, None, spawn.inbox);
        self.data.total.fetch_add(1, Ordering::Relaxed);
        let mut sender = ResultSender::new(spawn.completion, self.data.clone());
        self.scheduler
            .watch(spawn.id, move |_, exit| sender.finish(task_result(exit)));
        self.scheduler.schedule(spawn.id);
    }
}

/// Completes a task's [`Completion`] when its exit is observed, or with
/// [`TaskError::Shutdown`] if the task is dropped before it ends.
struct ResultSender {
    completion: Option<Completion>,
    thread: Arc<PerThreadData>,
}

impl ResultSender {
    fn new(completion: Completion, thread: Arc<PerThreadData>) -> Self {
        thread.executing.fetch_add(1, Ordering::Relaxed);
        Self {
            completion: Some(completion),
            thread,
        }
    }

    fn finish(&mut self, result: TaskResult) {
        if let Some(completion) = self.completion.take() {
            self.thread.executing.fetch_sub(1, Ordering::Relaxed);
            completion.complete(result);
        }
    }
}

impl Drop for ResultSender {
    fn drop(&mut self) {
        self.finish(Err(TaskError::Shutdown));
    }
}

/// The outcome of a task spawned in a [`Reactor`].
pub type TaskResult = Result<Vec<Value>, TaskError>;

fn task_result(exit: &Exit) -> TaskResult {
    match exit {
        Exit::Returned(values) => Ok(values.clone()),
        Exit::Faulted(fault) => Err(TaskError::Fault(*fault)),
        Exit::Orphaned => Err(TaskError::Orphaned),
    }
}

/// A write-once slot shared between a task's [`ResultSender`] and its
/// [`TaskHandle`].
#[derive(Default, Clone, Debug)]
struct Completion(Arc<CompletionState>);

#[derive(Default, Debug)]
struct CompletionState {
    slot: Mutex<Slot>,
    filled: Condvar,
}

#[derive(Default, Debug)]
struct Slot {
    result: Option<TaskResult>,
    pending: Vec<Waker>,
}

impl Completion {
    fn complete(&self, result: TaskResult) {
        let pending = {
            let mut slot = self.0.slot.lock();
            slot.result = Some(result);
            std::mem::take(&mut slot.pending)
        };
        self.0.filled.notify_all();
        pending.into_iter().for_each(Waker::wake);
    }

    fn get(&self) -> Option<TaskResult> {
        self.0.slot.lock().result.clone()
    }

    fn wait(&self) -> TaskResult {
        let mut slot = self.0.slot.lock();
        loop {
            match &slot.result {
                Some(result) => return result.clone(),
                None => self.0.filled.wait(&mut slot),
            }
        }
    }

    fn wait_until(&self, deadline: Instant) -> Option<TaskResult> {
        let mut slot = self.0.slot.lock();
        while slot.result.is_none() {
            if self.0.filled.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.result.clone()
    }

    fn poll(&self, waker: &Waker) -> Poll<TaskResult> {
        let mut slot = self.0.slot.lock();
        if let Some(result) = &slot.result {
            return Poll::Ready(result.clone());
        }
        if !slot.pending.iter().any(|pending| pending.will_wake(waker)) {
            slot.pending.push(waker.clone());
        }
        Poll::Pending
    }
}

impl Future for &'_ TaskHandle {
    type Output = TaskResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.completion.poll(cx.waker())
    }
}

/// The reason a task spawned in a [`Reactor`] did not return a value.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TaskError {
    /// The task faulted.
    Fault(Fault),
    /// The task was ended because its parent ended first.
    Orphaned,
    /// The reactor shut down before the task ended.
    Shutdown,
}

impl Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Fault(fault) => write!(f, "task faulted: {fault}"),
            TaskError::Orphaned => f.write_str("task was orphaned"),
            TaskError::Shutdown => f.write_str("reactor shut down"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Fault(fault) => Some(fault),
            TaskError::Orphaned | TaskError::Shutdown => None,
        }
    }
}

pub struct TaskHandle {
    id: TaskId,
    mailbox: Mailbox,
    completion: Completion,
}

impl TaskHandle {
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Delivers `value` to the task's inbox.
    pub fn send(&self, value: Value) {
        self.mailbox.send(value, None);
    }

    #[must_use]
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn join(&self) -> TaskResult {
        self.completion.wait()
    }

    #[must_use]
    pub fn try_join(&self) -> Option<TaskResult> {
        self.completion.get()
    }

    #[must_use]
    pub fn try_join_until(&self, deadline: Instant) -> Option<TaskResult> {
        self.completion.wait_until(deadline)
    }

    #[must_use]
    pub fn try_join_for(&self, duration: Duration) -> Option<TaskResult> {
        self.try_join_until(Instant::now() + duration)
    }
}

impl Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("result", &self.completion.get())
            .finish_non_exhaustive()
    }
}

/// The reactor has shut down and can no longer accept tasks.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReactorShutdown;

impl Display for ReactorShutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("reactor shut down")
    }
}

impl std::error::Error for ReactorShutdown {}

#[derive(Debug, Clone)]
pub struct ReactorHandle {
    data: Arc<HandleData>,
}

impl ReactorHandle {
    /// Spawns a task executing `function` on the least busy thread.
    pub fn spawn(&self, function: Arc<Function>) -> Result<TaskHandle, ReactorShutdown> {
        if self.data.shared.shutdown.load(Ordering::Relaxed) {
            return Err(ReactorShutdown);
        }

        let threads = self.data.threads.lock();
        let thread = threads
            .iter()
            .min_by_key(|thread| thread.data.executing.load(Ordering::Relaxed))
            .ok_or(ReactorShutdown)?;

        let id = TaskId::next();
        let (mailbox, inbox) = sol_channel::inbox(thread.data.wake.waker(id));
        let completion = Completion::default();
        thread
            .spawner
            .send(ThreadCommand::Spawn(Spawn {
                id,
                function,
                inbox,
                completion: completion.clone(),
            }))
            .map_err(|_| ReactorShutdown)?;
        thread.data.wake.unpark();
        trace!(task = %id, thread = thread.data.num, "spawned");

        Ok(TaskHandle {
            id,
            mailbox,
            completion,
        })
    }

    /// Returns the number of unfinished tasks on each thread.
    #[must_use]
    pub fn load(&self) -> Vec<usize> {
        self.data
            .threads
            .lock()
            .iter()
            .map(|thread| thread.data.executing.load(Ordering::Relaxed))
            .collect()
    }

    /// Returns the number of tasks each thread has been given.
    #[must_use]
    pub fn totals(&self) -> Vec<usize> {
        self.data
            .threads
            .lock()
            .iter()
            .map(|thread| thread.data.total.load(Ordering::Relaxed))
            .collect()
    }

    /// Stops every thread, ending unfinished tasks with
    /// [`TaskError::Shutdown`].
    ///
    /// # Errors
    ///
    /// Returns the panic payload of a thread that panicked.
    pub fn shutdown(&self) -> Result<(), Box<dyn Any + Send + 'static>> {
        if self.data.shared.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let threads = std::mem::take(&mut *self.data.threads.lock());
        debug!(threads = threads.len(), "shutting down");
        for thread in &threads {
            thread.data.wake.unpark();
        }
        threads
            .into_iter()
            .try_for_each(|thread| thread.handle.join())
    }
}

#[derive(Debug)]
struct SharedReactorData {
    shutdown: AtomicBool,
}

#[derive(Debug)]
struct PerThread {
    spawner: Sender<ThreadCommand>,
    handle: JoinHandle<()>,
    data: Arc<PerThreadData>,
}

#[derive(Debug)]
struct PerThreadData {
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    num: usize,
    wake: WakeHandle,
    executing: AtomicUsize,
    total: AtomicUsize,
}

impl PerThreadData {
    fn new(num: usize, wake: WakeHandle) -> Self {
        Self {
            num,
            wake,
            executing: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug)]
struct HandleData {
    threads: Mutex<Vec<PerThread>>,
    shared: Arc<SharedReactorData>,
}
