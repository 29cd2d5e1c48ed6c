//! Timers that wake waiting tasks.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use alot::{LotId, Lots};
use crossbeam_utils::sync::Parker;
use kempt::Map;
use sol_lang::vm::TaskId;

/// Identifies a timer started by a [`TimerFacility`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimerId(pub u64);

/// An event source that notifies a scheduler when timers fire.
///
/// Each timer is tagged with the task that started it, which is reported
/// back when it fires.
pub trait TimerFacility {
    /// Starts a timer that fires once after `after`, and then every `repeat`
    /// if provided.
    fn start_timer(&mut self, after: Duration, repeat: Option<Duration>, task: TaskId)
        -> TimerId;

    /// Stops `timer` from firing. Returns false if the timer had already
    /// fired or been cancelled.
    ///
    /// Cancellation takes effect immediately and may be repeated.
    fn cancel_timer(&mut self, timer: TimerId) -> bool;

    /// Returns true if any timers have not yet fired or been cancelled.
    fn has_pending(&self) -> bool;

    /// Invokes `fired` for every timer that is due, without blocking.
    fn poll(&mut self, fired: &mut dyn FnMut(TimerId, TaskId));

    /// Blocks until the next timer is due or `parker` is unparked, then
    /// invokes `fired` for every timer that is due.
    fn wait(&mut self, parker: &Parker, fired: &mut dyn FnMut(TimerId, TaskId));
}

struct Timer {
    id: TimerId,
    task: TaskId,
    deadline: Instant,
    repeat: Option<Duration>,
}

/// A [`TimerFacility`] that keeps timers ordered by deadline and blocks the
/// current thread while waiting.
#[derive(Default)]
pub struct TimerQueue {
    timers: Lots<Timer>,
    ids: Map<TimerId, LotId>,
    queue: VecDeque<LotId>,
    next_id: u64,
}

impl TimerQueue {
    /// Returns an empty timer queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the deadline of the next timer to fire.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .find_map(|id| self.timers.get(*id))
            .map(|timer| timer.deadline)
    }

    fn find_position(&self, deadline: Instant) -> usize {
        self.queue
            .iter()
            .enumerate()
            .filter_map(|(index, id)| self.timers.get(*id).map(|timer| (index, timer)))
            .find_map(|(index, timer)| (timer.deadline > deadline).then_some(index))
            .unwrap_or(self.queue.len())
    }

    fn fire_due(&mut self, now: Instant, fired: &mut dyn FnMut(TimerId, TaskId)) {
        while let Some(id) = self.queue.front().copied() {
            let Some(timer) = self.timers.get_mut(id) else {
                // Cancelled.
                self.queue.pop_front();
                continue;
            };
            if timer.deadline > now {
                break;
            }

            self.queue.pop_front();
            let (timer_id, task) = (timer.id, timer.task);
            if let Some(repeat) = timer.repeat {
                // Never schedule the next firing in the past, so a slow
                // consumer cannot fall permanently behind.
                let deadline = (timer.deadline + repeat).max(now);
                timer.deadline = deadline;
                let index = self.find_position(deadline);
                self.queue.insert(index, id);
            } else {
                self.timers.remove(id);
                self.ids.remove(&timer_id);
            }

            trace!(timer = timer_id.0, %task, "timer fired");
            fired(timer_id, task);
        }
    }
}

impl TimerFacility for TimerQueue {
    fn start_timer(
        &mut self,
        after: Duration,
        repeat: Option<Duration>,
        task: TaskId,
    ) -> TimerId {
        let now = Instant::now();
        let deadline = now
            .checked_add(after)
            .unwrap_or_else(|| now + Duration::from_secs(u64::from(u32::MAX)));
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let index = self.find_position(deadline);
        let lot = self.timers.push(Timer {
            id,
            task,
            deadline,
            repeat: repeat.filter(|repeat| !repeat.is_zero()),
        });
        self.ids.insert(id, lot);
        self.queue.insert(index, lot);
        trace!(timer = id.0, %task, ?after, "timer started");
        id
    }

    fn cancel_timer(&mut self, timer: TimerId) -> bool {
        // The queue entry is skipped lazily once the timer is gone.
        match self.ids.remove(&timer) {
            Some(lot) => {
                self.timers.remove(lot.value);
                true
            }
            None => false,
        }
    }

    fn has_pending(&self) -> bool {
        !self.ids.is_empty()
    }

    fn poll(&mut self, fired: &mut dyn FnMut(TimerId, TaskId)) {
        self.fire_due(Instant::now(), fired);
    }

    fn wait(&mut self, parker: &Parker, fired: &mut dyn FnMut(TimerId, TaskId)) {
        match self.next_deadline() {
            Some(deadline) => parker.park_deadline(deadline),
            None => parker.park(),
        }
        self.fire_due(Instant::now(), fired);
    }
}
