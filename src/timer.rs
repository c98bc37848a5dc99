//! # Timer Engine
//!
//! Software timers kept in a skip list ordered by absolute expiry tick.
//!
//! ## Skip list
//!
//! ```text
//! level 0   head ─────────────────────► T9 ─────────────────────► head
//! level 1   head ─────────► T4 ───────► T9 ─────────► T12 ──────► head
//! level 2   head ─► T1 ─► T4 ─► T6 ─► T9 ─► T10 ─► T12 ─► T15 ──► head
//! ```
//!
//! Every timer is linked at the bottom level; a timer present at level `k`
//! is also present at every level below it. Insertion walks each level
//! from the row head cached on the level above, so an insert or removal
//! costs O(log n) on average. How many levels a new timer joins is decided
//! by a running insertion counter rather than a random source: the
//! distribution is deterministic and testable.
//!
//! ## Wraparound
//!
//! Ticks are a free-running `u32`. Comparisons use the distance
//! `(a - b) mod 2^32`, treating anything below `2^31` as "a is not before
//! b", which stays correct across counter wraparound as long as no timer
//! is armed for more than half the tick range.
//!
//! ## Hard and soft timers
//!
//! Hard timers fire in the tick interrupt through `timer_check`. Soft timers
//! are queued there and fired later, in task context, by the timer service
//! task through `timer_soft_check`.

use bitflags::bitflags;

use crate::config::{MAX_TIMERS, TIMER_SKIP_LIST_LEVEL, TIMER_SKIP_LIST_MASK};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::object::ObjectId;
use crate::slab::{Handle, Slab};
use crate::task::{PendOn, PendStatus, TaskId};

const LEVELS: usize = TIMER_SKIP_LIST_LEVEL;
const TICK_HALF: u32 = 1 << 31;

/// Longest period a timer accepts. Longer ones would break the
/// wraparound comparison.
pub const MAX_PERIOD: u32 = TICK_HALF - 1;

/// Whether `now` has reached `deadline`, robust to wraparound.
#[inline]
pub fn tick_reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) < TICK_HALF
}

/// Whether `a` lies strictly after `b`, robust to wraparound.
#[inline]
pub fn tick_after(a: u32, b: u32) -> bool {
    let delta = a.wrapping_sub(b);
    delta != 0 && delta < TICK_HALF
}

// ---------------------------------------------------------------------------
// Timer records
// ---------------------------------------------------------------------------

/// Handle to a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub(crate) Handle);

bitflags! {
    /// Timer mode flags. A timer without `PERIODIC` is one-shot, a timer
    /// without `SOFT` is hard.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerFlags: u8 {
        const PERIODIC = 1 << 0;
        const SOFT = 1 << 1;
        /// Set while the timer is armed.
        const ACTIVE = 1 << 2;
    }
}

impl TimerFlags {
    pub const ONESHOT: TimerFlags = TimerFlags::empty();
    pub const HARD: TimerFlags = TimerFlags::empty();
}

/// User timer callback. Runs with the kernel borrowed, so it may restart,
/// stop or detach timers (including its own) and send events.
pub type TimerFn = fn(&mut Kernel, TimerId, usize);

/// What happens when a timer fires.
#[derive(Clone, Copy)]
pub enum TimerAction {
    /// End a task's timed suspension.
    Timeout(TaskId),
    /// Send `event` to `target`, or publish it when there is no target.
    Deliver {
        event: ObjectId,
        target: Option<TaskId>,
    },
    /// Call user code with an opaque parameter.
    Callback { func: TimerFn, param: usize },
}

/// Neighbours of a timer on one level. `None` is the list head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Row {
    prev: Option<u16>,
    next: Option<u16>,
}

const EMPTY_ROW: Row = Row {
    prev: None,
    next: None,
};

pub struct Timer {
    timeout_tick: u32,
    init_tick: u32,
    flags: TimerFlags,
    row: [Option<Row>; LEVELS],
    action: TimerAction,
}

impl Timer {
    pub fn new(action: TimerAction, period: u32, flags: TimerFlags) -> Self {
        Self {
            timeout_tick: 0,
            init_tick: period.clamp(1, MAX_PERIOD),
            flags: flags.difference(TimerFlags::ACTIVE),
            row: [None; LEVELS],
            action,
        }
    }

    #[inline]
    pub fn timeout_tick(&self) -> u32 {
        self.timeout_tick
    }

    #[inline]
    pub fn init_tick(&self) -> u32 {
        self.init_tick
    }

    #[inline]
    pub fn flags(&self) -> TimerFlags {
        self.flags
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.flags.contains(TimerFlags::ACTIVE)
    }
}

/// Requests accepted by [`TimerList::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerControl {
    GetPeriod,
    SetPeriod(u32),
    SetOneshot,
    SetPeriodic,
    GetState,
    /// Ticks until the timer fires, 0 when stopped.
    GetRemaining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerReply {
    Done,
    Period(u32),
    State(TimerState),
    Remaining(u32),
}

// ---------------------------------------------------------------------------
// Skip list
// ---------------------------------------------------------------------------

/// Pool of timers plus the skip list of armed ones.
pub struct TimerList {
    pool: Slab<Timer, MAX_TIMERS>,
    heads: [Row; LEVELS],
    /// Insertion counter driving level promotion.
    counter: u32,
}

impl TimerList {
    pub const fn new() -> Self {
        Self {
            pool: Slab::new(),
            heads: [EMPTY_ROW; LEVELS],
            counter: 0,
        }
    }

    pub fn create(&mut self, timer: Timer) -> Result<TimerId> {
        self.pool.insert(timer).map(TimerId).map_err(|_| {
            log::warn!("timer pool exhausted");
            KernelError::Full
        })
    }

    pub fn get(&self, id: TimerId) -> Option<&Timer> {
        self.pool.get(id.0)
    }

    pub fn get_mut(&mut self, id: TimerId) -> Option<&mut Timer> {
        self.pool.get_mut(id.0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    fn row(&self, level: usize, node: Option<u16>) -> Row {
        match node {
            None => self.heads[level],
            Some(index) => match self.pool.at(index as usize).and_then(|t| t.row[level]) {
                Some(row) => row,
                None => crate::error::fatal("timer list link broken", file!(), line!()),
            },
        }
    }

    fn row_mut(&mut self, level: usize, node: Option<u16>) -> &mut Row {
        match node {
            None => &mut self.heads[level],
            Some(index) => match self.pool.at_mut(index as usize).and_then(|t| t.row[level].as_mut()) {
                Some(row) => row,
                None => crate::error::fatal("timer list link broken", file!(), line!()),
            },
        }
    }

    fn insert_after(&mut self, level: usize, after: Option<u16>, index: u16) {
        let next = self.row(level, after).next;
        if let Some(timer) = self.pool.at_mut(index as usize) {
            timer.row[level] = Some(Row { prev: after, next });
        }
        self.row_mut(level, after).next = Some(index);
        self.row_mut(level, next).prev = Some(index);
    }

    fn unlink(&mut self, index: u16) {
        for level in 0..LEVELS {
            let Some(row) = self.pool.at(index as usize).and_then(|t| t.row[level]) else {
                continue;
            };
            self.row_mut(level, row.prev).next = row.next;
            self.row_mut(level, row.next).prev = row.prev;
            if let Some(timer) = self.pool.at_mut(index as usize) {
                timer.row[level] = None;
            }
        }
    }

    fn timeout_at(&self, index: u16) -> u32 {
        self.pool.at(index as usize).map_or(0, |t| t.timeout_tick)
    }

    fn link(&mut self, index: u16) {
        let timeout = self.timeout_at(index);
        let mut row_head: [Option<u16>; LEVELS] = [None; LEVELS];

        for level in 0..LEVELS {
            // Advance past every entry that does not expire strictly after
            // the new one, so equal deadlines keep insertion order.
            while let Some(next) = self.row(level, row_head[level]).next {
                if tick_after(self.timeout_at(next), timeout) {
                    break;
                }
                row_head[level] = Some(next);
            }
            if level + 1 < LEVELS {
                row_head[level + 1] = row_head[level];
            }
        }

        self.counter = self.counter.wrapping_add(1);
        let mut promote = self.counter;

        self.insert_after(LEVELS - 1, row_head[LEVELS - 1], index);
        for level in (0..LEVELS - 1).rev() {
            if promote & TIMER_SKIP_LIST_MASK != 0 {
                break;
            }
            self.insert_after(level, row_head[level], index);
            promote >>= (TIMER_SKIP_LIST_MASK + 1) >> 1;
        }
    }

    /// Whether the timer is linked into the list.
    pub fn is_linked(&self, id: TimerId) -> bool {
        self.get(id).is_some_and(|t| t.row[LEVELS - 1].is_some())
    }

    /// Arm the timer to fire at absolute tick `deadline`.
    pub fn start_at(&mut self, id: TimerId, deadline: u32) -> Result<()> {
        let index = id.0.index() as u16;
        if self.is_linked(id) {
            self.unlink(index);
        }
        let timer = self.get_mut(id).ok_or(KernelError::NotFound)?;
        timer.timeout_tick = deadline;
        timer.flags.insert(TimerFlags::ACTIVE);
        self.link(index);
        Ok(())
    }

    /// Arm the timer one period after `now`. Restarting an armed timer
    /// moves it.
    pub fn start(&mut self, id: TimerId, now: u32) -> Result<()> {
        let period = self.get(id).ok_or(KernelError::NotFound)?.init_tick;
        self.start_at(id, now.wrapping_add(period))
    }

    /// Disarm the timer. Stopping a stopped timer is a no-op.
    pub fn stop(&mut self, id: TimerId) -> Result<()> {
        if self.is_linked(id) {
            self.unlink(id.0.index() as u16);
        }
        let timer = self.get_mut(id).ok_or(KernelError::NotFound)?;
        timer.flags.remove(TimerFlags::ACTIVE);
        Ok(())
    }

    /// Disarm and release the timer.
    pub fn remove(&mut self, id: TimerId) -> Option<Timer> {
        if self.is_linked(id) {
            self.unlink(id.0.index() as u16);
        }
        self.pool.remove(id.0)
    }

    /// Unlink and return the earliest timer if it has expired at `now`.
    /// The timer keeps its `ACTIVE` flag; the caller decides its fate.
    pub fn pop_expired(&mut self, now: u32) -> Option<TimerId> {
        let first = self.heads[LEVELS - 1].next?;
        if !tick_reached(now, self.timeout_at(first)) {
            return None;
        }
        self.unlink(first);
        self.pool.handle_at(first as usize).map(TimerId)
    }

    /// Deadline of the earliest armed timer.
    pub fn next_timeout(&self) -> Option<u32> {
        self.heads[LEVELS - 1].next.map(|index| self.timeout_at(index))
    }

    /// Deadlines linked at `level`, in list order.
    pub fn level_deadlines(&self, level: usize) -> impl Iterator<Item = u32> + '_ {
        let mut cursor = self.heads[level].next;
        core::iter::from_fn(move || {
            let index = cursor?;
            cursor = self.row(level, Some(index)).next;
            Some(self.timeout_at(index))
        })
    }

    pub fn control(&mut self, id: TimerId, cmd: TimerControl, now: u32) -> Result<TimerReply> {
        let timer = self.get_mut(id).ok_or(KernelError::NotFound)?;
        let reply = match cmd {
            TimerControl::GetPeriod => TimerReply::Period(timer.init_tick),
            TimerControl::SetPeriod(0) => return Err(KernelError::InvalidState),
            TimerControl::SetPeriod(period) => {
                timer.init_tick = period.min(MAX_PERIOD);
                TimerReply::Done
            }
            TimerControl::SetOneshot => {
                timer.flags.remove(TimerFlags::PERIODIC);
                TimerReply::Done
            }
            TimerControl::SetPeriodic => {
                timer.flags.insert(TimerFlags::PERIODIC);
                TimerReply::Done
            }
            TimerControl::GetState => TimerReply::State(if timer.is_active() {
                TimerState::Running
            } else {
                TimerState::Stopped
            }),
            TimerControl::GetRemaining => {
                let remaining = if timer.is_active() && !tick_reached(now, timer.timeout_tick) {
                    timer.timeout_tick.wrapping_sub(now)
                } else {
                    0
                };
                TimerReply::Remaining(remaining)
            }
        };
        Ok(reply)
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kernel integration
// ---------------------------------------------------------------------------

impl Kernel {
    /// Create a user timer. It stays stopped until [`Kernel::timer_start`].
    pub fn timer_create(
        &mut self,
        func: TimerFn,
        param: usize,
        period: u32,
        flags: TimerFlags,
    ) -> Result<TimerId> {
        self.timers
            .create(Timer::new(TimerAction::Callback { func, param }, period, flags))
    }

    pub fn timer_start(&mut self, id: TimerId) -> Result<()> {
        self.timers.start(id, self.tick)
    }

    pub fn timer_stop(&mut self, id: TimerId) -> Result<()> {
        self.timers.stop(id)
    }

    pub fn timer_control(&mut self, id: TimerId, cmd: TimerControl) -> Result<TimerReply> {
        self.timers.control(id, cmd, self.tick)
    }

    /// Stop the timer and release its slot. Safe to call from the timer's
    /// own callback: the engine notices the slot is gone and does not re-arm.
    pub fn timer_detach(&mut self, id: TimerId) -> Result<()> {
        self.timers.remove(id).map(|_| ()).ok_or(KernelError::NotFound)
    }

    /// Fire every hard timer that expired at the current tick and queue
    /// expired soft timers for the timer task. Tick-interrupt context.
    pub fn timer_check(&mut self) {
        let now = self.tick;
        while let Some(id) = self.timers.pop_expired(now) {
            let soft = self
                .timers
                .get(id)
                .is_some_and(|t| t.flags.contains(TimerFlags::SOFT));
            if !soft {
                self.run_timer(id, now);
                continue;
            }

            if self.soft_queue.push_back(id).is_err() {
                log::warn!("soft timer queue full, retrying next tick");
                let _ = self.timers.start_at(id, now.wrapping_add(1));
                continue;
            }
            if let Some(service) = self.timer_task {
                let tcb = self.sched.task(service);
                if tcb.is_pending() && tcb.pend_on == PendOn::Suspend {
                    self.wake(service, PendStatus::Ok);
                }
            }
        }
    }

    /// Fire the soft timers queued by [`Kernel::timer_check`]. Timer-task
    /// context.
    pub fn timer_soft_check(&mut self) {
        let now = self.tick;
        while let Some(id) = self.soft_queue.pop_front() {
            self.run_timer(id, now);
        }
        self.reschedule();
    }

    /// Whether soft timers are waiting for the timer task.
    pub fn soft_timers_pending(&self) -> bool {
        !self.soft_queue.is_empty()
    }

    fn run_timer(&mut self, id: TimerId, now: u32) {
        let Some(timer) = self.timers.get_mut(id) else {
            return;
        };
        if !timer.is_active() {
            // Stopped while queued for the timer task.
            return;
        }
        if !timer.flags.contains(TimerFlags::PERIODIC) {
            timer.flags.remove(TimerFlags::ACTIVE);
        }
        let action = timer.action;

        match action {
            TimerAction::Timeout(task) => self.pend_timeout(task),
            TimerAction::Deliver { event, target } => self.deliver_timed(event, target),
            TimerAction::Callback { func, param } => func(self, id, param),
        }

        // The callback may have stopped, restarted or detached the timer.
        let rearm = self.timers.get(id).is_some_and(|t| {
            t.flags.contains(TimerFlags::ACTIVE | TimerFlags::PERIODIC)
        }) && !self.timers.is_linked(id);
        if rearm {
            let _ = self.timers.start(id, now);
        }
    }

    /// Arm `task`'s private timer for a timed suspension of `ticks`.
    pub(crate) fn arm_task_timer(&mut self, task: TaskId, ticks: u32) {
        if let Some(timer) = self.sched.task(task).timer {
            if let Some(t) = self.timers.get_mut(timer) {
                t.init_tick = ticks.clamp(1, MAX_PERIOD);
            }
            let _ = self.timers.start(timer, self.tick);
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn noop(_: &mut Kernel, _: TimerId, _: usize) {}

    fn timer(period: u32) -> Timer {
        Timer::new(TimerAction::Callback { func: noop, param: 0 }, period, TimerFlags::ONESHOT)
    }

    fn drain(list: &mut TimerList, now: u32) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some(id) = list.pop_expired(now) {
            fired.push(id);
        }
        fired
    }

    #[test]
    fn test_wraparound_compare() {
        assert!(tick_reached(5, 5));
        assert!(tick_reached(10, 5));
        assert!(!tick_reached(4, 5));
        assert!(tick_reached(3, u32::MAX - 2), "3 is past MAX-2 after wrap");
        assert!(tick_after(2, u32::MAX));
        assert!(!tick_after(7, 7));
    }

    #[test]
    fn test_expiry_order() {
        let mut list = TimerList::new();
        let a = list.create(timer(30)).unwrap();
        let b = list.create(timer(10)).unwrap();
        let c = list.create(timer(20)).unwrap();
        for id in [a, b, c] {
            list.start(id, 0).unwrap();
        }

        assert!(drain(&mut list, 9).is_empty());
        assert_eq!(drain(&mut list, 10), vec![b]);
        assert_eq!(drain(&mut list, 100), vec![c, a]);
        assert_eq!(list.next_timeout(), None);
    }

    #[test]
    fn test_ties_fire_in_insertion_order() {
        let mut list = TimerList::new();
        let ids: Vec<TimerId> = (0..6).map(|_| list.create(timer(5)).unwrap()).collect();
        for &id in &ids {
            list.start(id, 100).unwrap();
        }
        assert_eq!(drain(&mut list, 105), ids);
    }

    #[test]
    fn test_wraparound_ordering() {
        let mut list = TimerList::new();
        let now = u32::MAX - 5;
        let late = list.create(timer(10)).unwrap();
        let early = list.create(timer(3)).unwrap();
        let mid = list.create(timer(7)).unwrap();
        for id in [late, early, mid] {
            list.start(id, now).unwrap();
        }

        assert!(drain(&mut list, u32::MAX - 3).is_empty());
        // MAX-5+3 = MAX-2: fires before the wrap
        assert_eq!(drain(&mut list, u32::MAX - 2), vec![early]);
        // MAX-5+7 = 1 and MAX-5+10 = 4 after the wrap
        assert!(drain(&mut list, 0).is_empty(), "wrapped deadlines are not early");
        assert_eq!(drain(&mut list, 1), vec![mid]);
        assert!(drain(&mut list, 3).is_empty());
        assert_eq!(drain(&mut list, 4), vec![late]);
        assert_eq!(list.next_timeout(), None);
    }

    #[test]
    fn test_counter_leveling_is_deterministic() {
        let mut list = TimerList::new();
        for i in 0..16u32 {
            let id = list.create(timer(100 - i)).unwrap();
            list.start(id, 0).unwrap();
        }
        let sizes: Vec<usize> = (0..LEVELS).map(|l| list.level_deadlines(l).count()).collect();
        assert_eq!(sizes, vec![1, 4, 16]);

        for level in 0..LEVELS {
            let deadlines: Vec<u32> = list.level_deadlines(level).collect();
            assert!(deadlines.windows(2).all(|w| w[0] <= w[1]), "level {} unsorted", level);
        }
        let upper: Vec<u32> = list.level_deadlines(1).collect();
        let bottom: Vec<u32> = list.level_deadlines(2).collect();
        assert!(upper.iter().all(|d| bottom.contains(d)), "upper levels are subsets");
    }

    #[test]
    fn test_stop_and_restart() {
        let mut list = TimerList::new();
        let a = list.create(timer(5)).unwrap();
        let b = list.create(timer(8)).unwrap();
        list.start(a, 0).unwrap();
        list.start(b, 0).unwrap();
        list.stop(a).unwrap();
        assert!(!list.get(a).unwrap().is_active());
        assert_eq!(drain(&mut list, 6), vec![]);
        list.start(a, 6).unwrap();
        assert_eq!(drain(&mut list, 11), vec![b, a]);
        assert!(list.stop(a).is_ok(), "stopping a stopped timer is a no-op");
    }

    #[test]
    fn test_control_commands() {
        let mut list = TimerList::new();
        let a = list.create(timer(5)).unwrap();
        assert_eq!(list.control(a, TimerControl::GetState, 0), Ok(TimerReply::State(TimerState::Stopped)));
        list.control(a, TimerControl::SetPeriod(40), 0).unwrap();
        list.control(a, TimerControl::SetPeriodic, 0).unwrap();
        assert_eq!(list.control(a, TimerControl::GetPeriod, 0), Ok(TimerReply::Period(40)));
        list.start(a, 10).unwrap();
        assert_eq!(list.control(a, TimerControl::GetRemaining, 25), Ok(TimerReply::Remaining(25)));
        assert!(list.get(a).unwrap().flags().contains(TimerFlags::PERIODIC));
        assert_eq!(list.control(a, TimerControl::SetPeriod(0), 0), Err(KernelError::InvalidState));
    }

    // -- kernel-level behaviour -------------------------------------------

    static PERIODIC_FIRES: AtomicU32 = AtomicU32::new(0);

    fn count_periodic(_: &mut Kernel, _: TimerId, _: usize) {
        PERIODIC_FIRES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_periodic_rearms() {
        let mut k = Kernel::new();
        let t = k.timer_create(count_periodic, 0, 10, TimerFlags::PERIODIC).unwrap();
        k.timer_start(t).unwrap();
        for _ in 0..55 {
            k.tick();
        }
        assert_eq!(PERIODIC_FIRES.load(Ordering::SeqCst), 5);
        assert_eq!(k.timer_control(t, TimerControl::GetRemaining), Ok(TimerReply::Remaining(5)));
    }

    static SELF_STOPS: AtomicU32 = AtomicU32::new(0);

    fn stop_self(k: &mut Kernel, id: TimerId, _: usize) {
        SELF_STOPS.fetch_add(1, Ordering::SeqCst);
        k.timer_stop(id).unwrap();
    }

    #[test]
    fn test_stop_inside_callback_is_not_rearmed() {
        let mut k = Kernel::new();
        let t = k.timer_create(stop_self, 0, 3, TimerFlags::PERIODIC).unwrap();
        k.timer_start(t).unwrap();
        for _ in 0..20 {
            k.tick();
        }
        assert_eq!(SELF_STOPS.load(Ordering::SeqCst), 1);
        assert!(!k.timers.is_linked(t));
    }

    static DETACHES: AtomicU32 = AtomicU32::new(0);

    fn detach_self(k: &mut Kernel, id: TimerId, _: usize) {
        DETACHES.fetch_add(1, Ordering::SeqCst);
        k.timer_detach(id).unwrap();
    }

    #[test]
    fn test_detach_inside_callback() {
        let mut k = Kernel::new();
        let t = k.timer_create(detach_self, 0, 2, TimerFlags::PERIODIC).unwrap();
        k.timer_start(t).unwrap();
        for _ in 0..10 {
            k.tick();
        }
        assert_eq!(DETACHES.load(Ordering::SeqCst), 1);
        assert_eq!(k.timer_start(t), Err(KernelError::NotFound));
    }

    static SOFT_FIRES: AtomicU32 = AtomicU32::new(0);

    fn count_soft(_: &mut Kernel, _: TimerId, param: usize) {
        SOFT_FIRES.fetch_add(param as u32, Ordering::SeqCst);
    }

    #[test]
    fn test_soft_timer_deferred_to_task_context() {
        let mut k = Kernel::new();
        let t = k
            .timer_create(count_soft, 3, 4, TimerFlags::ONESHOT | TimerFlags::SOFT)
            .unwrap();
        k.timer_start(t).unwrap();
        for _ in 0..4 {
            k.tick();
        }
        assert_eq!(SOFT_FIRES.load(Ordering::SeqCst), 0, "soft timers never fire in tick context");
        assert!(k.soft_timers_pending());
        k.timer_soft_check();
        assert_eq!(SOFT_FIRES.load(Ordering::SeqCst), 3);
        assert_eq!(k.timer_control(t, TimerControl::GetState), Ok(TimerReply::State(TimerState::Stopped)));
    }
}
