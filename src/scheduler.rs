//! # Scheduler
//!
//! Core scheduling logic for tickos: strict fixed-priority preemption with
//! round-robin time slicing inside a priority level.
//!
//! ## Ready queue
//!
//! One doubly linked list per priority, threaded through the TCBs, plus a
//! bitmap whose bit `p` is set iff list `p` is non-empty. The most
//! important ready task is the head of the list named by the bitmap's
//! lowest set bit, an O(1) lookup.
//!
//! The running task is *not* linked into a ready list. On `schedule()`:
//!
//! 1. **Find** the best ready task (lowest set bit → list head).
//! 2. **Keep** the running task if it is strictly more important, or equally
//!    important and has not used up its slice.
//! 3. **Switch** otherwise: unlink the best ready task, make it `Running`,
//!    and append the preempted task (if it is still runnable) to the tail of
//!    its list, which is what rotates equal-priority tasks.
//!
//! The switch itself is carried out later by the port layer (PendSV on
//! Cortex-M), which asks for the pending `(from, to)` pair.

use crate::bitmap::Bitmap;
use crate::config::{MAX_TASKS, PRIORITY_COUNT};
use crate::task::{Link, TaskControlBlock, TaskId, TaskState};

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

/// Per-priority ready lists plus the priority-ready bitmap.
pub struct ReadyQueue {
    heads: [Option<TaskId>; PRIORITY_COUNT],
    tails: [Option<TaskId>; PRIORITY_COUNT],
    bitmap: Bitmap,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            heads: [None; PRIORITY_COUNT],
            tails: [None; PRIORITY_COUNT],
            bitmap: Bitmap::EMPTY,
        }
    }

    #[inline]
    pub fn bitmap(&self) -> Bitmap {
        self.bitmap
    }

    #[inline]
    pub fn head(&self, priority: u8) -> Option<TaskId> {
        self.heads[priority as usize]
    }

    fn push_back(&mut self, tasks: &mut [TaskControlBlock], id: TaskId) {
        let p = tasks[id.index()].priority as usize;
        tasks[id.index()].ready_link = Link {
            prev: self.tails[p],
            next: None,
        };
        match self.tails[p] {
            Some(tail) => tasks[tail.index()].ready_link.next = Some(id),
            None => self.heads[p] = Some(id),
        }
        self.tails[p] = Some(id);
        self.bitmap.set(p);
    }

    fn unlink(&mut self, tasks: &mut [TaskControlBlock], id: TaskId) {
        let p = tasks[id.index()].priority as usize;
        let Link { prev, next } = tasks[id.index()].ready_link;
        match prev {
            Some(prev) => tasks[prev.index()].ready_link.next = next,
            None => self.heads[p] = next,
        }
        match next {
            Some(next) => tasks[next.index()].ready_link.prev = prev,
            None => self.tails[p] = prev,
        }
        tasks[id.index()].ready_link = Link::DETACHED;
        if self.heads[p].is_none() {
            self.bitmap.clear(p);
        }
    }

    /// Most important ready task, if any.
    ///
    /// A set bit over an empty list (or the reverse) means the queue is
    /// corrupted and is fatal.
    pub fn highest(&self) -> Option<TaskId> {
        let p = self.bitmap.lowest()?;
        let head = self.heads[p];
        crate::kernel_assert!(head.is_some(), "ready bitmap set for an empty list");
        head
    }

    /// Check that every bit mirrors the emptiness of its list.
    pub fn is_consistent(&self) -> bool {
        (0..PRIORITY_COUNT).all(|p| self.bitmap.contains(p) == self.heads[p].is_some())
    }
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The central scheduler state: the task table, the ready queue and the
/// identity of the running task.
pub struct Scheduler {
    /// Fixed-size table of TCBs.
    pub tasks: [TaskControlBlock; MAX_TASKS],

    pub ready: ReadyQueue,

    /// The running task. `None` before `start`.
    current: Option<TaskId>,

    /// Task that was running when the pending switch was requested.
    switch_from: Option<TaskId>,

    /// Set while a context switch has been decided but not carried out.
    switch_pending: bool,

    /// Nesting depth of the scheduler lock.
    lock_nest: u16,

    /// A `schedule` call was skipped because the scheduler was locked.
    deferred: bool,

    started: bool,

    /// Number of context switches decided since start.
    pub context_switches: u32,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [TaskControlBlock::EMPTY; MAX_TASKS],
            ready: ReadyQueue::new(),
            current: None,
            switch_from: None,
            switch_pending: false,
            lock_nest: 0,
            deferred: false,
            started: false,
            context_switches: 0,
        }
    }

    #[inline]
    pub fn task(&self, id: TaskId) -> &TaskControlBlock {
        &self.tasks[id.index()]
    }

    #[inline]
    pub fn task_mut(&mut self, id: TaskId) -> &mut TaskControlBlock {
        &mut self.tasks[id.index()]
    }

    /// The running task.
    #[inline]
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock_nest > 0
    }

    /// Link `id` at the tail of its priority's ready list and mark it
    /// `Ready`. Inserting a task that is already ready or running is fatal.
    pub fn insert_ready(&mut self, id: TaskId) {
        let state = self.tasks[id.index()].state;
        crate::kernel_assert!(
            !matches!(state, TaskState::Ready | TaskState::Running | TaskState::Closed),
            "task inserted into the ready queue twice"
        );
        self.ready.push_back(&mut self.tasks, id);
        self.tasks[id.index()].state = TaskState::Ready;
    }

    /// Unlink `id` from its ready list. The caller sets the new state.
    pub fn remove_ready(&mut self, id: TaskId) {
        crate::kernel_assert!(
            self.tasks[id.index()].state == TaskState::Ready,
            "task removed from the ready queue while not ready"
        );
        self.ready.unlink(&mut self.tasks, id);
    }

    /// Take `id` out of scheduling. Ready tasks leave their list; the
    /// running task simply stops being `Running` and is switched away from
    /// on the next `schedule`.
    pub fn suspend(&mut self, id: TaskId) {
        if self.tasks[id.index()].state == TaskState::Ready {
            self.ready.unlink(&mut self.tasks, id);
        }
        self.tasks[id.index()].state = TaskState::Suspended;
    }

    /// Change the scheduled priority of `id`, moving it between ready lists
    /// if needed.
    pub fn set_priority(&mut self, id: TaskId, priority: u8) {
        crate::kernel_assert!((priority as usize) < PRIORITY_COUNT, "priority out of range");
        if self.tasks[id.index()].state == TaskState::Ready {
            self.ready.unlink(&mut self.tasks, id);
            self.tasks[id.index()].priority = priority;
            self.ready.push_back(&mut self.tasks, id);
        } else {
            self.tasks[id.index()].priority = priority;
        }
    }

    /// Mark the scheduler started. The first `schedule` afterwards picks
    /// the initial task.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Re-evaluate which task should run.
    ///
    /// Returns `true` if a context switch is now pending. Never fails; a
    /// corrupted ready queue halts in [`ReadyQueue::highest`].
    pub fn schedule(&mut self) -> bool {
        if !self.started {
            return false;
        }
        if self.lock_nest > 0 {
            self.deferred = true;
            return false;
        }

        let Some(best) = self.ready.highest() else {
            return false;
        };
        let best_priority = self.tasks[best.index()].priority;

        if let Some(cur) = self.current {
            let running = &mut self.tasks[cur.index()];
            if running.state == TaskState::Running {
                if running.priority < best_priority {
                    running.yield_pending = false;
                    return false;
                }
                if running.priority == best_priority && !running.yield_pending {
                    return false;
                }
            }
        }

        self.ready.unlink(&mut self.tasks, best);
        self.tasks[best.index()].state = TaskState::Running;

        if let Some(cur) = self.current {
            let prev = &mut self.tasks[cur.index()];
            prev.yield_pending = false;
            if prev.state == TaskState::Running {
                prev.state = TaskState::Ready;
                self.ready.push_back(&mut self.tasks, cur);
            }
        }

        if !self.switch_pending {
            self.switch_from = self.current;
            self.switch_pending = true;
        }
        self.current = Some(best);
        self.context_switches = self.context_switches.wrapping_add(1);
        true
    }

    /// Consume one tick of the running task's slice. Returns `true` when the
    /// slice expired and a reschedule is due.
    pub fn tick(&mut self) -> bool {
        match self.current {
            Some(cur) if self.tasks[cur.index()].state == TaskState::Running => {
                self.tasks[cur.index()].consume_tick()
            }
            _ => false,
        }
    }

    /// Give up the rest of the running task's slice.
    pub fn yield_current(&mut self) -> bool {
        if let Some(cur) = self.current {
            let tcb = &mut self.tasks[cur.index()];
            tcb.remaining_tick = tcb.init_tick;
            tcb.yield_pending = true;
        }
        self.schedule()
    }

    /// Enter the scheduler lock. Nests.
    pub fn lock(&mut self) {
        self.lock_nest += 1;
    }

    /// Leave the scheduler lock. When the outermost lock is released,
    /// reschedules and returns whether a switch is pending.
    pub fn unlock(&mut self) -> bool {
        crate::kernel_assert!(self.lock_nest > 0, "scheduler unlocked more often than locked");
        self.lock_nest -= 1;
        if self.lock_nest == 0 {
            self.deferred = false;
            self.schedule()
        } else {
            false
        }
    }

    /// Whether the port layer still has to carry out a switch.
    #[inline]
    pub fn switch_pending(&self) -> bool {
        self.switch_pending
    }

    /// Hand the pending switch to the port layer, returning the task to save
    /// and the task to restore.
    pub fn take_switch(&mut self) -> Option<(Option<TaskId>, TaskId)> {
        if !self.switch_pending {
            return None;
        }
        self.switch_pending = false;
        let to = self.current?;
        Some((self.switch_from.take(), to))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
