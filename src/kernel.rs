//! # Kernel
//!
//! The kernel state and its task-level API.
//!
//! [`Kernel`] owns every kernel object: the scheduler and its task table,
//! the timer engine, the semaphore and mutex pools, the object table, the
//! pending event records and the database heap. It is a plain state
//! machine. Blocking calls do not block here: they suspend the caller,
//! pick the next task and report [`Wait::Blocked`]. The port layer
//! (see `os`) carries out the context switch and, once the task runs
//! again, reads the outcome back through [`Kernel::pend_result`].
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► os::init()            ← idle + timer service tasks
//!         ├─► os::register_task()   ← application tasks (×N)
//!         └─► os::start()           ← SysTick, PendSV, first task (no return)
//! ```

use heapless::{Deque, Vec};

use crate::config::{
    HEAP_SIZE, IDLE_PRIORITY, KEY_LEN, MAX_MUTEXES, MAX_SEMAPHORES, MAX_TASKS, PRIORITY_COUNT,
    SOFT_TIMER_QUEUE, TICK_HZ, TIMER_TASK_PRIORITY, WAIT_FOREVER,
};
use crate::error::{KernelError, Result};
use crate::event::RecordQueue;
use crate::heap::Heap;
use crate::mutex::Mutex;
use crate::object::{ObjectKind, ObjectTable, Payload};
use crate::scheduler::Scheduler;
use crate::sem::Semaphore;
use crate::slab::Slab;
use crate::task::{PendOn, PendStatus, TaskConfig, TaskEntry, TaskId, TaskState};
use crate::timer::{Timer, TimerAction, TimerFlags, TimerId, TimerList};
use crate::wait::WaitOrder;

/// Outcome of a call that may block the running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait<T> {
    /// Completed without blocking.
    Ready(T),
    /// The caller was suspended. The result is available through
    /// [`Kernel::pend_result`] once it runs again.
    Blocked,
}

impl<T> Wait<T> {
    #[inline]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Wait::Blocked)
    }
}

/// Entry points and stacks of the tasks `init` registers on its own.
pub struct SystemTasks {
    pub idle_entry: TaskEntry,
    pub idle_stack: &'static mut [u32],
    pub timer_entry: TaskEntry,
    pub timer_stack: &'static mut [u32],
}

/// Convert milliseconds to ticks, rounding up. A non-zero duration is at
/// least one tick.
pub fn ms_to_ticks(ms: u32) -> u32 {
    if ms == WAIT_FOREVER {
        return WAIT_FOREVER;
    }
    let ticks = (ms as u64 * TICK_HZ as u64).div_ceil(1000);
    ticks.min(WAIT_FOREVER as u64 - 1) as u32
}

// ---------------------------------------------------------------------------
// Kernel state
// ---------------------------------------------------------------------------

pub struct Kernel {
    pub(crate) sched: Scheduler,
    pub(crate) timers: TimerList,
    pub(crate) sems: Slab<Semaphore, MAX_SEMAPHORES>,
    pub(crate) mutexes: Slab<Mutex, MAX_MUTEXES>,
    pub(crate) objects: ObjectTable,
    pub(crate) records: RecordQueue,
    pub(crate) heap: Heap<HEAP_SIZE>,
    pub(crate) tick: u32,
    pub(crate) soft_queue: Deque<TimerId, SOFT_TIMER_QUEUE>,
    pub(crate) idle_task: Option<TaskId>,
    pub(crate) timer_task: Option<TaskId>,
    /// Exited tasks waiting for the idle loop to reap them.
    pub(crate) defunct: Vec<TaskId, MAX_TASKS>,
}

// SAFETY: the only non-`Send` fields are the raw stack pointers in the task
// table. They are written and read by the context switch hook, which holds
// the kernel lock like every other access.
unsafe impl Send for Kernel {}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            sched: Scheduler::new(),
            timers: TimerList::new(),
            sems: Slab::new(),
            mutexes: Slab::new(),
            objects: ObjectTable::new(),
            records: RecordQueue::new(),
            heap: Heap::new(),
            tick: 0,
            soft_queue: Deque::new(),
            idle_task: None,
            timer_task: None,
            defunct: Vec::new(),
        }
    }

    /// Register the idle task and the soft-timer service task. The timer
    /// task starts suspended; expiring soft timers wake it.
    pub fn init(&mut self, system: SystemTasks) -> Result<()> {
        let idle = self.register_task(
            TaskConfig {
                name: "idle",
                priority: IDLE_PRIORITY,
                time_slice: 0,
                param: 0,
            },
            system.idle_entry,
            system.idle_stack,
        )?;
        let timer = self.register_task(
            TaskConfig {
                name: "timer",
                priority: TIMER_TASK_PRIORITY,
                time_slice: 0,
                param: 0,
            },
            system.timer_entry,
            system.timer_stack,
        )?;
        self.park(timer);
        self.idle_task = Some(idle);
        self.timer_task = Some(timer);
        log::info!("kernel initialized");
        Ok(())
    }

    /// Register a task. It becomes ready immediately and, once the kernel is
    /// started, preempts the caller if it is more important.
    ///
    /// Registering a name twice is fatal.
    pub fn register_task(
        &mut self,
        config: TaskConfig,
        entry: TaskEntry,
        stack: &'static mut [u32],
    ) -> Result<TaskId> {
        crate::kernel_assert!(
            (config.priority as usize) < PRIORITY_COUNT,
            "task priority out of range"
        );
        if config.name.len() > KEY_LEN {
            return Err(KernelError::NameTooLong);
        }
        crate::kernel_assert!(
            self.objects.find(ObjectKind::Task, config.name).is_none(),
            "task name registered twice"
        );

        let index = self
            .sched
            .tasks
            .iter()
            .position(|t| !t.active)
            .ok_or(KernelError::Full)?;
        let id = TaskId(index as u8);

        let timer = self.timers.create(Timer::new(
            TimerAction::Timeout(id),
            1,
            TimerFlags::ONESHOT | TimerFlags::HARD,
        ))?;
        let event_sem = match self.sem_create(0, WaitOrder::Fifo) {
            Ok(sem) => sem,
            Err(e) => {
                self.timers.remove(timer);
                return Err(e);
            }
        };
        let object = match self.objects.insert(
            ObjectKind::Task,
            config.name,
            Default::default(),
            Payload::Task(id),
        ) {
            Ok(object) => object,
            Err(e) => {
                self.timers.remove(timer);
                let _ = self.sem_delete(event_sem);
                return Err(e);
            }
        };

        let stack_pointer = crate::arch::init_stack(stack, entry, config.param);
        let tcb = self.sched.task_mut(id);
        tcb.init(id, &config);
        tcb.timer = Some(timer);
        tcb.event_sem = Some(event_sem);
        tcb.object = Some(object);
        tcb.entry = Some(entry);
        tcb.stack_base = stack.as_mut_ptr();
        tcb.stack_len = stack.len();
        tcb.stack_pointer = stack_pointer;

        self.sched.insert_ready(id);
        log::info!("task '{}' registered at priority {}", config.name, config.priority);
        self.reschedule();
        Ok(id)
    }

    /// Start scheduling. Returns the first task to run; the port layer
    /// transfers control to it.
    pub fn start(&mut self) -> Option<TaskId> {
        self.sched.start();
        self.sched.schedule();
        log::info!("scheduler started");
        self.sched.current()
    }

    /// Tick interrupt entry: advance time, fire hard timers, charge the
    /// running task's slice and reschedule. Returns whether a context
    /// switch is pending.
    pub fn tick(&mut self) -> bool {
        self.tick = self.tick.wrapping_add(1);
        self.timer_check();
        self.sched.tick();
        self.reschedule()
    }

    #[inline]
    pub fn now(&self) -> u32 {
        self.tick
    }

    pub fn get_time_ms(&self) -> u32 {
        (self.tick as u64 * 1000 / TICK_HZ as u64) as u32
    }

    #[inline]
    pub fn current_task(&self) -> Option<TaskId> {
        self.sched.current()
    }

    pub fn task_by_name(&self, name: &str) -> Option<TaskId> {
        let id = self.objects.find(ObjectKind::Task, name)?;
        match self.objects.get(id)?.payload {
            Payload::Task(task) => Some(task),
            _ => None,
        }
    }

    pub fn task_state(&self, task: TaskId) -> TaskState {
        self.sched.task(task).state
    }

    pub fn task_priority(&self, task: TaskId) -> u8 {
        self.sched.task(task).priority
    }

    /// Outcome of `task`'s most recent suspension.
    pub fn pend_result(&self, task: TaskId) -> PendStatus {
        self.sched.task(task).pend_status
    }

    #[inline]
    pub fn switch_pending(&self) -> bool {
        self.sched.switch_pending()
    }

    pub fn context_switches(&self) -> u32 {
        self.sched.context_switches
    }

    /// Live allocations in the database heap.
    pub fn heap_used_blocks(&self) -> usize {
        self.heap.used_blocks()
    }

    // -----------------------------------------------------------------------
    // Task control
    // -----------------------------------------------------------------------

    /// Suspend `task` until [`Kernel::resume`]. Suspending the running task
    /// switches away from it.
    pub fn suspend(&mut self, task: TaskId) -> Result<()> {
        if !self.sched.task(task).is_runnable() {
            return Err(KernelError::InvalidState);
        }
        self.park(task);
        self.reschedule();
        Ok(())
    }

    /// Make a suspended task ready again. A task blocked on an object
    /// leaves its wait with [`PendStatus::Interrupted`]; a delayed or
    /// explicitly suspended task resumes normally.
    pub fn resume(&mut self, task: TaskId) -> Result<()> {
        let tcb = self.sched.task(task);
        if !tcb.is_pending() {
            return Err(KernelError::InvalidState);
        }
        let status = match tcb.pend_on {
            PendOn::Delay | PendOn::Suspend | PendOn::Nothing => PendStatus::Ok,
            PendOn::Semaphore(_) | PendOn::Mutex(_) => PendStatus::Interrupted,
        };
        self.wake(task, status);
        self.reschedule();
        Ok(())
    }

    /// Give up the rest of the running task's slice.
    pub fn yield_now(&mut self) -> bool {
        self.sched.yield_current()
    }

    /// Suspend the running task for `ticks` ticks. Zero yields instead.
    pub fn delay(&mut self, ticks: u32) {
        if ticks == 0 {
            self.yield_now();
            return;
        }
        self.block_current(PendOn::Delay, ticks);
        self.reschedule();
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay(ms_to_ticks(ms));
    }

    /// Terminate the running task. Mutexes it holds pass to their next
    /// waiters right away; everything else is released later by
    /// [`Kernel::idle_cleanup`].
    pub fn exit(&mut self) {
        let Some(cur) = self.sched.current() else {
            return;
        };
        crate::kernel_assert!(Some(cur) != self.idle_task, "idle task cannot exit");
        if let Some(timer) = self.sched.task(cur).timer {
            let _ = self.timers.stop(timer);
        }
        self.mutex_release_all(cur);
        self.sched.task_mut(cur).state = TaskState::Closed;
        let _ = self.defunct.push(cur);
        log::info!("task '{}' exited", self.sched.task(cur).name);
        self.reschedule();
    }

    /// Release everything held by exited tasks. Idle-loop context.
    pub fn idle_cleanup(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(task) = self.defunct.pop() {
            let tcb = self.sched.task(task);
            let (timer, sem, object) = (tcb.timer, tcb.event_sem, tcb.object);
            if let Some(timer) = timer {
                self.timers.remove(timer);
            }
            if let Some(sem) = sem {
                let _ = self.sem_delete(sem);
            }
            if let Some(object) = object {
                self.objects.remove(object);
            }
            self.forget_task_events(task);
            let tcb = self.sched.task_mut(task);
            tcb.active = false;
            tcb.entry = None;
            reaped += 1;
        }
        reaped
    }

    /// Assign a new base priority. A task boosted by priority inheritance
    /// keeps its boost while it is more important than `priority`, and
    /// settles on the new base once its mutexes are released.
    pub fn set_priority(&mut self, task: TaskId, priority: u8) {
        crate::kernel_assert!((priority as usize) < PRIORITY_COUNT, "priority out of range");
        self.sched.task_mut(task).base_priority = priority;
        self.refresh_priority(task);
        self.reschedule();
    }

    /// Lock the scheduler. Nests; interrupts stay enabled.
    pub fn enter_critical(&mut self) {
        self.sched.lock();
    }

    /// Unlock the scheduler, rescheduling when the outermost lock goes.
    pub fn exit_critical(&mut self) -> bool {
        self.sched.unlock()
    }

    /// Port hook for the context switch handler: record the outgoing
    /// task's stack pointer and return the incoming task's.
    pub fn switch_context(&mut self, psp: *mut u32) -> *mut u32 {
        match self.sched.take_switch() {
            Some((from, to)) => {
                if let Some(from) = from {
                    self.sched.task_mut(from).stack_pointer = psp;
                }
                self.sched.task(to).stack_pointer
            }
            None => psp,
        }
    }

    /// One round of the timer service task: fire queued soft timers, then
    /// sleep until more arrive.
    pub fn timer_task_step(&mut self) {
        self.timer_soft_check();
        if let (Some(timer), Some(cur)) = (self.timer_task, self.sched.current()) {
            if timer == cur && !self.soft_timers_pending() {
                self.park(cur);
                self.reschedule();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Suspension plumbing shared by every blocking primitive
    // -----------------------------------------------------------------------

    #[inline]
    pub(crate) fn reschedule(&mut self) -> bool {
        self.sched.schedule()
    }

    /// The running task, for calls that only make sense in task context.
    pub(crate) fn running(&self) -> TaskId {
        match self.sched.current() {
            Some(cur) => cur,
            None => crate::error::fatal("task-context call before the scheduler started", file!(), line!()),
        }
    }

    /// Take `task` out of scheduling until an explicit resume.
    fn park(&mut self, task: TaskId) {
        self.sched.suspend(task);
        let tcb = self.sched.task_mut(task);
        tcb.pend_on = PendOn::Suspend;
        tcb.pend_status = PendStatus::Pending;
    }

    /// Suspend the running task on `pend_on`, arming its timer unless
    /// `timeout` is [`WAIT_FOREVER`]. The caller queues it on the object's
    /// wait list and reschedules.
    pub(crate) fn block_current(&mut self, pend_on: PendOn, timeout: u32) -> TaskId {
        let cur = self.running();
        self.sched.suspend(cur);
        let tcb = self.sched.task_mut(cur);
        tcb.pend_on = pend_on;
        tcb.pend_status = PendStatus::Pending;
        if timeout != WAIT_FOREVER {
            self.arm_task_timer(cur, timeout);
        }
        cur
    }

    /// End `task`'s suspension with `status`. Whichever of timeout, release
    /// or resume gets here first wins; later calls find the task no longer
    /// pending and do nothing.
    pub(crate) fn wake(&mut self, task: TaskId, status: PendStatus) -> bool {
        if !self.sched.task(task).is_pending() {
            return false;
        }
        match self.sched.task(task).pend_on {
            PendOn::Semaphore(sem) => self.sem_unlink_waiter(sem, task),
            PendOn::Mutex(mutex) => self.mutex_unlink_waiter(mutex, task),
            PendOn::Delay | PendOn::Suspend | PendOn::Nothing => {}
        }
        if let Some(timer) = self.sched.task(task).timer {
            let _ = self.timers.stop(timer);
        }
        let tcb = self.sched.task_mut(task);
        tcb.pend_on = PendOn::Nothing;
        tcb.pend_status = status;
        self.sched.insert_ready(task);
        true
    }

    /// A task's private timer fired.
    pub(crate) fn pend_timeout(&mut self, task: TaskId) {
        let status = match self.sched.task(task).pend_on {
            PendOn::Delay => PendStatus::Ok,
            _ => PendStatus::Timeout,
        };
        self.wake(task, status);
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Host test harness
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::testing::{boot, spawn};
    use super::*;

    #[test]
    fn test_start_picks_most_important() {
        let mut k = boot();
        spawn(&mut k, "low", 10);
        let hi = spawn(&mut k, "high", 3);
        assert_eq!(k.start(), Some(hi));
        assert_eq!(k.task_state(hi), TaskState::Running);
        assert_eq!(k.task_state(k.timer_task.unwrap()), TaskState::Suspended);
    }

    #[test]
    fn test_task_lookup_by_name() {
        let mut k = boot();
        let a = spawn(&mut k, "sensor", 8);
        assert_eq!(k.task_by_name("sensor"), Some(a));
        assert_eq!(k.task_by_name("idle"), k.idle_task);
        assert_eq!(k.task_by_name("nobody"), None);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_name_is_fatal() {
        let mut k = boot();
        spawn(&mut k, "twin", 8);
        spawn(&mut k, "twin", 9);
    }

    #[test]
    fn test_registration_preempts_after_start() {
        let mut k = boot();
        let low = spawn(&mut k, "low", 10);
        k.start();
        let hi = spawn(&mut k, "high", 2);
        assert_eq!(k.current_task(), Some(hi));
        assert_eq!(k.task_state(low), TaskState::Ready);
    }

    #[test]
    fn test_delay_wakes_after_ticks() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        k.start();
        k.delay(3);
        assert_eq!(k.current_task(), Some(b));
        k.tick();
        k.tick();
        assert_eq!(k.task_state(a), TaskState::Suspended);
        k.tick();
        assert_eq!(k.current_task(), Some(a), "delay elapsed, a preempts b");
        assert_eq!(k.pend_result(a), PendStatus::Ok);
    }

    #[test]
    fn test_suspend_resume() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        k.start();
        k.suspend(a).unwrap();
        assert_eq!(k.current_task(), Some(b));
        assert_eq!(k.suspend(a), Err(KernelError::InvalidState));
        k.resume(a).unwrap();
        assert_eq!(k.current_task(), Some(a));
        assert_eq!(k.resume(a), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_resume_beats_delay_timer() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        spawn(&mut k, "b", 6);
        k.start();
        k.delay(10);
        k.resume(a).unwrap();
        assert_eq!(k.current_task(), Some(a));
        for _ in 0..20 {
            k.tick();
        }
        assert_eq!(k.current_task(), Some(a), "stale timeout must not disturb a");
        assert_eq!(k.task_state(a), TaskState::Running);
    }

    #[test]
    fn test_exit_and_cleanup() {
        let mut k = boot();
        let a = spawn(&mut k, "worker", 5);
        k.start();
        let sems_before = k.sems.len();
        k.exit();
        assert_eq!(k.task_state(a), TaskState::Closed);
        assert_eq!(k.current_task(), k.idle_task);
        assert_eq!(k.idle_cleanup(), 1);
        assert_eq!(k.task_by_name("worker"), None);
        assert_eq!(k.sems.len(), sems_before - 1, "private semaphore released");
        let again = spawn(&mut k, "worker", 5);
        assert_eq!(again, a, "slot is reusable after cleanup");
    }

    #[test]
    fn test_set_priority_reorders() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        k.start();
        k.set_priority(b, 1);
        assert_eq!(k.current_task(), Some(b));
        assert_eq!(k.task_priority(b), 1);
        assert_eq!(k.task_state(a), TaskState::Ready);
    }

    #[test]
    fn test_scheduler_lock_defers_preemption() {
        let mut k = boot();
        let low = spawn(&mut k, "low", 9);
        k.start();
        k.enter_critical();
        let hi = spawn(&mut k, "hi", 1);
        assert_eq!(k.current_task(), Some(low));
        assert!(k.exit_critical());
        assert_eq!(k.current_task(), Some(hi));
    }

    #[test]
    fn test_time_conversion() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(WAIT_FOREVER), WAIT_FOREVER);
        let mut k = Kernel::new();
        for _ in 0..250 {
            k.tick();
        }
        assert_eq!(k.get_time_ms(), 250 * 1000 / TICK_HZ);
    }
}
