//! # Counting Semaphore
//!
//! A counter plus a wait list. `count > 0` implies nobody is waiting:
//! a release with waiters hands the unit straight to the next waiter
//! instead of incrementing.
//!
//! Every task owns one semaphore, created at registration, which the event
//! layer posts whenever an event is addressed to the task.

use crate::config::SEM_VALUE_MAX;
use crate::error::{KernelError, Result};
use crate::kernel::{Kernel, Wait};
use crate::slab::Handle;
use crate::task::{PendOn, PendStatus, TaskControlBlock, TaskId};
use crate::wait::{WaitList, WaitOrder};

/// Handle to a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemId(pub(crate) Handle);

pub struct Semaphore {
    count: u16,
    waiters: WaitList,
}

impl Semaphore {
    #[inline]
    pub fn count(&self) -> u16 {
        self.count
    }

    pub(crate) fn reposition(&mut self, tasks: &mut [TaskControlBlock], task: TaskId) {
        self.waiters.reposition(tasks, task);
    }
}

impl Kernel {
    pub fn sem_create(&mut self, value: u16, order: WaitOrder) -> Result<SemId> {
        let sem = Semaphore {
            count: value.min(SEM_VALUE_MAX),
            waiters: WaitList::new(order),
        };
        self.sems.insert(sem).map(SemId).map_err(|_| {
            log::warn!("semaphore pool exhausted");
            KernelError::Full
        })
    }

    /// Take one unit, blocking the running task for up to `timeout` ticks
    /// when none is available. `timeout == 0` never blocks.
    pub fn sem_take(&mut self, id: SemId, timeout: u32) -> Result<Wait<()>> {
        let sem = self.sems.get_mut(id.0).ok_or(KernelError::NotFound)?;
        if sem.count > 0 {
            sem.count -= 1;
            return Ok(Wait::Ready(()));
        }
        if timeout == 0 {
            return Err(KernelError::Timeout);
        }

        let cur = self.block_current(PendOn::Semaphore(id), timeout);
        if let Some(sem) = self.sems.get_mut(id.0) {
            sem.waiters.push(&mut self.sched.tasks, cur);
        }
        self.reschedule();
        Ok(Wait::Blocked)
    }

    pub fn sem_try_take(&mut self, id: SemId) -> Result<()> {
        self.sem_take(id, 0).map(|_| ())
    }

    /// Release one unit. Safe from interrupt context.
    ///
    /// The next waiter, if any, receives the unit directly. Otherwise the
    /// count grows, and a count already at `SEM_VALUE_MAX` is reported as
    /// [`KernelError::Overflow`].
    pub fn sem_release(&mut self, id: SemId) -> Result<()> {
        let sem = self.sems.get_mut(id.0).ok_or(KernelError::NotFound)?;
        match sem.waiters.pop_front(&mut self.sched.tasks) {
            Some(waiter) => {
                self.wake(waiter, PendStatus::Ok);
                self.reschedule();
                Ok(())
            }
            None if sem.count >= SEM_VALUE_MAX => Err(KernelError::Overflow),
            None => {
                sem.count += 1;
                Ok(())
            }
        }
    }

    pub fn sem_value(&self, id: SemId) -> Result<u16> {
        self.sems.get(id.0).map(Semaphore::count).ok_or(KernelError::NotFound)
    }

    /// Destroy the semaphore. Waiters wake with [`PendStatus::Detached`].
    pub fn sem_delete(&mut self, id: SemId) -> Result<()> {
        let mut sem = self.sems.remove(id.0).ok_or(KernelError::NotFound)?;
        while let Some(waiter) = sem.waiters.pop_front(&mut self.sched.tasks) {
            self.wake(waiter, PendStatus::Detached);
        }
        self.reschedule();
        Ok(())
    }

    /// Take `task` off the wait list after a timeout or an interrupted wait.
    pub(crate) fn sem_unlink_waiter(&mut self, id: SemId, task: TaskId) {
        if let Some(sem) = self.sems.get_mut(id.0) {
            if sem.waiters.contains(&self.sched.tasks, task) {
                sem.waiters.remove(&mut self.sched.tasks, task);
            }
        }
    }

    /// Map a finished wait to the caller-facing result.
    pub fn pend_outcome(&self, task: TaskId) -> Result<()> {
        match self.pend_result(task) {
            PendStatus::Ok => Ok(()),
            PendStatus::Timeout => Err(KernelError::Timeout),
            PendStatus::Detached => Err(KernelError::Detached),
            PendStatus::Interrupted => Err(KernelError::Interrupted),
            PendStatus::Pending => Err(KernelError::InvalidState),
        }
    }
}
