//! # Mutex
//!
//! Recursive mutex with priority inheritance.
//!
//! While a mutex is held its owner runs at least as important as every task
//! waiting for it: a more important task that has to wait boosts the owner
//! to its own priority. On the final release ownership passes to the most
//! important waiter and the old owner drops back to its base priority, or
//! to the most important waiter of a mutex it still holds.

use heapless::Vec;

use crate::config::{MAX_MUTEXES, MUTEX_HOLD_MAX};
use crate::error::{KernelError, Result};
use crate::kernel::{Kernel, Wait};
use crate::slab::Handle;
use crate::task::{PendOn, PendStatus, TaskId};
use crate::wait::{WaitList, WaitOrder};

/// Handle to a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexId(pub(crate) Handle);

pub struct Mutex {
    owner: Option<TaskId>,
    hold: u8,
    waiters: WaitList,
}

impl Kernel {
    pub fn mutex_create(&mut self) -> Result<MutexId> {
        let mutex = Mutex {
            owner: None,
            hold: 0,
            waiters: WaitList::new(WaitOrder::Priority),
        };
        self.mutexes.insert(mutex).map(MutexId).map_err(|_| {
            log::warn!("mutex pool exhausted");
            KernelError::Full
        })
    }

    /// Acquire the mutex for the running task, blocking for up to `timeout`
    /// ticks. The owner may take it again up to `MUTEX_HOLD_MAX` times.
    pub fn mutex_take(&mut self, id: MutexId, timeout: u32) -> Result<Wait<()>> {
        let cur = self.running();
        let priority = self.sched.task(cur).priority;
        let mutex = self.mutexes.get_mut(id.0).ok_or(KernelError::NotFound)?;

        let owner = match mutex.owner {
            None => {
                mutex.owner = Some(cur);
                mutex.hold = 1;
                return Ok(Wait::Ready(()));
            }
            Some(owner) if owner == cur => {
                if mutex.hold >= MUTEX_HOLD_MAX {
                    return Err(KernelError::Overflow);
                }
                mutex.hold += 1;
                return Ok(Wait::Ready(()));
            }
            Some(owner) => owner,
        };
        if timeout == 0 {
            return Err(KernelError::Timeout);
        }

        if priority < self.sched.task(owner).priority {
            log::trace!(
                "priority inheritance: '{}' boosted to {}",
                self.sched.task(owner).name,
                priority
            );
            self.change_priority(owner, priority);
        }

        self.block_current(PendOn::Mutex(id), timeout);
        if let Some(mutex) = self.mutexes.get_mut(id.0) {
            mutex.waiters.push(&mut self.sched.tasks, cur);
        }
        self.reschedule();
        Ok(Wait::Blocked)
    }

    /// Release one hold. The final release hands the mutex to the most
    /// important waiter and recomputes the old owner's priority.
    ///
    /// Releasing a mutex the running task does not own is fatal.
    pub fn mutex_release(&mut self, id: MutexId) -> Result<()> {
        let cur = self.running();
        let mutex = self.mutexes.get_mut(id.0).ok_or(KernelError::NotFound)?;
        crate::kernel_assert!(
            mutex.owner == Some(cur),
            "mutex released by a task that does not own it"
        );

        mutex.hold -= 1;
        if mutex.hold > 0 {
            return Ok(());
        }
        self.hand_off(id, cur);
        self.reschedule();
        Ok(())
    }

    /// Give up every mutex `task` holds, whatever the hold count. Used when
    /// a task exits.
    pub(crate) fn mutex_release_all(&mut self, task: TaskId) {
        let owned: Vec<MutexId, MAX_MUTEXES> = self
            .mutexes
            .iter()
            .filter(|(_, m)| m.owner == Some(task))
            .map(|(handle, _)| MutexId(handle))
            .collect();
        for id in owned {
            if let Some(mutex) = self.mutexes.get_mut(id.0) {
                mutex.hold = 0;
            }
            self.hand_off(id, task);
        }
    }

    /// Pass a fully released mutex from `owner` to its next waiter, or
    /// mark it free.
    fn hand_off(&mut self, id: MutexId, owner: TaskId) {
        let Some(mutex) = self.mutexes.get_mut(id.0) else {
            return;
        };
        let next = mutex.waiters.pop_front(&mut self.sched.tasks);
        mutex.owner = next;
        mutex.hold = u8::from(next.is_some());

        self.refresh_priority(owner);
        if let Some(waiter) = next {
            self.wake(waiter, PendStatus::Ok);
            self.refresh_priority(waiter);
        }
    }

    pub fn mutex_owner(&self, id: MutexId) -> Option<TaskId> {
        self.mutexes.get(id.0)?.owner
    }

    /// Destroy the mutex. Waiters wake with [`PendStatus::Detached`] and a
    /// boosted owner loses the boost this mutex gave it.
    pub fn mutex_delete(&mut self, id: MutexId) -> Result<()> {
        let mut mutex = self.mutexes.remove(id.0).ok_or(KernelError::NotFound)?;
        while let Some(waiter) = mutex.waiters.pop_front(&mut self.sched.tasks) {
            self.wake(waiter, PendStatus::Detached);
        }
        if let Some(owner) = mutex.owner {
            self.refresh_priority(owner);
        }
        self.reschedule();
        Ok(())
    }

    /// The priority `task` is entitled to: its base priority, raised to
    /// the most important waiter of every mutex it holds.
    fn inherited_priority(&self, task: TaskId) -> u8 {
        self.mutexes
            .iter()
            .filter(|(_, m)| m.owner == Some(task))
            .filter_map(|(_, m)| m.waiters.head())
            .map(|waiter| self.sched.task(waiter).priority)
            .fold(self.sched.task(task).base_priority, u8::min)
    }

    /// Bring `task`'s scheduled priority in line with
    /// [`Kernel::inherited_priority`].
    pub(crate) fn refresh_priority(&mut self, task: TaskId) {
        let target = self.inherited_priority(task);
        if self.sched.task(task).priority != target {
            self.change_priority(task, target);
        }
    }

    /// Recompute the owner's priority after a waiter left other than by
    /// acquiring.
    pub(crate) fn refresh_owner_priority(&mut self, id: MutexId) {
        if let Some(owner) = self.mutexes.get(id.0).and_then(|m| m.owner) {
            self.refresh_priority(owner);
        }
    }

    pub(crate) fn mutex_unlink_waiter(&mut self, id: MutexId, task: TaskId) {
        let Some(mutex) = self.mutexes.get_mut(id.0) else {
            return;
        };
        if mutex.waiters.contains(&self.sched.tasks, task) {
            mutex.waiters.remove(&mut self.sched.tasks, task);
            self.refresh_owner_priority(id);
        }
    }

    /// Set a task's scheduled priority and keep every structure ordered by
    /// priority consistent: its ready list, the wait list it sits on, and
    /// the owner of a mutex it waits for.
    pub(crate) fn change_priority(&mut self, task: TaskId, priority: u8) {
        self.sched.set_priority(task, priority);
        match self.sched.task(task).pend_on {
            PendOn::Semaphore(sem) => {
                if let Some(sem) = self.sems.get_mut(sem.0) {
                    sem.reposition(&mut self.sched.tasks, task);
                }
            }
            PendOn::Mutex(mutex) => {
                if let Some(m) = self.mutexes.get_mut(mutex.0) {
                    m.waiters.reposition(&mut self.sched.tasks, task);
                }
                self.refresh_owner_priority(mutex);
            }
            PendOn::Delay | PendOn::Suspend | PendOn::Nothing => {}
        }
    }
}
