//! Wait lists for blocking primitives.
//!
//! A [`WaitList`] threads blocked tasks through their `pend_link`, so a task
//! can sit on at most one wait list at a time. FIFO lists serve waiters in
//! arrival order; priority lists keep the most important waiter at the head
//! and fall back to arrival order among equal priorities.

use crate::task::{Link, TaskControlBlock, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOrder {
    Fifo,
    Priority,
}

pub struct WaitList {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    order: WaitOrder,
}

impl WaitList {
    pub const fn new(order: WaitOrder) -> Self {
        Self {
            head: None,
            tail: None,
            order,
        }
    }

    #[inline]
    pub fn order(&self) -> WaitOrder {
        self.order
    }

    #[inline]
    pub fn head(&self) -> Option<TaskId> {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Queue `id` according to the list's order.
    pub fn push(&mut self, tasks: &mut [TaskControlBlock], id: TaskId) {
        let before = match self.order {
            WaitOrder::Fifo => None,
            WaitOrder::Priority => {
                let priority = tasks[id.index()].priority;
                self.iter(tasks).find(|t| tasks[t.index()].priority > priority)
            }
        };

        match before {
            None => {
                tasks[id.index()].pend_link = Link {
                    prev: self.tail,
                    next: None,
                };
                match self.tail {
                    Some(tail) => tasks[tail.index()].pend_link.next = Some(id),
                    None => self.head = Some(id),
                }
                self.tail = Some(id);
            }
            Some(next) => {
                let prev = tasks[next.index()].pend_link.prev;
                tasks[id.index()].pend_link = Link {
                    prev,
                    next: Some(next),
                };
                tasks[next.index()].pend_link.prev = Some(id);
                match prev {
                    Some(prev) => tasks[prev.index()].pend_link.next = Some(id),
                    None => self.head = Some(id),
                }
            }
        }
    }

    /// Unlink `id`. The caller guarantees it is on this list.
    pub fn remove(&mut self, tasks: &mut [TaskControlBlock], id: TaskId) {
        let Link { prev, next } = tasks[id.index()].pend_link;
        match prev {
            Some(prev) => tasks[prev.index()].pend_link.next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => tasks[next.index()].pend_link.prev = prev,
            None => self.tail = prev,
        }
        tasks[id.index()].pend_link = Link::DETACHED;
    }

    pub fn pop_front(&mut self, tasks: &mut [TaskControlBlock]) -> Option<TaskId> {
        let head = self.head?;
        self.remove(tasks, head);
        Some(head)
    }

    pub fn contains(&self, tasks: &[TaskControlBlock], id: TaskId) -> bool {
        self.iter(tasks).any(|t| t == id)
    }

    /// Move `id` to its place after a priority change.
    pub fn reposition(&mut self, tasks: &mut [TaskControlBlock], id: TaskId) {
        if self.order == WaitOrder::Priority {
            self.remove(tasks, id);
            self.push(tasks, id);
        }
    }

    /// Waiters, head first.
    pub fn iter<'a>(&self, tasks: &'a [TaskControlBlock]) -> impl Iterator<Item = TaskId> + 'a {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = tasks[id.index()].pend_link.next;
            Some(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskConfig;

    fn table(priorities: &[u8]) -> Vec<TaskControlBlock> {
        priorities
            .iter()
            .enumerate()
            .map(|(i, &priority)| {
                let mut tcb = TaskControlBlock::EMPTY;
                tcb.init(TaskId(i as u8), &TaskConfig { name: "w", priority, time_slice: 1, param: 0 });
                tcb
            })
            .collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut tasks = table(&[5, 1, 3]);
        let mut list = WaitList::new(WaitOrder::Fifo);
        for i in 0..3 {
            list.push(&mut tasks, TaskId(i));
        }
        let order: Vec<TaskId> = list.iter(&tasks).collect();
        assert_eq!(order, vec![TaskId(0), TaskId(1), TaskId(2)]);
    }

    #[test]
    fn test_priority_order_stable_among_equals() {
        let mut tasks = table(&[5, 1, 3, 1]);
        let mut list = WaitList::new(WaitOrder::Priority);
        for i in 0..4 {
            list.push(&mut tasks, TaskId(i));
        }
        let order: Vec<TaskId> = list.iter(&tasks).collect();
        assert_eq!(order, vec![TaskId(1), TaskId(3), TaskId(2), TaskId(0)]);
        assert_eq!(list.pop_front(&mut tasks), Some(TaskId(1)));
        assert_eq!(list.head(), Some(TaskId(3)));
    }

    #[test]
    fn test_remove_middle_and_reposition() {
        let mut tasks = table(&[4, 4, 4]);
        let mut list = WaitList::new(WaitOrder::Priority);
        for i in 0..3 {
            list.push(&mut tasks, TaskId(i));
        }
        list.remove(&mut tasks, TaskId(1));
        assert!(!list.contains(&tasks, TaskId(1)));

        tasks[2].priority = 0;
        list.reposition(&mut tasks, TaskId(2));
        let order: Vec<TaskId> = list.iter(&tasks).collect();
        assert_eq!(order, vec![TaskId(2), TaskId(0)]);
        assert_eq!(list.pop_front(&mut tasks), Some(TaskId(2)));
        assert_eq!(list.pop_front(&mut tasks), Some(TaskId(0)));
        assert!(list.is_empty());
    }
}
