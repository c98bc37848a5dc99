//! # Events and Pub-Sub
//!
//! Events are named topics in the object table. Delivering an event
//! attaches an *event record* to the global pending queue:
//!
//! ```text
//!   pending queue (send order)
//!   ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//!   │ "Tick"       │ ─► │ "temp" (res.)│ ─► │ "Tick"       │ ─► ∅
//!   │ owners 0b010 │    │ owners 0b110 │    │ owners 0b010 │
//!   └──────────────┘    └──────────────┘    └──────────────┘
//! ```
//!
//! The owner bitmap holds one bit per task that has not consumed the
//! record yet. A task consumes a record by clearing its bit; the record
//! leaves the queue once the bitmap is empty. Topic records are freed at
//! that point. Value and stream events keep one *resident* record that
//! later deliveries merge into, so it is only unlinked.
//!
//! Each owner's private semaphore is posted per delivery. It only serves
//! as the wake-up signal: waiters always scan the queue before blocking.

use core::fmt::Write;

use heapless::Vec;

use crate::bitmap::TaskSet;
use crate::config::{EVENT_RECORD_POOL, OBJECT_TABLE_SIZE};
use crate::error::{KernelError, Result};
use crate::kernel::{ms_to_ticks, Kernel, Wait};
use crate::object::{
    make_key, Attribute, EventObject, Key, ObjectId, ObjectKind, Payload, TimedDelivery,
};
use crate::slab::{Handle, Slab};
use crate::task::TaskId;
use crate::timer::{Timer, TimerAction, TimerControl, TimerFlags, MAX_PERIOD};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Handle to an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId(pub(crate) Handle);

pub struct EventRecord {
    pub event: ObjectId,
    /// Tick of the latest delivery.
    pub tick: u32,
    pub owners: TaskSet,
    next: Option<RecordId>,
    queued: bool,
    resident: bool,
}

/// Record pool plus the singly linked pending queue.
pub struct RecordQueue {
    pool: Slab<EventRecord, EVENT_RECORD_POOL>,
    head: Option<RecordId>,
    tail: Option<RecordId>,
}

impl RecordQueue {
    pub const fn new() -> Self {
        Self {
            pool: Slab::new(),
            head: None,
            tail: None,
        }
    }

    fn alloc(&mut self, event: ObjectId, tick: u32, owners: TaskSet, resident: bool) -> Result<RecordId> {
        let record = EventRecord {
            event,
            tick,
            owners,
            next: None,
            queued: false,
            resident,
        };
        self.pool.insert(record).map(RecordId).map_err(|_| {
            log::warn!("event record pool exhausted");
            KernelError::Full
        })
    }

    pub fn get(&self, id: RecordId) -> Option<&EventRecord> {
        self.pool.get(id.0)
    }

    fn get_mut(&mut self, id: RecordId) -> Option<&mut EventRecord> {
        self.pool.get_mut(id.0)
    }

    fn enqueue(&mut self, id: RecordId) {
        match self.get_mut(id) {
            Some(record) if !record.queued => {
                record.queued = true;
                record.next = None;
            }
            _ => return,
        }
        match self.tail.and_then(|tail| self.get_mut(tail)) {
            Some(tail) => tail.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn unlink(&mut self, id: RecordId) {
        let mut prev: Option<RecordId> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let next = self.get(current).and_then(|r| r.next);
            if current == id {
                match prev.and_then(|p| self.get_mut(p)) {
                    Some(p) => p.next = next,
                    None => self.head = next,
                }
                if self.tail == Some(id) {
                    self.tail = prev;
                }
                if let Some(record) = self.get_mut(id) {
                    record.queued = false;
                    record.next = None;
                }
                return;
            }
            prev = cursor;
            cursor = next;
        }
    }

    fn free(&mut self, id: RecordId) {
        self.unlink(id);
        self.pool.remove(id.0);
    }

    /// Allocated records, queued or resident.
    #[inline]
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Queued records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = RecordId> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.get(id).and_then(|r| r.next);
            Some(id)
        })
    }
}

impl Default for RecordQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// An event as seen by the task consuming it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: ObjectId,
    pub topic: Key,
    pub attr: Attribute,
    /// Tick of the delivery.
    pub tick: u32,
}

fn delivery_key(target: Option<TaskId>, topic: &str) -> Result<Key> {
    let mut key = make_key(topic)?;
    if let Some(task) = target {
        write!(key, "@{}", task.index()).map_err(|_| KernelError::NameTooLong)?;
    }
    Ok(key)
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

impl Kernel {
    /// Look up the event object for `topic`, creating a plain topic on
    /// first use.
    pub fn event_object(&mut self, topic: &str) -> Result<ObjectId> {
        match self.objects.find(ObjectKind::Event, topic) {
            Some(id) => Ok(id),
            None => self.objects.insert(
                ObjectKind::Event,
                topic,
                Attribute::TOPIC,
                Payload::Event(EventObject::new()),
            ),
        }
    }

    /// Send `topic` to one task. Dropped silently when the task has receipt
    /// disabled or is waiting for a different specific topic.
    pub fn send(&mut self, target: TaskId, topic: &str) -> Result<()> {
        if !self.sched.task(target).active {
            return Err(KernelError::NotFound);
        }
        let event = self.event_object(topic)?;
        self.send_event(target, event)
    }

    /// Send to a task by name.
    pub fn send_to(&mut self, name: &str, topic: &str) -> Result<()> {
        let target = self.task_by_name(name).ok_or(KernelError::NotFound)?;
        self.send(target, topic)
    }

    /// Deliver `topic` to every subscriber that accepts events. Publishing
    /// a topic nobody subscribes to does nothing.
    pub fn publish(&mut self, topic: &str) -> Result<()> {
        match self.objects.find(ObjectKind::Event, topic) {
            Some(event) => self.publish_event(event),
            None => Ok(()),
        }
    }

    pub(crate) fn send_event(&mut self, target: TaskId, event: ObjectId) -> Result<()> {
        let tcb = self.sched.task(target);
        if !tcb.active {
            return Err(KernelError::NotFound);
        }
        if tcb.event_recv_disable {
            log::debug!("'{}' has receipt disabled, event dropped", tcb.name);
            return Ok(());
        }
        if tcb.wait_specific.is_some_and(|wanted| wanted != event) {
            return Ok(());
        }
        self.deliver(event, TaskSet::single(target.index()))
    }

    pub(crate) fn publish_event(&mut self, event: ObjectId) -> Result<()> {
        let subscribers = self
            .objects
            .get(event)
            .and_then(|o| o.event())
            .map(|e| e.subscribers)
            .ok_or(KernelError::NotFound)?;
        let mut owners = TaskSet::EMPTY;
        for index in subscribers.iter() {
            let tcb = &self.sched.tasks[index];
            if tcb.active && !tcb.event_recv_disable {
                owners.set(index);
            }
        }
        if owners.is_empty() {
            return Ok(());
        }
        self.deliver(event, owners)
    }

    /// Attach a record for `owners` and post each owner's semaphore.
    fn deliver(&mut self, event: ObjectId, owners: TaskSet) -> Result<()> {
        let now = self.tick;
        let object = self.objects.get_mut(event).ok_or(KernelError::NotFound)?;
        let merge = object.attr.intersects(Attribute::VALUE | Attribute::STREAM);
        let target = object.event_mut().ok_or(KernelError::WrongKind)?;

        let resident = target.resident.filter(|&id| self.records.get(id).is_some());
        let record = match resident {
            Some(id) if merge => {
                if let Some(record) = self.records.get_mut(id) {
                    record.owners = record.owners.union(owners);
                    record.tick = now;
                }
                id
            }
            _ => {
                let id = self.records.alloc(event, now, owners, merge)?;
                if merge {
                    target.resident = Some(id);
                }
                id
            }
        };
        self.records.enqueue(record);

        for index in owners.iter() {
            if let Some(sem) = self.sched.tasks[index].event_sem {
                // A saturated semaphore still wakes the task.
                let _ = self.sem_release(sem);
            }
        }
        Ok(())
    }

    /// Subscribe the running task to `topic`.
    pub fn sub(&mut self, topic: &str) -> Result<()> {
        let task = self.running();
        self.sub_task(task, topic)
    }

    pub fn sub_task(&mut self, task: TaskId, topic: &str) -> Result<()> {
        let event = self.event_object(topic)?;
        if let Some(target) = self.objects.get_mut(event).and_then(|o| o.event_mut()) {
            target.subscribers.set(task.index());
        }
        Ok(())
    }

    pub fn unsub(&mut self, topic: &str) -> Result<()> {
        let task = self.running();
        self.unsub_task(task, topic)
    }

    pub fn unsub_task(&mut self, task: TaskId, topic: &str) -> Result<()> {
        let event = self
            .objects
            .find(ObjectKind::Event, topic)
            .ok_or(KernelError::NotFound)?;
        if let Some(target) = self.objects.get_mut(event).and_then(|o| o.event_mut()) {
            target.subscribers.clear(task.index());
        }
        Ok(())
    }

    /// Wait up to `timeout` ticks for any event addressed to the running
    /// task. After a [`Wait::Blocked`] return and a successful wake-up the
    /// port layer collects the event with [`Kernel::take_event`].
    pub fn wait_event(&mut self, timeout: u32) -> Result<Wait<Event>> {
        let task = self.running();
        self.wait_for(task, None, timeout)
    }

    /// Wait for `topic` only. Sends of other topics are dropped while the
    /// task waits.
    pub fn wait_specific_event(&mut self, topic: &str, timeout: u32) -> Result<Wait<Event>> {
        let task = self.running();
        let event = self.event_object(topic)?;
        self.sched.task_mut(task).wait_specific = Some(event);
        let outcome = self.wait_for(task, Some(event), timeout);
        if !matches!(outcome, Ok(Wait::Blocked)) {
            self.clear_specific_wait(task);
        }
        outcome
    }

    pub fn clear_specific_wait(&mut self, task: TaskId) {
        self.sched.task_mut(task).wait_specific = None;
    }

    fn wait_for(&mut self, task: TaskId, filter: Option<ObjectId>, timeout: u32) -> Result<Wait<Event>> {
        let sem = self.sched.task(task).event_sem.ok_or(KernelError::InvalidState)?;
        loop {
            if let Some(event) = self.take_event(task, filter) {
                let _ = self.sem_try_take(sem);
                return Ok(Wait::Ready(event));
            }
            // A unit without a matching record is left over from a merged
            // or filtered delivery; keep draining.
            match self.sem_take(sem, timeout)? {
                Wait::Ready(()) => continue,
                Wait::Blocked => return Ok(Wait::Blocked),
            }
        }
    }

    /// Consume the oldest queued record owned by `task`, optionally only for
    /// the event `filter`.
    pub fn take_event(&mut self, task: TaskId, filter: Option<ObjectId>) -> Option<Event> {
        let bit = task.index();
        let id = self.records.iter().find(|&id| {
            self.records.get(id).is_some_and(|r| {
                r.owners.contains(bit) && filter.map_or(true, |wanted| r.event == wanted)
            })
        })?;

        let record = self.records.get_mut(id)?;
        record.owners.clear(bit);
        let (event, tick, drained, resident) =
            (record.event, record.tick, record.owners.is_empty(), record.resident);
        if drained {
            if resident {
                self.records.unlink(id);
            } else {
                self.records.free(id);
            }
        }

        let object = self.objects.get(event)?;
        Some(Event {
            id: event,
            topic: object.key.clone(),
            attr: object.attr,
            tick,
        })
    }

    /// Enable or disable event receipt for `task`.
    pub fn set_event_receive(&mut self, task: TaskId, enabled: bool) {
        self.sched.task_mut(task).event_recv_disable = !enabled;
    }

    /// Number of allocated event records.
    pub fn pending_records(&self) -> usize {
        self.records.len()
    }

    /// Drop an exited task from every subscription, record and timed
    /// delivery.
    pub(crate) fn forget_task_events(&mut self, task: TaskId) {
        let bit = task.index();
        for object in self.objects.iter_mut() {
            if let Some(event) = object.event_mut() {
                event.subscribers.clear(bit);
            }
        }

        let owned: Vec<RecordId, EVENT_RECORD_POOL> = self
            .records
            .iter()
            .filter(|&id| self.records.get(id).is_some_and(|r| r.owners.contains(bit)))
            .collect();
        for id in owned {
            let Some(record) = self.records.get_mut(id) else {
                continue;
            };
            record.owners.clear(bit);
            if record.owners.is_empty() {
                if record.resident {
                    self.records.unlink(id);
                } else {
                    self.records.free(id);
                }
            }
        }

        let timed: Vec<(ObjectId, crate::timer::TimerId), OBJECT_TABLE_SIZE> = self
            .objects
            .iter()
            .filter_map(|(id, object)| match &object.payload {
                Payload::Timer(d) if d.target == Some(task) => Some((id, d.timer)),
                _ => None,
            })
            .collect();
        for (object, timer) in timed {
            self.timers.remove(timer);
            self.objects.remove(object);
        }
    }

    // -----------------------------------------------------------------------
    // Timed delivery
    // -----------------------------------------------------------------------

    /// Send `topic` to `target` once, `ms` milliseconds from now.
    pub fn send_delay(&mut self, target: TaskId, topic: &str, ms: u32) -> Result<ObjectId> {
        self.schedule_delivery(Some(target), topic, ms, false)
    }

    /// Send `topic` to `target` every `ms` milliseconds.
    pub fn send_period(&mut self, target: TaskId, topic: &str, ms: u32) -> Result<ObjectId> {
        self.schedule_delivery(Some(target), topic, ms, true)
    }

    pub fn publish_delay(&mut self, topic: &str, ms: u32) -> Result<ObjectId> {
        self.schedule_delivery(None, topic, ms, false)
    }

    pub fn publish_period(&mut self, topic: &str, ms: u32) -> Result<ObjectId> {
        self.schedule_delivery(None, topic, ms, true)
    }

    /// Stop a delayed or periodic delivery.
    pub fn cancel_timed(&mut self, target: Option<TaskId>, topic: &str) -> Result<()> {
        let key = delivery_key(target, topic)?;
        let object = self
            .objects
            .find(ObjectKind::Timer, &key)
            .ok_or(KernelError::NotFound)?;
        match self.objects.get(object).map(|o| &o.payload) {
            Some(Payload::Timer(d)) => self.timers.stop(d.timer),
            _ => Err(KernelError::WrongKind),
        }
    }

    /// Arm the delivery timer for `(target, topic)`, reusing the timer
    /// object of an earlier request for the same pair.
    fn schedule_delivery(
        &mut self,
        target: Option<TaskId>,
        topic: &str,
        ms: u32,
        periodic: bool,
    ) -> Result<ObjectId> {
        let event = self.event_object(topic)?;
        let key = delivery_key(target, topic)?;
        let ticks = ms_to_ticks(ms).clamp(1, MAX_PERIOD);
        let flags = if periodic {
            TimerFlags::PERIODIC
        } else {
            TimerFlags::ONESHOT
        };

        let object = match self.objects.find(ObjectKind::Timer, &key) {
            Some(object) => object,
            None => {
                let timer = self
                    .timers
                    .create(Timer::new(TimerAction::Deliver { event, target }, ticks, flags))?;
                let delivery = TimedDelivery {
                    timer,
                    event,
                    target,
                };
                match self
                    .objects
                    .insert(ObjectKind::Timer, &key, Attribute::empty(), Payload::Timer(delivery))
                {
                    Ok(object) => object,
                    Err(e) => {
                        self.timers.remove(timer);
                        return Err(e);
                    }
                }
            }
        };

        let timer = match self.objects.get(object).map(|o| &o.payload) {
            Some(Payload::Timer(d)) => d.timer,
            _ => return Err(KernelError::WrongKind),
        };
        let now = self.tick;
        self.timers.control(timer, TimerControl::SetPeriod(ticks), now)?;
        let mode = if periodic {
            TimerControl::SetPeriodic
        } else {
            TimerControl::SetOneshot
        };
        self.timers.control(timer, mode, now)?;
        self.timers.start(timer, now)?;
        log::debug!("timed delivery '{}' armed for {} ticks", key, ticks);
        Ok(object)
    }

    /// Timer action for delayed and periodic deliveries.
    pub(crate) fn deliver_timed(&mut self, event: ObjectId, target: Option<TaskId>) {
        let result = match target {
            Some(task) => self.send_event(task, event),
            None => self.publish_event(event),
        };
        if let Err(e) = result {
            log::warn!("timed delivery failed: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WAIT_FOREVER;
    use crate::kernel::testing::{boot, spawn};

    #[test]
    fn test_send_then_wait() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        k.start();
        k.send(a, "ping").unwrap();
        assert_eq!(k.pending_records(), 1);
        match k.wait_event(0) {
            Ok(Wait::Ready(ev)) => assert_eq!(ev.topic.as_str(), "ping"),
            other => panic!("expected a ready event, got {:?}", other),
        }
        assert_eq!(k.pending_records(), 0, "record freed once consumed");
        assert_eq!(k.wait_event(0), Err(KernelError::Timeout));
    }

    #[test]
    fn test_send_wakes_blocked_waiter() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        k.start();
        assert_eq!(k.wait_event(WAIT_FOREVER), Ok(Wait::Blocked));
        assert_eq!(k.current_task(), Some(b));

        k.send_to("a", "go").unwrap();
        assert_eq!(k.current_task(), Some(a));
        let ev = k.take_event(a, None).expect("event waiting for a");
        assert_eq!(ev.topic.as_str(), "go");
    }

    #[test]
    fn test_publish_ownership_conservation() {
        let mut k = boot();
        let subs = [spawn(&mut k, "s0", 5), spawn(&mut k, "s1", 6), spawn(&mut k, "s2", 7)];
        for &s in &subs {
            k.sub_task(s, "news").unwrap();
        }
        k.publish("news").unwrap();
        let id = k.records.iter().next().unwrap();
        let initial = k.records.get(id).unwrap().owners;
        assert_eq!(initial.len(), 3);

        for (i, &s) in subs.iter().enumerate() {
            assert_eq!(k.pending_records(), 1, "record alive until the last owner consumes");
            assert!(k.take_event(s, None).is_some());
            if i + 1 < subs.len() {
                let owners = k.records.get(id).unwrap().owners;
                assert_eq!(owners.len() as usize, subs.len() - i - 1, "exactly one bit lost");
                assert!(!owners.contains(s.index()));
            }
        }
        assert_eq!(k.pending_records(), 0);
        assert!(k.records.get(id).is_none());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        k.publish("void").unwrap();
        k.sub_task(a, "void").unwrap();
        k.set_event_receive(a, false);
        k.publish("void").unwrap();
        assert_eq!(k.pending_records(), 0, "receipt-disabled subscribers are skipped");
    }

    #[test]
    fn test_receipt_disabled_drops_send() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        k.set_event_receive(a, false);
        k.send(a, "x").unwrap();
        assert_eq!(k.pending_records(), 0);
        k.set_event_receive(a, true);
        k.send(a, "x").unwrap();
        assert_eq!(k.pending_records(), 1);
    }

    #[test]
    fn test_specific_wait_filters_topics() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        spawn(&mut k, "b", 6);
        k.start();
        k.send(a, "early").unwrap();
        assert_eq!(k.wait_specific_event("wanted", WAIT_FOREVER), Ok(Wait::Blocked));

        k.send(a, "other").unwrap();
        assert_eq!(k.pending_records(), 1, "other topics are dropped during a specific wait");
        k.send(a, "wanted").unwrap();
        assert_eq!(k.current_task(), Some(a));

        let wanted = k.objects.find(ObjectKind::Event, "wanted");
        let ev = k.take_event(a, wanted).unwrap();
        assert_eq!(ev.topic.as_str(), "wanted");
        k.clear_specific_wait(a);

        match k.wait_event(0) {
            Ok(Wait::Ready(ev)) => assert_eq!(ev.topic.as_str(), "early"),
            other => panic!("earlier event should still be queued, got {:?}", other),
        }
    }

    #[test]
    fn test_wait_times_out() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        spawn(&mut k, "b", 6);
        k.start();
        k.wait_event(3).unwrap();
        for _ in 0..3 {
            k.tick();
        }
        assert_eq!(k.current_task(), Some(a));
        assert_eq!(k.pend_outcome(a), Err(KernelError::Timeout));
    }

    #[test]
    fn test_send_delay_fires_once() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        k.start();
        k.send_delay(a, "later", 5).unwrap();
        for _ in 0..4 {
            k.tick();
        }
        assert_eq!(k.pending_records(), 0);
        k.tick();
        assert_eq!(k.pending_records(), 1);
        for _ in 0..20 {
            k.tick();
        }
        assert_eq!(k.pending_records(), 1, "one-shot delivery");
    }

    #[test]
    fn test_publish_period_and_cancel() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        k.sub_task(a, "beat").unwrap();
        k.start();
        let first = k.publish_period("beat", 2).unwrap();
        let second = k.publish_period("beat", 2).unwrap();
        assert_eq!(first, second, "timer object reused per key");

        let mut seen = 0;
        for _ in 0..10 {
            k.tick();
            while k.take_event(a, None).is_some() {
                seen += 1;
            }
        }
        assert_eq!(seen, 5);
        k.cancel_timed(None, "beat").unwrap();
        for _ in 0..10 {
            k.tick();
        }
        assert!(k.take_event(a, None).is_none());
        assert_eq!(k.cancel_timed(Some(a), "beat"), Err(KernelError::NotFound));
    }

    #[test]
    fn test_exit_releases_records() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 6);
        k.sub_task(a, "t").unwrap();
        k.sub_task(b, "t").unwrap();
        k.start();
        k.publish("t").unwrap();
        k.exit();
        k.idle_cleanup();
        assert_eq!(k.pending_records(), 1);
        assert!(k.take_event(b, None).is_some());
        assert_eq!(k.pending_records(), 0, "exited owner no longer pins the record");
    }
}
