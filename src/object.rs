//! # Object Table
//!
//! One global, fixed-capacity, open-addressed hash table maps names to
//! kernel objects: tasks, event topics (including database keys) and timed
//! deliveries.
//!
//! ## Addressing
//!
//! The home slot of a key is a BKDR hash over a one-byte type prefix and
//! the name, modulo the (prime) table size. Collisions probe outward from
//! home, alternating sides:
//!
//! ```text
//!   probe:   0    1    2    3    4    5   ...  OBJECT_TABLE_PROBE - 1
//!   offset:  0   +1   -1   +2   -2   +3   ...
//! ```
//!
//! Lookups visit every probe position, so removals never need tombstones.
//! Running out of probe positions on insert is fatal: collisions are a
//! sizing problem to fix at build time, not a runtime condition.

use bitflags::bitflags;
use heapless::String;

use crate::bitmap::TaskSet;
use crate::config::{KEY_LEN, OBJECT_TABLE_PROBE, OBJECT_TABLE_SIZE};
use crate::db::DbSlot;
use crate::error::{KernelError, Result};
use crate::event::RecordId;
use crate::task::TaskId;
use crate::timer::TimerId;

const HASH_SEED: u32 = 131;

/// Object name, bounded to `KEY_LEN` bytes.
pub type Key = String<KEY_LEN>;

pub fn make_key(name: &str) -> Result<Key> {
    let mut key = Key::new();
    key.push_str(name).map_err(|_| KernelError::NameTooLong)?;
    Ok(key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Task,
    Event,
    Timer,
}

impl ObjectKind {
    /// Type prefix mixed into the hash, so a task and a topic may share a
    /// name.
    const fn prefix(self) -> u8 {
        match self {
            ObjectKind::Task => b'T',
            ObjectKind::Event => b'E',
            ObjectKind::Timer => b'M',
        }
    }
}

bitflags! {
    /// Attributes of event objects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Attribute: u8 {
        /// Database key writable by every task, not only its registrant.
        const GLOBAL = 1 << 0;
        /// Database writes do not notify subscribers.
        const UNBLOCKED = 1 << 1;
        /// Plain topic: every delivery allocates a fresh record.
        const TOPIC = 1 << 2;
        /// Fixed-size value slot; deliveries merge into one resident record.
        const VALUE = 1 << 3;
        /// Byte stream; deliveries merge into one resident record.
        const STREAM = 1 << 4;
    }
}

/// Table index plus generation of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub(crate) index: u16,
    pub(crate) generation: u16,
}

pub struct EventObject {
    pub subscribers: TaskSet,
    /// Record reused by every delivery of a value or stream event.
    pub resident: Option<RecordId>,
    pub db: Option<DbSlot>,
    /// Task that registered the database key.
    pub owner: Option<TaskId>,
}

impl EventObject {
    pub const fn new() -> Self {
        Self {
            subscribers: TaskSet::EMPTY,
            resident: None,
            db: None,
            owner: None,
        }
    }
}

/// A delayed or periodic event delivery.
pub struct TimedDelivery {
    pub timer: TimerId,
    pub event: ObjectId,
    /// `None` publishes to the topic's subscribers.
    pub target: Option<TaskId>,
}

pub enum Payload {
    Task(TaskId),
    Event(EventObject),
    Timer(TimedDelivery),
}

pub struct Object {
    pub kind: ObjectKind,
    pub key: Key,
    pub attr: Attribute,
    pub payload: Payload,
}

impl Object {
    pub fn event(&self) -> Option<&EventObject> {
        match &self.payload {
            Payload::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn event_mut(&mut self) -> Option<&mut EventObject> {
        match &mut self.payload {
            Payload::Event(event) => Some(event),
            _ => None,
        }
    }
}

struct Slot {
    generation: u16,
    object: Option<Object>,
}

pub struct ObjectTable {
    slots: [Slot; OBJECT_TABLE_SIZE],
    len: usize,
}

fn hash(kind: ObjectKind, name: &str) -> usize {
    let h = core::iter::once(kind.prefix())
        .chain(name.bytes())
        .fold(0u32, |h, b| h.wrapping_mul(HASH_SEED).wrapping_add(b as u32));
    h as usize % OBJECT_TABLE_SIZE
}

/// Slot visited by probe number `step` for a key whose home is `home`.
fn probe(home: usize, step: usize) -> usize {
    let distance = (step + 1) / 2;
    if step % 2 == 1 {
        (home + distance) % OBJECT_TABLE_SIZE
    } else {
        (home + OBJECT_TABLE_SIZE - distance % OBJECT_TABLE_SIZE) % OBJECT_TABLE_SIZE
    }
}

impl ObjectTable {
    pub const fn new() -> Self {
        Self {
            slots: [const {
                Slot {
                    generation: 0,
                    object: None,
                }
            }; OBJECT_TABLE_SIZE],
            len: 0,
        }
    }

    pub fn find(&self, kind: ObjectKind, name: &str) -> Option<ObjectId> {
        let home = hash(kind, name);
        (0..OBJECT_TABLE_PROBE).map(|step| probe(home, step)).find_map(|index| {
            let slot = &self.slots[index];
            match &slot.object {
                Some(object) if object.kind == kind && object.key.as_str() == name => Some(ObjectId {
                    index: index as u16,
                    generation: slot.generation,
                }),
                _ => None,
            }
        })
    }

    /// Insert a new object. The caller makes sure the key is not taken.
    pub fn insert(
        &mut self,
        kind: ObjectKind,
        name: &str,
        attr: Attribute,
        payload: Payload,
    ) -> Result<ObjectId> {
        let key = make_key(name)?;
        let home = hash(kind, name);
        let index = (0..OBJECT_TABLE_PROBE)
            .map(|step| probe(home, step))
            .find(|&index| self.slots[index].object.is_none());
        let Some(index) = index else {
            crate::error::fatal("object table exhausted", file!(), line!());
        };

        let slot = &mut self.slots[index];
        slot.object = Some(Object {
            kind,
            key,
            attr,
            payload,
        });
        self.len += 1;
        log::debug!("object '{}' ({:?}) stored at slot {}", name, kind, index);
        Ok(ObjectId {
            index: index as u16,
            generation: slot.generation,
        })
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(object)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.object.as_mut()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &Object)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let object = slot.object.as_ref()?;
            let id = ObjectId {
                index: index as u16,
                generation: slot.generation,
            };
            Some((id, object))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.slots.iter_mut().filter_map(|slot| slot.object.as_mut())
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
