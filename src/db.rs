//! # Database
//!
//! Named value slots and byte streams backed by the kernel heap. A database
//! key is an event object with a storage slot attached, so tasks subscribe
//! to it like to any topic and hear about every write.
//!
//! - **Value** keys hold one fixed-size block; reads and writes copy the
//!   whole block.
//! - **Stream** keys are bounded ring buffers; a write that does not fit is
//!   rejected whole, a read drains up to the requested length.
//!
//! Writes publish the key unless it carries `UNBLOCKED`. Keys without
//! `GLOBAL` accept writes only from the task that registered them.

use crate::error::{KernelError, Result};
use crate::heap::HeapBlock;
use crate::kernel::Kernel;
use crate::object::{Attribute, EventObject, ObjectId, ObjectKind, Payload};
use crate::task::TaskId;

/// Storage attached to a database key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbSlot {
    block: HeapBlock,
    /// Ring read position (streams).
    head: u16,
    /// Bytes stored (streams).
    len: u16,
}

impl DbSlot {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    #[inline]
    pub fn stored(&self) -> usize {
        self.len as usize
    }
}

struct Resolved {
    id: ObjectId,
    slot: DbSlot,
    attr: Attribute,
    owner: Option<TaskId>,
}

impl Kernel {
    /// Register a database key of `size` bytes. `attr` must name exactly one
    /// of `VALUE` or `STREAM`. An existing plain topic of the same name is
    /// upgraded in place; registering a database key twice is fatal.
    pub fn db_register(&mut self, key: &str, size: usize, attr: Attribute) -> Result<ObjectId> {
        let storage = attr & (Attribute::VALUE | Attribute::STREAM);
        if storage != Attribute::VALUE && storage != Attribute::STREAM {
            return Err(KernelError::WrongKind);
        }
        if size == 0 || size > u16::MAX as usize {
            return Err(KernelError::InvalidSize);
        }

        let existing = self.objects.find(ObjectKind::Event, key);
        if let Some(id) = existing {
            let registered = self
                .objects
                .get(id)
                .and_then(|o| o.event())
                .is_some_and(|e| e.db.is_some());
            crate::kernel_assert!(!registered, "database key registered twice");
        }

        let block = self.heap.alloc(size).ok_or_else(|| {
            log::warn!("heap exhausted registering '{}'", key);
            KernelError::NoMemory
        })?;
        let slot = DbSlot {
            block,
            head: 0,
            len: 0,
        };
        let owner = self.sched.current();

        let id = match existing {
            Some(id) => {
                let object = self.objects.get_mut(id).ok_or(KernelError::NotFound)?;
                object.attr = object.attr.difference(Attribute::TOPIC) | attr;
                if let Some(event) = object.event_mut() {
                    event.db = Some(slot);
                    event.owner = owner;
                }
                id
            }
            None => {
                let event = EventObject {
                    db: Some(slot),
                    owner,
                    ..EventObject::new()
                };
                match self.objects.insert(ObjectKind::Event, key, attr, Payload::Event(event)) {
                    Ok(id) => id,
                    Err(e) => {
                        self.heap.free(block);
                        return Err(e);
                    }
                }
            }
        };
        log::debug!("database key '{}' registered, {} bytes", key, size);
        Ok(id)
    }

    fn db_resolve(&self, key: &str, storage: Attribute) -> Result<Resolved> {
        let id = self
            .objects
            .find(ObjectKind::Event, key)
            .ok_or(KernelError::NotFound)?;
        let object = self.objects.get(id).ok_or(KernelError::NotFound)?;
        let event = object.event().ok_or(KernelError::WrongKind)?;
        let slot = event.db.ok_or(KernelError::WrongKind)?;
        if !object.attr.contains(storage) {
            return Err(KernelError::WrongKind);
        }
        Ok(Resolved {
            id,
            slot,
            attr: object.attr,
            owner: event.owner,
        })
    }

    fn db_check_writer(&self, entry: &Resolved) -> Result<()> {
        match entry.owner {
            Some(owner) if !entry.attr.contains(Attribute::GLOBAL) && self.sched.current() != Some(owner) => {
                Err(KernelError::NotOwner)
            }
            _ => Ok(()),
        }
    }

    fn db_store(&mut self, id: ObjectId, slot: DbSlot) {
        if let Some(event) = self.objects.get_mut(id).and_then(|o| o.event_mut()) {
            event.db = Some(slot);
        }
    }

    fn db_notify(&mut self, entry: &Resolved) {
        if entry.attr.contains(Attribute::UNBLOCKED) {
            return;
        }
        if let Err(e) = self.publish_event(entry.id) {
            log::warn!("database notification failed: {}", e);
        }
    }

    /// Overwrite a value key. `data` must match the slot size.
    pub fn db_block_write(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let entry = self.db_resolve(key, Attribute::VALUE)?;
        self.db_check_writer(&entry)?;
        if data.len() != entry.slot.capacity() {
            return Err(KernelError::InvalidSize);
        }
        self.heap.bytes_mut(&entry.slot.block).copy_from_slice(data);
        self.db_notify(&entry);
        Ok(())
    }

    /// Copy a value key out. `buf` must match the slot size.
    pub fn db_block_read(&self, key: &str, buf: &mut [u8]) -> Result<()> {
        let entry = self.db_resolve(key, Attribute::VALUE)?;
        if buf.len() != entry.slot.capacity() {
            return Err(KernelError::InvalidSize);
        }
        buf.copy_from_slice(self.heap.bytes(&entry.slot.block));
        Ok(())
    }

    /// Append to a stream key. Fails with [`KernelError::Full`], writing
    /// nothing, when `data` does not fit.
    pub fn db_stream_write(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let entry = self.db_resolve(key, Attribute::STREAM)?;
        self.db_check_writer(&entry)?;
        let mut slot = entry.slot;
        let capacity = slot.capacity();
        if data.len() > capacity - slot.stored() {
            return Err(KernelError::Full);
        }

        let tail = (slot.head as usize + slot.stored()) % capacity;
        let first = data.len().min(capacity - tail);
        let ring = self.heap.bytes_mut(&slot.block);
        ring[tail..tail + first].copy_from_slice(&data[..first]);
        ring[..data.len() - first].copy_from_slice(&data[first..]);

        slot.len += data.len() as u16;
        self.db_store(entry.id, slot);
        self.db_notify(&entry);
        Ok(())
    }

    /// Drain up to `buf.len()` bytes from a stream key. Returns the number
    /// of bytes read, 0 when the stream is empty.
    pub fn db_stream_read(&mut self, key: &str, buf: &mut [u8]) -> Result<usize> {
        let entry = self.db_resolve(key, Attribute::STREAM)?;
        let mut slot = entry.slot;
        let capacity = slot.capacity();
        let count = buf.len().min(slot.stored());

        let head = slot.head as usize;
        let first = count.min(capacity - head);
        let ring = self.heap.bytes(&slot.block);
        buf[..first].copy_from_slice(&ring[head..head + first]);
        buf[first..count].copy_from_slice(&ring[..count - first]);

        slot.head = ((head + count) % capacity) as u16;
        slot.len -= count as u16;
        self.db_store(entry.id, slot);
        Ok(count)
    }

    /// Bytes currently held by a stream key.
    pub fn db_stream_len(&self, key: &str) -> Result<usize> {
        self.db_resolve(key, Attribute::STREAM).map(|e| e.slot.stored())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::{boot, spawn};

    #[test]
    fn test_value_round_trip() {
        let mut k = boot();
        k.db_register("cfg", 4, Attribute::VALUE | Attribute::GLOBAL).unwrap();
        k.db_block_write("cfg", &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        k.db_block_read("cfg", &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        assert_eq!(k.db_block_write("cfg", &[1, 2]), Err(KernelError::InvalidSize));
        let mut short = [0u8; 3];
        assert_eq!(k.db_block_read("cfg", &mut short), Err(KernelError::InvalidSize));
        assert_eq!(k.db_stream_write("cfg", &[1]), Err(KernelError::WrongKind));
    }

    #[test]
    fn test_stream_round_trip_with_wrap() {
        let mut k = boot();
        k.db_register("log", 8, Attribute::STREAM).unwrap();
        k.db_stream_write("log", b"abcde").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(k.db_stream_read("log", &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");

        // tail sits at 5, so this write wraps around the end
        k.db_stream_write("log", b"fghijk").unwrap();
        assert_eq!(k.db_stream_len("log"), Ok(7));
        let mut all = [0u8; 16];
        let n = k.db_stream_read("log", &mut all).unwrap();
        assert_eq!(&all[..n], b"efghijk", "short read returns what is available");
        assert_eq!(k.db_stream_read("log", &mut all), Ok(0));
    }

    #[test]
    fn test_stream_full_writes_nothing() {
        let mut k = boot();
        k.db_register("s", 4, Attribute::STREAM).unwrap();
        k.db_stream_write("s", b"abc").unwrap();
        assert_eq!(k.db_stream_write("s", b"de"), Err(KernelError::Full));
        assert_eq!(k.db_stream_len("s"), Ok(3), "no partial write");
    }

    #[test]
    fn test_write_notifies_subscribers_through_resident_record() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        k.db_register("temp", 2, Attribute::VALUE | Attribute::GLOBAL).unwrap();
        k.sub_task(a, "temp").unwrap();

        k.db_block_write("temp", &[1, 0]).unwrap();
        k.db_block_write("temp", &[2, 0]).unwrap();
        assert_eq!(k.pending_records(), 1, "writes merge into one record");
        let ev = k.take_event(a, None).unwrap();
        assert_eq!(ev.topic.as_str(), "temp");
        assert!(ev.attr.contains(Attribute::VALUE));
        assert!(k.take_event(a, None).is_none());

        k.db_block_write("temp", &[3, 0]).unwrap();
        assert!(k.take_event(a, None).is_some(), "resident record requeued");
    }

    #[test]
    fn test_unblocked_key_is_silent() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        k.db_register("quiet", 1, Attribute::VALUE | Attribute::UNBLOCKED).unwrap();
        k.sub_task(a, "quiet").unwrap();
        k.db_block_write("quiet", &[9]).unwrap();
        assert_eq!(k.pending_records(), 0);
    }

    #[test]
    fn test_private_key_rejects_other_writers() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        spawn(&mut k, "b", 6);
        k.start();
        k.db_register("mine", 1, Attribute::VALUE).unwrap();
        k.db_register("ours", 1, Attribute::VALUE | Attribute::GLOBAL).unwrap();
        k.db_block_write("mine", &[1]).unwrap();

        k.suspend(a).unwrap();
        assert_eq!(k.db_block_write("mine", &[2]), Err(KernelError::NotOwner));
        assert_eq!(k.db_block_write("ours", &[2]), Ok(()));
        let mut out = [0u8; 1];
        k.db_block_read("mine", &mut out).unwrap();
        assert_eq!(out, [1], "reads are open to everyone");
    }

    #[test]
    fn test_register_upgrades_existing_topic() {
        let mut k = boot();
        let topic = k.event_object("speed").unwrap();
        let key = k.db_register("speed", 4, Attribute::VALUE).unwrap();
        assert_eq!(topic, key);
        assert!(!k.objects.get(key).unwrap().attr.contains(Attribute::TOPIC));
    }

    #[test]
    fn test_register_rejects_bad_attributes() {
        let mut k = boot();
        assert_eq!(k.db_register("x", 4, Attribute::GLOBAL).err(), Some(KernelError::WrongKind));
        assert_eq!(
            k.db_register("y", 4, Attribute::VALUE | Attribute::STREAM).err(),
            Some(KernelError::WrongKind)
        );
        assert_eq!(k.db_register("z", 0, Attribute::VALUE).err(), Some(KernelError::InvalidSize));
        assert_eq!(
            k.db_register("big", 1 << 14, Attribute::STREAM).err(),
            Some(KernelError::NoMemory)
        );
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_double_registration_is_fatal() {
        let mut k = boot();
        k.db_register("dup", 4, Attribute::VALUE).unwrap();
        let _ = k.db_register("dup", 4, Attribute::VALUE);
    }
}
