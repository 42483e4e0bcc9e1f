//! Session-scoped numbered pipes (`|N`, `!N`).
//!
//! A slot is created with `remaining = N` and aged once per executed Line.
//! At `remaining == 0` the slot is due: its read end feeds the first stage of
//! the Line being run. A slot that ages below zero was never consumed and is
//! closed. Lookup for tag N is by `remaining == N`, so Lines tagged with a
//! number that lands on the same future Line share one slot.

use std::io;
use std::os::fd::OwnedFd;

use tracing::debug;

use crate::fd::discard_in_background;

#[derive(Debug)]
struct Slot {
    remaining: i32,
    reader: OwnedFd,
    writer: OwnedFd,
}

#[derive(Debug, Default)]
pub struct NumberedPipeTable {
    slots: Vec<Slot>,
}

impl NumberedPipeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Age every slot by one Line, closing those that were never consumed.
    /// Their unread contents are drained in the background so producers
    /// still writing can finish. Returns how many slots were closed.
    pub fn age(&mut self) -> usize {
        for slot in &mut self.slots {
            slot.remaining -= 1;
        }
        let (live, expired): (Vec<Slot>, Vec<Slot>) = std::mem::take(&mut self.slots)
            .into_iter()
            .partition(|slot| slot.remaining >= 0);
        self.slots = live;
        let count = expired.len();
        for slot in expired {
            discard_in_background(slot.reader);
        }
        if count > 0 {
            debug!(expired = count, "numbered pipes expired unread");
        }
        count
    }

    /// A duplicate of the due slot's read end, if a slot is due this Line.
    pub fn due_reader(&self) -> io::Result<Option<OwnedFd>> {
        self.slots
            .iter()
            .find(|slot| slot.remaining == 0)
            .map(|slot| slot.reader.try_clone())
            .transpose()
    }

    /// Close the due slot once its reader has been handed to a stage.
    pub fn close_due(&mut self) {
        self.slots.retain(|slot| slot.remaining != 0);
    }

    /// A duplicate of the write end of the slot for tag `count`, if one
    /// already exists.
    pub fn writer(&self, count: u16) -> io::Result<Option<OwnedFd>> {
        let remaining = i32::from(count);
        self.slots
            .iter()
            .find(|slot| slot.remaining == remaining)
            .map(|slot| slot.writer.try_clone())
            .transpose()
    }

    /// Register a fresh pipe for tag `count` and return a duplicate of its
    /// write end.
    pub fn insert(&mut self, count: u16, reader: OwnedFd, writer: OwnedFd) -> io::Result<OwnedFd> {
        let handle = writer.try_clone()?;
        self.slots.push(Slot {
            remaining: i32::from(count),
            reader,
            writer,
        });
        debug!(count, "numbered pipe created");
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
