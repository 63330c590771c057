//! Handle tables
//!
//! A dense per-process array of capability slots. Handles are plain indices;
//! slot 0 is as valid as any other. Dropping a slot releases whatever it
//! held: channel endpoints adjust their refcounts, messages free their data
//! and everything attached to them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KError, KResult};
use crate::ipc::{Message, MessageQueue, ReceiveRef, SendRef};

const DEFAULT_LENGTH: usize = 8;

/// One capability slot.
pub enum Handle {
    Empty,
    Message(Box<Message>),
    ChannelSend(SendRef),
    ChannelReceive(ReceiveRef),
    MessageQueue(Arc<MessageQueue>),
}

impl Handle {
    pub fn is_empty(&self) -> bool {
        matches!(self, Handle::Empty)
    }
}

/// A process's capability table.
pub struct HandleTable {
    slots: Vec<Handle>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        let mut slots = Vec::with_capacity(DEFAULT_LENGTH);
        slots.resize_with(DEFAULT_LENGTH, || Handle::Empty);
        HandleTable { slots }
    }

    /// Store a handle in the first empty slot, doubling the table when
    /// full. On allocation failure the handle is handed back untouched.
    pub fn add(&mut self, handle: Handle) -> Result<usize, Handle> {
        if let Some(i) = self.slots.iter().position(Handle::is_empty) {
            self.slots[i] = handle;
            return Ok(i);
        }
        let i = self.slots.len();
        if self.slots.try_reserve(self.slots.len()).is_err() {
            return Err(handle);
        }
        self.slots.resize_with(2 * i, || Handle::Empty);
        self.slots[i] = handle;
        Ok(i)
    }

    /// Borrow the handle in a slot.
    pub fn get(&self, i: usize) -> KResult<&Handle> {
        match self.slots.get(i) {
            None | Some(Handle::Empty) => Err(KError::InvalidHandle),
            Some(handle) => Ok(handle),
        }
    }

    /// Mutably borrow the handle in a slot.
    pub fn get_mut(&mut self, i: usize) -> KResult<&mut Handle> {
        match self.slots.get_mut(i) {
            None | Some(Handle::Empty) => Err(KError::InvalidHandle),
            Some(handle) => Ok(handle),
        }
    }

    /// Move the handle out of a slot, leaving it empty.
    pub fn take(&mut self, i: usize) -> KResult<Handle> {
        match self.slots.get_mut(i) {
            None | Some(Handle::Empty) => Err(KError::InvalidHandle),
            Some(slot) => Ok(core::mem::replace(slot, Handle::Empty)),
        }
    }

    /// Free the capability in a slot.
    pub fn remove(&mut self, i: usize) -> KResult<()> {
        self.take(i).map(drop)
    }

    /// Restore a handle to a specific slot (rollback of a failed transfer).
    pub fn put_back(&mut self, i: usize, handle: Handle) {
        if let Some(slot) = self.slots.get_mut(i) {
            *slot = handle;
        }
    }
}

impl Default for HandleTable {
    fn default() -> HandleTable {
        HandleTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Channel;

    #[test]
    fn slots_are_reused_lowest_first() {
        let mut table = HandleTable::new();
        let (tx, _rx) = Channel::create();
        let a = table.add(Handle::ChannelSend(tx.clone())).ok().unwrap();
        let b = table.add(Handle::ChannelSend(tx.clone())).ok().unwrap();
        assert_eq!((a, b), (0, 1));

        table.remove(a).unwrap();
        let c = table.add(Handle::ChannelSend(tx)).ok().unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn table_grows_past_default_size() {
        let mut table = HandleTable::new();
        let (tx, _rx) = Channel::create();
        for i in 0..DEFAULT_LENGTH * 2 + 1 {
            assert_eq!(table.add(Handle::ChannelSend(tx.clone())).ok().unwrap(), i);
        }
    }

    #[test]
    fn empty_and_out_of_range_slots_are_invalid() {
        let mut table = HandleTable::new();
        assert!(matches!(table.get(0), Err(KError::InvalidHandle)));
        assert!(matches!(table.get(10_000), Err(KError::InvalidHandle)));
        assert!(matches!(table.remove(3), Err(KError::InvalidHandle)));
    }

    #[test]
    fn dropping_a_slot_releases_the_endpoint() {
        let mut table = HandleTable::new();
        let (tx, rx) = Channel::create();
        let i = table.add(Handle::ChannelSend(tx)).ok().unwrap();
        table.remove(i).unwrap();
        assert_eq!(
            rx.receive(true).map(|_| ()),
            Err(KError::ChannelClosed)
        );
    }

    #[test]
    fn take_leaves_the_slot_empty() {
        let mut table = HandleTable::new();
        let (tx, _rx) = Channel::create();
        let i = table.add(Handle::ChannelSend(tx)).ok().unwrap();
        let handle = table.take(i).unwrap();
        assert!(matches!(handle, Handle::ChannelSend(_)));
        assert!(matches!(table.get(i), Err(KError::InvalidHandle)));
        table.put_back(i, handle);
        assert!(table.get(i).is_ok());
    }
}
