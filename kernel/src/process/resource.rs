//! Resource namespaces
//!
//! Each process carries an immutable map from 32-byte names to capabilities,
//! assembled by its parent at spawn time. Channel resources can be bound to
//! handles any number of times; a message resource moves out on first use
//! and the name is invalid afterwards.

use alloc::boxed::Box;
use alloc::vec::Vec;

use sable_abi::{ResourceKind, ResourceName};
use spin::Mutex;

use crate::error::{KError, KResult};
use crate::ipc::{Message, ReceiveRef, SendRef};
use crate::process::handle::Handle;

/// A named capability.
pub enum Resource {
    Empty,
    ChannelSend(SendRef),
    ChannelReceive(ReceiveRef),
    Message(Box<Message>),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Empty => ResourceKind::Empty,
            Resource::ChannelSend(_) => ResourceKind::ChannelSend,
            Resource::ChannelReceive(_) => ResourceKind::ChannelReceive,
            Resource::Message(_) => ResourceKind::Message,
        }
    }
}

/// The per-process name → capability map.
pub struct ResourceMap {
    entries: Mutex<Vec<(ResourceName, Resource)>>,
}

impl ResourceMap {
    pub fn new(entries: Vec<(ResourceName, Resource)>) -> ResourceMap {
        ResourceMap {
            entries: Mutex::new(entries),
        }
    }

    pub fn empty() -> ResourceMap {
        ResourceMap::new(Vec::new())
    }

    /// Bind the named resource to a fresh handle, checking its kind.
    ///
    /// Channel resources are duplicated; a message resource is moved out of
    /// the map, so a second lookup fails with `InvalidResource`.
    pub fn get(&self, name: &ResourceName, expected: ResourceKind) -> KResult<Handle> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|(entry_name, _)| entry_name == name)
            .map(|(_, resource)| resource)
            .ok_or(KError::InvalidResource)?;
        if entry.kind() != expected {
            return Err(KError::WrongResourceType);
        }
        match entry {
            Resource::Empty => Err(KError::InvalidResource),
            Resource::ChannelSend(send) => Ok(Handle::ChannelSend(send.clone())),
            Resource::ChannelReceive(receive) => Ok(Handle::ChannelReceive(receive.duplicate())),
            Resource::Message(_) => {
                let Resource::Message(message) = core::mem::replace(entry, Resource::Empty) else {
                    unreachable!();
                };
                Ok(Handle::Message(message))
            }
        }
    }

    /// Run `f` over the named message resource without consuming it.
    pub fn with_message<R>(
        &self,
        name: &ResourceName,
        f: impl FnOnce(&Message) -> R,
    ) -> KResult<R> {
        let entries = self.entries.lock();
        let resource = entries
            .iter()
            .find(|(entry_name, _)| entry_name == name)
            .map(|(_, resource)| resource)
            .ok_or(KError::InvalidResource)?;
        match resource {
            Resource::Message(message) => Ok(f(message)),
            Resource::Empty => Err(KError::InvalidResource),
            _ => Err(KError::WrongResourceType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Channel;
    use alloc::vec;

    #[test]
    fn lookup_is_by_name_and_kind() {
        let (tx, _rx) = Channel::create();
        let map = ResourceMap::new(vec![(
            ResourceName::new("drive/read"),
            Resource::ChannelSend(tx),
        )]);

        assert!(map
            .get(&ResourceName::new("drive/read"), ResourceKind::ChannelSend)
            .is_ok());
        assert!(matches!(
            map.get(&ResourceName::new("drive/read"), ResourceKind::ChannelReceive),
            Err(KError::WrongResourceType)
        ));
        assert!(matches!(
            map.get(&ResourceName::new("missing"), ResourceKind::ChannelSend),
            Err(KError::InvalidResource)
        ));
    }

    #[test]
    fn channel_resources_can_be_bound_repeatedly() {
        let (tx, _rx) = Channel::create();
        let map = ResourceMap::new(vec![(
            ResourceName::new("svc/send"),
            Resource::ChannelSend(tx),
        )]);
        let name = ResourceName::new("svc/send");
        assert!(map.get(&name, ResourceKind::ChannelSend).is_ok());
        assert!(map.get(&name, ResourceKind::ChannelSend).is_ok());
    }

    #[test]
    fn message_resources_move_out_once() {
        let map = ResourceMap::new(vec![(
            ResourceName::new("drive/info"),
            Resource::Message(Box::new(Message::new(vec![1, 2, 3], vec![]))),
        )]);
        let name = ResourceName::new("drive/info");
        let handle = map.get(&name, ResourceKind::Message).unwrap();
        assert!(matches!(handle, Handle::Message(_)));
        assert!(matches!(
            map.get(&name, ResourceKind::Message),
            Err(KError::InvalidResource)
        ));
    }

    #[test]
    fn with_message_reads_in_place() {
        let map = ResourceMap::new(vec![(
            ResourceName::new("drive/info"),
            Resource::Message(Box::new(Message::new(vec![9, 9], vec![]))),
        )]);
        let name = ResourceName::new("drive/info");
        let len = map.with_message(&name, |message| message.data.len()).unwrap();
        assert_eq!(len, 2);
        // Reading in place does not consume the resource.
        assert!(map.with_message(&name, |_| ()).is_ok());
    }
}
