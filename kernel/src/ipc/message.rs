//! Messages
//!
//! A message is an owned byte payload plus an ordered sequence of attached
//! capabilities, transported by value through a channel. A message created
//! by `channel_call` additionally carries the send end of its reply channel;
//! replying consumes that end, so a message can be answered exactly once.

use alloc::boxed::Box;
use alloc::vec::Vec;

use sable_abi::{AttachedHandleKind, MessageFlags};

use crate::error::{KError, KResult};
use crate::ipc::channel::{ReceiveRef, SendRef};

/// A capability riding on a message.
pub enum AttachedHandle {
    ChannelSend(SendRef),
    ChannelReceive(ReceiveRef),
    Message(Box<Message>),
}

impl AttachedHandle {
    pub fn kind(&self) -> AttachedHandleKind {
        match self {
            AttachedHandle::ChannelSend(_) => AttachedHandleKind::ChannelSend,
            AttachedHandle::ChannelReceive(_) => AttachedHandleKind::ChannelReceive,
            AttachedHandle::Message(_) => AttachedHandleKind::Message,
        }
    }
}

/// A message in flight or held by a receiver.
pub struct Message {
    pub data: Vec<u8>,
    pub handles: Vec<AttachedHandle>,
    /// Send end of the reply channel, present on messages sent with
    /// `channel_call` or `channel_call_async`.
    pub reply: Option<SendRef>,
    /// Error replies carry a user error code instead of a payload.
    pub error: Option<u64>,
}

impl Message {
    pub fn new(data: Vec<u8>, handles: Vec<AttachedHandle>) -> Message {
        Message {
            data,
            handles,
            reply: None,
            error: None,
        }
    }

    /// The empty message, used for bare acknowledgement replies.
    pub fn empty() -> Message {
        Message::new(Vec::new(), Vec::new())
    }

    /// An error reply carrying a user error code.
    pub fn from_error(code: u64) -> Message {
        let mut message = Message::empty();
        message.error = Some(code);
        message
    }
}

/// How much of a message a receive spec accepts, before any copying.
///
/// `offset` skips message bytes and handles that an earlier partial read
/// already consumed. `min_data`/`min_handles` default to the buffer lengths,
/// so without the partial flags a read demands an exact fit.
#[derive(Debug, Clone, Copy)]
pub struct ReadSpec {
    pub data_capacity: u64,
    pub handles_capacity: u64,
    pub data_offset: u64,
    pub handles_offset: u64,
    pub min_data: u64,
    pub min_handles: u64,
}

impl ReadSpec {
    /// Exact-fit spec: the message must have precisely the buffer's size.
    pub fn exact(data_capacity: u64, handles_capacity: u64) -> ReadSpec {
        ReadSpec {
            data_capacity,
            handles_capacity,
            data_offset: 0,
            handles_offset: 0,
            min_data: data_capacity,
            min_handles: handles_capacity,
        }
    }
}

/// Lengths a read will actually copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLengths {
    pub data: u64,
    pub handles: u64,
}

/// Validate a read spec against a message's lengths.
///
/// Applied before anything is copied, so a failed read has no effect.
pub fn check_read(
    message_data_len: u64,
    message_handles_len: u64,
    spec: &ReadSpec,
    flags: MessageFlags,
) -> KResult<ReadLengths> {
    let data_available = message_data_len.saturating_sub(spec.data_offset);
    let handles_available = message_handles_len.saturating_sub(spec.handles_offset);

    if data_available < spec.min_data {
        return Err(KError::MessageDataTooShort);
    }
    if data_available > spec.data_capacity && !flags.contains(MessageFlags::ALLOW_PARTIAL_DATA_READ)
    {
        return Err(KError::MessageDataTooLong);
    }
    if handles_available < spec.min_handles {
        return Err(KError::MessageHandlesTooShort);
    }
    if handles_available > spec.handles_capacity
        && !flags.contains(MessageFlags::ALLOW_PARTIAL_HANDLES_READ)
    {
        return Err(KError::MessageHandlesTooLong);
    }
    Ok(ReadLengths {
        data: data_available.min(spec.data_capacity),
        handles: handles_available.min(spec.handles_capacity),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_fit_passes() {
        let spec = ReadSpec::exact(16, 0);
        let lengths = check_read(16, 0, &spec, MessageFlags::empty()).unwrap();
        assert_eq!(lengths, ReadLengths { data: 16, handles: 0 });
    }

    #[test]
    fn short_message_is_rejected() {
        let spec = ReadSpec::exact(16, 0);
        assert_eq!(
            check_read(15, 0, &spec, MessageFlags::empty()),
            Err(KError::MessageDataTooShort)
        );
    }

    #[test]
    fn long_message_needs_partial_flag() {
        let spec = ReadSpec::exact(16, 0);
        assert_eq!(
            check_read(17, 0, &spec, MessageFlags::empty()),
            Err(KError::MessageDataTooLong)
        );
        let lengths =
            check_read(17, 0, &spec, MessageFlags::ALLOW_PARTIAL_DATA_READ).unwrap();
        assert_eq!(lengths.data, 16);
    }

    #[test]
    fn handle_counts_are_checked() {
        let spec = ReadSpec::exact(0, 2);
        assert_eq!(
            check_read(0, 1, &spec, MessageFlags::empty()),
            Err(KError::MessageHandlesTooShort)
        );
        assert_eq!(
            check_read(0, 3, &spec, MessageFlags::empty()),
            Err(KError::MessageHandlesTooLong)
        );
        let lengths =
            check_read(0, 3, &spec, MessageFlags::ALLOW_PARTIAL_HANDLES_READ).unwrap();
        assert_eq!(lengths.handles, 2);
    }

    #[test]
    fn offset_consumes_prefix() {
        // Reading the body after an 8-byte header was already read.
        let spec = ReadSpec {
            data_capacity: 8,
            handles_capacity: 0,
            data_offset: 8,
            handles_offset: 0,
            min_data: 8,
            min_handles: 0,
        };
        let lengths = check_read(16, 0, &spec, MessageFlags::empty()).unwrap();
        assert_eq!(lengths.data, 8);
        assert_eq!(
            check_read(8, 0, &spec, MessageFlags::empty()),
            Err(KError::MessageDataTooShort)
        );
    }

    #[test]
    fn min_length_can_relax_exactness() {
        // A spec that tolerates 0..=64 bytes.
        let spec = ReadSpec {
            data_capacity: 64,
            handles_capacity: 0,
            data_offset: 0,
            handles_offset: 0,
            min_data: 0,
            min_handles: 0,
        };
        assert_eq!(
            check_read(10, 0, &spec, MessageFlags::empty()).unwrap().data,
            10
        );
        assert_eq!(
            check_read(0, 0, &spec, MessageFlags::empty()).unwrap().data,
            0
        );
    }
}
