//! Message wire structures
//!
//! `channel_send`, `channel_call`, `message_reply` and `message_read` take
//! pointers to the structures below. Send payloads are described as scatter
//! lists so callers can compose a header and a body without an intermediate
//! copy; the kernel gathers them into one contiguous message.

use bitflags::bitflags;
use static_assertions::assert_eq_size;

bitflags! {
    /// Flags accepted by the message syscalls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u64 {
        /// Fail with `WouldBlock` instead of blocking.
        const NONBLOCK = 1 << 0;
        /// Accept a message whose data is longer than the receive buffer.
        const ALLOW_PARTIAL_DATA_READ = 1 << 1;
        /// Accept a message with more attached handles than the spec lists.
        const ALLOW_PARTIAL_HANDLES_READ = 1 << 2;
        /// Free the message handle after a successful read or reply.
        const FREE_MESSAGE = 1 << 3;
        /// Report an expired deadline even if a message is ready.
        const PRIORITIZE_TIMEOUT = 1 << 4;
        /// On a failed read, reply to the message with the caller's error code.
        const REPLY_ON_FAILURE = 1 << 5;
    }
}

bitflags! {
    /// Flags for `map_pages`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const WRITE = 1 << 0;
        const EXECUTE = 1 << 1;
    }
}

bitflags! {
    /// Per-handle flags in a send spec.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttachFlags: u64 {
        /// Remove the handle from the sender's table instead of copying it.
        const MOVE = 1 << 0;
    }
}

/// Kind of a handle attached to a message.
///
/// Only channel sends may be attached by copy; everything else moves.
/// Message queues are not transferable at all.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachedHandleKind {
    ChannelSend = 0,
    ChannelReceive = 1,
    Message = 2,
}

impl AttachedHandleKind {
    pub fn from_raw(raw: u64) -> Option<AttachedHandleKind> {
        match raw {
            0 => Some(AttachedHandleKind::ChannelSend),
            1 => Some(AttachedHandleKind::ChannelReceive),
            2 => Some(AttachedHandleKind::Message),
            _ => None,
        }
    }
}

/// Data and handle lengths of a message, as reported by `message_get_length`
/// and consumed as the `offset`/`min_length` arguments of `message_read`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageLength {
    pub data: u64,
    pub handles: u64,
}

/// Tag delivered with every message dequeued from a message queue.
///
/// The value is chosen when a channel is attached and is opaque to the
/// kernel; servers typically store a request discriminant and a context
/// pointer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageTag {
    pub data: [u64; 2],
}

impl MessageTag {
    pub const fn new(d0: u64, d1: u64) -> MessageTag {
        MessageTag { data: [d0, d1] }
    }
}

/// One attached handle in a send spec.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SendAttachedHandle {
    /// `AttachFlags` bits.
    pub flags: u64,
    /// Index into the sender's handle table.
    pub handle: u64,
}

/// One expected handle slot in a receive spec.
///
/// `kind` is filled in by the caller with the expected
/// `AttachedHandleKind`; the kernel writes the bound handle index into
/// `handle` on success.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReceiveAttachedHandle {
    pub kind: u64,
    pub handle: u64,
}

/// One data buffer in a send scatter list.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SendMessageData {
    pub length: u64,
    pub data: *const u8,
}

/// One handle buffer in a send scatter list.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SendMessageHandles {
    pub length: u64,
    pub handles: *const SendAttachedHandle,
}

/// Full description of an outgoing message.
///
/// A null pointer passed where a `SendMessage` is expected stands for the
/// empty message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SendMessage {
    pub data_buffers_num: u64,
    pub data_buffers: *const SendMessageData,
    pub handles_buffers_num: u64,
    pub handles_buffers: *const SendMessageHandles,
}

impl SendMessage {
    /// A send spec with a single data buffer and no handles.
    pub const fn from_data(buffer: &SendMessageData) -> SendMessage {
        SendMessage {
            data_buffers_num: 1,
            data_buffers: buffer,
            handles_buffers_num: 0,
            handles_buffers: core::ptr::null(),
        }
    }
}

/// Full description of where to place a received message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReceiveMessage {
    pub data_length: u64,
    pub data: *mut u8,
    pub handles_length: u64,
    pub handles: *mut ReceiveAttachedHandle,
}

// These cross the syscall boundary by pointer; keep their layout honest.
assert_eq_size!(MessageLength, [u64; 2]);
assert_eq_size!(MessageTag, [u64; 2]);
assert_eq_size!(SendAttachedHandle, [u64; 2]);
assert_eq_size!(ReceiveAttachedHandle, [u64; 2]);
assert_eq_size!(SendMessage, [u64; 4]);
assert_eq_size!(ReceiveMessage, [u64; 4]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_kind_round_trip() {
        for kind in [
            AttachedHandleKind::ChannelSend,
            AttachedHandleKind::ChannelReceive,
            AttachedHandleKind::Message,
        ] {
            assert_eq!(AttachedHandleKind::from_raw(kind as u64), Some(kind));
        }
        assert_eq!(AttachedHandleKind::from_raw(3), None);
    }

    #[test]
    fn flags_are_distinct() {
        let all = MessageFlags::all();
        assert_eq!(all.bits().count_ones(), 6);
        assert!(all.contains(MessageFlags::REPLY_ON_FAILURE));
    }
}
