//! Sable kernel/user ABI
//!
//! Types shared verbatim between the kernel and user space: error codes,
//! syscall numbers and flags, the message wire structures read by the kernel
//! during `channel_send`/`message_read`, resource names, and the structures
//! exchanged with the drive and file services.
//!
//! Everything in this crate is `#[repr(C)]` or `#[repr(u64)]` and must not
//! change layout without bumping the syscall ABI.

#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod fs;
pub mod message;
pub mod resource;
pub mod syscall;
pub mod time;

pub use error::Error;
pub use message::{
    AttachFlags, AttachedHandleKind, MapFlags, MessageFlags, MessageLength, MessageTag,
    ReceiveAttachedHandle, ReceiveMessage, SendAttachedHandle, SendMessage, SendMessageData,
    SendMessageHandles,
};
pub use resource::{ResourceKind, ResourceName, RESOURCE_NAME_MAX};

/// A handle value as passed through syscall registers.
///
/// Handles are small integers local to a process; slot 0 is valid.
pub type RawHandle = u64;

/// Blocking operations that take a timeout treat this value as "no timeout".
pub const TIMEOUT_NONE: i64 = i64::MAX;
