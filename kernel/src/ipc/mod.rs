//! Inter-process communication
//!
//! - `message`: messages and receive-spec validation
//! - `channel`: reference-counted channels with send/receive endpoints,
//!   call/reply correlation
//! - `mqueue`: message queues multiplexing many receive endpoints

pub mod channel;
pub mod message;
pub mod mqueue;

pub use channel::{Channel, ReceiveRef, SendRef};
pub use message::{AttachedHandle, Message};
pub use mqueue::MessageQueue;
