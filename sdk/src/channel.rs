//! Message composition helpers
//!
//! The send/receive specs are scatter lists of raw pointers; these helpers
//! cover the shapes services actually use, so call sites stay free of
//! pointer plumbing.

use sable_abi::{
    MessageFlags, MessageLength, RawHandle, ReceiveMessage, SendMessage, SendMessageData,
};

use crate::syscall;
use crate::Result;

/// Send one byte buffer on a channel.
pub fn send_bytes(channel: RawHandle, data: &[u8]) -> Result<()> {
    let buffer = SendMessageData {
        length: data.len() as u64,
        data: data.as_ptr(),
    };
    let message = SendMessage {
        data_buffers_num: 1,
        data_buffers: &buffer,
        handles_buffers_num: 0,
        handles_buffers: core::ptr::null(),
    };
    syscall::channel_send(channel, &message, MessageFlags::empty())
}

/// Call and read the reply into `reply` in one step, freeing the reply
/// message afterwards.
///
/// `min_length` bounds how short the reply data may be; `None` demands an
/// exact fit.
pub fn channel_call_read(
    channel: RawHandle,
    message: &SendMessage,
    reply: &ReceiveMessage,
    min_length: Option<&MessageLength>,
) -> Result<()> {
    let reply_handle = syscall::channel_call(channel, message)?;
    let result = syscall::message_read(
        reply_handle,
        reply,
        None,
        min_length,
        0,
        MessageFlags::FREE_MESSAGE,
    );
    if result.is_err() {
        syscall::handle_free(reply_handle);
    }
    result
}

/// Call with one request buffer and read the reply into one response
/// buffer of exactly `reply.len()` bytes.
pub fn call_bytes(channel: RawHandle, request: &[u8], reply: &mut [u8]) -> Result<()> {
    let buffer = SendMessageData {
        length: request.len() as u64,
        data: request.as_ptr(),
    };
    let message = SendMessage {
        data_buffers_num: 1,
        data_buffers: &buffer,
        handles_buffers_num: 0,
        handles_buffers: core::ptr::null(),
    };
    let receive = ReceiveMessage {
        data_length: reply.len() as u64,
        data: reply.as_mut_ptr(),
        handles_length: 0,
        handles: core::ptr::null_mut(),
    };
    channel_call_read(channel, &message, &receive, None)
}
