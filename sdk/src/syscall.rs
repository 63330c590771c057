//! Raw syscall wrappers
//!
//! Calling convention: number in `rax`, arguments in `rdi`, `rsi`, `rdx`,
//! `r10`, `r8`, `r9`; the error code returns in `rax` (0 on success). The
//! `syscall` instruction clobbers `rcx` and `r11`.

use sable_abi::syscall as nr;
use sable_abi::{
    Error, MapFlags, MessageFlags, MessageLength, MessageTag, RawHandle, ReceiveMessage,
    ResourceKind, ResourceName, SendMessage,
};

use crate::Result;

#[cfg(target_arch = "x86_64")]
unsafe fn raw_syscall(number: u64, args: [u64; 6]) -> u64 {
    let ret: u64;
    core::arch::asm!(
        "syscall",
        inlateout("rax") number => ret,
        in("rdi") args[0],
        in("rsi") args[1],
        in("rdx") args[2],
        in("r10") args[3],
        in("r8") args[4],
        in("r9") args[5],
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack)
    );
    ret
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn raw_syscall(_number: u64, _args: [u64; 6]) -> u64 {
    unimplemented!("sable only targets x86-64")
}

fn check(ret: u64) -> Result<()> {
    Error::from_syscall(ret)
}

fn option_ptr<T>(value: Option<&T>) -> u64 {
    match value {
        Some(value) => value as *const T as u64,
        None => 0,
    }
}

/// Map fresh anonymous pages over `[start, start + length)`.
pub fn map_pages(start: u64, length: u64, flags: MapFlags) -> Result<()> {
    unsafe {
        check(raw_syscall(
            nr::SYS_MAP_PAGES,
            [start, length, flags.bits(), 0, 0, 0],
        ))
    }
}

/// Terminate the calling process.
pub fn process_exit() -> ! {
    unsafe {
        raw_syscall(nr::SYS_PROCESS_EXIT, [0; 6]);
    }
    unreachable!()
}

/// Give up the rest of the timeslice.
pub fn process_yield() {
    unsafe {
        raw_syscall(nr::SYS_PROCESS_YIELD, [0; 6]);
    }
}

/// Sleep until an absolute deadline.
pub fn process_wait(deadline: i64) {
    unsafe {
        raw_syscall(nr::SYS_PROCESS_WAIT, [deadline as u64, 0, 0, 0, 0, 0]);
    }
}

/// Data and handle counts of a held message.
pub fn message_get_length(message: RawHandle) -> Result<MessageLength> {
    let mut length = MessageLength::default();
    unsafe {
        check(raw_syscall(
            nr::SYS_MESSAGE_GET_LENGTH,
            [message, &mut length as *mut MessageLength as u64, 0, 0, 0, 0],
        ))?;
    }
    Ok(length)
}

/// Read a held message into user buffers.
pub fn message_read(
    message: RawHandle,
    receive: &ReceiveMessage,
    offset: Option<&MessageLength>,
    min_length: Option<&MessageLength>,
    reply_error: u64,
    flags: MessageFlags,
) -> Result<()> {
    unsafe {
        check(raw_syscall(
            nr::SYS_MESSAGE_READ,
            [
                message,
                receive as *const ReceiveMessage as u64,
                option_ptr(offset),
                option_ptr(min_length),
                reply_error,
                flags.bits(),
            ],
        ))
    }
}

/// Create a channel; returns `(send, receive)` handles.
pub fn channel_create() -> Result<(RawHandle, RawHandle)> {
    let mut send: RawHandle = 0;
    let mut receive: RawHandle = 0;
    unsafe {
        check(raw_syscall(
            nr::SYS_CHANNEL_CREATE,
            [
                &mut send as *mut RawHandle as u64,
                &mut receive as *mut RawHandle as u64,
                0,
                0,
                0,
                0,
            ],
        ))?;
    }
    Ok((send, receive))
}

/// Fire-and-forget send.
pub fn channel_send(channel: RawHandle, message: &SendMessage, flags: MessageFlags) -> Result<()> {
    unsafe {
        check(raw_syscall(
            nr::SYS_CHANNEL_SEND,
            [
                channel,
                message as *const SendMessage as u64,
                flags.bits(),
                0,
                0,
                0,
            ],
        ))
    }
}

/// Send and block for the reply; returns the reply message handle.
pub fn channel_call(channel: RawHandle, message: &SendMessage) -> Result<RawHandle> {
    let mut reply: RawHandle = 0;
    unsafe {
        check(raw_syscall(
            nr::SYS_CHANNEL_CALL,
            [
                channel,
                message as *const SendMessage as u64,
                &mut reply as *mut RawHandle as u64,
                0,
                0,
                0,
            ],
        ))?;
    }
    Ok(reply)
}

/// Send; the reply will arrive on `mqueue` under `tag`.
pub fn channel_call_async(
    channel: RawHandle,
    message: &SendMessage,
    mqueue: RawHandle,
    tag: MessageTag,
) -> Result<()> {
    unsafe {
        check(raw_syscall(
            nr::SYS_CHANNEL_CALL_ASYNC,
            [
                channel,
                message as *const SendMessage as u64,
                mqueue,
                &tag as *const MessageTag as u64,
                0,
                0,
            ],
        ))
    }
}

/// Answer a received message. `None` replies with the empty message.
pub fn message_reply(
    message: RawHandle,
    reply: Option<&SendMessage>,
    flags: MessageFlags,
) -> Result<()> {
    unsafe {
        check(raw_syscall(
            nr::SYS_MESSAGE_REPLY,
            [message, option_ptr(reply), flags.bits(), 0, 0, 0],
        ))
    }
}

/// Answer a received message with an error code.
pub fn message_reply_error(message: RawHandle, error: Error, flags: MessageFlags) -> Result<()> {
    unsafe {
        check(raw_syscall(
            nr::SYS_MESSAGE_REPLY_ERROR,
            [message, error.code(), flags.bits(), 0, 0, 0],
        ))
    }
}

/// Create a message queue.
pub fn mqueue_create() -> Result<RawHandle> {
    let mut mqueue: RawHandle = 0;
    unsafe {
        check(raw_syscall(
            nr::SYS_MQUEUE_CREATE,
            [&mut mqueue as *mut RawHandle as u64, 0, 0, 0, 0, 0],
        ))?;
    }
    Ok(mqueue)
}

/// Dequeue the next `(tag, message)` pair, waiting until `timeout`.
pub fn mqueue_receive(
    mqueue: RawHandle,
    timeout: i64,
    flags: MessageFlags,
) -> Result<(MessageTag, RawHandle)> {
    let mut tag = MessageTag::default();
    let mut message: RawHandle = 0;
    unsafe {
        check(raw_syscall(
            nr::SYS_MQUEUE_RECEIVE,
            [
                mqueue,
                &mut tag as *mut MessageTag as u64,
                &mut message as *mut RawHandle as u64,
                timeout as u64,
                flags.bits(),
                0,
            ],
        ))?;
    }
    Ok((tag, message))
}

/// Bind a channel receive handle to a message queue under `tag`.
pub fn mqueue_add_channel(mqueue: RawHandle, channel: RawHandle, tag: MessageTag) -> Result<()> {
    unsafe {
        check(raw_syscall(
            nr::SYS_MQUEUE_ADD_CHANNEL,
            [mqueue, channel, &tag as *const MessageTag as u64, 0, 0, 0],
        ))
    }
}

/// Bind a channel-receive resource to a message queue under `tag`.
pub fn mqueue_add_channel_resource(
    mqueue: RawHandle,
    name: &ResourceName,
    tag: MessageTag,
) -> Result<()> {
    unsafe {
        check(raw_syscall(
            nr::SYS_MQUEUE_ADD_CHANNEL_RESOURCE,
            [
                mqueue,
                name as *const ResourceName as u64,
                &tag as *const MessageTag as u64,
                0,
                0,
                0,
            ],
        ))
    }
}

/// Bind a named resource to a fresh handle.
pub fn resource_get(name: &ResourceName, kind: ResourceKind) -> Result<RawHandle> {
    let mut handle: RawHandle = 0;
    unsafe {
        check(raw_syscall(
            nr::SYS_RESOURCE_GET,
            [
                name as *const ResourceName as u64,
                kind as u64,
                &mut handle as *mut RawHandle as u64,
                0,
                0,
                0,
            ],
        ))?;
    }
    Ok(handle)
}

/// Read a message resource's data without binding a handle.
pub fn message_resource_read(
    name: &ResourceName,
    buffer: &mut [u8],
    min_length: u64,
    flags: MessageFlags,
) -> Result<()> {
    unsafe {
        check(raw_syscall(
            nr::SYS_MESSAGE_RESOURCE_READ,
            [
                name as *const ResourceName as u64,
                buffer.len() as u64,
                buffer.as_mut_ptr() as u64,
                min_length,
                flags.bits(),
                0,
            ],
        ))
    }
}

/// Release a handle.
pub fn handle_free(handle: RawHandle) {
    unsafe {
        raw_syscall(nr::SYS_HANDLE_FREE, [handle, 0, 0, 0, 0, 0]);
    }
}

/// Current timestamp (100 ns ticks since the epoch).
pub fn time_get() -> i64 {
    let mut time: i64 = 0;
    unsafe {
        raw_syscall(nr::SYS_TIME_GET, [&mut time as *mut i64 as u64, 0, 0, 0, 0, 0]);
    }
    time
}

/// CPU time consumed by the calling process.
pub fn process_time_get() -> i64 {
    let mut time: i64 = 0;
    unsafe {
        raw_syscall(
            nr::SYS_PROCESS_TIME_GET,
            [&mut time as *mut i64 as u64, 0, 0, 0, 0, 0],
        );
    }
    time
}
