//! Syscall dispatch
//!
//! The entry trampoline hands over the syscall number and six register
//! arguments; everything here runs on the current process's kernel stack
//! with interrupts enabled. Every pointer argument is validated against the
//! user half before it is touched; a fault on a validated-but-unmapped page
//! is the process's own problem.
//!
//! Handles named in a request are moved out of the table for the duration
//! of the operation and restored on failure, so a failed syscall leaves the
//! table exactly as it found it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use sable_abi::syscall as nr;
use sable_abi::{
    AttachedHandleKind, MapFlags, MessageFlags, MessageLength, MessageTag, ReceiveAttachedHandle,
    ReceiveMessage, ResourceKind, ResourceName, SendAttachedHandle, SendMessage, SendMessageData,
    SendMessageHandles,
};

use crate::error::{KError, KResult};
use crate::ipc::channel::{reply_to, Channel};
use crate::ipc::message::{check_read, ReadSpec};
use crate::ipc::{AttachedHandle, Message, MessageQueue};
use crate::memory::paging::{self, verify_user_buffer};
use crate::process::{Handle, Process};
use crate::sched;
use crate::sched::wait;
use crate::time;

/// Entry point called by the syscall trampoline.
pub extern "C" fn syscall_handler(
    number: u64,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
) -> u64 {
    dispatch(number, [arg0, arg1, arg2, arg3, arg4, arg5])
}

/// Decode and run one syscall; returns the user-visible error code (0 on
/// success).
pub fn dispatch(number: u64, args: [u64; 6]) -> u64 {
    let result = match number {
        nr::SYS_MAP_PAGES => sys_map_pages(args[0], args[1], args[2]),
        nr::SYS_PROCESS_EXIT => sched::exit_current(),
        nr::SYS_PROCESS_YIELD => {
            sched::yield_current();
            Ok(())
        }
        nr::SYS_PROCESS_WAIT => wait::process_wait(args[0] as i64),
        nr::SYS_MESSAGE_GET_LENGTH => sys_message_get_length(args[0], args[1]),
        nr::SYS_MESSAGE_READ => {
            return sys_message_read(args[0], args[1], args[2], args[3], args[4], args[5]);
        }
        nr::SYS_CHANNEL_CREATE => sys_channel_create(args[0], args[1]),
        nr::SYS_CHANNEL_SEND => sys_channel_send(args[0], args[1], args[2]),
        nr::SYS_CHANNEL_CALL => return sys_channel_call(args[0], args[1], args[2]),
        nr::SYS_CHANNEL_CALL_ASYNC => {
            sys_channel_call_async(args[0], args[1], args[2], args[3])
        }
        nr::SYS_MESSAGE_REPLY => sys_message_reply(args[0], args[1], args[2]),
        nr::SYS_MESSAGE_REPLY_ERROR => sys_message_reply_error(args[0], args[1], args[2]),
        nr::SYS_MQUEUE_CREATE => sys_mqueue_create(args[0]),
        nr::SYS_MQUEUE_RECEIVE => {
            sys_mqueue_receive(args[0], args[1], args[2], args[3] as i64, args[4])
        }
        nr::SYS_MQUEUE_ADD_CHANNEL => sys_mqueue_add_channel(args[0], args[1], args[2]),
        nr::SYS_MQUEUE_ADD_CHANNEL_RESOURCE => {
            sys_mqueue_add_channel_resource(args[0], args[1], args[2])
        }
        nr::SYS_RESOURCE_GET => sys_resource_get(args[0], args[1], args[2]),
        nr::SYS_MESSAGE_RESOURCE_READ => {
            sys_message_resource_read(args[0], args[1], args[2], args[3], args[4])
        }
        nr::SYS_HANDLE_FREE => sys_handle_free(args[0]),
        nr::SYS_TIME_GET => sys_time_get(args[0]),
        nr::SYS_PROCESS_TIME_GET => sys_process_time_get(args[0]),
        _ => Err(KError::InvalidSyscall),
    };
    match result {
        Ok(()) => 0,
        Err(err) => err.syscall_code(),
    }
}

#[inline]
fn current() -> *mut Process {
    sched::current()
}

/// Copy a value out of user memory.
unsafe fn read_user<T: Copy>(ptr: u64) -> KResult<T> {
    verify_user_buffer(ptr, core::mem::size_of::<T>() as u64)?;
    Ok(core::ptr::read_unaligned(ptr as *const T))
}

/// Copy a value into user memory.
unsafe fn write_user<T: Copy>(ptr: u64, value: T) -> KResult<()> {
    verify_user_buffer(ptr, core::mem::size_of::<T>() as u64)?;
    core::ptr::write_unaligned(ptr as *mut T, value);
    Ok(())
}

unsafe fn user_slice<'a>(ptr: u64, length: u64) -> KResult<&'a [u8]> {
    verify_user_buffer(ptr, length)?;
    Ok(core::slice::from_raw_parts(ptr as *const u8, length as usize))
}

fn message_flags(raw: u64) -> KResult<MessageFlags> {
    MessageFlags::from_bits(raw).ok_or(KError::InvalidArg)
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

fn sys_map_pages(start: u64, length: u64, flags: u64) -> KResult<()> {
    let flags = MapFlags::from_bits(flags).ok_or(KError::InvalidArg)?;
    verify_user_buffer(start, length)?;
    unsafe {
        paging::map_user_pages(
            start,
            length,
            flags.contains(MapFlags::WRITE),
            flags.contains(MapFlags::EXECUTE),
        )
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Assemble an outgoing message from a user send spec.
///
/// Handles flagged `MOVE` leave the sender's table immediately; if anything
/// later fails they are restored, so the table is untouched on error.
unsafe fn gather_message(spec_ptr: u64) -> KResult<Box<Message>> {
    if spec_ptr == 0 {
        return Ok(Box::new(Message::empty()));
    }
    let spec: SendMessage = read_user(spec_ptr)?;

    // Gather the data scatter list.
    let buffers_bytes = spec
        .data_buffers_num
        .checked_mul(core::mem::size_of::<SendMessageData>() as u64)
        .ok_or(KError::InvalidArg)?;
    verify_user_buffer(spec.data_buffers as u64, buffers_bytes)?;
    let mut total: u64 = 0;
    for i in 0..spec.data_buffers_num {
        let buffer: SendMessageData = read_user(spec.data_buffers as u64 + i * 16)?;
        total = total.checked_add(buffer.length).ok_or(KError::InvalidArg)?;
    }
    let mut data = Vec::new();
    if data.try_reserve_exact(total as usize).is_err() {
        return Err(KError::NoMemory);
    }
    for i in 0..spec.data_buffers_num {
        let buffer: SendMessageData = read_user(spec.data_buffers as u64 + i * 16)?;
        data.extend_from_slice(user_slice(buffer.data as u64, buffer.length)?);
    }

    // Gather attached handles. Moves are remembered as (slot, index into
    // `handles`) so a later failure can put everything back.
    let mut handles: Vec<AttachedHandle> = Vec::new();
    let mut moved: Vec<(usize, usize)> = Vec::new();
    let result = (|| -> KResult<()> {
        let handle_buffers_bytes = spec
            .handles_buffers_num
            .checked_mul(core::mem::size_of::<SendMessageHandles>() as u64)
            .ok_or(KError::InvalidArg)?;
        verify_user_buffer(spec.handles_buffers as u64, handle_buffers_bytes)?;
        for i in 0..spec.handles_buffers_num {
            let buffer: SendMessageHandles = read_user(spec.handles_buffers as u64 + i * 16)?;
            let entries_bytes = buffer
                .length
                .checked_mul(core::mem::size_of::<SendAttachedHandle>() as u64)
                .ok_or(KError::InvalidArg)?;
            verify_user_buffer(buffer.handles as u64, entries_bytes)?;
            for j in 0..buffer.length {
                let entry: SendAttachedHandle = read_user(buffer.handles as u64 + j * 16)?;
                let attached = attach_handle(entry)?;
                if entry.flags & 1 != 0 {
                    moved.push((entry.handle as usize, handles.len()));
                }
                handles.push(attached);
            }
        }
        Ok(())
    })();
    if let Err(err) = result {
        rollback_moves(moved, handles);
        return Err(err);
    }
    Ok(Box::new(Message::new(data, handles)))
}

/// Restore moved handles to their original slots after a failed gather.
fn rollback_moves(moved: Vec<(usize, usize)>, mut handles: Vec<AttachedHandle>) {
    let current = current();
    let mut table = unsafe { (*current).handles.lock() };
    // Later indices first so earlier ones stay valid while removing.
    for &(slot, index) in moved.iter().rev() {
        let handle = match handles.remove(index) {
            AttachedHandle::ChannelSend(send) => Handle::ChannelSend(send),
            AttachedHandle::ChannelReceive(receive) => Handle::ChannelReceive(receive),
            AttachedHandle::Message(message) => Handle::Message(message),
        };
        table.put_back(slot, handle);
    }
}

/// Pull one attached handle out of the sender's table (move) or duplicate
/// it (copy; channel sends only).
unsafe fn attach_handle(entry: SendAttachedHandle) -> KResult<AttachedHandle> {
    let slot = entry.handle as usize;
    let move_it = entry.flags & 1 != 0;
    let mut table = (*current()).handles.lock();
    if move_it {
        let handle = table.take(slot)?;
        match handle {
            Handle::ChannelSend(send) => Ok(AttachedHandle::ChannelSend(send)),
            Handle::ChannelReceive(receive) => Ok(AttachedHandle::ChannelReceive(receive)),
            Handle::Message(message) => Ok(AttachedHandle::Message(message)),
            Handle::MessageQueue(mqueue) => {
                table.put_back(slot, Handle::MessageQueue(mqueue));
                Err(KError::WrongHandleType)
            }
            Handle::Empty => Err(KError::InvalidHandle),
        }
    } else {
        match table.get(slot)? {
            Handle::ChannelSend(send) => Ok(AttachedHandle::ChannelSend(send.clone())),
            Handle::Empty => Err(KError::InvalidHandle),
            _ => Err(KError::UncopyableHandleType),
        }
    }
}

fn sys_message_get_length(handle: u64, out_ptr: u64) -> KResult<()> {
    let current = current();
    let (data, handles) = unsafe {
        let table = (*current).handles.lock();
        match table.get(handle as usize)? {
            Handle::Message(message) => (message.data.len() as u64, message.handles.len() as u64),
            _ => return Err(KError::WrongHandleType),
        }
    };
    unsafe { write_user(out_ptr, MessageLength { data, handles }) }
}

/// `message_read`: deliver a held message's data and handles into user
/// buffers. Returns the raw user error code.
fn sys_message_read(
    handle: u64,
    recv_ptr: u64,
    offset_ptr: u64,
    min_ptr: u64,
    reply_error: u64,
    raw_flags: u64,
) -> u64 {
    let Ok(flags) = message_flags(raw_flags) else {
        return KError::InvalidArg.syscall_code();
    };
    let slot = handle as usize;
    let current = current();

    // Take the message out so the table lock is not held across delivery.
    let mut message = unsafe {
        let mut table = (*current).handles.lock();
        match table.take(slot) {
            Ok(Handle::Message(message)) => message,
            Ok(other) => {
                table.put_back(slot, other);
                return KError::WrongHandleType.syscall_code();
            }
            Err(err) => return err.syscall_code(),
        }
    };

    if let Some(code) = message.error {
        // Error replies deliver their code as the read result.
        if flags.contains(MessageFlags::FREE_MESSAGE) {
            return code;
        }
        unsafe { (*current).handles.lock().put_back(slot, Handle::Message(message)) };
        return code;
    }

    let result = unsafe { deliver_message(&mut message, recv_ptr, offset_ptr, min_ptr, flags) };
    match result {
        Ok(()) => {
            if !flags.contains(MessageFlags::FREE_MESSAGE) {
                unsafe {
                    (*current)
                        .handles
                        .lock()
                        .put_back(slot, Handle::Message(message));
                }
            }
            0
        }
        Err(err) => {
            if flags.contains(MessageFlags::REPLY_ON_FAILURE) {
                let _ = reply_to(&mut message, Box::new(Message::from_error(reply_error)));
                // A failed read with an error reply consumes the message.
                return err.syscall_code();
            }
            unsafe {
                (*current)
                    .handles
                    .lock()
                    .put_back(slot, Handle::Message(message));
            }
            err.syscall_code()
        }
    }
}

/// Copy message contents into the user's receive buffers and bind the
/// accepted attached handles. On failure nothing is transferred.
unsafe fn deliver_message(
    message: &mut Message,
    recv_ptr: u64,
    offset_ptr: u64,
    min_ptr: u64,
    flags: MessageFlags,
) -> KResult<()> {
    let recv: ReceiveMessage = if recv_ptr == 0 {
        ReceiveMessage {
            data_length: 0,
            data: core::ptr::null_mut(),
            handles_length: 0,
            handles: core::ptr::null_mut(),
        }
    } else {
        read_user(recv_ptr)?
    };
    let offset: MessageLength = if offset_ptr == 0 {
        MessageLength::default()
    } else {
        read_user(offset_ptr)?
    };
    let spec = ReadSpec {
        data_capacity: recv.data_length,
        handles_capacity: recv.handles_length,
        data_offset: offset.data,
        handles_offset: offset.handles,
        min_data: if min_ptr == 0 {
            recv.data_length
        } else {
            read_user::<MessageLength>(min_ptr)?.data
        },
        min_handles: if min_ptr == 0 {
            recv.handles_length
        } else {
            read_user::<MessageLength>(min_ptr)?.handles
        },
    };
    let lengths = check_read(
        message.data.len() as u64,
        message.handles.len() as u64,
        &spec,
        flags,
    )?;

    // Expected handle kinds must match before anything is bound.
    verify_user_buffer(
        recv.handles as u64,
        lengths
            .handles
            .checked_mul(core::mem::size_of::<ReceiveAttachedHandle>() as u64)
            .ok_or(KError::InvalidArg)?,
    )?;
    for i in 0..lengths.handles {
        let expected: ReceiveAttachedHandle = read_user(recv.handles as u64 + i * 16)?;
        let actual = message.handles[(spec.handles_offset + i) as usize].kind();
        if AttachedHandleKind::from_raw(expected.kind) != Some(actual) {
            return Err(KError::MessageWrongHandleType);
        }
    }

    // Copy the data window.
    verify_user_buffer(recv.data as u64, lengths.data)?;
    if lengths.data > 0 {
        core::ptr::copy_nonoverlapping(
            message.data.as_ptr().add(spec.data_offset as usize),
            recv.data,
            lengths.data as usize,
        );
    }

    // Bind the handles, rolling back on a failed add.
    let current = current();
    let mut bound: Vec<usize> = Vec::new();
    let start = spec.handles_offset as usize;
    for i in 0..lengths.handles as usize {
        let attached = message.handles.remove(start);
        let handle = match attached {
            AttachedHandle::ChannelSend(send) => Handle::ChannelSend(send),
            AttachedHandle::ChannelReceive(receive) => Handle::ChannelReceive(receive),
            AttachedHandle::Message(inner) => Handle::Message(inner),
        };
        let slot = { (*current).handles.lock().add(handle) };
        match slot {
            Ok(slot) => {
                let entry: ReceiveAttachedHandle = read_user(recv.handles as u64 + i as u64 * 16)?;
                let result = write_user(
                    recv.handles as u64 + i as u64 * 16,
                    ReceiveAttachedHandle {
                        kind: entry.kind,
                        handle: slot as u64,
                    },
                );
                if result.is_err() {
                    bound.push(slot);
                    unbind(current, &bound, message, start);
                    return Err(KError::InvalidAddress);
                }
                bound.push(slot);
            }
            Err(handle) => {
                reinsert(message, start, handle);
                unbind(current, &bound, message, start);
                return Err(KError::NoMemory);
            }
        }
    }
    Ok(())
}

/// Put a handle that failed to bind back into the message.
fn reinsert(message: &mut Message, at: usize, handle: Handle) {
    let attached = match handle {
        Handle::ChannelSend(send) => AttachedHandle::ChannelSend(send),
        Handle::ChannelReceive(receive) => AttachedHandle::ChannelReceive(receive),
        Handle::Message(inner) => AttachedHandle::Message(inner),
        Handle::MessageQueue(_) | Handle::Empty => return,
    };
    message.handles.insert(at, attached);
}

/// Undo partially bound handles: pull them back out of the table and
/// reinsert them into the message at their original position.
unsafe fn unbind(current: *mut Process, bound: &[usize], message: &mut Message, start: usize) {
    let mut table = (*current).handles.lock();
    for (i, &slot) in bound.iter().enumerate().rev() {
        if let Ok(handle) = table.take(slot) {
            let attached = match handle {
                Handle::ChannelSend(send) => AttachedHandle::ChannelSend(send),
                Handle::ChannelReceive(receive) => AttachedHandle::ChannelReceive(receive),
                Handle::Message(inner) => AttachedHandle::Message(inner),
                Handle::MessageQueue(_) | Handle::Empty => continue,
            };
            message.handles.insert(start + i, attached);
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

fn sys_channel_create(send_ptr: u64, recv_ptr: u64) -> KResult<()> {
    let current = current();
    let (send, receive) = Channel::create();
    unsafe {
        let mut table = (*current).handles.lock();
        let send_slot = table
            .add(Handle::ChannelSend(send))
            .map_err(|_| KError::NoMemory)?;
        let recv_slot = match table.add(Handle::ChannelReceive(receive)) {
            Ok(slot) => slot,
            Err(_) => {
                let _ = table.remove(send_slot);
                return Err(KError::NoMemory);
            }
        };
        drop(table);
        if let Err(err) = write_user(send_ptr, send_slot as u64) {
            let mut table = (*current).handles.lock();
            let _ = table.remove(send_slot);
            let _ = table.remove(recv_slot);
            return Err(err);
        }
        if let Err(err) = write_user(recv_ptr, recv_slot as u64) {
            let mut table = (*current).handles.lock();
            let _ = table.remove(send_slot);
            let _ = table.remove(recv_slot);
            return Err(err);
        }
    }
    Ok(())
}

unsafe fn channel_send_ref(handle: u64) -> KResult<crate::ipc::SendRef> {
    let table = (*current()).handles.lock();
    match table.get(handle as usize)? {
        Handle::ChannelSend(send) => Ok(send.clone()),
        _ => Err(KError::WrongHandleType),
    }
}

fn sys_channel_send(handle: u64, spec_ptr: u64, raw_flags: u64) -> KResult<()> {
    message_flags(raw_flags)?;
    unsafe {
        let send = channel_send_ref(handle)?;
        let message = gather_message(spec_ptr)?;
        send.send(message)
    }
}

fn sys_channel_call(handle: u64, spec_ptr: u64, reply_ptr: u64) -> u64 {
    let result = unsafe {
        (|| -> Result<Box<Message>, u64> {
            let send = channel_send_ref(handle).map_err(|err| err.syscall_code())?;
            let message = gather_message(spec_ptr).map_err(|err| err.syscall_code())?;
            send.call(message)
        })()
    };
    match result {
        Ok(reply) => unsafe {
            let slot = { (*current()).handles.lock().add(Handle::Message(reply)) };
            match slot {
                Ok(slot) => match write_user(reply_ptr, slot as u64) {
                    Ok(()) => 0,
                    Err(err) => {
                        let _ = (*current()).handles.lock().remove(slot);
                        err.syscall_code()
                    }
                },
                Err(_) => KError::NoMemory.syscall_code(),
            }
        },
        Err(code) => code,
    }
}

fn sys_channel_call_async(handle: u64, spec_ptr: u64, mqueue_handle: u64, tag_ptr: u64) -> KResult<()> {
    unsafe {
        let tag: MessageTag = read_user(tag_ptr)?;
        let send = channel_send_ref(handle)?;
        let mqueue = {
            let table = (*current()).handles.lock();
            match table.get(mqueue_handle as usize)? {
                Handle::MessageQueue(mqueue) => Arc::clone(mqueue),
                _ => return Err(KError::WrongHandleType),
            }
        };
        let message = gather_message(spec_ptr)?;
        send.call_async(message, &mqueue, tag)
    }
}

fn sys_message_reply(handle: u64, spec_ptr: u64, raw_flags: u64) -> KResult<()> {
    let flags = message_flags(raw_flags)?;
    let slot = handle as usize;
    let current = current();
    unsafe {
        let mut message = {
            let mut table = (*current).handles.lock();
            match table.take(slot)? {
                Handle::Message(message) => message,
                other => {
                    table.put_back(slot, other);
                    return Err(KError::WrongHandleType);
                }
            }
        };
        let result = (|| -> KResult<()> {
            let reply = gather_message(spec_ptr)?;
            reply_to(&mut message, reply)
        })();
        if result.is_err() || !flags.contains(MessageFlags::FREE_MESSAGE) {
            (*current)
                .handles
                .lock()
                .put_back(slot, Handle::Message(message));
        }
        result
    }
}

fn sys_message_reply_error(handle: u64, error: u64, raw_flags: u64) -> KResult<()> {
    let flags = message_flags(raw_flags)?;
    if error == 0 {
        return Err(KError::InvalidArg);
    }
    let slot = handle as usize;
    let current = current();
    unsafe {
        let mut message = {
            let mut table = (*current).handles.lock();
            match table.take(slot)? {
                Handle::Message(message) => message,
                other => {
                    table.put_back(slot, other);
                    return Err(KError::WrongHandleType);
                }
            }
        };
        let result = reply_to(&mut message, Box::new(Message::from_error(error)));
        if result.is_err() || !flags.contains(MessageFlags::FREE_MESSAGE) {
            (*current)
                .handles
                .lock()
                .put_back(slot, Handle::Message(message));
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Message queues
// ---------------------------------------------------------------------------

fn sys_mqueue_create(out_ptr: u64) -> KResult<()> {
    let current = current();
    unsafe {
        let mqueue = MessageQueue::create();
        let slot = {
            (*current)
                .handles
                .lock()
                .add(Handle::MessageQueue(mqueue))
                .map_err(|_| KError::NoMemory)?
        };
        if let Err(err) = write_user(out_ptr, slot as u64) {
            let _ = (*current).handles.lock().remove(slot);
            return Err(err);
        }
    }
    Ok(())
}

unsafe fn mqueue_ref(handle: u64) -> KResult<Arc<MessageQueue>> {
    let table = (*current()).handles.lock();
    match table.get(handle as usize)? {
        Handle::MessageQueue(mqueue) => Ok(Arc::clone(mqueue)),
        _ => Err(KError::WrongHandleType),
    }
}

fn sys_mqueue_receive(
    mqueue_handle: u64,
    tag_ptr: u64,
    msg_ptr: u64,
    timeout: i64,
    raw_flags: u64,
) -> KResult<()> {
    let flags = message_flags(raw_flags)?;
    unsafe {
        // Validate the output pointers before blocking, not after.
        verify_user_buffer(tag_ptr, core::mem::size_of::<MessageTag>() as u64)?;
        verify_user_buffer(msg_ptr, 8)?;
        let mqueue = mqueue_ref(mqueue_handle)?;
        let (tag, message) = mqueue.receive(timeout, flags)?;
        match (*current()).handles.lock().add(Handle::Message(message)) {
            Ok(slot) => {
                write_user(tag_ptr, tag)?;
                write_user(msg_ptr, slot as u64)?;
                Ok(())
            }
            Err(Handle::Message(message)) => {
                // The message could not be bound; put it back for the next
                // receive instead of dropping it.
                mqueue.unreceive(tag, message);
                Err(KError::NoMemory)
            }
            Err(_) => Err(KError::NoMemory),
        }
    }
}

fn sys_mqueue_add_channel(mqueue_handle: u64, channel_handle: u64, tag_ptr: u64) -> KResult<()> {
    let current = current();
    unsafe {
        let tag: MessageTag = read_user(tag_ptr)?;
        let mqueue = mqueue_ref(mqueue_handle)?;
        let slot = channel_handle as usize;
        let receiver = {
            let mut table = (*current).handles.lock();
            match table.take(slot)? {
                Handle::ChannelReceive(receiver) => receiver,
                other => {
                    table.put_back(slot, other);
                    return Err(KError::WrongHandleType);
                }
            }
        };
        match MessageQueue::attach(&mqueue, receiver, tag) {
            Ok(()) => Ok(()),
            Err((err, receiver)) => {
                (*current)
                    .handles
                    .lock()
                    .put_back(slot, Handle::ChannelReceive(receiver));
                Err(err)
            }
        }
    }
}

fn sys_mqueue_add_channel_resource(mqueue_handle: u64, name_ptr: u64, tag_ptr: u64) -> KResult<()> {
    let current = current();
    unsafe {
        let name: ResourceName = read_user(name_ptr)?;
        let tag: MessageTag = read_user(tag_ptr)?;
        let mqueue = mqueue_ref(mqueue_handle)?;
        let receiver = match (*current).resources.get(&name, ResourceKind::ChannelReceive)? {
            Handle::ChannelReceive(receiver) => receiver,
            _ => return Err(KError::WrongResourceType),
        };
        MessageQueue::attach(&mqueue, receiver, tag).map_err(|(err, _)| err)
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

fn sys_resource_get(name_ptr: u64, kind_raw: u64, out_ptr: u64) -> KResult<()> {
    let current = current();
    unsafe {
        let name: ResourceName = read_user(name_ptr)?;
        let kind = ResourceKind::from_raw(kind_raw).ok_or(KError::InvalidArg)?;
        let handle = (*current).resources.get(&name, kind)?;
        let slot = {
            (*current)
                .handles
                .lock()
                .add(handle)
                .map_err(|_| KError::NoMemory)?
        };
        if let Err(err) = write_user(out_ptr, slot as u64) {
            let _ = (*current).handles.lock().remove(slot);
            return Err(err);
        }
    }
    Ok(())
}

fn sys_message_resource_read(
    name_ptr: u64,
    data_length: u64,
    data_ptr: u64,
    min_data_length: u64,
    raw_flags: u64,
) -> KResult<()> {
    let flags = message_flags(raw_flags)?;
    let current = current();
    unsafe {
        let name: ResourceName = read_user(name_ptr)?;
        verify_user_buffer(data_ptr, data_length)?;
        (*current).resources.with_message(&name, |message| {
            let spec = ReadSpec {
                data_capacity: data_length,
                handles_capacity: 0,
                data_offset: 0,
                handles_offset: 0,
                min_data: min_data_length.min(data_length),
                min_handles: 0,
            };
            let lengths = check_read(message.data.len() as u64, 0, &spec, flags)?;
            if lengths.data > 0 {
                core::ptr::copy_nonoverlapping(
                    message.data.as_ptr(),
                    data_ptr as *mut u8,
                    lengths.data as usize,
                );
            }
            Ok(())
        })?
    }
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

fn sys_handle_free(handle: u64) -> KResult<()> {
    unsafe { (*current()).handles.lock().remove(handle as usize) }
}

fn sys_time_get(out_ptr: u64) -> KResult<()> {
    unsafe { write_user(out_ptr, time::now()) }
}

fn sys_process_time_get(out_ptr: u64) -> KResult<()> {
    unsafe { write_user(out_ptr, time::process_time()) }
}
