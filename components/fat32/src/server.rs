//! The file server loop
//!
//! One message queue multiplexes every request source: the three public
//! `file/*` channels plus one trio of read/write/resize channels per open
//! file. The tag's first word carries the request kind; the second is the
//! open-file index, so each per-file channel routes straight to its state.
//!
//! Requests are served to completion one at a time; concurrent clients are
//! naturally serialized by the queue.

use sable_abi::fs::{FileRange, VirtDriveInfo};
use sable_abi::{
    Error, MessageFlags, MessageLength, MessageTag, RawHandle, ReceiveMessage, ResourceKind,
    ResourceName, SendAttachedHandle, SendMessage, SendMessageData, SendMessageHandles,
    TIMEOUT_NONE,
};
use sable_sdk::syscall;

use crate::dir::DirEntry;
use crate::drive::ChannelDrive;
use crate::path::Located;
use crate::{FsError, Volume};

// stat replies are sent as raw bytes of this struct.
static_assertions::const_assert_eq!(core::mem::size_of::<sable_abi::fs::FileMetadata>(), 40);

const TAG_STAT: u64 = 0;
const TAG_LIST: u64 = 1;
const TAG_OPEN: u64 = 2;
const TAG_READ: u64 = 3;
const TAG_WRITE: u64 = 4;
const TAG_RESIZE: u64 = 5;

/// Per-open-file state, addressed by the index carried in the tag.
struct OpenFile {
    entry: DirEntry,
    location: Option<u64>,
}

/// Serve forever. Expects the `virt_drive/*` and `file/*` resources wired
/// by the parent.
pub fn run() -> ! {
    match serve() {
        Ok(never) => match never {},
        Err(error) => {
            log::error!("file server failed to start: {error}");
            syscall::process_exit()
        }
    }
}

enum Never {}

fn serve() -> Result<Never, FsError> {
    let transport = |error| FsError::Transport(error);

    let read_channel = syscall::resource_get(
        &ResourceName::new("virt_drive/read"),
        ResourceKind::ChannelSend,
    )
    .map_err(transport)?;
    let write_channel = syscall::resource_get(
        &ResourceName::new("virt_drive/write"),
        ResourceKind::ChannelSend,
    )
    .map_err(transport)?;

    let mut info = VirtDriveInfo {
        guid: [0; 2],
        size: 0,
    };
    let info_bytes = unsafe {
        core::slice::from_raw_parts_mut(
            &mut info as *mut VirtDriveInfo as *mut u8,
            core::mem::size_of::<VirtDriveInfo>(),
        )
    };
    syscall::message_resource_read(
        &ResourceName::new("virt_drive/info"),
        info_bytes,
        core::mem::size_of::<VirtDriveInfo>() as u64,
        MessageFlags::empty(),
    )
    .map_err(transport)?;

    let drive = ChannelDrive::new(read_channel, write_channel);
    let volume = Volume::open(drive, info.size)?;
    log::info!(
        "serving a {} byte FAT32 volume, cluster size {}",
        info.size,
        volume.geometry().cluster_size
    );

    let mqueue = syscall::mqueue_create().map_err(transport)?;
    for (name, tag) in [
        ("file/stat_r", TAG_STAT),
        ("file/list_r", TAG_LIST),
        ("file/open_r", TAG_OPEN),
    ] {
        syscall::mqueue_add_channel_resource(
            mqueue,
            &ResourceName::new(name),
            MessageTag::new(tag, 0),
        )
        .map_err(transport)?;
    }

    let mut open_files: Vec<OpenFile> = Vec::new();
    loop {
        let Ok((tag, message)) = syscall::mqueue_receive(mqueue, TIMEOUT_NONE, MessageFlags::empty())
        else {
            continue;
        };
        let result = handle_request(&volume, mqueue, &mut open_files, tag, message);
        if let Err(error) = result {
            let _ = syscall::message_reply_error(
                message,
                error.to_error(),
                MessageFlags::FREE_MESSAGE,
            );
        }
    }
}

fn handle_request(
    volume: &Volume<ChannelDrive>,
    mqueue: RawHandle,
    open_files: &mut Vec<OpenFile>,
    tag: MessageTag,
    message: RawHandle,
) -> Result<(), FsError> {
    match tag.data[0] {
        TAG_STAT => {
            let Located { entry, .. } = volume.entry_from_path(&read_path(message)?)?;
            let metadata = entry.metadata();
            reply_bytes(message, unsafe {
                core::slice::from_raw_parts(
                    &metadata as *const _ as *const u8,
                    core::mem::size_of_val(&metadata),
                )
            })
        }
        TAG_LIST => {
            let Located { entry, .. } = volume.entry_from_path(&read_path(message)?)?;
            if !entry.is_directory() {
                return Err(FsError::NotDir);
            }
            let list = volume.list_dir(entry.first_cluster())?;
            reply_bytes(message, &list)
        }
        TAG_OPEN => {
            let located = volume.entry_from_path(&read_path(message)?)?;
            open_file(mqueue, open_files, located, message)
        }
        TAG_READ => {
            let open_file = open_files
                .get(tag.data[1] as usize)
                .ok_or(FsError::IoInternal)?;
            let range = read_request::<FileRange>(message)?;
            let end = range
                .offset
                .checked_add(range.length)
                .ok_or(FsError::Eof)?;
            if end > open_file.entry.file_size as u64 {
                return Err(FsError::Eof);
            }
            if range.length == 0 {
                return reply_empty(message);
            }
            let mut data = vec![0u8; range.length as usize];
            volume.read_file(open_file.entry.first_cluster(), range.offset, &mut data)?;
            reply_bytes(message, &data)
        }
        TAG_WRITE => {
            let open_file = open_files
                .get(tag.data[1] as usize)
                .ok_or(FsError::IoInternal)?;
            let length = syscall::message_get_length(message)
                .map_err(FsError::Transport)?
                .data;
            if length < 8 {
                return Err(FsError::Transport(Error::MessageDataTooShort));
            }
            let offset = read_prefix_u64(message)?;
            let length = length - 8;
            let end = offset.checked_add(length).ok_or(FsError::Eof)?;
            if end > open_file.entry.file_size as u64 {
                return Err(FsError::Eof);
            }
            if length == 0 {
                return reply_empty(message);
            }
            let mut data = vec![0u8; length as usize];
            let receive = ReceiveMessage {
                data_length: length,
                data: data.as_mut_ptr(),
                handles_length: 0,
                handles: core::ptr::null_mut(),
            };
            syscall::message_read(
                message,
                &receive,
                Some(&MessageLength { data: 8, handles: 0 }),
                None,
                0,
                MessageFlags::empty(),
            )
            .map_err(FsError::Transport)?;
            volume.write_file(open_file.entry.first_cluster(), offset, &data)?;
            reply_empty(message)
        }
        TAG_RESIZE => {
            let index = tag.data[1] as usize;
            let new_size = read_request::<u64>(message)?;
            if new_size > u32::MAX as u64 {
                return Err(FsError::NoSpace);
            }
            let open_file = open_files.get_mut(index).ok_or(FsError::IoInternal)?;
            let location = open_file.location;
            volume.resize_file(&mut open_file.entry, location, new_size as u32)?;
            reply_empty(message)
        }
        _ => Err(FsError::IoInternal),
    }
}

/// Register an open file and hand back its read/write/resize channels.
fn open_file(
    mqueue: RawHandle,
    open_files: &mut Vec<OpenFile>,
    located: Located,
    message: RawHandle,
) -> Result<(), FsError> {
    let transport = |error| FsError::Transport(error);
    let index = open_files.len() as u64;

    let (read_send, read_recv) = syscall::channel_create().map_err(transport)?;
    let (write_send, write_recv) = syscall::channel_create().map_err(transport)?;
    let (resize_send, resize_recv) = syscall::channel_create().map_err(transport)?;
    for (recv, tag) in [
        (read_recv, TAG_READ),
        (write_recv, TAG_WRITE),
        (resize_recv, TAG_RESIZE),
    ] {
        syscall::mqueue_add_channel(mqueue, recv, MessageTag::new(tag, index))
            .map_err(transport)?;
    }
    open_files.push(OpenFile {
        entry: located.entry,
        location: located.location,
    });

    const MOVE: u64 = 1;
    let attached = [
        SendAttachedHandle {
            flags: MOVE,
            handle: read_send,
        },
        SendAttachedHandle {
            flags: MOVE,
            handle: write_send,
        },
        SendAttachedHandle {
            flags: MOVE,
            handle: resize_send,
        },
    ];
    let handle_buffer = SendMessageHandles {
        length: attached.len() as u64,
        handles: attached.as_ptr(),
    };
    let reply = SendMessage {
        data_buffers_num: 0,
        data_buffers: core::ptr::null(),
        handles_buffers_num: 1,
        handles_buffers: &handle_buffer,
    };
    syscall::message_reply(message, Some(&reply), MessageFlags::FREE_MESSAGE)
        .map_err(transport)
}

/// Read a whole message as a path.
fn read_path(message: RawHandle) -> Result<Vec<u8>, FsError> {
    let length = syscall::message_get_length(message)
        .map_err(FsError::Transport)?
        .data;
    let mut path = vec![0u8; length as usize];
    let receive = ReceiveMessage {
        data_length: length,
        data: path.as_mut_ptr(),
        handles_length: 0,
        handles: core::ptr::null_mut(),
    };
    syscall::message_read(message, &receive, None, None, 0, MessageFlags::empty())
        .map_err(FsError::Transport)?;
    Ok(path)
}

/// Read a fixed-layout request structure.
fn read_request<T: Copy + Default>(message: RawHandle) -> Result<T, FsError> {
    let mut value = T::default();
    let receive = ReceiveMessage {
        data_length: core::mem::size_of::<T>() as u64,
        data: &mut value as *mut T as *mut u8,
        handles_length: 0,
        handles: core::ptr::null_mut(),
    };
    syscall::message_read(message, &receive, None, None, 0, MessageFlags::empty())
        .map_err(FsError::Transport)?;
    Ok(value)
}

/// Read the leading `u64` of a longer message.
fn read_prefix_u64(message: RawHandle) -> Result<u64, FsError> {
    let mut value: u64 = 0;
    let receive = ReceiveMessage {
        data_length: 8,
        data: &mut value as *mut u64 as *mut u8,
        handles_length: 0,
        handles: core::ptr::null_mut(),
    };
    syscall::message_read(
        message,
        &receive,
        None,
        None,
        0,
        MessageFlags::ALLOW_PARTIAL_DATA_READ,
    )
    .map_err(FsError::Transport)?;
    Ok(value)
}

fn reply_bytes(message: RawHandle, data: &[u8]) -> Result<(), FsError> {
    let buffer = SendMessageData {
        length: data.len() as u64,
        data: data.as_ptr(),
    };
    let reply = SendMessage::from_data(&buffer);
    syscall::message_reply(message, Some(&reply), MessageFlags::FREE_MESSAGE)
        .map_err(FsError::Transport)
}

fn reply_empty(message: RawHandle) -> Result<(), FsError> {
    syscall::message_reply(message, None, MessageFlags::FREE_MESSAGE)
        .map_err(FsError::Transport)
}
