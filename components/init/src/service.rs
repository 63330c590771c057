//! The init flow
//!
//! Opens every physical drive, discovers its partitions, and spawns one
//! FAT32 server per partition. Each server receives a drive window scoped
//! to its partition plus freshly created `file/*` service channels; init
//! keeps the send ends to hand to later consumers.

use sable_abi::fs::{PhysDriveInfo, PhysDriveOpenArgs, VirtDriveInfo};
use sable_abi::{
    AttachedHandleKind, MessageFlags, MessageLength, RawHandle, ReceiveAttachedHandle,
    ReceiveMessage, ResourceKind, ResourceName, SendAttachedHandle, SendMessage, SendMessageData,
    SendMessageHandles, RESOURCE_NAME_MAX,
};
use sable_sdk::channel::channel_call_read;
use sable_sdk::syscall;

use crate::partition::{discover_partitions, Partition};
use crate::InitError;

/// The file-service endpoints init keeps for one mounted partition.
pub struct MountedVolume {
    pub partition: Partition,
    pub stat: RawHandle,
    pub list: RawHandle,
    pub open: RawHandle,
}

/// Run init: discover everything and spawn the servers.
///
/// `fat32_image` is the embedded FAT32-server ELF, provided by the image
/// embedding layer.
pub fn run(fat32_image: &[u8]) -> ! {
    match start(fat32_image) {
        Ok(volumes) => {
            log::info!("init: {} volume(s) mounted", volumes.len());
            // Nothing further to supervise yet; yield the CPU forever.
            loop {
                sable_sdk::syscall::process_wait(i64::MAX);
            }
        }
        Err(error) => {
            log::error!("init failed: {error}");
            syscall::process_exit()
        }
    }
}

fn start(fat32_image: &[u8]) -> Result<Vec<MountedVolume>, InitError> {
    let transport = InitError::Transport;

    let drive_open = syscall::resource_get(
        &ResourceName::new("phys_drive/open"),
        ResourceKind::ChannelSend,
    )
    .map_err(transport)?;
    let spawn = syscall::resource_get(
        &ResourceName::new("process/spawn"),
        ResourceKind::ChannelSend,
    )
    .map_err(transport)?;

    // One PhysDriveInfo per drive in the info message.
    let info_handle = syscall::resource_get(
        &ResourceName::new("phys_drive/info"),
        ResourceKind::Message,
    )
    .map_err(transport)?;
    let info_length = syscall::message_get_length(info_handle).map_err(transport)?;
    let entry_size = core::mem::size_of::<PhysDriveInfo>() as u64;
    if info_length.data % entry_size != 0 {
        return Err(InitError::BadTable);
    }
    let drive_count = (info_length.data / entry_size) as usize;
    let mut drives = vec![
        PhysDriveInfo {
            sector_size: 0,
            sector_count: 0,
        };
        drive_count
    ];
    let receive = ReceiveMessage {
        data_length: info_length.data,
        data: drives.as_mut_ptr() as *mut u8,
        handles_length: 0,
        handles: core::ptr::null_mut(),
    };
    syscall::message_read(
        info_handle,
        &receive,
        None,
        None,
        0,
        MessageFlags::FREE_MESSAGE,
    )
    .map_err(transport)?;

    // Discover partitions drive by drive.
    let mut partitions: Vec<Partition> = Vec::new();
    for (drive_index, drive) in drives.iter().enumerate() {
        let (read_channel, write_channel) = open_drive_window(
            drive_open,
            PhysDriveOpenArgs {
                drive_id: drive_index as u32,
                offset: 0,
                length: u64::MAX,
            },
        )?;
        let mut read = |offset: u64, buffer: &mut [u8]| drive_read(read_channel, offset, buffer);
        match discover_partitions(
            &mut read,
            drive_index as u32,
            drive.sector_size as u64,
            drive.sector_count as u64,
        ) {
            Ok(found) => {
                log::info!("drive {drive_index}: {} partition(s)", found.len());
                partitions.extend(found);
            }
            Err(error) => log::warn!("drive {drive_index}: {error}"),
        }
        syscall::handle_free(read_channel);
        syscall::handle_free(write_channel);
    }

    // One FAT32 server per partition.
    let mut volumes = Vec::new();
    for partition in partitions {
        match mount_partition(drive_open, spawn, &drives, partition, fat32_image) {
            Ok(volume) => volumes.push(volume),
            Err(error) => log::warn!("partition on drive {}: {error}", partition.drive),
        }
    }
    Ok(volumes)
}

/// Open a byte window onto a drive; returns its read and write channels.
fn open_drive_window(
    drive_open: RawHandle,
    args: PhysDriveOpenArgs,
) -> Result<(RawHandle, RawHandle), InitError> {
    let mut attached = [
        ReceiveAttachedHandle {
            kind: AttachedHandleKind::ChannelSend as u64,
            handle: 0,
        },
        ReceiveAttachedHandle {
            kind: AttachedHandleKind::ChannelSend as u64,
            handle: 0,
        },
    ];
    let request = SendMessageData {
        length: core::mem::size_of::<PhysDriveOpenArgs>() as u64,
        data: &args as *const PhysDriveOpenArgs as *const u8,
    };
    let message = SendMessage::from_data(&request);
    let receive = ReceiveMessage {
        data_length: 0,
        data: core::ptr::null_mut(),
        handles_length: 2,
        handles: attached.as_mut_ptr(),
    };
    channel_call_read(drive_open, &message, &receive, None).map_err(InitError::Transport)?;
    Ok((attached[0].handle, attached[1].handle))
}

fn drive_read(channel: RawHandle, offset: u64, buffer: &mut [u8]) -> Result<(), InitError> {
    let range = sable_abi::fs::FileRange {
        offset,
        length: buffer.len() as u64,
    };
    let request = SendMessageData {
        length: core::mem::size_of::<sable_abi::fs::FileRange>() as u64,
        data: &range as *const sable_abi::fs::FileRange as *const u8,
    };
    let message = SendMessage::from_data(&request);
    let receive = ReceiveMessage {
        data_length: buffer.len() as u64,
        data: buffer.as_mut_ptr(),
        handles_length: 0,
        handles: core::ptr::null_mut(),
    };
    channel_call_read(channel, &message, &receive, None).map_err(InitError::Transport)
}

/// Turn raw bytes into a message handle by bouncing them off a private
/// channel; the only way user space mints a message capability.
fn message_from_bytes(bytes: &[u8]) -> Result<RawHandle, InitError> {
    let (send, receive) = syscall::channel_create().map_err(InitError::Transport)?;
    sable_sdk::channel::send_bytes(send, bytes).map_err(InitError::Transport)?;
    // The message is already queued, so a zero-timeout receive pops it.
    let mqueue = syscall::mqueue_create().map_err(InitError::Transport)?;
    syscall::mqueue_add_channel(mqueue, receive, sable_abi::MessageTag::new(0, 0))
        .map_err(InitError::Transport)?;
    let (_, message) = syscall::mqueue_receive(mqueue, 0, MessageFlags::empty())
        .map_err(InitError::Transport)?;
    syscall::handle_free(mqueue);
    syscall::handle_free(send);
    Ok(message)
}

/// Spawn a FAT32 server for one partition.
fn mount_partition(
    drive_open: RawHandle,
    spawn: RawHandle,
    drives: &[PhysDriveInfo],
    partition: Partition,
    fat32_image: &[u8],
) -> Result<MountedVolume, InitError> {
    let transport = InitError::Transport;
    let sector_size = drives[partition.drive as usize].sector_size as u64;
    let (drive_read_h, drive_write_h) = open_drive_window(
        drive_open,
        PhysDriveOpenArgs {
            drive_id: partition.drive,
            offset: partition.first_sector * sector_size,
            length: partition.sector_count * sector_size,
        },
    )?;

    let info = VirtDriveInfo {
        guid: partition.guid,
        size: partition.sector_count * sector_size,
    };
    let info_bytes = unsafe {
        core::slice::from_raw_parts(
            &info as *const VirtDriveInfo as *const u8,
            core::mem::size_of::<VirtDriveInfo>(),
        )
    };
    let info_message = message_from_bytes(info_bytes)?;

    let (stat_send, stat_recv) = syscall::channel_create().map_err(transport)?;
    let (list_send, list_recv) = syscall::channel_create().map_err(transport)?;
    let (open_send, open_recv) = syscall::channel_create().map_err(transport)?;

    let names: [ResourceName; 6] = [
        ResourceName::new("virt_drive/read"),
        ResourceName::new("virt_drive/write"),
        ResourceName::new("virt_drive/info"),
        ResourceName::new("file/stat_r"),
        ResourceName::new("file/list_r"),
        ResourceName::new("file/open_r"),
    ];
    const MOVE: u64 = 1;
    let handles = [
        SendAttachedHandle { flags: MOVE, handle: drive_read_h },
        SendAttachedHandle { flags: MOVE, handle: drive_write_h },
        SendAttachedHandle { flags: MOVE, handle: info_message },
        SendAttachedHandle { flags: MOVE, handle: stat_recv },
        SendAttachedHandle { flags: MOVE, handle: list_recv },
        SendAttachedHandle { flags: MOVE, handle: open_recv },
    ];

    // Spawn payload: resource count, names, then the ELF image.
    let count = (names.len() as u64).to_le_bytes();
    let data_buffers = [
        SendMessageData {
            length: 8,
            data: count.as_ptr(),
        },
        SendMessageData {
            length: (names.len() * RESOURCE_NAME_MAX) as u64,
            data: names.as_ptr() as *const u8,
        },
        SendMessageData {
            length: fat32_image.len() as u64,
            data: fat32_image.as_ptr(),
        },
    ];
    let handle_buffer = SendMessageHandles {
        length: handles.len() as u64,
        handles: handles.as_ptr(),
    };
    let message = SendMessage {
        data_buffers_num: data_buffers.len() as u64,
        data_buffers: data_buffers.as_ptr(),
        handles_buffers_num: 1,
        handles_buffers: &handle_buffer,
    };
    let receive = ReceiveMessage {
        data_length: 0,
        data: core::ptr::null_mut(),
        handles_length: 0,
        handles: core::ptr::null_mut(),
    };
    channel_call_read(spawn, &message, &receive, Some(&MessageLength::default()))
        .map_err(transport)?;

    Ok(MountedVolume {
        partition,
        stat: stat_send,
        list: list_send,
        open: open_send,
    })
}
