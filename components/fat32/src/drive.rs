//! Drive access
//!
//! The volume code sees a flat byte range. In production that range is a
//! partition window served by the drive service over channels; in tests it
//! is a plain buffer.

use std::cell::RefCell;

use sable_abi::fs::FileRange;
use sable_abi::{MessageLength, RawHandle, ReceiveMessage, SendMessage, SendMessageData};
use sable_sdk::channel::channel_call_read;
use sable_sdk::syscall;

use crate::FsError;

/// Byte-addressed storage behind the file system.
pub trait Drive {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<(), FsError>;
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), FsError>;
}

/// The production drive: `virt_drive/read` and `virt_drive/write` channels.
pub struct ChannelDrive {
    read_channel: RawHandle,
    write_channel: RawHandle,
}

impl ChannelDrive {
    pub fn new(read_channel: RawHandle, write_channel: RawHandle) -> ChannelDrive {
        ChannelDrive {
            read_channel,
            write_channel,
        }
    }
}

impl Drive for ChannelDrive {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<(), FsError> {
        let range = FileRange {
            offset,
            length: buffer.len() as u64,
        };
        let request = SendMessageData {
            length: core::mem::size_of::<FileRange>() as u64,
            data: &range as *const FileRange as *const u8,
        };
        let message = SendMessage::from_data(&request);
        let receive = ReceiveMessage {
            data_length: buffer.len() as u64,
            data: buffer.as_mut_ptr(),
            handles_length: 0,
            handles: core::ptr::null_mut(),
        };
        channel_call_read(self.read_channel, &message, &receive, None)
            .map_err(FsError::Transport)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), FsError> {
        let offset_bytes = offset.to_le_bytes();
        let buffers = [
            SendMessageData {
                length: 8,
                data: offset_bytes.as_ptr(),
            },
            SendMessageData {
                length: data.len() as u64,
                data: data.as_ptr(),
            },
        ];
        let message = SendMessage {
            data_buffers_num: 2,
            data_buffers: buffers.as_ptr(),
            handles_buffers_num: 0,
            handles_buffers: core::ptr::null(),
        };
        let reply = syscall::channel_call(self.write_channel, &message)
            .map_err(FsError::Transport)?;
        // An empty reply acknowledges the write.
        let result = syscall::message_read(
            reply,
            &ReceiveMessage {
                data_length: 0,
                data: core::ptr::null_mut(),
                handles_length: 0,
                handles: core::ptr::null_mut(),
            },
            None,
            Some(&MessageLength::default()),
            0,
            sable_abi::MessageFlags::FREE_MESSAGE,
        );
        if result.is_err() {
            syscall::handle_free(reply);
        }
        result.map_err(FsError::Transport)
    }
}

/// An in-memory drive for the test suite.
pub struct MemDrive {
    data: RefCell<Vec<u8>>,
}

impl MemDrive {
    pub fn new(size: usize) -> MemDrive {
        MemDrive {
            data: RefCell::new(vec![0u8; size]),
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> MemDrive {
        MemDrive {
            data: RefCell::new(data),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.borrow().len() as u64
    }
}

impl Drive for MemDrive {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<(), FsError> {
        let data = self.data.borrow();
        let start = offset as usize;
        let end = start.checked_add(buffer.len()).ok_or(FsError::IoInternal)?;
        if end > data.len() {
            return Err(FsError::IoInternal);
        }
        buffer.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), FsError> {
        let mut data = self.data.borrow_mut();
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(FsError::IoInternal)?;
        if end > data.len() {
            return Err(FsError::IoInternal);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}
