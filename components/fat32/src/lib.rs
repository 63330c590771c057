//! FAT32 file-system server
//!
//! # Purpose
//! Serves `stat`, `list`, `open`, `read`, `write` and `resize` requests over
//! channels, backed by a FAT32 volume reached through the `virt_drive/*`
//! resources.
//!
//! # Integration points
//! - Consumes: `virt_drive/read`, `virt_drive/write` (channel sends),
//!   `virt_drive/info` (message)
//! - Serves: `file/stat_r`, `file/list_r`, `file/open_r` (channel receives,
//!   multiplexed on one message queue); `open` replies carry per-file
//!   read/write/resize channels
//!
//! # Structure
//! All file-system logic lives in [`Volume`], parameterized over a [`Drive`]
//! so the test suite can run the entire format path against an in-memory
//! image; the server loop in [`server`] is transport glue.

pub mod bpb;
pub mod dir;
pub mod drive;
pub mod fat;
pub mod file;
pub mod path;
pub mod server;

use thiserror::Error;

pub use bpb::Geometry;
pub use drive::{Drive, MemDrive};

/// Errors surfaced by the file-system core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("drive transport failed: {0}")]
    Transport(sable_abi::Error),

    #[error("the volume is not a valid FAT32 file system")]
    InvalidVolume,

    #[error("no such file or directory")]
    DoesNotExist,

    #[error("not a directory")]
    NotDir,

    #[error("range extends past the end of the file")]
    Eof,

    #[error("no space left on the volume")]
    NoSpace,

    #[error("the root directory has no directory entry")]
    RootDirectory,

    #[error("file system metadata is inconsistent")]
    IoInternal,
}

impl FsError {
    /// The wire error code reported to clients.
    pub fn to_error(self) -> sable_abi::Error {
        match self {
            FsError::Transport(error) => error,
            FsError::InvalidVolume => sable_abi::Error::Other,
            FsError::DoesNotExist => sable_abi::Error::DoesNotExist,
            FsError::NotDir => sable_abi::Error::NotDir,
            FsError::Eof => sable_abi::Error::Eof,
            FsError::NoSpace => sable_abi::Error::NoSpace,
            FsError::RootDirectory => sable_abi::Error::InvalidArg,
            FsError::IoInternal => sable_abi::Error::IoInternal,
        }
    }
}

/// A FAT32 volume on some drive.
pub struct Volume<D: Drive> {
    drive: D,
    geometry: Geometry,
}

impl<D: Drive> Volume<D> {
    /// Read and validate the BPB, producing a ready volume.
    pub fn open(drive: D, drive_size: u64) -> Result<Volume<D>, FsError> {
        let mut sector = [0u8; bpb::BPB_SIZE];
        drive.read(0, &mut sector)?;
        let geometry = bpb::parse_bpb(&sector, drive_size)?;
        Ok(Volume { drive, geometry })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn drive(&self) -> &D {
        &self.drive
    }
}

#[cfg(test)]
pub(crate) mod testimg;
