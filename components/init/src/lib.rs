//! Init service
//!
//! # Purpose
//! First user-space process. Walks every physical drive, reads its
//! partition table (MBR, or GPT behind a protective MBR), and spawns one
//! FAT32 server per discovered partition with a drive window scoped to it.
//!
//! # Integration points
//! - Consumes: `phys_drive/info` (message), `phys_drive/open` (channel
//!   send), `process/spawn` (channel send)
//! - Provides to children: `virt_drive/read`, `virt_drive/write`,
//!   `virt_drive/info`, and the `file/*_r` service endpoints

pub mod partition;
pub mod service;

use thiserror::Error;

pub use partition::{Partition, PartitionTable};

/// Errors of the discovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("drive transport failed: {0}")]
    Transport(sable_abi::Error),

    #[error("no partition table found")]
    NoTable,

    #[error("partition table is corrupt")]
    BadTable,
}
