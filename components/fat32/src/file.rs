//! File reads, writes and resizing
//!
//! A file is a cluster chain plus the size recorded in its directory
//! entry. I/O walks the chain to the cluster containing the start offset,
//! then transfers the partial head, the full middle clusters, and the
//! partial tail. Resizing adjusts the chain and zeroes every byte the new
//! size exposes, then rewrites the directory entry.

use crate::dir::DirEntry;
use crate::drive::Drive;
use crate::fat::FAT_EOF;
use crate::{FsError, Volume};

enum Access<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl<D: Drive> Volume<D> {
    fn transfer(&self, offset: u64, access: Access<'_>, at: usize, len: usize) -> Result<(), FsError> {
        match access {
            Access::Read(buffer) => self.drive.read(offset, &mut buffer[at..at + len]),
            Access::Write(data) => self.drive.write(offset, &data[at..at + len]),
        }
    }

    /// Read `buffer.len()` bytes starting at `offset`.
    ///
    /// The caller has already checked the range against the file size; a
    /// chain that ends early is metadata corruption.
    pub fn read_file(
        &self,
        first_cluster: u32,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), FsError> {
        self.file_io(first_cluster, offset, Access::Read(buffer))
    }

    /// Write `data` starting at `offset`, within the current file size.
    pub fn write_file(&self, first_cluster: u32, offset: u64, data: &[u8]) -> Result<(), FsError> {
        self.file_io(first_cluster, offset, Access::Write(data))
    }

    fn file_io(&self, first_cluster: u32, offset: u64, access: Access<'_>) -> Result<(), FsError> {
        let cluster_size = self.geometry.cluster_size as u64;
        let length = match &access {
            Access::Read(buffer) => buffer.len() as u64,
            Access::Write(data) => data.len() as u64,
        };
        if length == 0 {
            return Ok(());
        }

        // Seek to the cluster containing the start offset.
        let mut cluster = first_cluster;
        let mut cluster_start: u64 = 0;
        while cluster_start + cluster_size <= offset {
            cluster = self.next_cluster_allocated(cluster)?;
            cluster_start += cluster_size;
        }

        // Entirely within one cluster.
        if offset + length <= cluster_start + cluster_size {
            let at = self.geometry.cluster_offset(cluster) + (offset - cluster_start);
            return self.transfer(at, access, 0, length as usize);
        }

        // Partial head cluster.
        let head_length = (cluster_size - (offset - cluster_start)) as usize;
        let mut access = access;
        let at = self.geometry.cluster_offset(cluster) + (offset - cluster_start);
        match &mut access {
            Access::Read(buffer) => self.drive.read(at, &mut buffer[..head_length])?,
            Access::Write(data) => self.drive.write(at, &data[..head_length])?,
        }
        let mut transferred = head_length as u64;
        cluster_start += cluster_size;
        cluster = self.next_cluster_allocated(cluster)?;

        // Full middle clusters.
        while cluster_start + cluster_size < offset + length {
            let at = self.geometry.cluster_offset(cluster);
            match &mut access {
                Access::Read(buffer) => self.drive.read(
                    at,
                    &mut buffer[transferred as usize..(transferred + cluster_size) as usize],
                )?,
                Access::Write(data) => self.drive.write(
                    at,
                    &data[transferred as usize..(transferred + cluster_size) as usize],
                )?,
            }
            cluster = self.next_cluster_allocated(cluster)?;
            cluster_start += cluster_size;
            transferred += cluster_size;
        }

        // Partial tail cluster.
        let at = self.geometry.cluster_offset(cluster);
        let tail = (length - transferred) as usize;
        match access {
            Access::Read(buffer) => self.drive.read(at, &mut buffer[transferred as usize..]),
            Access::Write(data) => {
                debug_assert_eq!(data.len() - transferred as usize, tail);
                self.drive.write(at, &data[transferred as usize..])
            }
        }
    }

    /// Change a file's size, updating the chain and its directory entry.
    ///
    /// Growing allocates zeroed clusters and appends them; shrinking marks
    /// the new tail end-of-file and frees the rest. Bytes between the old
    /// size and the end of its final cluster are zeroed so a later grow
    /// never exposes stale data. `entry_location` is the on-disk position
    /// of the directory entry; the root directory has none and cannot be
    /// resized.
    pub fn resize_file(
        &self,
        entry: &mut DirEntry,
        entry_location: Option<u64>,
        new_size: u32,
    ) -> Result<(), FsError> {
        let entry_location = entry_location.ok_or(FsError::RootDirectory)?;
        let cluster_size = self.geometry.cluster_size;
        let first_cluster = entry.first_cluster();
        let old_size = entry.file_size;
        let new_cluster_count = new_size.div_ceil(cluster_size);
        entry.file_size = new_size;

        let result = (|| {
            // Already-empty file staying empty: nothing to do.
            if new_size == 0 && first_cluster == 0 {
                return Ok(());
            }
            // Shrinking to zero: release the whole chain.
            if new_size == 0 {
                self.free_clusters(first_cluster)?;
                entry.set_first_cluster(0);
                return Ok(());
            }
            // Growing an empty file: fresh chain.
            if first_cluster == 0 {
                let new_first = self.allocate_clusters(new_cluster_count)?;
                entry.set_first_cluster(new_first);
                return Ok(());
            }

            let blank = vec![0u8; cluster_size as usize];
            let mut cluster = first_cluster;
            let mut index: u32 = 0;
            loop {
                // Zero whatever lies beyond the old size in this cluster.
                if index as u64 * cluster_size as u64 > old_size as u64 {
                    self.drive
                        .write(self.geometry.cluster_offset(cluster), &blank)?;
                } else if (index as u64 + 1) * cluster_size as u64 > old_size as u64 {
                    let to_clear =
                        ((index as u64 + 1) * cluster_size as u64 - old_size as u64) as usize;
                    self.drive.write(
                        self.geometry.cluster_offset(cluster)
                            + (cluster_size as usize - to_clear) as u64,
                        &blank[..to_clear],
                    )?;
                }
                match self.next_cluster(cluster)? {
                    None => {
                        // Old chain ends here; extend if the new size needs
                        // more clusters.
                        if index == new_cluster_count - 1 {
                            return Ok(());
                        }
                        let appended = self.allocate_clusters(new_cluster_count - index - 1)?;
                        self.fat_write_entry(cluster, appended)?;
                        return Ok(());
                    }
                    Some(next) => {
                        // New chain ends here; trim the remainder.
                        if index == new_cluster_count - 1 {
                            self.fat_write_entry(cluster, FAT_EOF)?;
                            self.free_clusters(next)?;
                            return Ok(());
                        }
                        cluster = next;
                        index += 1;
                    }
                }
            }
        })();
        result?;
        self.drive.write(entry_location, &entry.to_bytes())
    }
}
