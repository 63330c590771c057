//! In-memory FAT32 images for the test suite
//!
//! Formats a minimal but fully valid volume: 512-byte sectors, one sector
//! per cluster, and just enough clusters to clear the FAT32 threshold.
//! Files and directories are planted by writing raw directory entries and
//! FAT chains, so the tests exercise the reader against byte layouts
//! produced independently of the code under test.

use crate::dir::{short_name_checksum, DirEntry, ATTR_DIRECTORY, LONG_NAME_ATTR, LONG_NAME_ORD_LAST};
use crate::drive::MemDrive;
use crate::fat::{FAT_EOF, FAT_FREE};

pub const SECTOR_SIZE: u32 = 512;
pub const RESERVED_SECTORS: u32 = 32;
pub const FAT_COUNT: u32 = 2;
pub const FAT_SECTORS: u32 = 512;
pub const CLUSTER_COUNT: u32 = 65_525;
pub const TOTAL_SECTORS: u32 = RESERVED_SECTORS + FAT_COUNT * FAT_SECTORS + CLUSTER_COUNT;
pub const DRIVE_SIZE: u64 = TOTAL_SECTORS as u64 * SECTOR_SIZE as u64;

pub const FAT_OFFSET: u64 = RESERVED_SECTORS as u64 * SECTOR_SIZE as u64;
pub const DATA_OFFSET: u64 =
    (RESERVED_SECTORS + FAT_COUNT * FAT_SECTORS) as u64 * SECTOR_SIZE as u64;

/// A valid boot sector for the test geometry.
pub fn boot_sector() -> [u8; 512] {
    let mut sector = [0u8; 512];
    sector[0] = 0xEB;
    sector[1] = 0x58;
    sector[2] = 0x90;
    sector[3..11].copy_from_slice(b"sable   ");
    sector[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    sector[13] = 1; // sectors per cluster
    sector[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
    sector[16] = FAT_COUNT as u8;
    sector[21] = 0xF8; // media
    sector[32..36].copy_from_slice(&TOTAL_SECTORS.to_le_bytes());
    sector[36..40].copy_from_slice(&FAT_SECTORS.to_le_bytes());
    sector[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
    sector[66] = 0x29;
    sector[67..71].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    sector[71..82].copy_from_slice(b"SABLE TEST ");
    sector[82..90].copy_from_slice(b"FAT32   ");
    sector[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
    sector
}

/// Builds a volume image with files planted in it.
pub struct ImageBuilder {
    data: Vec<u8>,
    /// Next free cluster handed out by [`ImageBuilder::take_clusters`].
    next_cluster: u32,
    /// Next free 32-byte entry slot per directory cluster.
    dir_cursors: Vec<(u32, usize)>,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        let mut data = vec![0u8; DRIVE_SIZE as usize];
        data[..512].copy_from_slice(&boot_sector());
        let mut image = ImageBuilder {
            data,
            next_cluster: 3,
            dir_cursors: vec![(2, 0)],
        };
        // Reserved FAT entries and the root directory's chain.
        image.set_fat(0, 0x0FFF_FFF8);
        image.set_fat(1, 0x0FFF_FFFF);
        image.set_fat(2, FAT_EOF);
        image
    }

    pub fn set_fat(&mut self, cluster: u32, entry: u32) {
        let at = (FAT_OFFSET + cluster as u64 * 4) as usize;
        self.data[at..at + 4].copy_from_slice(&entry.to_le_bytes());
    }

    pub fn fat(&self, cluster: u32) -> u32 {
        let at = (FAT_OFFSET + cluster as u64 * 4) as usize;
        u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap())
            & crate::fat::FAT_ENTRY_MASK
    }

    fn cluster_range(&self, cluster: u32) -> core::ops::Range<usize> {
        let start = (DATA_OFFSET + (cluster as u64 - 2) * SECTOR_SIZE as u64) as usize;
        start..start + SECTOR_SIZE as usize
    }

    pub fn write_cluster(&mut self, cluster: u32, at: usize, bytes: &[u8]) {
        let range = self.cluster_range(cluster);
        self.data[range][at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Claim `count` clusters and chain them in the FAT.
    pub fn take_clusters(&mut self, count: u32) -> Vec<u32> {
        let clusters: Vec<u32> = (self.next_cluster..self.next_cluster + count).collect();
        self.next_cluster += count;
        for window in clusters.windows(2) {
            self.set_fat(window[0], window[1]);
        }
        if let Some(&last) = clusters.last() {
            self.set_fat(last, FAT_EOF);
        }
        clusters
    }

    /// Mark a specific cluster free (for fragmentation scenarios).
    pub fn release_cluster(&mut self, cluster: u32) {
        self.set_fat(cluster, FAT_FREE);
    }

    fn dir_slot(&mut self, dir_cluster: u32) -> usize {
        for cursor in &mut self.dir_cursors {
            if cursor.0 == dir_cluster {
                let slot = cursor.1;
                cursor.1 += 1;
                assert!(slot < SECTOR_SIZE as usize / 32, "test directory full");
                return slot;
            }
        }
        self.dir_cursors.push((dir_cluster, 1));
        0
    }

    /// Append a short-name entry, optionally preceded by a long-name
    /// sequence.
    pub fn add_entry(
        &mut self,
        dir_cluster: u32,
        short_name: [u8; 11],
        long_name: Option<&str>,
        attr: u8,
        first_cluster: u32,
        size: u32,
    ) -> u64 {
        if let Some(long) = long_name {
            let checksum = short_name_checksum(&short_name);
            let units: Vec<u16> = long.encode_utf16().collect();
            let fragments = units.len().div_ceil(13);
            for ord in (1..=fragments).rev() {
                let slot = self.dir_slot(dir_cluster);
                let mut entry = [0u8; 32];
                let mut ord_byte = ord as u8;
                if ord == fragments {
                    ord_byte |= LONG_NAME_ORD_LAST;
                }
                entry[0] = ord_byte;
                entry[11] = LONG_NAME_ATTR;
                entry[12] = 0; // type
                entry[13] = checksum;
                // 13 UTF-16 units spread over three fields, zero-terminated
                // and 0xFFFF-padded.
                let positions: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
                for (i, &at) in positions.iter().enumerate() {
                    let index = (ord - 1) * 13 + i;
                    let unit = match index.cmp(&units.len()) {
                        core::cmp::Ordering::Less => units[index],
                        core::cmp::Ordering::Equal => 0x0000,
                        core::cmp::Ordering::Greater => 0xFFFF,
                    };
                    entry[at..at + 2].copy_from_slice(&unit.to_le_bytes());
                }
                self.write_cluster(dir_cluster, slot * 32, &entry);
            }
        }
        let slot = self.dir_slot(dir_cluster);
        let mut entry = DirEntry::default();
        entry.name = short_name;
        entry.attr = attr;
        entry.set_first_cluster(first_cluster);
        entry.file_size = size;
        self.write_cluster(dir_cluster, slot * 32, &entry.to_bytes());
        DATA_OFFSET + (dir_cluster as u64 - 2) * SECTOR_SIZE as u64 + slot as u64 * 32
    }

    /// Plant a regular file with the given content.
    pub fn add_file(&mut self, dir_cluster: u32, short_name: [u8; 11], content: &[u8]) -> u64 {
        let first = if content.is_empty() {
            0
        } else {
            let count = (content.len() as u32).div_ceil(SECTOR_SIZE);
            let clusters = self.take_clusters(count);
            for (i, chunk) in content.chunks(SECTOR_SIZE as usize).enumerate() {
                self.write_cluster(clusters[i], 0, chunk);
            }
            clusters[0]
        };
        self.add_entry(
            dir_cluster,
            short_name,
            None,
            0x20,
            first,
            content.len() as u32,
        )
    }

    /// Plant a subdirectory; returns its first cluster.
    pub fn add_dir(&mut self, parent_cluster: u32, short_name: [u8; 11]) -> u32 {
        let cluster = self.take_clusters(1)[0];
        self.add_entry(parent_cluster, short_name, None, ATTR_DIRECTORY, cluster, 0);
        cluster
    }

    pub fn finish(self) -> MemDrive {
        MemDrive::from_bytes(self.data)
    }
}

/// Pad a `NAME.EXT` style name into the 11-byte short form.
pub fn short(name: &str, ext: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
    out
}

/// Open a built image as a volume.
pub fn volume(image: ImageBuilder) -> crate::Volume<MemDrive> {
    crate::Volume::open(image.finish(), DRIVE_SIZE).unwrap()
}
