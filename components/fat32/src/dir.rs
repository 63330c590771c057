//! Directory entries and traversal
//!
//! Directories are chains of clusters holding 32-byte entries. A file's
//! name is either the 8.3 short name in its entry, or a sequence of
//! long-name entries immediately before it: the sequence starts with the
//! fragment marked LAST carrying the highest ordinal, counts down to 1, and
//! every fragment carries a checksum of the short name that must match the
//! terminating entry.

use sable_abi::fs::FileMetadata;
use sable_abi::time::{days_from_civil, TICKS_PER_SEC};

use crate::drive::Drive;
use crate::fat;
use crate::{FsError, Volume};

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;

pub const LONG_NAME_ATTR: u8 = 0x0F;
pub const LONG_NAME_ATTR_MASK: u8 = 0x3F;
pub const LONG_NAME_ORD_MASK: u8 = 0x3F;
pub const LONG_NAME_ORD_LAST: u8 = 0x40;

/// Longest name the reader accepts, in bytes.
pub const NAME_MAX: usize = 255;

/// A short (8.3) directory entry, decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub creation_time_tens: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub access_date: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub file_size: u32,
    first_cluster_high: u16,
    first_cluster_low: u16,
}

impl DirEntry {
    pub fn from_bytes(bytes: &[u8; 32]) -> DirEntry {
        let read_u16 = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        DirEntry {
            name: bytes[0..11].try_into().unwrap(),
            attr: bytes[11],
            creation_time_tens: bytes[13],
            creation_time: read_u16(14),
            creation_date: read_u16(16),
            access_date: read_u16(18),
            first_cluster_high: read_u16(20),
            write_time: read_u16(22),
            write_date: read_u16(24),
            first_cluster_low: read_u16(26),
            file_size: u32::from_le_bytes(bytes[28..32].try_into().unwrap()),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[0..11].copy_from_slice(&self.name);
        bytes[11] = self.attr;
        bytes[13] = self.creation_time_tens;
        bytes[14..16].copy_from_slice(&self.creation_time.to_le_bytes());
        bytes[16..18].copy_from_slice(&self.creation_date.to_le_bytes());
        bytes[18..20].copy_from_slice(&self.access_date.to_le_bytes());
        bytes[20..22].copy_from_slice(&self.first_cluster_high.to_le_bytes());
        bytes[22..24].copy_from_slice(&self.write_time.to_le_bytes());
        bytes[24..26].copy_from_slice(&self.write_date.to_le_bytes());
        bytes[26..28].copy_from_slice(&self.first_cluster_low.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.file_size.to_le_bytes());
        bytes
    }

    #[inline]
    pub fn first_cluster(&self) -> u32 {
        ((self.first_cluster_high as u32) << 16) | self.first_cluster_low as u32
    }

    #[inline]
    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_high = (cluster >> 16) as u16;
        self.first_cluster_low = cluster as u16;
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    /// The synthetic entry standing in for the root directory.
    pub fn root(root_cluster: u32) -> DirEntry {
        let mut entry = DirEntry {
            attr: ATTR_DIRECTORY,
            ..DirEntry::default()
        };
        entry.set_first_cluster(root_cluster);
        entry
    }

    /// Client-visible metadata for this entry.
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            is_dir: self.is_directory(),
            reserved1: [0; 7],
            size: self.file_size as u64,
            create_time: timestamp_from_fat(
                self.creation_date,
                self.creation_time,
                self.creation_time_tens,
            ),
            modify_time: timestamp_from_fat(self.write_date, self.write_time, 0),
            access_time: timestamp_from_fat(self.access_date, 0, 0),
        }
    }
}

/// Decode FAT's 2-second-resolution date and time, plus the hundredths
/// field used for creation stamps.
pub fn timestamp_from_fat(date: u16, time: u16, tens: u8) -> i64 {
    let year = (date >> 9) as i64 + 1980;
    let month = ((date >> 5) & 0x0F).max(1) as u32;
    let day = (date & 0x1F).max(1) as u32;
    let hour = (time >> 11) as i64;
    let minute = ((time >> 5) & 0x3F) as i64;
    let second = ((time & 0x1F) * 2) as i64;
    let days = days_from_civil(year, month, day);
    let seconds = second + 60 * (minute + 60 * (hour + 24 * days));
    seconds * TICKS_PER_SEC + tens as i64 * (TICKS_PER_SEC / 100)
}

/// The rotate-and-add checksum long-name entries carry.
pub fn short_name_checksum(name: &[u8; 11]) -> u8 {
    let mut checksum: u8 = 0;
    for &byte in name {
        checksum = checksum.rotate_right(1).wrapping_add(byte);
    }
    checksum
}

// Permitted code points, one bit per character below 0x80. Characters at
// or above 0x80 are always allowed.
static SHORT_NAME_ALLOWED: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0xFB, 0x23, 0xFF, 0x03, 0xFF, 0xFF, 0xFF, 0xC7, 0x01, 0x00, 0x00,
    0x68,
];
static LONG_NAME_ALLOWED: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0xFB, 0x7B, 0xFF, 0x0B, 0xFF, 0xFF, 0xFF, 0xEF, 0xFF, 0xFF, 0xFF,
    0x6F,
];

pub fn char_allowed_in_short_name(c: u8) -> bool {
    c > 0x7F || (SHORT_NAME_ALLOWED[(c >> 3) as usize] >> (c & 7)) & 1 != 0
}

pub fn char_allowed_in_long_name(c: u8) -> bool {
    c > 0x7F || (LONG_NAME_ALLOWED[(c >> 3) as usize] >> (c & 7)) & 1 != 0
}

/// Copy one long-name fragment into the name buffer at the slot its
/// ordinal dictates. For the LAST fragment, returns the total name length.
/// Characters above 0xFF and disallowed characters reject the fragment.
fn copy_long_name_fragment(entry: &[u8], name: &mut [u8; NAME_MAX]) -> Result<Option<usize>, ()> {
    let read_unit = |at: usize| u16::from_le_bytes([entry[at], entry[at + 1]]);
    let positions: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
    let ord = entry[0];
    let offset = ((ord & LONG_NAME_ORD_MASK) as usize - 1) * 13;
    if offset > NAME_MAX {
        return Err(());
    }
    let is_last = ord & LONG_NAME_ORD_LAST != 0;
    for (i, &at) in positions.iter().enumerate() {
        let unit = read_unit(at);
        if is_last && unit == 0 {
            return Ok(Some(offset + i));
        }
        if offset + i >= NAME_MAX {
            return Err(());
        }
        if unit > 0xFF || !char_allowed_in_long_name(unit as u8) {
            return Err(());
        }
        name[offset + i] = unit as u8;
    }
    Ok(if is_last { Some(offset + 13) } else { None })
}

/// An entry yielded by directory iteration.
#[derive(Debug, Clone)]
pub struct NamedEntry {
    pub name: Vec<u8>,
    pub entry: DirEntry,
    /// Byte offset of the 32-byte entry on the drive.
    pub location: u64,
}

/// Iteration state over one directory's entry chain.
pub struct DirReader {
    cluster: u32,
    entry_index: usize,
    buffer: Vec<u8>,
    loaded: bool,
}

impl DirReader {
    pub fn new(first_cluster: u32) -> DirReader {
        DirReader {
            cluster: first_cluster,
            entry_index: 0,
            buffer: Vec::new(),
            loaded: false,
        }
    }
}

impl<D: Drive> Volume<D> {
    /// Produce the next live entry, assembling long names along the way.
    ///
    /// Returns `Ok(None)` at end of directory. Deleted entries, the volume
    /// label, and malformed long-name sequences are skipped; a long-name
    /// sequence whose checksum does not match its short entry degrades to
    /// the short name, exactly as a repair tool would read the directory.
    pub fn next_dir_entry(&self, state: &mut DirReader) -> Result<Option<NamedEntry>, FsError> {
        let cluster_size = self.geometry.cluster_size as usize;
        let entries_per_cluster = cluster_size / 32;
        let mut name = [0u8; NAME_MAX];
        let mut name_length = 0usize;
        let mut reading_long_name = false;
        let mut next_ord: u8 = 0;
        let mut long_checksum: u8 = 0;

        if state.cluster >= fat::FAT_EOF_MIN {
            return Ok(None);
        }
        if state.cluster < 2 {
            return Err(FsError::IoInternal);
        }
        loop {
            // Step to the next cluster when this one is exhausted.
            if state.loaded && state.entry_index >= entries_per_cluster {
                match self.next_cluster(state.cluster)? {
                    Some(next) => state.cluster = next,
                    None => return Ok(None),
                }
                state.entry_index = 0;
                state.loaded = false;
            }
            if !state.loaded {
                state.buffer.resize(cluster_size, 0);
                self.drive
                    .read(self.geometry.cluster_offset(state.cluster), &mut state.buffer)?;
                state.loaded = true;
            }

            let at = state.entry_index * 32;
            let raw: &[u8] = &state.buffer[at..at + 32];

            if raw[11] & LONG_NAME_ATTR_MASK == LONG_NAME_ATTR {
                // Long-name entries with a nonzero type are extensions we
                // do not recognize.
                if raw[12] != 0 {
                    reading_long_name = false;
                } else {
                    let ord = raw[0];
                    if ord & LONG_NAME_ORD_LAST != 0 && ord & LONG_NAME_ORD_MASK != 0 {
                        match copy_long_name_fragment(raw, &mut name) {
                            Ok(Some(length)) => {
                                name_length = length;
                                reading_long_name = true;
                                next_ord = (ord & LONG_NAME_ORD_MASK) - 1;
                                long_checksum = raw[13];
                            }
                            Ok(None) | Err(()) => reading_long_name = false,
                        }
                    } else if ord & LONG_NAME_ORD_LAST == 0
                        && reading_long_name
                        && ord & LONG_NAME_ORD_MASK == next_ord
                        && raw[13] == long_checksum
                    {
                        match copy_long_name_fragment(raw, &mut name) {
                            Ok(_) => next_ord -= 1,
                            Err(()) => reading_long_name = false,
                        }
                    } else {
                        reading_long_name = false;
                    }
                }
                state.entry_index += 1;
                continue;
            }

            // A short entry: the long name applies only if the sequence
            // completed and its checksum matches.
            let mut has_long_name = reading_long_name && next_ord == 0;
            reading_long_name = false;
            if raw[0] == 0xE5 || raw[0] == b' ' {
                state.entry_index += 1;
                continue;
            }
            if raw[0] == 0x00 {
                return Ok(None);
            }
            let entry = DirEntry::from_bytes(raw.try_into().unwrap());
            if has_long_name && short_name_checksum(&entry.name) != long_checksum {
                has_long_name = false;
            }

            let final_name = if has_long_name {
                name[..name_length].to_vec()
            } else {
                match short_name_of(&entry.name) {
                    Some(short) => short,
                    None => {
                        state.entry_index += 1;
                        continue;
                    }
                }
            };
            let location =
                self.geometry.cluster_offset(state.cluster) + state.entry_index as u64 * 32;
            state.entry_index += 1;
            return Ok(Some(NamedEntry {
                name: final_name,
                entry,
                location,
            }));
        }
    }

    /// Find an entry by exact name within a directory.
    pub fn find_in_dir(&self, dir_first_cluster: u32, name: &[u8]) -> Result<NamedEntry, FsError> {
        let mut state = DirReader::new(dir_first_cluster);
        while let Some(entry) = self.next_dir_entry(&mut state)? {
            if entry.name == name {
                return Ok(entry);
            }
        }
        Err(FsError::DoesNotExist)
    }

    /// Concatenated `(u32 length, bytes)` names of every entry in a
    /// directory, the `list` wire format.
    pub fn list_dir(&self, dir_first_cluster: u32) -> Result<Vec<u8>, FsError> {
        let mut list = Vec::new();
        let mut state = DirReader::new(dir_first_cluster);
        while let Some(entry) = self.next_dir_entry(&mut state)? {
            list.extend_from_slice(&(entry.name.len() as u32).to_le_bytes());
            list.extend_from_slice(&entry.name);
        }
        Ok(list)
    }
}

/// Decode an 8.3 name into `name.ext` form. Returns `None` when the name
/// contains characters short names may not hold.
fn short_name_of(name: &[u8; 11]) -> Option<Vec<u8>> {
    let mut main_length = 8;
    while main_length > 0 && name[main_length - 1] == b' ' {
        main_length -= 1;
    }
    let mut ext_length = 3;
    while ext_length > 0 && name[7 + ext_length] == b' ' {
        ext_length -= 1;
    }
    let mut out = Vec::with_capacity(main_length + 1 + ext_length);
    for &byte in &name[..main_length] {
        if !char_allowed_in_short_name(byte) {
            return None;
        }
        out.push(byte);
    }
    if ext_length > 0 {
        out.push(b'.');
        for &byte in &name[8..8 + ext_length] {
            if !char_allowed_in_short_name(byte) {
                return None;
            }
            out.push(byte);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testimg::{self, short, ImageBuilder};

    #[test]
    fn entry_round_trips_through_bytes() {
        let mut entry = DirEntry::default();
        entry.name = short("HELLO", "TXT");
        entry.attr = ATTR_ARCHIVE;
        entry.set_first_cluster(0x0012_3456);
        entry.file_size = 777;
        entry.write_date = 0x5234;
        let decoded = DirEntry::from_bytes(&entry.to_bytes());
        assert_eq!(decoded, entry);
        assert_eq!(decoded.first_cluster(), 0x0012_3456);
    }

    #[test]
    fn checksum_matches_reference() {
        // Reference value computed with the canonical rotate-add over
        // "FILENAMETXT".
        let name = *b"FILENAMETXT";
        let mut expected: u8 = 0;
        for &byte in name.iter() {
            expected = ((expected << 7) | (expected >> 1)).wrapping_add(byte);
        }
        assert_eq!(short_name_checksum(&name), expected);
    }

    #[test]
    fn short_names_are_listed() {
        let mut image = ImageBuilder::new();
        image.add_file(2, short("SHORT", "TXT"), b"hello");
        image.add_file(2, short("NOEXT", ""), b"");
        let volume = testimg::volume(image);

        let mut state = DirReader::new(2);
        let first = volume.next_dir_entry(&mut state).unwrap().unwrap();
        assert_eq!(first.name, b"SHORT.TXT");
        assert_eq!(first.entry.file_size, 5);
        let second = volume.next_dir_entry(&mut state).unwrap().unwrap();
        assert_eq!(second.name, b"NOEXT");
        assert!(volume.next_dir_entry(&mut state).unwrap().is_none());
    }

    #[test]
    fn long_names_are_assembled_across_fragments() {
        let mut image = ImageBuilder::new();
        image.add_entry(
            2,
            short("AVERYL~1", "DAT"),
            Some("a-very-long-filename-over-13-chars.dat"),
            ATTR_ARCHIVE,
            0,
            0,
        );
        let volume = testimg::volume(image);
        let entry = volume
            .find_in_dir(2, b"a-very-long-filename-over-13-chars.dat")
            .unwrap();
        assert_eq!(entry.entry.name, short("AVERYL~1", "DAT"));
    }

    #[test]
    fn exactly_thirteen_character_names_work() {
        // No explicit terminator fits in the final fragment.
        let mut image = ImageBuilder::new();
        image.add_entry(
            2,
            short("THIRTE~1", ""),
            Some("thirteen-char"),
            ATTR_ARCHIVE,
            0,
            0,
        );
        let volume = testimg::volume(image);
        assert!(volume.find_in_dir(2, b"thirteen-char").is_ok());
    }

    #[test]
    fn mismatched_checksum_falls_back_to_the_short_name() {
        let mut image = ImageBuilder::new();
        image.add_entry(
            2,
            short("REAL", "TXT"),
            Some("pretty-name.txt"),
            ATTR_ARCHIVE,
            0,
            0,
        );
        // Corrupt the checksum of the single long-name entry (slot 0).
        image.write_cluster(2, 13, &[0xAB]);
        let volume = testimg::volume(image);

        assert!(volume.find_in_dir(2, b"pretty-name.txt").is_err());
        assert!(volume.find_in_dir(2, b"REAL.TXT").is_ok());
    }

    #[test]
    fn deleted_and_label_entries_are_skipped() {
        let mut image = ImageBuilder::new();
        let location = image.add_file(2, short("DEAD", ""), b"");
        image.add_entry(2, short("LABEL", ""), None, ATTR_VOLUME_ID, 0, 0);
        image.add_file(2, short("LIVE", ""), b"");
        // Mark the first entry deleted in place.
        let offset_in_cluster = (location - testimg::DATA_OFFSET) as usize % 512;
        image.write_cluster(2, offset_in_cluster, &[0xE5]);
        let volume = testimg::volume(image);

        let list = volume.list_dir(2).unwrap();
        let mut names = Vec::new();
        let mut at = 0;
        while at < list.len() {
            let len = u32::from_le_bytes(list[at..at + 4].try_into().unwrap()) as usize;
            names.push(list[at + 4..at + 4 + len].to_vec());
            at += 4 + len;
        }
        assert!(names.contains(&b"LIVE".to_vec()));
        assert!(!names.contains(&b"DEAD".to_vec()));
    }

    #[test]
    fn iteration_continues_across_cluster_boundaries() {
        let mut image = ImageBuilder::new();
        // Hand-build a directory spanning two clusters: 16 entries in the
        // first, one in the second.
        let clusters = image.take_clusters(2);
        let (first, second) = (clusters[0], clusters[1]);
        for i in 0..16 {
            let mut entry = DirEntry::default();
            entry.name = short("FILE", "");
            entry.name[4] = b'A' + i as u8;
            entry.attr = ATTR_ARCHIVE;
            image.write_cluster(first, i * 32, &entry.to_bytes());
        }
        let mut entry = DirEntry::default();
        entry.name = short("LAST", "");
        entry.attr = ATTR_ARCHIVE;
        image.write_cluster(second, 0, &entry.to_bytes());
        image.add_entry(2, short("BIGDIR", ""), None, ATTR_DIRECTORY, first, 0);
        let volume = testimg::volume(image);

        let list = volume.list_dir(first).unwrap();
        let mut count = 0;
        let mut at = 0;
        while at < list.len() {
            let len = u32::from_le_bytes(list[at..at + 4].try_into().unwrap()) as usize;
            at += 4 + len;
            count += 1;
        }
        assert_eq!(count, 17);
    }

    #[test]
    fn fat_timestamps_decode() {
        // 2004-05-20, 13:45:30 -> date 0x30B4, time 0x6DCF.
        let date = ((2004 - 1980) << 9 | 5 << 5 | 20) as u16;
        let time = (13 << 11 | 45 << 5 | 15) as u16;
        let expected = sable_abi::time::timestamp_from_datetime(2004, 5, 20, 13, 45, 30);
        assert_eq!(timestamp_from_fat(date, time, 0), expected);
        // The tenths field adds hundredths of a second.
        assert_eq!(
            timestamp_from_fat(date, time, 50),
            expected + TICKS_PER_SEC / 2
        );
    }

    #[test]
    fn metadata_carries_directory_bit_and_size() {
        let mut entry = DirEntry::default();
        entry.attr = ATTR_DIRECTORY;
        entry.file_size = 0;
        assert!(entry.metadata().is_dir);

        let mut entry = DirEntry::default();
        entry.attr = ATTR_ARCHIVE;
        entry.file_size = 4096;
        let metadata = entry.metadata();
        assert!(!metadata.is_dir);
        assert_eq!(metadata.size, 4096);
    }
}
