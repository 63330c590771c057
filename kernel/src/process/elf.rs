//! ELF64 loading
//!
//! Parsing and validation are separated from mapping so a rejected image
//! provably has no effect on the target address space: `parse` walks the
//! file and builds a load plan, `load` executes the plan against the
//! current address space.

use alloc::vec::Vec;

use crate::error::{KError, KResult};
use crate::memory::address::{page_align_down, page_align_up};
use crate::memory::paging;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const CLASS_64_BIT: u8 = 2;
const ENDIAN_LITTLE: u8 = 1;
const HEADER_VERSION_CURRENT: u8 = 1;
const ABI_SYSV: u8 = 0;
const TYPE_EXEC: u16 = 2;
const MACHINE_X86_64: u16 = 0x3E;
const VERSION_CURRENT: u32 = 1;

const PT_LOAD: u32 = 1;
const PT_FLAG_X: u32 = 1;
const PT_FLAG_W: u32 = 2;

/// Size of the ELF64 file header.
const EHDR_SIZE: usize = 64;
/// Size of one ELF64 program header.
const PHDR_SIZE: usize = 56;

/// Programs may not be loaded at or above this address.
const PROGRAM_LOAD_MAX_ADDR: u64 = 1 << 32;

/// One PT_LOAD segment of a validated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
    pub memory_size: u64,
    pub write: bool,
    pub execute: bool,
}

/// A validated load plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfImage {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

fn read_u16(file: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([file[at], file[at + 1]])
}

fn read_u32(file: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([file[at], file[at + 1], file[at + 2], file[at + 3]])
}

fn read_u64(file: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&file[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Validate an ELF file and extract its load plan.
///
/// Rejects anything that is not a little-endian x86-64 executable, any
/// program-header table that does not fit the file, and any segment whose
/// ranges wrap or reach past the load ceiling.
pub fn parse(file: &[u8]) -> KResult<ElfImage> {
    if file.len() < EHDR_SIZE {
        return Err(KError::InvalidArg);
    }
    if file[0..4] != ELF_MAGIC {
        return Err(KError::InvalidArg);
    }
    if file[4] != CLASS_64_BIT
        || file[5] != ENDIAN_LITTLE
        || file[6] != HEADER_VERSION_CURRENT
        || file[7] != ABI_SYSV
    {
        return Err(KError::InvalidArg);
    }
    if read_u16(file, 16) != TYPE_EXEC {
        return Err(KError::InvalidArg);
    }
    if read_u16(file, 18) != MACHINE_X86_64 {
        return Err(KError::InvalidArg);
    }
    if read_u32(file, 20) != VERSION_CURRENT {
        return Err(KError::InvalidArg);
    }
    let entry = read_u64(file, 24);
    let pht_offset = read_u64(file, 32);
    let pht_entry_size = read_u16(file, 54) as u64;
    let pht_entries = read_u16(file, 56) as u64;
    if pht_entry_size < PHDR_SIZE as u64 {
        return Err(KError::InvalidArg);
    }
    let pht_size = pht_entry_size
        .checked_mul(pht_entries)
        .ok_or(KError::InvalidArg)?;
    let pht_end = pht_offset.checked_add(pht_size).ok_or(KError::InvalidArg)?;
    if pht_end > file.len() as u64 {
        return Err(KError::InvalidArg);
    }

    let mut segments = Vec::new();
    for i in 0..pht_entries {
        let at = (pht_offset + i * pht_entry_size) as usize;
        if read_u32(file, at) != PT_LOAD {
            continue;
        }
        let flags = read_u32(file, at + 4);
        let offset = read_u64(file, at + 8);
        let vaddr = read_u64(file, at + 16);
        let file_size = read_u64(file, at + 32);
        let memory_size = read_u64(file, at + 40);

        let file_end = offset.checked_add(file_size).ok_or(KError::InvalidArg)?;
        if file_end > file.len() as u64 {
            return Err(KError::InvalidArg);
        }
        if file_size > memory_size {
            return Err(KError::InvalidArg);
        }
        vaddr.checked_add(file_size).ok_or(KError::InvalidArg)?;
        let memory_end = vaddr.checked_add(memory_size).ok_or(KError::InvalidArg)?;
        if memory_end > PROGRAM_LOAD_MAX_ADDR {
            return Err(KError::InvalidArg);
        }
        segments.push(Segment {
            offset,
            vaddr,
            file_size,
            memory_size,
            write: flags & PT_FLAG_W != 0,
            execute: flags & PT_FLAG_X != 0,
        });
    }
    Ok(ElfImage { entry, segments })
}

/// Map a validated image into the current address space and copy it in.
///
/// Residual bytes (below the segment start within its first page, and from
/// the end of the file data to the end of the last page) are zeroed, since
/// fresh frames carry stale contents.
///
/// # Safety
///
/// The current address space must be the new process's, with its user half
/// otherwise empty.
pub unsafe fn load(file: &[u8], image: &ElfImage) -> KResult<()> {
    for segment in &image.segments {
        paging::map_user_pages(
            segment.vaddr,
            segment.memory_size,
            segment.write,
            segment.execute,
        )?;
        core::ptr::copy_nonoverlapping(
            file.as_ptr().add(segment.offset as usize),
            segment.vaddr as *mut u8,
            segment.file_size as usize,
        );
        let start_page = page_align_down(segment.vaddr);
        let loaded_end = segment.vaddr + segment.file_size;
        let end_page = page_align_up(segment.vaddr + segment.memory_size);
        core::ptr::write_bytes(
            start_page as *mut u8,
            0,
            (segment.vaddr - start_page) as usize,
        );
        core::ptr::write_bytes(loaded_end as *mut u8, 0, (end_page - loaded_end) as usize);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal valid executable: one PT_LOAD segment with 8 bytes of data
    /// at 0x40_0000.
    fn minimal_elf() -> Vec<u8> {
        let mut file = alloc::vec![0u8; EHDR_SIZE + PHDR_SIZE + 8];
        file[0..4].copy_from_slice(&ELF_MAGIC);
        file[4] = CLASS_64_BIT;
        file[5] = ENDIAN_LITTLE;
        file[6] = HEADER_VERSION_CURRENT;
        file[7] = ABI_SYSV;
        file[16..18].copy_from_slice(&TYPE_EXEC.to_le_bytes());
        file[18..20].copy_from_slice(&MACHINE_X86_64.to_le_bytes());
        file[20..24].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
        file[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes()); // entry
        file[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // phoff
        file[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        file[56..58].copy_from_slice(&1u16.to_le_bytes());

        let ph = EHDR_SIZE;
        file[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        file[ph + 4..ph + 8].copy_from_slice(&(PT_FLAG_X).to_le_bytes());
        let data_offset = (EHDR_SIZE + PHDR_SIZE) as u64;
        file[ph + 8..ph + 16].copy_from_slice(&data_offset.to_le_bytes());
        file[ph + 16..ph + 24].copy_from_slice(&0x40_0000u64.to_le_bytes());
        file[ph + 32..ph + 40].copy_from_slice(&8u64.to_le_bytes()); // filesz
        file[ph + 40..ph + 48].copy_from_slice(&16u64.to_le_bytes()); // memsz
        file
    }

    #[test]
    fn accepts_a_conforming_image() {
        let image = parse(&minimal_elf()).unwrap();
        assert_eq!(image.entry, 0x40_0000);
        assert_eq!(image.segments.len(), 1);
        let segment = image.segments[0];
        assert_eq!(segment.vaddr, 0x40_0000);
        assert_eq!(segment.file_size, 8);
        assert_eq!(segment.memory_size, 16);
        assert!(segment.execute);
        assert!(!segment.write);
    }

    #[test]
    fn rejects_wrong_magic_and_class() {
        let mut file = minimal_elf();
        file[0] = 0x7E;
        assert!(parse(&file).is_err());

        let mut file = minimal_elf();
        file[4] = 1; // 32-bit
        assert!(parse(&file).is_err());

        let mut file = minimal_elf();
        file[5] = 2; // big-endian
        assert!(parse(&file).is_err());
    }

    #[test]
    fn rejects_wrong_type_and_machine() {
        let mut file = minimal_elf();
        file[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert!(parse(&file).is_err());

        let mut file = minimal_elf();
        file[18..20].copy_from_slice(&0xB7u16.to_le_bytes()); // aarch64
        assert!(parse(&file).is_err());
    }

    #[test]
    fn rejects_truncated_files() {
        assert!(parse(&[]).is_err());
        assert!(parse(&minimal_elf()[..EHDR_SIZE - 1]).is_err());
        // Program header table reaching past the end.
        let mut file = minimal_elf();
        file[56..58].copy_from_slice(&100u16.to_le_bytes());
        assert!(parse(&file).is_err());
    }

    #[test]
    fn rejects_undersized_program_header_entries() {
        let mut file = minimal_elf();
        file[54..56].copy_from_slice(&(PHDR_SIZE as u16 - 1).to_le_bytes());
        assert!(parse(&file).is_err());
    }

    #[test]
    fn rejects_bad_segment_ranges() {
        // file_size larger than memory_size
        let ph = EHDR_SIZE;
        let mut file = minimal_elf();
        file[ph + 40..ph + 48].copy_from_slice(&4u64.to_le_bytes());
        assert!(parse(&file).is_err());

        // segment data past end of file
        let mut file = minimal_elf();
        file[ph + 32..ph + 40].copy_from_slice(&10_000u64.to_le_bytes());
        assert!(parse(&file).is_err());

        // wrapping offset
        let mut file = minimal_elf();
        file[ph + 8..ph + 16].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(parse(&file).is_err());

        // load above the 4 GiB ceiling
        let mut file = minimal_elf();
        file[ph + 16..ph + 24].copy_from_slice(&(PROGRAM_LOAD_MAX_ADDR - 8).to_le_bytes());
        assert!(parse(&file).is_err());
    }

    #[test]
    fn non_load_segments_are_ignored() {
        let mut file = minimal_elf();
        let ph = EHDR_SIZE;
        file[ph..ph + 4].copy_from_slice(&2u32.to_le_bytes()); // PT_DYNAMIC
        let image = parse(&file).unwrap();
        assert!(image.segments.is_empty());
    }
}
