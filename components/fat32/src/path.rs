//! Path resolution
//!
//! Paths are `/`-separated byte strings resolved from the root cluster.
//! Every component but the last must name a directory. The empty path
//! resolves to a synthetic root entry; the root has no on-disk directory
//! entry, so its location is `None` and operations that would rewrite the
//! entry must refuse it.

use crate::dir::DirEntry;
use crate::drive::Drive;
use crate::{FsError, Volume};

/// A resolved directory entry and where it lives on disk.
#[derive(Debug, Clone)]
pub struct Located {
    pub entry: DirEntry,
    /// Byte offset of the 32-byte entry, or `None` for the root.
    pub location: Option<u64>,
}

impl<D: Drive> Volume<D> {
    /// Resolve a path to its directory entry.
    pub fn entry_from_path(&self, path: &[u8]) -> Result<Located, FsError> {
        if path.is_empty() {
            return Ok(Located {
                entry: DirEntry::root(self.geometry.root_cluster),
                location: None,
            });
        }
        let mut entry = DirEntry::root(self.geometry.root_cluster);
        let mut location = None;
        for component in path.split(|&b| b == b'/') {
            if !entry.is_directory() {
                return Err(FsError::DoesNotExist);
            }
            let found = self.find_in_dir(entry.first_cluster(), component)?;
            entry = found.entry;
            location = Some(found.location);
        }
        Ok(Located { entry, location })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::ATTR_DIRECTORY;
    use crate::testimg::{self, short, ImageBuilder};

    fn nested_image() -> crate::Volume<crate::MemDrive> {
        let mut image = ImageBuilder::new();
        let sub = image.add_dir(2, short("SUB", ""));
        let deeper = image.add_dir(sub, short("DEEPER", ""));
        image.add_file(deeper, short("LEAF", "TXT"), b"payload");
        image.add_file(2, short("TOP", ""), b"top");
        testimg::volume(image)
    }

    #[test]
    fn empty_path_is_the_root_sentinel() {
        let volume = nested_image();
        let located = volume.entry_from_path(b"").unwrap();
        assert!(located.entry.is_directory());
        assert_eq!(located.location, None);
        assert_eq!(
            located.entry.first_cluster(),
            volume.geometry().root_cluster
        );
    }

    #[test]
    fn single_component_resolves_in_the_root() {
        let volume = nested_image();
        let located = volume.entry_from_path(b"TOP").unwrap();
        assert_eq!(located.entry.file_size, 3);
        assert!(located.location.is_some());
    }

    #[test]
    fn nested_paths_walk_directories() {
        let volume = nested_image();
        let located = volume.entry_from_path(b"SUB/DEEPER/LEAF.TXT").unwrap();
        assert_eq!(located.entry.file_size, 7);
        assert_eq!(located.entry.attr & ATTR_DIRECTORY, 0);
    }

    #[test]
    fn missing_components_fail() {
        let volume = nested_image();
        assert_eq!(
            volume.entry_from_path(b"SUB/MISSING").map(|_| ()),
            Err(FsError::DoesNotExist)
        );
        assert_eq!(
            volume.entry_from_path(b"NOWHERE/LEAF.TXT").map(|_| ()),
            Err(FsError::DoesNotExist)
        );
    }

    #[test]
    fn a_file_cannot_be_traversed_into() {
        let volume = nested_image();
        assert_eq!(
            volume.entry_from_path(b"TOP/below").map(|_| ()),
            Err(FsError::DoesNotExist)
        );
    }
}
