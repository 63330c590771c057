//! Resource names and kinds
//!
//! Every process is given an immutable map from 32-byte names to typed
//! capabilities at spawn. Names are fixed-size, zero-padded byte strings
//! compared bytewise; the conventional form is `service/operation`.

/// Length of a resource name in bytes.
pub const RESOURCE_NAME_MAX: usize = 32;

/// Kind of a named resource.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Empty = 0,
    ChannelSend = 1,
    ChannelReceive = 2,
    Message = 3,
}

impl ResourceKind {
    pub fn from_raw(raw: u64) -> Option<ResourceKind> {
        match raw {
            0 => Some(ResourceKind::Empty),
            1 => Some(ResourceKind::ChannelSend),
            2 => Some(ResourceKind::ChannelReceive),
            3 => Some(ResourceKind::Message),
            _ => None,
        }
    }
}

/// A fixed-size, zero-padded resource name.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ResourceName {
    pub bytes: [u8; RESOURCE_NAME_MAX],
}

impl ResourceName {
    /// Build a name from a string, zero-padding short inputs and truncating
    /// long ones.
    pub const fn new(s: &str) -> ResourceName {
        let src = s.as_bytes();
        let mut bytes = [0u8; RESOURCE_NAME_MAX];
        let mut i = 0;
        while i < src.len() && i < RESOURCE_NAME_MAX {
            bytes[i] = src[i];
            i += 1;
        }
        ResourceName { bytes }
    }

    /// Build a name from raw bytes (already padded).
    pub const fn from_bytes(bytes: [u8; RESOURCE_NAME_MAX]) -> ResourceName {
        ResourceName { bytes }
    }
}

impl core::fmt::Debug for ResourceName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let len = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(RESOURCE_NAME_MAX);
        match core::str::from_utf8(&self.bytes[..len]) {
            Ok(s) => write!(f, "ResourceName({:?})", s),
            Err(_) => write!(f, "ResourceName({:02x?})", &self.bytes[..len]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_is_zero_padded() {
        let name = ResourceName::new("file/open_r");
        assert_eq!(&name.bytes[..11], b"file/open_r");
        assert!(name.bytes[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn long_name_is_truncated() {
        let name = ResourceName::new("a-resource-name-well-past-thirty-two-bytes");
        assert_eq!(name.bytes.len(), RESOURCE_NAME_MAX);
        assert_eq!(name.bytes[31], b'-');
    }

    #[test]
    fn equality_is_bytewise() {
        assert_eq!(ResourceName::new("x"), ResourceName::new("x"));
        assert_ne!(ResourceName::new("x"), ResourceName::new("y"));
    }
}
