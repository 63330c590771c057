//! User-visible error codes
//!
//! Every syscall returns one of these codes (or 0 for success) in `rax`.
//! Kernel-internal errors live in a separate high range and are translated
//! at the syscall boundary; user space only ever sees the codes below.

use core::fmt;

/// Error codes surfaced to user space.
///
/// The discriminants are the wire values and must stay stable.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unspecified failure
    Other = 1,
    /// Invalid argument
    InvalidArg = 2,
    /// Out of kernel memory
    NoMemory = 3,
    /// Syscall number out of range
    InvalidSyscall = 4,
    /// A page in the requested range is already mapped with different bits
    PageAlreadyMapped = 5,
    /// Handle index does not name an occupied slot
    InvalidHandle = 6,
    /// Handle exists but has the wrong kind for the operation
    WrongHandleType = 7,
    /// User buffer wraps or extends into kernel space
    InvalidAddress = 8,
    /// Message data shorter than the receiver required
    MessageDataTooShort = 9,
    /// Message data longer than the receive buffer
    MessageDataTooLong = 10,
    /// Fewer attached handles than the receiver required
    MessageHandlesTooShort = 11,
    /// More attached handles than the receive spec accepts
    MessageHandlesTooLong = 12,
    /// No resource with the given name
    InvalidResource = 13,
    /// Resource exists but has the wrong kind
    WrongResourceType = 14,
    /// All endpoints of the channel are gone
    ChannelClosed = 15,
    /// An attached handle has a kind the receive spec did not expect
    MessageWrongHandleType = 16,
    /// Attempted to copy a handle kind that only supports move
    UncopyableHandleType = 17,
    /// The channel is already bound to a message queue
    MqueueAlreadySet = 18,
    /// A blocking operation reached its deadline
    TimedOut = 19,
    /// A non-blocking operation would have blocked
    WouldBlock = 20,
    /// Path component does not exist
    DoesNotExist = 21,
    /// Path component is not a directory
    NotDir = 22,
    /// Range extends past the end of the file
    Eof = 23,
    /// Not enough free space on the volume
    NoSpace = 24,
    /// The storage backend returned inconsistent data
    IoInternal = 25,
}

impl Error {
    /// Decode a wire value. Unknown values decode as `Other`.
    pub fn from_code(code: u64) -> Error {
        match code {
            1 => Error::Other,
            2 => Error::InvalidArg,
            3 => Error::NoMemory,
            4 => Error::InvalidSyscall,
            5 => Error::PageAlreadyMapped,
            6 => Error::InvalidHandle,
            7 => Error::WrongHandleType,
            8 => Error::InvalidAddress,
            9 => Error::MessageDataTooShort,
            10 => Error::MessageDataTooLong,
            11 => Error::MessageHandlesTooShort,
            12 => Error::MessageHandlesTooLong,
            13 => Error::InvalidResource,
            14 => Error::WrongResourceType,
            15 => Error::ChannelClosed,
            16 => Error::MessageWrongHandleType,
            17 => Error::UncopyableHandleType,
            18 => Error::MqueueAlreadySet,
            19 => Error::TimedOut,
            20 => Error::WouldBlock,
            21 => Error::DoesNotExist,
            22 => Error::NotDir,
            23 => Error::Eof,
            24 => Error::NoSpace,
            25 => Error::IoInternal,
            _ => Error::Other,
        }
    }

    /// The wire value of this code.
    #[inline]
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Interpret a raw syscall return value.
    ///
    /// Zero means success, anything else is an error code.
    pub fn from_syscall(ret: u64) -> Result<(), Error> {
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::from_code(ret))
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Error::Other => "unspecified error",
            Error::InvalidArg => "invalid argument",
            Error::NoMemory => "out of memory",
            Error::InvalidSyscall => "invalid syscall number",
            Error::PageAlreadyMapped => "page already mapped",
            Error::InvalidHandle => "invalid handle",
            Error::WrongHandleType => "wrong handle type",
            Error::InvalidAddress => "invalid address",
            Error::MessageDataTooShort => "message data too short",
            Error::MessageDataTooLong => "message data too long",
            Error::MessageHandlesTooShort => "message handles too short",
            Error::MessageHandlesTooLong => "message handles too long",
            Error::InvalidResource => "invalid resource",
            Error::WrongResourceType => "wrong resource type",
            Error::ChannelClosed => "channel closed",
            Error::MessageWrongHandleType => "attached handle has wrong type",
            Error::UncopyableHandleType => "handle type cannot be copied",
            Error::MqueueAlreadySet => "channel already bound to a message queue",
            Error::TimedOut => "timed out",
            Error::WouldBlock => "operation would block",
            Error::DoesNotExist => "does not exist",
            Error::NotDir => "not a directory",
            Error::Eof => "end of file",
            Error::NoSpace => "no space left",
            Error::IoInternal => "internal i/o error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 1..=25u64 {
            let err = Error::from_code(code);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn unknown_code_is_other() {
        assert_eq!(Error::from_code(0xDEAD), Error::Other);
        assert_eq!(Error::from_code(0), Error::Other);
    }

    #[test]
    fn syscall_return_decoding() {
        assert_eq!(Error::from_syscall(0), Ok(()));
        assert_eq!(Error::from_syscall(3), Err(Error::NoMemory));
    }
}
