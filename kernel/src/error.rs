//! Kernel error codes
//!
//! Kernel-internal errors occupy a high range disjoint from the user codes:
//! the general codes (`Other`, `InvalidArg`, `NoMemory`) have kernel analogs,
//! and the specific codes exist only in the kernel range. [`KError::user_code`]
//! performs the translation at the syscall boundary; any kernel code without a
//! user mapping becomes `InvalidArg` so internal details never leak.

use sable_abi::Error;

/// Base of the kernel error range.
pub const ERR_KERNEL_MIN: u64 = 0xFFFF_FFFF_FFFF_0000;
/// Base of the kernel-specific error range.
pub const ERR_KERNEL_SPECIFIC_MIN: u64 = 0xFFFF_FFFF_FFFF_1000;

/// Result alias used throughout the kernel.
pub type KResult<T> = Result<T, KError>;

/// Kernel-internal error codes.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KError {
    // General codes, analogous to the user-space ones
    Other = ERR_KERNEL_MIN + 1,
    InvalidArg = ERR_KERNEL_MIN + 2,
    NoMemory = ERR_KERNEL_MIN + 3,
    // Specific codes, no general analog
    InvalidSyscall = ERR_KERNEL_SPECIFIC_MIN,
    PageAlreadyMapped = ERR_KERNEL_SPECIFIC_MIN + 1,
    InvalidHandle = ERR_KERNEL_SPECIFIC_MIN + 2,
    WrongHandleType = ERR_KERNEL_SPECIFIC_MIN + 3,
    InvalidAddress = ERR_KERNEL_SPECIFIC_MIN + 4,
    MessageDataTooShort = ERR_KERNEL_SPECIFIC_MIN + 5,
    MessageDataTooLong = ERR_KERNEL_SPECIFIC_MIN + 6,
    MessageHandlesTooShort = ERR_KERNEL_SPECIFIC_MIN + 7,
    MessageHandlesTooLong = ERR_KERNEL_SPECIFIC_MIN + 8,
    InvalidResource = ERR_KERNEL_SPECIFIC_MIN + 9,
    WrongResourceType = ERR_KERNEL_SPECIFIC_MIN + 10,
    ChannelClosed = ERR_KERNEL_SPECIFIC_MIN + 11,
    MessageWrongHandleType = ERR_KERNEL_SPECIFIC_MIN + 12,
    UncopyableHandleType = ERR_KERNEL_SPECIFIC_MIN + 13,
    MqueueAlreadySet = ERR_KERNEL_SPECIFIC_MIN + 14,
    TimedOut = ERR_KERNEL_SPECIFIC_MIN + 15,
    WouldBlock = ERR_KERNEL_SPECIFIC_MIN + 16,
}

impl KError {
    /// Translate to the code surfaced to user space.
    pub fn user_code(self) -> Error {
        match self {
            KError::Other => Error::Other,
            KError::InvalidArg => Error::InvalidArg,
            KError::NoMemory => Error::NoMemory,
            KError::InvalidSyscall => Error::InvalidSyscall,
            KError::PageAlreadyMapped => Error::PageAlreadyMapped,
            KError::InvalidHandle => Error::InvalidHandle,
            KError::WrongHandleType => Error::WrongHandleType,
            KError::InvalidAddress => Error::InvalidAddress,
            KError::MessageDataTooShort => Error::MessageDataTooShort,
            KError::MessageDataTooLong => Error::MessageDataTooLong,
            KError::MessageHandlesTooShort => Error::MessageHandlesTooShort,
            KError::MessageHandlesTooLong => Error::MessageHandlesTooLong,
            KError::InvalidResource => Error::InvalidResource,
            KError::WrongResourceType => Error::WrongResourceType,
            KError::ChannelClosed => Error::ChannelClosed,
            KError::MessageWrongHandleType => Error::MessageWrongHandleType,
            KError::UncopyableHandleType => Error::UncopyableHandleType,
            KError::MqueueAlreadySet => Error::MqueueAlreadySet,
            KError::TimedOut => Error::TimedOut,
            KError::WouldBlock => Error::WouldBlock,
        }
    }

    /// The raw code returned in `rax`, already translated for user space.
    #[inline]
    pub fn syscall_code(self) -> u64 {
        self.user_code().code()
    }
}
