//! Syscall numbers
//!
//! The number goes in `rax`, arguments in `rdi`, `rsi`, `rdx`, `r10`, `r8`,
//! `r9`; the error code comes back in `rax` with 0 meaning success. Outputs
//! are written through pointer arguments.

pub const SYS_MAP_PAGES: u64 = 0;
pub const SYS_PROCESS_EXIT: u64 = 1;
pub const SYS_PROCESS_YIELD: u64 = 2;
pub const SYS_PROCESS_WAIT: u64 = 3;
pub const SYS_MESSAGE_GET_LENGTH: u64 = 4;
pub const SYS_MESSAGE_READ: u64 = 5;
pub const SYS_CHANNEL_CREATE: u64 = 6;
pub const SYS_CHANNEL_SEND: u64 = 7;
pub const SYS_CHANNEL_CALL: u64 = 8;
pub const SYS_CHANNEL_CALL_ASYNC: u64 = 9;
pub const SYS_MESSAGE_REPLY: u64 = 10;
pub const SYS_MESSAGE_REPLY_ERROR: u64 = 11;
pub const SYS_MQUEUE_CREATE: u64 = 12;
pub const SYS_MQUEUE_RECEIVE: u64 = 13;
pub const SYS_MQUEUE_ADD_CHANNEL: u64 = 14;
pub const SYS_MQUEUE_ADD_CHANNEL_RESOURCE: u64 = 15;
pub const SYS_RESOURCE_GET: u64 = 16;
pub const SYS_MESSAGE_RESOURCE_READ: u64 = 17;
pub const SYS_HANDLE_FREE: u64 = 18;
pub const SYS_TIME_GET: u64 = 19;
pub const SYS_PROCESS_TIME_GET: u64 = 20;

/// Highest valid syscall number.
pub const SYS_MAX: u64 = SYS_PROCESS_TIME_GET;
