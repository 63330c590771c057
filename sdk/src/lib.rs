//! Sable user-space SDK
//!
//! Thin, safe wrappers over the raw syscall interface plus the message
//! helpers every service ends up writing: single-buffer sends, call-and-read
//! round trips, reply shorthands.

#![cfg_attr(not(test), no_std)]

pub mod channel;
pub mod syscall;

pub use sable_abi as abi;
pub use sable_abi::{Error, RawHandle};

/// Result alias for user-space code.
pub type Result<T> = core::result::Result<T, Error>;
