//! Utilities used across the collector.

mod address;
pub use address::{Address, ByteOffset, ByteSize, ObjectRef};

pub mod constants;
pub mod options;
pub mod pages;

#[cfg(test)]
pub mod test_util;
