//! Seekable byte sources consumed by decoders.

pub mod file;
pub mod memory;

pub use file::FileInputSource;
pub use memory::MemoryInputSource;

use crate::Result;

/// A readable, optionally seekable stream of bytes.
///
/// Sources must be `Sync` so decoders built on container demuxers can hold
/// them behind shared media-source adapters.
pub trait InputSource: Send + Sync {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Read up to `buffer.len()` bytes, returning how many were read.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    fn at_end(&self) -> bool;

    /// Current read offset in bytes.
    fn offset(&self) -> u64;

    /// Total length in bytes, if known.
    fn length(&self) -> Option<u64>;

    fn supports_seeking(&self) -> bool;

    /// Move the read offset to `offset` bytes from the start.
    fn seek_to(&mut self, offset: u64) -> Result<()>;

    /// Location of the bytes, if they have one.
    fn url(&self) -> Option<&str> {
        None
    }
}
