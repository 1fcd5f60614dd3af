//! Input source serving bytes from a region of memory.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use bytes::Bytes;

use super::InputSource;
use crate::{Error, Result};

/// Serves bytes held in memory.
///
/// Built either by copying a borrowed slice or by taking shared ownership of
/// an existing `Bytes` handle without copying.
#[derive(Debug, Clone)]
pub struct MemoryInputSource {
    data: Bytes,
    position: usize,
    open: bool,
}

impl MemoryInputSource {
    /// Copy `bytes` into a new source.
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self::from_bytes(Bytes::copy_from_slice(bytes))
    }

    /// Serve `data` without copying it.
    pub const fn from_bytes(data: Bytes) -> Self {
        Self {
            data,
            position: 0,
            open: false,
        }
    }

    /// The underlying bytes.
    pub const fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryInputSource {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(Bytes::from(data))
    }
}

impl InputSource for MemoryInputSource {
    fn open(&mut self) -> Result<()> {
        self.position = 0;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::OpenFailed("memory source is not open".to_string()));
        }
        let remaining = &self.data[self.position..];
        let count = remaining.len().min(buffer.len());
        buffer[..count].copy_from_slice(&remaining[..count]);
        self.position += count;
        Ok(count)
    }

    fn at_end(&self) -> bool {
        self.position == self.data.len()
    }

    fn offset(&self) -> u64 {
        self.position as u64
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: u64) -> Result<()> {
        let offset = usize::try_from(offset)
            .ok()
            .filter(|&o| o <= self.data.len())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "offset {offset} is past the end of a {}-byte source",
                    self.data.len()
                ))
            })?;
        self.position = offset;
        Ok(())
    }
}
