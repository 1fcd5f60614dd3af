//! Input source reading from a local file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::InputSource;
use crate::{Error, Result};

/// Reads bytes from a file on disk.
#[derive(Debug)]
pub struct FileInputSource {
    path: PathBuf,
    url: String,
    file: Option<File>,
    length: u64,
    offset: u64,
}

impl FileInputSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let url = format!("file://{}", path.display());
        Self {
            path,
            url,
            file: None,
            length: 0,
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::OpenFailed(format!("{} is not open", self.path.display())))
    }
}

impl InputSource for FileInputSource {
    fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .map_err(|e| Error::OpenFailed(format!("{}: {e}", self.path.display())))?;
        self.length = file.metadata()?.len();
        self.offset = 0;
        self.file = Some(file);
        debug!("Opened {} ({} bytes)", self.path.display(), self.length);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let count = self.file_mut()?.read(buffer)?;
        self.offset += count as u64;
        Ok(count)
    }

    fn at_end(&self) -> bool {
        self.offset >= self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn length(&self) -> Option<u64> {
        self.file.as_ref().map(|_| self.length)
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.offset = self.file_mut()?.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn url(&self) -> Option<&str> {
        Some(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_fails_to_open() {
        let mut source = FileInputSource::new("/nonexistent/segue/track.flac");
        assert!(matches!(source.open(), Err(Error::OpenFailed(_))));
        assert!(!source.is_open());
        assert!(source.length().is_none());
    }

    #[test]
    fn test_url_uses_file_scheme() {
        let source = FileInputSource::new("/music/a.flac");
        assert_eq!(source.url(), Some("file:///music/a.flac"));
    }
}
