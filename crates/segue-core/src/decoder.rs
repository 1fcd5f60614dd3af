//! The decode contract consumed by the playback engine.

use crate::format::AudioFormat;
use crate::pcm::PcmBuffer;
use crate::Result;

/// A source of PCM frames.
///
/// Implementations turn the bytes of one input source into planar float
/// frames. The engine takes ownership of a decoder when it is enqueued and
/// drops it once every decoded frame has been rendered.
///
/// Decoders are driven from the engine's decoder thread only, so they need
/// to be `Send` but never `Sync`.
pub trait Decoder: Send {
    /// Open the underlying source and read enough to report a format.
    fn open(&mut self) -> Result<()>;

    /// Whether `open` has succeeded.
    fn is_open(&self) -> bool;

    /// Format of the decoded stream. Only meaningful once open.
    fn format(&self) -> AudioFormat;

    /// Total length in frames, or `None` for streams of unknown length.
    fn frame_length(&self) -> Option<u64>;

    /// Whether `seek_to_frame` is supported.
    fn supports_seeking(&self) -> bool {
        false
    }

    /// Reposition so the next decoded frame is `frame`.
    ///
    /// Returns the frame actually reached.
    fn seek_to_frame(&mut self, frame: u64) -> Result<u64> {
        let _ = frame;
        Err(crate::Error::SeekNotSupported)
    }

    /// Decode up to `frame_count` frames into the start of `buffer`.
    ///
    /// Sets `buffer`'s valid frame count and returns it. Zero means the end of
    /// the stream has been reached. `buffer` has as many channels as
    /// `format().channels` and at least `frame_count` frames of capacity.
    fn decode_frames(&mut self, buffer: &mut PcmBuffer, frame_count: usize) -> Result<usize>;

    /// Location the decoder reads from, if it has one.
    fn url(&self) -> Option<&str> {
        None
    }
}

impl std::fmt::Debug for dyn Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("url", &self.url())
            .field("open", &self.is_open())
            .field("frame_length", &self.frame_length())
            .finish_non_exhaustive()
    }
}
