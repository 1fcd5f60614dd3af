//! Audio decoding using symphonia.

use std::io::{self, Read, Seek, SeekFrom};

use segue_core::{AudioFormat, Decoder, Error, InputSource, PcmBuffer, Result};
use symphonia::core::{
    audio::{AudioBuffer, Channels, Layout, Signal},
    codecs::{self, CodecParameters, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    units::TimeBase,
};
use tracing::{debug, trace, warn};

/// Presents an [`InputSource`] to symphonia as a `MediaSource`.
struct SourceReader {
    source: Box<dyn InputSource>,
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source
            .read(buf)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

impl Seek for SourceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.source.offset().checked_add_signed(delta),
            SeekFrom::End(delta) => self
                .source
                .length()
                .and_then(|length| length.checked_add_signed(delta)),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid seek offset"))?;

        self.source
            .seek_to(target)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(target)
    }
}

impl MediaSource for SourceReader {
    fn is_seekable(&self) -> bool {
        self.source.supports_seeking()
    }

    fn byte_len(&self) -> Option<u64> {
        self.source.length()
    }
}

/// Map a MIME type to the container extension symphonia probes for.
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    if mime.contains("webm") || mime.contains("opus") {
        Some("webm")
    } else if mime.contains("mp4") || mime.contains("m4a") || mime.contains("aac") {
        Some("m4a")
    } else if mime.contains("mp3") || mime.contains("mpeg") {
        Some("mp3")
    } else if mime.contains("ogg") || mime.contains("vorbis") {
        Some("ogg")
    } else if mime.contains("flac") {
        Some("flac")
    } else if mime.contains("wav") {
        Some("wav")
    } else {
        None
    }
}

/// Converts between PCM frames and a track's container timestamps, which
/// count in units of the track's time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackClock {
    sample_rate: u64,
    numer: u64,
    denom: u64,
}

impl TrackClock {
    /// Tracks without a time base count timestamps in frames.
    fn new(sample_rate: u32, time_base: Option<TimeBase>) -> Self {
        let (numer, denom) = match time_base {
            Some(tb) if tb.numer > 0 && tb.denom > 0 => (tb.numer, tb.denom),
            _ => (1, sample_rate.max(1)),
        };
        Self {
            sample_rate: u64::from(sample_rate.max(1)),
            numer: u64::from(numer),
            denom: u64::from(denom),
        }
    }

    /// Timestamp at or before `frame`.
    fn timestamp(self, frame: u64) -> u64 {
        let ticks = u128::from(frame) * u128::from(self.denom);
        let per_tick = u128::from(self.sample_rate) * u128::from(self.numer);
        u64::try_from(ticks / per_tick).unwrap_or(u64::MAX)
    }

    /// Frame nearest to `ts`.
    fn frame(self, ts: u64) -> u64 {
        let frames = u128::from(ts) * u128::from(self.numer) * u128::from(self.sample_rate);
        let denom = u128::from(self.denom);
        u64::try_from((frames + denom / 2) / denom).unwrap_or(u64::MAX)
    }
}

struct OpenStream {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn codecs::Decoder>,
    track_id: u32,
    clock: TrackClock,
    format: AudioFormat,
    frame_length: Option<u64>,
    seekable: bool,
    /// Converted packet not yet handed out.
    pending: Option<AudioBuffer<f32>>,
    pending_offset: usize,
}

impl OpenStream {
    fn pending_frames(&self) -> usize {
        self.pending
            .as_ref()
            .map_or(0, |buffer| buffer.frames() - self.pending_offset)
    }

    /// Decode the next packet of our track into `pending`. Returns `false`
    /// at the end of the stream.
    fn next_packet(&mut self) -> Result<bool> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(e) => {
                    return Err(Error::DecodeError(format!("Failed to read packet: {e}")));
                }
            };

            // Skip packets for other tracks
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let reusable = self.pending.as_ref().is_some_and(|buffer| {
                        buffer.capacity() >= decoded.capacity() && buffer.spec() == decoded.spec()
                    });
                    if !reusable {
                        self.pending =
                            Some(AudioBuffer::new(decoded.capacity() as u64, *decoded.spec()));
                    }
                    if let Some(buffer) = self.pending.as_mut() {
                        decoded.convert(buffer);
                    }
                    self.pending_offset = 0;
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Log and skip corrupt frames
                    warn!("Decode error (skipping): {e}");
                }
                Err(e) => {
                    return Err(Error::DecodeError(format!("Decode failed: {e}")));
                }
            }
        }
    }

    /// Copy up to `count` pending frames into `out` at frame `offset`.
    fn take_pending(&mut self, out: Option<(&mut PcmBuffer, usize)>, count: usize) -> usize {
        let count = count.min(self.pending_frames());
        let Some(buffer) = &self.pending else {
            return 0;
        };
        if let Some((out, offset)) = out {
            let channels = out.channels().min(buffer.spec().channels.count());
            for ch in 0..channels {
                let src = &buffer.chan(ch)[self.pending_offset..self.pending_offset + count];
                out.plane_mut(ch)[offset..offset + count].copy_from_slice(src);
            }
        }
        self.pending_offset += count;
        count
    }
}

/// The track's channel set, falling back to its layout.
fn track_channels(params: &CodecParameters) -> Option<Channels> {
    params
        .channels
        .or_else(|| params.channel_layout.map(Layout::into_channels))
        .filter(|channels| channels.count() > 0)
}

/// [`Decoder`] for every container and codec symphonia supports.
///
/// Reads through any [`InputSource`]. Seeking is frame accurate: after the
/// container seek, frames before the target are decoded and discarded.
pub struct SymphoniaDecoder {
    source: Option<Box<dyn InputSource>>,
    extension: Option<String>,
    url: Option<String>,
    stream: Option<OpenStream>,
}

impl SymphoniaDecoder {
    /// Create a decoder over `source`. Nothing is read until `open`.
    pub fn new(source: Box<dyn InputSource>) -> Self {
        let url = source.url().map(str::to_string);
        let extension = url
            .as_deref()
            .and_then(|url| url.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        Self {
            source: Some(source),
            extension,
            url,
            stream: None,
        }
    }

    /// Create a decoder with an explicit container hint (a file extension).
    pub fn with_hint(source: Box<dyn InputSource>, extension: Option<&str>) -> Self {
        let mut decoder = Self::new(source);
        if let Some(extension) = extension {
            decoder.extension = Some(extension.to_string());
        }
        decoder
    }

    fn stream_mut(&mut self) -> Result<&mut OpenStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("decoder is not open".to_string()))
    }
}

impl Decoder for SymphoniaDecoder {
    fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut source = self
            .source
            .take()
            .ok_or_else(|| Error::OpenFailed("decoder source already consumed".to_string()))?;
        if !source.is_open() {
            source.open()?;
        }
        let seekable = source.supports_seeking();

        let mss = MediaSourceStream::new(
            Box::new(SourceReader { source }),
            MediaSourceStreamOptions::default(),
        );

        let mut hint = Hint::new();
        if let Some(extension) = &self.extension {
            hint.with_extension(extension);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|e| Error::OpenFailed(format!("Failed to probe format: {e}")))?;

        let reader = probed.format;

        // Find the first audio track
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::OpenFailed("No audio tracks found".to_string()))?;

        let mut params = track.codec_params.clone();
        let track_id = track.id;
        let sample_rate = params
            .sample_rate
            .filter(|rate| *rate > 0)
            .ok_or_else(|| Error::UnsupportedFormat("Unknown sample rate".to_string()))?;
        let channel_set = track_channels(&params)
            .ok_or_else(|| Error::UnsupportedFormat("Unknown channel layout".to_string()))?;
        // Matroska only describes a layout; some codecs want the channel set.
        params.channels.get_or_insert(channel_set);
        let channels = channel_set.count() as u16;
        let bits = params.bits_per_sample.map_or(16, |bits| bits as u16);
        let format = AudioFormat::new(sample_rate, channels, bits);
        let clock = TrackClock::new(sample_rate, params.time_base);
        let frame_length = params.n_frames.map(|ts| clock.frame(ts));

        debug!(
            "Audio track: id={}, format={}, frames={:?}, time base={:?}",
            track_id, format, frame_length, params.time_base
        );

        let decoder_opts = DecoderOptions::default();
        let decoder = symphonia::default::get_codecs()
            .make(&params, &decoder_opts)
            .map_err(|e| Error::UnsupportedFormat(format!("Failed to create decoder: {e}")))?;

        self.stream = Some(OpenStream {
            reader,
            decoder,
            track_id,
            clock,
            format,
            frame_length,
            seekable,
            pending: None,
            pending_offset: 0,
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn format(&self) -> AudioFormat {
        self.stream
            .as_ref()
            .map_or(AudioFormat::new(0, 0, 0), |stream| stream.format)
    }

    fn frame_length(&self) -> Option<u64> {
        self.stream.as_ref().and_then(|stream| stream.frame_length)
    }

    fn supports_seeking(&self) -> bool {
        match &self.stream {
            Some(stream) => stream.seekable,
            None => self
                .source
                .as_ref()
                .is_some_and(|source| source.supports_seeking()),
        }
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64> {
        let stream = self.stream_mut()?;
        if !stream.seekable {
            return Err(Error::SeekNotSupported);
        }

        let seeked = stream
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: stream.clock.timestamp(frame),
                    track_id: stream.track_id,
                },
            )
            .map_err(|e| Error::DecodeError(format!("Seek failed: {e}")))?;

        // Reset decoder state
        stream.decoder.reset();
        stream.pending_offset = stream
            .pending
            .as_ref()
            .map_or(0, |buffer| buffer.frames());

        // Decode and discard up to the exact frame.
        let landed = stream.clock.frame(seeked.actual_ts);
        let mut position = landed;
        while position < frame {
            if stream.pending_frames() == 0 && !stream.next_packet()? {
                break;
            }
            let skip = usize::try_from(frame - position).unwrap_or(usize::MAX);
            position += stream.take_pending(None, skip) as u64;
        }

        trace!(
            "Seek to frame {} reached {} (container landed on frame {})",
            frame, position, landed
        );
        Ok(position)
    }

    fn decode_frames(&mut self, buffer: &mut PcmBuffer, frame_count: usize) -> Result<usize> {
        let stream = self.stream_mut()?;
        let frame_count = frame_count.min(buffer.capacity());
        let mut written = 0;

        while written < frame_count {
            if stream.pending_frames() == 0 && !stream.next_packet()? {
                break;
            }
            written += stream.take_pending(Some((&mut *buffer, written)), frame_count - written);
        }

        buffer.set_frames(written);
        Ok(written)
    }

    fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}
