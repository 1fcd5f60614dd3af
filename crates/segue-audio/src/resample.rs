//! Sample rate conversion between rendered content and the output device.

use rubato::{FftFixedIn, Resampler as RubatoResampler};
use segue_core::{Error, Result};
use tracing::debug;

/// Input frames converted per resampler call.
pub const DEFAULT_CHUNK_FRAMES: usize = 1024;

/// Pull-driven rate converter for interleaved audio.
///
/// All buffers are allocated up front, so [`RateConverter::fill`] is safe to
/// call from a real-time thread.
pub struct RateConverter {
    #[allow(clippy::struct_field_names)]
    resampler: FftFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Interleaved input pulled from the source, one chunk.
    pulled: Vec<f32>,
    /// Deinterleaved input chunk.
    input_buffer: Vec<Vec<f32>>,
    /// Deinterleaved output of the last call.
    output_buffer: Vec<Vec<f32>>,
    /// Interleaved converted samples not yet handed out.
    pending: Vec<f32>,
    pending_offset: usize,
}

impl RateConverter {
    /// Create a converter from `input_rate` to `output_rate`.
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        channels: usize,
        chunk_size: usize,
    ) -> Result<Self> {
        let resampler = FftFixedIn::new(
            input_rate as usize,
            output_rate as usize,
            chunk_size,
            2,
            channels,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to create resampler: {e}")))?;

        let output_buffer = resampler.output_buffer_allocate(true);
        let max_output = resampler.output_frames_max();

        debug!(
            "Resampler created: {}Hz -> {}Hz, {} channels",
            input_rate, output_rate, channels
        );

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels,
            pulled: vec![0.0; chunk_size * channels],
            input_buffer: vec![vec![0.0; chunk_size]; channels],
            output_buffer,
            pending: Vec::with_capacity(max_output * channels),
            pending_offset: 0,
        })
    }

    /// Get the input sample rate.
    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Get the output sample rate.
    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Get the number of channels.
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Fill `out` with converted samples, pulling whole input chunks from
    /// `source` as needed.
    pub fn fill(&mut self, out: &mut [f32], mut source: impl FnMut(&mut [f32])) {
        let mut written = 0;

        while written < out.len() {
            if self.pending_offset >= self.pending.len() {
                self.convert_next(&mut source);
                if self.pending.is_empty() {
                    break;
                }
            }

            let available = &self.pending[self.pending_offset..];
            let count = available.len().min(out.len() - written);
            out[written..written + count].copy_from_slice(&available[..count]);
            written += count;
            self.pending_offset += count;
        }

        out[written..].fill(0.0);
    }

    /// Reset the resampler state.
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
        self.pending_offset = 0;
    }

    fn convert_next(&mut self, source: &mut impl FnMut(&mut [f32])) {
        self.pending.clear();
        self.pending_offset = 0;

        source(&mut self.pulled);
        let frames = self.pulled.len() / self.channels;
        for (ch, buffer) in self.input_buffer.iter_mut().enumerate() {
            for (frame, sample) in buffer.iter_mut().enumerate().take(frames) {
                *sample = self.pulled[frame * self.channels + ch];
            }
        }

        // A failed chunk is dropped; the caller pads with silence.
        let Ok((_, produced)) =
            self.resampler
                .process_into_buffer(&self.input_buffer, &mut self.output_buffer, None)
        else {
            return;
        };

        for frame in 0..produced {
            for ch in &self.output_buffer {
                self.pending.push(ch[frame]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_converter_creation() {
        let converter = RateConverter::new(48000, 44100, 2, DEFAULT_CHUNK_FRAMES).unwrap();
        assert_eq!(converter.input_rate(), 48000);
        assert_eq!(converter.output_rate(), 44100);
        assert_eq!(converter.channels(), 2);
    }

    #[test]
    fn test_pulls_input_at_rate_ratio() {
        let mut converter = RateConverter::new(48000, 44100, 1, DEFAULT_CHUNK_FRAMES).unwrap();
        let mut pulled = 0usize;
        let mut out = vec![0.0f32; 44100];
        converter.fill(&mut out, |input| {
            pulled += input.len();
            input.fill(0.5);
        });

        // One second of output needs about one second of input.
        assert!(pulled > 46_000, "pulled {pulled}");
        assert!(pulled < 52_000, "pulled {pulled}");
    }

    #[test]
    fn test_dc_level_preserved() {
        let mut converter = RateConverter::new(44100, 48000, 2, DEFAULT_CHUNK_FRAMES).unwrap();
        let mut out = vec![0.0f32; 48000 * 2];
        converter.fill(&mut out, |input| input.fill(0.25));

        // Past the filter delay the level settles.
        for sample in &out[out.len() - 1000..] {
            assert!((sample - 0.25).abs() < 0.01, "sample {sample}");
        }
    }
}
