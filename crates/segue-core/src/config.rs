//! Engine tuning parameters.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of decoders that may be in flight at once (decoding or still
/// waiting to be rendered).
pub const ACTIVE_DECODER_SLOTS: usize = 8;

/// Tuning for one playback engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ring buffer capacity in frames (rounded up to a power of two).
    pub ring_buffer_frames: usize,
    /// Frames requested from a decoder per decode call. Bounds stop/seek latency.
    pub decode_chunk_frames: usize,
    /// Largest block the render callback processes in one pass; longer host
    /// requests are split.
    pub render_block_frames: usize,
    /// Collector safety-net poll interval.
    pub collector_timeout_ms: u64,
    /// Decoder worker poll interval while idle.
    pub decoder_idle_timeout_ms: u64,
    /// Initial output volume (0.0 to 1.0).
    pub volume: f32,
    /// Initial linear gain applied before volume.
    pub pre_gain: f32,
    /// Clamp rendered samples to full scale.
    pub hard_limiting: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_buffer_frames: 16_384,
            decode_chunk_frames: 2048,
            render_block_frames: 1024,
            collector_timeout_ms: 2000,
            decoder_idle_timeout_ms: 250,
            volume: 1.0,
            pre_gain: 1.0,
            hard_limiting: false,
        }
    }
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ring_buffer_frames == 0 {
            return Err(Error::InvalidArgument(
                "ring_buffer_frames must be non-zero".to_string(),
            ));
        }
        if self.decode_chunk_frames == 0 || self.decode_chunk_frames > self.ring_buffer_frames {
            return Err(Error::InvalidArgument(format!(
                "decode_chunk_frames must be between 1 and {}",
                self.ring_buffer_frames
            )));
        }
        if self.render_block_frames == 0 {
            return Err(Error::InvalidArgument(
                "render_block_frames must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::InvalidArgument(format!(
                "volume {} is outside 0.0..=1.0",
                self.volume
            )));
        }
        if !self.pre_gain.is_finite() || self.pre_gain < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "pre_gain {} must be finite and non-negative",
                self.pre_gain
            )));
        }
        Ok(())
    }

    /// Ring capacity after power-of-two rounding.
    pub const fn ring_capacity(&self) -> usize {
        self.ring_buffer_frames.next_power_of_two()
    }

    pub const fn collector_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_timeout_ms)
    }

    pub const fn decoder_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.decoder_idle_timeout_ms)
    }
}
