//! PCM stream format types.

use serde::{Deserialize, Serialize};

/// Speaker arrangement of a PCM stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    Mono,
    Stereo,
    /// Any other channel count, in decoder order.
    Discrete(u16),
}

impl ChannelLayout {
    /// Default layout for a channel count.
    pub const fn for_channels(channels: u16) -> Self {
        match channels {
            1 => Self::Mono,
            2 => Self::Stereo,
            n => Self::Discrete(n),
        }
    }

    /// Number of channels in this layout.
    pub const fn channels(self) -> u16 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Discrete(n) => n,
        }
    }
}

/// Format of decoded PCM audio.
///
/// Decoders report the format of the source; the engine always carries
/// samples as 32-bit float internally, so `bits_per_sample` is informational.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Frames per second.
    pub sample_rate: u32,
    /// Channels per frame.
    pub channels: u16,
    /// Source bit depth.
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// 44.1 kHz, 16-bit stereo.
    pub const fn cd_audio() -> Self {
        Self::new(44_100, 2, 16)
    }

    /// Check that the format describes a playable stream.
    pub const fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }

    /// Two streams can share a ring buffer (and so play back to back without
    /// a gap) when they agree on rate and channel count.
    pub const fn is_compatible(&self, other: &Self) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }

    pub const fn layout(&self) -> ChannelLayout {
        ChannelLayout::for_channels(self.channels)
    }

    /// Convert a frame count to seconds.
    pub fn frames_to_seconds(&self, frames: u64) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 / f64::from(self.sample_rate)
    }

    /// Convert seconds to a frame count, saturating at zero.
    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        if !seconds.is_finite() || seconds <= 0.0 {
            return 0;
        }
        (seconds * f64::from(self.sample_rate)).round() as u64
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}-bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_for_channels() {
        assert_eq!(ChannelLayout::for_channels(1), ChannelLayout::Mono);
        assert_eq!(ChannelLayout::for_channels(2), ChannelLayout::Stereo);
        assert_eq!(ChannelLayout::for_channels(6), ChannelLayout::Discrete(6));
        assert_eq!(ChannelLayout::Discrete(6).channels(), 6);
    }

    #[test]
    fn test_compatibility_ignores_bit_depth() {
        let a = AudioFormat::new(44_100, 2, 16);
        let b = AudioFormat::new(44_100, 2, 24);
        let c = AudioFormat::new(48_000, 2, 16);
        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&c));
        assert!(!AudioFormat::new(0, 2, 16).is_valid());
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_time_conversion() {
        let format = AudioFormat::cd_audio();
        assert_eq!(format.frames_to_seconds(88_200), 2.0);
        assert_eq!(format.seconds_to_frames(1.5), 66_150);
        assert_eq!(format.seconds_to_frames(-3.0), 0);
        assert_eq!(format.seconds_to_frames(f64::NAN), 0);
    }
}
