//! Processing stages inserted into the output graph.

use serde::{Deserialize, Serialize};

use crate::format::AudioFormat;

/// Stable handle for an effect inserted into an output graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectId(pub u64);

impl std::fmt::Display for EffectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "effect#{}", self.0)
    }
}

/// An opaque DSP stage run by the output graph after the render callback.
///
/// `process` runs on the real-time thread: no allocation, no blocking.
pub trait Effect: Send {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Called off the real-time thread whenever the stream format changes.
    fn prepare(&mut self, format: &AudioFormat) {
        let _ = format;
    }

    /// Process interleaved samples in place.
    fn process(&mut self, samples: &mut [f32], channels: usize);

    /// Clear any internal state (delay lines, envelopes).
    fn reset(&mut self) {}
}

/// Constant linear gain. Mostly useful for trims and tests.
#[derive(Debug, Clone)]
pub struct GainEffect {
    gain: f32,
}

impl GainEffect {
    pub const fn new(gain: f32) -> Self {
        Self { gain }
    }
}

impl Effect for GainEffect {
    fn name(&self) -> &str {
        "gain"
    }

    fn process(&mut self, samples: &mut [f32], _channels: usize) {
        for sample in samples {
            *sample *= self.gain;
        }
    }
}
