//! # segue-audio
//!
//! Gapless playback engine for Segue.
//!
//! Features:
//! - Lock-free ring buffer shared by the decoder worker and the render callback
//! - Decoders queued back to back on one timeline, so tracks join without a gap
//! - Frame-accurate seeking, with lookahead decoders rewound
//! - Symphonia decoding and cpal output, resampled with rubato when the device
//!   runs at another rate

pub mod buffer;
pub mod decode;
mod fence;
pub mod host;
pub mod player;
pub mod render;
pub mod resample;
mod shared;
mod signal;
mod slot;
mod worker;

#[cfg(test)]
mod test_support;

pub use buffer::{RingBuffer, RingBufferError};
pub use decode::SymphoniaDecoder;
pub use host::{AudioHost, CpalHost, EffectChain, OfflineHandle, OfflineHost};
pub use player::{PlaybackState, Player, PlayerEvent};
pub use render::Renderer;
pub use resample::RateConverter;
