//! # segue-core
//!
//! Core types, contracts, and error handling for the Segue gapless playback engine.

pub mod config;
pub mod decoder;
pub mod effect;
pub mod error;
pub mod format;
pub mod pcm;
pub mod source;

pub use config::{EngineConfig, ACTIVE_DECODER_SLOTS};
pub use decoder::Decoder;
pub use effect::{Effect, EffectId, GainEffect};
pub use error::{Error, Result};
pub use format::{AudioFormat, ChannelLayout};
pub use pcm::PcmBuffer;
pub use source::{FileInputSource, InputSource, MemoryInputSource};
