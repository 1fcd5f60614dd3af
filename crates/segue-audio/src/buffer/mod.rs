//! Lock-free buffer implementations for real-time audio.

pub mod ring;

pub use ring::{RingBuffer, RingBufferError};
