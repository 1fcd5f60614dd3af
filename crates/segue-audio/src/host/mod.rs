//! The output graph the engine renders into.
//!
//! A host owns the device stream, calls a [`Renderer`] from its real-time
//! thread, converts to the device rate when it differs from the content,
//! and runs the effect chain on the result.

pub mod offline;
pub mod output;

use std::sync::Arc;

use parking_lot::Mutex;
use segue_core::{AudioFormat, Effect, EffectId, Error, Result};
use tracing::debug;

use crate::render::Renderer;
use crate::resample::{RateConverter, DEFAULT_CHUNK_FRAMES};

pub use offline::{OfflineHandle, OfflineHost};
pub use output::CpalHost;

/// Device-side half of playback.
///
/// All methods are called from control threads, never from the render path.
/// Failed reconfiguration must leave the previous configuration in effect.
pub trait AudioHost: Send {
    /// (Re)build the output for `format`, driven by `renderer`.
    fn configure(&mut self, format: &AudioFormat, renderer: Renderer) -> Result<()>;

    /// Start pulling from the renderer.
    fn start(&mut self) -> Result<()>;

    /// Stop pulling from the renderer.
    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Append `effect` to the end of the chain.
    fn add_effect(&mut self, effect: Box<dyn Effect>) -> Result<EffectId>;

    fn remove_effect(&mut self, id: EffectId) -> Result<()>;

    /// Identifier of the output device in use.
    fn device_uid(&self) -> Option<String>;

    fn set_device_uid(&mut self, uid: &str) -> Result<()>;

    /// Sample rate the device runs at.
    fn device_sample_rate(&self) -> Option<u32>;

    fn set_device_sample_rate(&mut self, sample_rate: u32) -> Result<()>;

    /// Identifiers of every available output device.
    fn output_devices(&self) -> Result<Vec<String>>;
}

/// Ordered effects applied to interleaved output.
#[derive(Default)]
pub struct EffectChain {
    effects: Vec<(EffectId, Box<dyn Effect>)>,
    next_id: u64,
    format: Option<AudioFormat>,
}

/// Chain shared between a host and its render thread. The render thread
/// only ever `try_lock`s it.
pub type SharedEffectChain = Arc<Mutex<EffectChain>>;

impl EffectChain {
    pub fn shared() -> SharedEffectChain {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn add(&mut self, mut effect: Box<dyn Effect>) -> EffectId {
        if let Some(format) = &self.format {
            effect.prepare(format);
        }
        self.next_id += 1;
        let id = EffectId(self.next_id);
        debug!("Inserted {} as {id}", effect.name());
        self.effects.push((id, effect));
        id
    }

    pub fn remove(&mut self, id: EffectId) -> Result<()> {
        let index = self
            .effects
            .iter()
            .position(|(existing, _)| *existing == id)
            .ok_or_else(|| Error::InvalidArgument(format!("no such effect: {id}")))?;
        let (_, effect) = self.effects.remove(index);
        debug!("Removed {} ({id})", effect.name());
        Ok(())
    }

    /// Prepare every effect for a new stream format.
    pub fn prepare(&mut self, format: &AudioFormat) {
        for (_, effect) in &mut self.effects {
            effect.prepare(format);
            effect.reset();
        }
        self.format = Some(*format);
    }

    pub fn process(&mut self, samples: &mut [f32], channels: usize) {
        for (_, effect) in &mut self.effects {
            effect.process(samples, channels);
        }
    }

    pub fn ids(&self) -> Vec<EffectId> {
        self.effects.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

/// Everything that runs on the host's audio thread for one buffer.
pub(crate) struct OutputStage {
    renderer: Renderer,
    converter: Option<RateConverter>,
    effects: SharedEffectChain,
    channels: usize,
}

impl OutputStage {
    /// Build the stage for content in `format` played at `device_rate`.
    pub fn new(
        format: &AudioFormat,
        device_rate: u32,
        renderer: Renderer,
        effects: SharedEffectChain,
    ) -> Result<Self> {
        let channels = usize::from(format.channels);
        let converter = if device_rate == format.sample_rate {
            None
        } else {
            Some(RateConverter::new(
                format.sample_rate,
                device_rate,
                channels,
                DEFAULT_CHUNK_FRAMES,
            )?)
        };
        effects
            .lock()
            .prepare(&AudioFormat::new(device_rate, format.channels, 32));
        Ok(Self {
            renderer,
            converter,
            effects,
            channels,
        })
    }

    /// Fill `out` (interleaved, device rate).
    pub fn process(&mut self, out: &mut [f32]) {
        match &mut self.converter {
            Some(converter) => converter.fill(out, |input| self.renderer.render(input)),
            None => self.renderer.render(out),
        }
        // A chain being edited is skipped for one buffer.
        if let Some(mut chain) = self.effects.try_lock() {
            chain.process(out, self.channels);
        }
    }
}
