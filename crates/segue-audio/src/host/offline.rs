//! A host without hardware: the caller pulls rendered audio.
//!
//! Used for headless rendering and for driving the engine deterministically
//! in tests.

use std::sync::Arc;

use parking_lot::Mutex;
use segue_core::{AudioFormat, Effect, EffectId, Error, Result};
use tracing::debug;

use super::{AudioHost, EffectChain, OutputStage, SharedEffectChain};
use crate::render::Renderer;

/// Name of the single device an [`OfflineHost`] has by default.
pub const OFFLINE_DEVICE: &str = "offline";

struct OfflineState {
    devices: Vec<String>,
    /// Rates the simulated device accepts; empty accepts any.
    supported_rates: Vec<u32>,
    device: String,
    device_rate: Option<u32>,
    format: Option<AudioFormat>,
    renderer: Option<Renderer>,
    stage: Option<OutputStage>,
    running: bool,
}

impl OfflineState {
    fn accepts(&self, rate: u32) -> bool {
        self.supported_rates.is_empty() || self.supported_rates.contains(&rate)
    }
}

/// Pull-driven [`AudioHost`].
pub struct OfflineHost {
    state: Arc<Mutex<OfflineState>>,
    effects: SharedEffectChain,
}

/// Caller side of an [`OfflineHost`].
#[derive(Clone)]
pub struct OfflineHandle {
    state: Arc<Mutex<OfflineState>>,
}

impl OfflineHost {
    /// A host with one device that accepts any format.
    pub fn new() -> (Self, OfflineHandle) {
        Self::with_devices(vec![OFFLINE_DEVICE.to_string()], Vec::new())
    }

    /// A host with the given devices, accepting only `supported_rates`
    /// (any rate when empty). The first device is selected.
    pub fn with_devices(devices: Vec<String>, supported_rates: Vec<u32>) -> (Self, OfflineHandle) {
        let device = devices
            .first()
            .cloned()
            .unwrap_or_else(|| OFFLINE_DEVICE.to_string());
        let state = Arc::new(Mutex::new(OfflineState {
            devices,
            supported_rates,
            device,
            device_rate: None,
            format: None,
            renderer: None,
            stage: None,
            running: false,
        }));
        let handle = OfflineHandle {
            state: Arc::clone(&state),
        };
        (
            Self {
                state,
                effects: EffectChain::shared(),
            },
            handle,
        )
    }

    fn rebuild(&self, state: &mut OfflineState, device_rate: u32) -> Result<()> {
        let (Some(format), Some(renderer)) = (state.format, state.renderer.clone()) else {
            return Ok(());
        };
        state.stage = Some(OutputStage::new(
            &format,
            device_rate,
            renderer,
            Arc::clone(&self.effects),
        )?);
        Ok(())
    }
}

impl AudioHost for OfflineHost {
    fn configure(&mut self, format: &AudioFormat, renderer: Renderer) -> Result<()> {
        let mut state = self.state.lock();
        if !state.accepts(format.sample_rate) {
            return Err(Error::UnsupportedFormat(format!(
                "{} does not support {format}",
                state.device
            )));
        }
        let device_rate = state.device_rate.unwrap_or(format.sample_rate);
        let stage = OutputStage::new(
            format,
            device_rate,
            renderer.clone(),
            Arc::clone(&self.effects),
        )?;

        state.format = Some(*format);
        state.renderer = Some(renderer);
        state.stage = Some(stage);
        debug!("Offline host configured for {format} at {device_rate} Hz");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.state.lock().running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // Rendering holds the state lock, so none is in progress past this.
        self.state.lock().running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn add_effect(&mut self, effect: Box<dyn Effect>) -> Result<EffectId> {
        Ok(self.effects.lock().add(effect))
    }

    fn remove_effect(&mut self, id: EffectId) -> Result<()> {
        self.effects.lock().remove(id)
    }

    fn device_uid(&self) -> Option<String> {
        Some(self.state.lock().device.clone())
    }

    fn set_device_uid(&mut self, uid: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.devices.iter().any(|device| device == uid) {
            return Err(Error::DeviceConfigurationFailed(format!(
                "no output device named {uid}"
            )));
        }
        state.device = uid.to_string();
        Ok(())
    }

    fn device_sample_rate(&self) -> Option<u32> {
        let state = self.state.lock();
        state
            .device_rate
            .or_else(|| state.format.map(|format| format.sample_rate))
    }

    fn set_device_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        let mut state = self.state.lock();
        if sample_rate == 0 || !state.accepts(sample_rate) {
            return Err(Error::DeviceConfigurationFailed(format!(
                "{} does not support {sample_rate} Hz",
                state.device
            )));
        }
        self.rebuild(&mut state, sample_rate)
            .map_err(|e| Error::DeviceConfigurationFailed(e.to_string()))?;
        state.device_rate = Some(sample_rate);
        Ok(())
    }

    fn output_devices(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().devices.clone())
    }
}

impl OfflineHandle {
    /// Render `frames` frames at the device rate. Silence unless the host is
    /// configured and running.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut state = self.state.lock();
        let channels = state.format.map_or(0, |format| usize::from(format.channels));
        let mut out = vec![0.0; frames * channels];
        if state.running {
            if let Some(stage) = state.stage.as_mut() {
                stage.process(&mut out);
            }
        }
        out
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.state.lock().format
    }

    pub fn device(&self) -> String {
        self.state.lock().device.clone()
    }
}
