//! Audio output using cpal.

use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, SampleRate, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use segue_core::{AudioFormat, Effect, EffectId, Error, Result};
use tracing::{debug, error, info, warn};

use super::{AudioHost, EffectChain, OutputStage, SharedEffectChain};
use crate::render::Renderer;

/// Frames preallocated for the callback's conversion buffer.
const CALLBACK_SCRATCH_FRAMES: usize = 4096;

type Reply<T> = Sender<Result<T>>;

/// Commands handled by the output thread.
enum HostCommand {
    Configure {
        format: AudioFormat,
        renderer: Renderer,
        reply: Reply<Option<u32>>,
    },
    Start(Reply<()>),
    Stop(Reply<()>),
    SetDevice {
        name: String,
        reply: Reply<Option<u32>>,
    },
    SetSampleRate {
        rate: u32,
        reply: Reply<Option<u32>>,
    },
    Shutdown,
}

/// [`AudioHost`] backed by the system's default cpal host.
///
/// `cpal::Stream` is not `Send`, so streams live on a dedicated thread that
/// this handle talks to over a command channel.
pub struct CpalHost {
    commands: Sender<HostCommand>,
    thread: Option<JoinHandle<()>>,
    effects: SharedEffectChain,
    running: bool,
    device_name: Option<String>,
    sample_rate: Option<u32>,
}

impl CpalHost {
    /// Create a host that will use the default output device.
    pub fn new() -> Result<Self> {
        let (commands, rx) = unbounded();
        let effects = EffectChain::shared();

        let thread_effects = Arc::clone(&effects);
        let thread = std::thread::Builder::new()
            .name("segue-output".to_string())
            .spawn(move || {
                let output = OutputThread {
                    device_name: None,
                    requested_rate: None,
                    format: None,
                    renderer: None,
                    stream: None,
                    playing: false,
                    effects: thread_effects,
                };
                output.run(&rx);
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn output thread: {e}")))?;

        Ok(Self {
            commands,
            thread: Some(thread),
            effects,
            running: false,
            device_name: None,
            sample_rate: None,
        })
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> HostCommand) -> Result<T> {
        let (tx, rx) = bounded(1);
        self.commands.send(make(tx)).map_err(|_| Error::Shutdown)?;
        rx.recv().map_err(|_| Error::Shutdown)?
    }
}

impl AudioHost for CpalHost {
    fn configure(&mut self, format: &AudioFormat, renderer: Renderer) -> Result<()> {
        let format = *format;
        let rate = self.request(|reply| HostCommand::Configure {
            format,
            renderer,
            reply,
        })?;
        self.sample_rate = rate;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.request(HostCommand::Start)?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.request(HostCommand::Stop)?;
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn add_effect(&mut self, effect: Box<dyn Effect>) -> Result<EffectId> {
        Ok(self.effects.lock().add(effect))
    }

    fn remove_effect(&mut self, id: EffectId) -> Result<()> {
        self.effects.lock().remove(id)
    }

    fn device_uid(&self) -> Option<String> {
        self.device_name.clone().or_else(default_device_name)
    }

    fn set_device_uid(&mut self, uid: &str) -> Result<()> {
        let name = uid.to_string();
        let rate = self.request(|reply| HostCommand::SetDevice { name, reply })?;
        self.device_name = Some(uid.to_string());
        self.sample_rate = rate.or(self.sample_rate);
        Ok(())
    }

    fn device_sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    fn set_device_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        let rate = self.request(|reply| HostCommand::SetSampleRate {
            rate: sample_rate,
            reply,
        })?;
        self.sample_rate = rate;
        Ok(())
    }

    fn output_devices(&self) -> Result<Vec<String>> {
        list_output_devices()
    }
}

impl Drop for CpalHost {
    fn drop(&mut self) {
        let _ = self.commands.send(HostCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Output thread panicked");
            }
        }
    }
}

/// Owns the device stream.
struct OutputThread {
    device_name: Option<String>,
    /// Explicitly requested device rate; otherwise the content rate is used
    /// when the device supports it.
    requested_rate: Option<u32>,
    format: Option<AudioFormat>,
    renderer: Option<Renderer>,
    stream: Option<Stream>,
    playing: bool,
    effects: SharedEffectChain,
}

impl OutputThread {
    fn run(mut self, commands: &Receiver<HostCommand>) {
        debug!("Output thread started");
        while let Ok(command) = commands.recv() {
            match command {
                HostCommand::Configure {
                    format,
                    renderer,
                    reply,
                } => {
                    let previous = (self.format.replace(format), self.renderer.replace(renderer));
                    let result = self.rebuild(self.device_name.clone(), self.requested_rate);
                    if result.is_err() {
                        (self.format, self.renderer) = previous;
                    }
                    let _ = reply.send(result);
                }
                HostCommand::Start(reply) => {
                    let _ = reply.send(self.set_playing(true));
                }
                HostCommand::Stop(reply) => {
                    let _ = reply.send(self.set_playing(false));
                }
                HostCommand::SetDevice { name, reply } => {
                    let result = self
                        .rebuild(Some(name.clone()), self.requested_rate)
                        .map_err(as_device_error);
                    if result.is_ok() {
                        self.device_name = Some(name);
                    }
                    let _ = reply.send(result);
                }
                HostCommand::SetSampleRate { rate, reply } => {
                    let result = self
                        .rebuild(self.device_name.clone(), Some(rate))
                        .map_err(as_device_error);
                    if result.is_ok() {
                        self.requested_rate = Some(rate);
                    }
                    let _ = reply.send(result);
                }
                HostCommand::Shutdown => break,
            }
        }
        self.stream = None;
        debug!("Output thread stopped");
    }

    fn set_playing(&mut self, playing: bool) -> Result<()> {
        if let Some(stream) = &self.stream {
            if playing {
                stream
                    .play()
                    .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {e}")))?;
            } else {
                stream
                    .pause()
                    .map_err(|e| Error::AudioOutput(format!("Failed to pause stream: {e}")))?;
            }
        }
        self.playing = playing;
        Ok(())
    }

    /// Build a stream for the current format on `device_name` (default device
    /// when `None`). The running stream is replaced only on success. Returns
    /// the device sample rate, or the requested one while unconfigured.
    fn rebuild(&mut self, device_name: Option<String>, rate: Option<u32>) -> Result<Option<u32>> {
        let device = find_device(device_name.as_deref())?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let (Some(format), Some(renderer)) = (self.format, self.renderer.clone()) else {
            // Nothing to play yet; validate the request and remember it.
            return Ok(rate);
        };

        let (config, sample_format) = pick_config(&device, &format, rate)?;
        let device_rate = config.sample_rate.0;
        debug!(
            "Output config on {name}: {}Hz, {} channels, {:?}",
            device_rate, config.channels, sample_format
        );

        let stage =
            OutputStage::new(&format, device_rate, renderer, Arc::clone(&self.effects))?;
        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, stage)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, stage)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, stage)?,
            _ => {
                return Err(Error::UnsupportedFormat(format!(
                    "Unsupported sample format: {sample_format:?}"
                )));
            }
        };

        if self.playing {
            stream
                .play()
                .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {e}")))?;
        }
        self.stream = Some(stream);

        info!("Audio output on {name}: {format} -> {device_rate} Hz");
        Ok(Some(device_rate))
    }
}

fn as_device_error(error: Error) -> Error {
    match error {
        Error::DeviceConfigurationFailed(_) => error,
        other => Error::DeviceConfigurationFailed(other.to_string()),
    }
}

fn find_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("No output device found".to_string())),
        Some(name) => host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
            .find(|device| device.name().is_ok_and(|n| n == name))
            .ok_or_else(|| {
                Error::DeviceConfigurationFailed(format!("No output device named {name}"))
            }),
    }
}

/// Choose a stream configuration with the content's channel count.
///
/// An explicit `rate` must be supported. Otherwise the content rate is
/// preferred and the device's default rate is the fallback.
fn pick_config(
    device: &Device,
    format: &AudioFormat,
    rate: Option<u32>,
) -> Result<(StreamConfig, SampleFormat)> {
    let ranges: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| Error::AudioOutput(format!("Failed to get output configs: {e}")))?
        .filter(|range| range.channels() == format.channels)
        .collect();
    if ranges.is_empty() {
        return Err(Error::UnsupportedFormat(format!(
            "Device has no {}-channel output",
            format.channels
        )));
    }

    let supports = |rate: u32| {
        ranges
            .iter()
            .find(|range| range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0)
            .map(|range| range.clone().with_sample_rate(SampleRate(rate)))
    };

    let supported = match rate {
        Some(rate) => supports(rate).ok_or_else(|| {
            Error::DeviceConfigurationFailed(format!("Device does not support {rate} Hz"))
        })?,
        None => match supports(format.sample_rate) {
            Some(config) => config,
            None => {
                let default = device.default_output_config().map_err(|e| {
                    Error::AudioOutput(format!("Failed to get output config: {e}"))
                })?;
                warn!(
                    "Device does not support {} Hz, resampling to {} Hz",
                    format.sample_rate,
                    default.sample_rate().0
                );
                supports(default.sample_rate().0).ok_or_else(|| {
                    Error::UnsupportedFormat(format!("No usable output rate for {format}"))
                })?
            }
        },
    };

    let sample_format = supported.sample_format();
    Ok((supported.config(), sample_format))
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &Device,
    config: &StreamConfig,
    mut stage: OutputStage,
) -> Result<Stream> {
    // Whole frames, so chunks never split one.
    let mut scratch = vec![0.0f32; CALLBACK_SCRATCH_FRAMES * usize::from(config.channels)];

    let err_fn = |err| {
        error!("Audio stream error: {err}");
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for chunk in data.chunks_mut(scratch.len()) {
                    let rendered = &mut scratch[..chunk.len()];
                    stage.process(rendered);
                    for (sample, value) in chunk.iter_mut().zip(rendered.iter()) {
                        *sample = T::from_sample(*value);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {e}")))
}

/// List available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// Get the default output device name.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    host.default_output_device().and_then(|d| d.name().ok())
}
