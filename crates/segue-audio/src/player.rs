//! Playback controller: the public face of the engine.
//!
//! A [`Player`] owns the playback queue, the active decoder table, the ring
//! buffer, and the output host. Every method takes `&self` and may be called
//! from any thread except the host's render thread.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use segue_core::{
    AudioFormat, Decoder, Effect, EffectId, EngineConfig, Error, FileInputSource,
    MemoryInputSource, Result,
};
use tracing::{debug, error, info, warn};

use crate::buffer::RingBuffer;
use crate::decode::{extension_for_mime, SymphoniaDecoder};
use crate::host::AudioHost;
use crate::render::Renderer;
use crate::shared::Shared;
use crate::slot::DecoderSlot;
use crate::worker;

/// How many times a seek retries when its slot is recycled underneath it.
const SEEK_ATTEMPTS: usize = 3;

/// Playback state of the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PlaybackState {
    #[default]
    Stopped = 0,
    Playing = 1,
    Paused = 2,
}

impl PlaybackState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Playing,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

/// Events emitted by the player.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Playback state changed.
    StateChanged(PlaybackState),
    /// A decoder left the queue and started decoding.
    DecodingStarted { url: Option<String> },
    /// A decoder produced its last frame.
    DecodingFinished { url: Option<String>, frames: u64 },
    /// Every frame of a decoder was rendered and the decoder was released.
    RenderingFinished { url: Option<String> },
    /// A decoder failed; playback continues with the next one.
    DecodeError { url: Option<String>, message: String },
    /// A seek was carried out; playback resumes at `frame`.
    SeekCompleted { frame: u64 },
    /// The output was reconfigured for a new stream format.
    FormatChanged(AudioFormat),
    /// The queue ran dry and everything enqueued has been played.
    PlaybackFinished,
}

/// Gapless audio player.
pub struct Player {
    shared: Arc<Shared>,
    host: Mutex<Box<dyn AudioHost>>,
    effects: Mutex<Vec<EffectId>>,
    events: Receiver<PlayerEvent>,
    decoder_thread: Option<JoinHandle<()>>,
    collector_thread: Option<JoinHandle<()>>,
}

impl Player {
    /// Create a player rendering into `host`.
    pub fn new(host: Box<dyn AudioHost>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (event_tx, events) = unbounded();
        let shared = Arc::new(Shared::new(config, event_tx));

        let decoder_thread = worker::spawn_decoder(Arc::clone(&shared))?;
        let collector_thread = match worker::spawn_collector(Arc::clone(&shared)) {
            Ok(handle) => handle,
            Err(e) => {
                shared.keep_running.store(false, Ordering::Release);
                shared.decoder_wake.post();
                let _ = decoder_thread.join();
                return Err(e);
            }
        };

        info!(
            "Player created: {} frame ring, {} frame decode chunks",
            shared.config.ring_capacity(),
            shared.config.decode_chunk_frames
        );

        Ok(Self {
            shared,
            host: Mutex::new(host),
            effects: Mutex::new(Vec::new()),
            events,
            decoder_thread: Some(decoder_thread),
            collector_thread: Some(collector_thread),
        })
    }

    // Transport

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// Start or resume playback.
    pub fn play(&self) -> Result<()> {
        {
            let mut host = self.host.lock();
            if self.shared.format().is_some() && !host.is_running() {
                host.start()?;
            }
        }
        self.transition(PlaybackState::Playing);
        self.shared.decoder_wake.post();
        Ok(())
    }

    /// Pause playback, keeping position and buffered audio.
    pub fn pause(&self) -> Result<()> {
        if self.state() != PlaybackState::Playing {
            return Ok(());
        }
        self.transition(PlaybackState::Paused);
        self.host.lock().stop()
    }

    pub fn play_pause(&self) -> Result<()> {
        if self.is_playing() {
            self.pause()
        } else {
            self.play()
        }
    }

    /// Stop playback and discard every queued and active decoder.
    pub fn stop(&self) -> Result<()> {
        let stopped = self.host.lock().stop();
        self.transition(PlaybackState::Stopped);
        self.reset_pipeline();
        stopped
    }

    fn transition(&self, state: PlaybackState) {
        if self.shared.set_state(state) != state {
            info!("Playback state: {:?}", state);
            self.shared.emit(PlayerEvent::StateChanged(state));
        }
    }

    /// Empty the queue, the table, and the ring.
    fn reset_pipeline(&self) {
        let mut released: Vec<Box<dyn Decoder>> = Vec::new();
        {
            let _gate = self.shared.gate.lock();
            let _exclusion = self.shared.fence.exclude();
            released.extend(self.shared.queue.lock().drain(..));
            let queued = released.len();
            for slot in self.shared.table.iter() {
                let mut guard = slot.lock();
                released.extend(slot.retire(&mut guard));
            }
            self.shared.ring.read().reset();
            self.shared.frames_rendered.store(0, Ordering::Release);
            debug!(
                "Released {} queued and {} active decoder(s)",
                queued,
                released.len() - queued
            );
        }
        drop(released);
    }

    // Queue

    /// Append `decoder` to the playback queue, opening it if needed.
    ///
    /// While the player is idle a new stream format reconfigures the output.
    /// Otherwise the decoder must match the format being played.
    pub fn enqueue(&self, mut decoder: Box<dyn Decoder>) -> Result<()> {
        if !decoder.is_open() {
            decoder.open().map_err(|e| match e {
                Error::OpenFailed(_) | Error::UnsupportedFormat(_) => e,
                other => Error::OpenFailed(other.to_string()),
            })?;
        }
        let format = decoder.format();
        if !format.is_valid() {
            return Err(Error::UnsupportedFormat(format!(
                "invalid stream format {format}"
            )));
        }

        {
            // Only a format change needs the decode gate.
            let mut queue = self.shared.queue.lock();
            let idle = queue.is_empty() && self.shared.table.active_count() == 0;
            match self.shared.format() {
                Some(current) if current.is_compatible(&format) => {
                    Self::push_queued(&mut queue, decoder);
                    drop(queue);
                    self.shared.decoder_wake.post();
                    return Ok(());
                }
                Some(current) if !idle => {
                    return Err(Error::UnsupportedFormat(format!(
                        "{format} cannot follow {current} gaplessly"
                    )));
                }
                _ => {}
            }
        }

        {
            let _gate = self.shared.gate.lock();
            let mut queue = self.shared.queue.lock();
            let idle = queue.is_empty() && self.shared.table.active_count() == 0;

            match self.shared.format() {
                Some(current) if current.is_compatible(&format) => {}
                Some(current) if !idle => {
                    return Err(Error::UnsupportedFormat(format!(
                        "{format} cannot follow {current} gaplessly"
                    )));
                }
                _ => self.reconfigure(format)?,
            }
            Self::push_queued(&mut queue, decoder);
        }

        self.shared.decoder_wake.post();
        Ok(())
    }

    fn push_queued(queue: &mut VecDeque<Box<dyn Decoder>>, decoder: Box<dyn Decoder>) {
        debug!(
            "Enqueued {} ({:?} frames)",
            decoder.url().unwrap_or("<unnamed>"),
            decoder.frame_length()
        );
        queue.push_back(decoder);
    }

    /// Enqueue a file, decoded with symphonia.
    pub fn enqueue_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let source = FileInputSource::new(path.as_ref());
        self.enqueue(Box::new(SymphoniaDecoder::new(Box::new(source))))
    }

    /// Enqueue encoded audio held in memory, decoded with symphonia.
    pub fn enqueue_bytes(&self, data: Bytes, mime_hint: Option<&str>) -> Result<()> {
        let source = MemoryInputSource::from_bytes(data);
        let extension = mime_hint.and_then(extension_for_mime);
        self.enqueue(Box::new(SymphoniaDecoder::with_hint(
            Box::new(source),
            extension,
        )))
    }

    /// Drop every decoder that has not started decoding. Returns how many.
    pub fn clear_queued_decoders(&self) -> Result<usize> {
        let cleared: Vec<_> = self.shared.queue.lock().drain(..).collect();
        if !cleared.is_empty() {
            debug!("Cleared {} queued decoder(s)", cleared.len());
        }
        Ok(cleared.len())
    }

    /// Switch the ring and host to `format`. Caller holds the decode gate.
    fn reconfigure(&self, format: AudioFormat) -> Result<()> {
        let _exclusion = self.shared.fence.exclude();
        let previous = self.shared.format();
        self.install_format(Some(format));

        let mut host = self.host.lock();
        let renderer = Renderer::new(Arc::clone(&self.shared), usize::from(format.channels));
        if let Err(e) = host.configure(&format, renderer) {
            warn!("Output rejected {format}: {e}");
            self.install_format(previous);
            return Err(match e {
                Error::UnsupportedFormat(_) => e,
                other => Error::UnsupportedFormat(other.to_string()),
            });
        }

        if self.is_playing() && !host.is_running() {
            if let Err(e) = host.start() {
                error!("Failed to start output: {e}");
            }
        }

        info!("Output format: {format}");
        self.shared.emit(PlayerEvent::FormatChanged(format));
        Ok(())
    }

    fn install_format(&self, format: Option<AudioFormat>) {
        let channels = format.map_or(0, |format| usize::from(format.channels));
        *self.shared.ring.write() =
            RingBuffer::new(channels, self.shared.config.ring_buffer_frames);
        *self.shared.format.write() = format;
        self.shared.frames_rendered.store(0, Ordering::Release);
    }

    // Seeking

    /// Whether the decoder being played can seek, along with every decoder
    /// already buffered behind it.
    pub fn supports_seeking(&self) -> bool {
        self.current_slot().is_some_and(|slot| {
            slot.supports_seeking()
                && slot.total_frames().is_some()
                && self
                    .shared
                    .table
                    .unseekable_after(slot.ring_start_frame())
                    .is_none()
        })
    }

    /// Seek within the decoder being played. Returns the (clamped) target.
    ///
    /// Fails with [`Error::SeekNotSupported`] when the decoder, or one
    /// already buffered behind it, cannot seek.
    ///
    /// The seek is carried out asynchronously; [`Player::current_frame`]
    /// reports the target immediately and [`PlayerEvent::SeekCompleted`]
    /// follows once playback resumes from it.
    pub fn seek_to_frame(&self, frame: u64) -> Result<u64> {
        for _ in 0..SEEK_ATTEMPTS {
            let index = self
                .shared
                .table
                .current()
                .ok_or_else(|| Error::InvalidArgument("nothing is playing".to_string()))?;
            let slot = self.shared.table.get(index);
            let generation = slot.generation();

            let guard = slot.lock();
            if !slot.is_active() || slot.is_rendering_finished() || slot.generation() != generation
            {
                // Finished or recycled while we were locating it.
                continue;
            }
            if !slot.supports_seeking() {
                return Err(Error::SeekNotSupported);
            }
            let total = slot.total_frames().ok_or(Error::SeekNotSupported)?;
            // Buffered lookahead is rewound by the seek.
            if let Some(blocker) = self.shared.table.unseekable_after(slot.ring_start_frame()) {
                debug!("Seek refused: slot {blocker} after slot {index} cannot be rewound");
                return Err(Error::SeekNotSupported);
            }

            let target = frame.min(total.saturating_sub(1));
            slot.request_seek(&guard, target);
            drop(guard);

            debug!("Seek requested to frame {target} in slot {index}");
            self.shared.decoder_wake.post();
            return Ok(target);
        }
        Err(Error::InvalidArgument("playback moved on during the seek".to_string()))
    }

    pub fn seek_to_time(&self, seconds: f64) -> Result<u64> {
        let format = self.require_format()?;
        self.seek_to_frame(format.seconds_to_frames(seconds.max(0.0)))
    }

    pub fn seek_forward(&self, seconds: f64) -> Result<u64> {
        let format = self.require_format()?;
        let current = self.current_frame().unwrap_or(0);
        self.seek_to_frame(current.saturating_add(format.seconds_to_frames(seconds.max(0.0))))
    }

    pub fn seek_backward(&self, seconds: f64) -> Result<u64> {
        let format = self.require_format()?;
        let current = self.current_frame().unwrap_or(0);
        self.seek_to_frame(current.saturating_sub(format.seconds_to_frames(seconds.max(0.0))))
    }

    fn require_format(&self) -> Result<AudioFormat> {
        self.shared
            .format()
            .ok_or_else(|| Error::InvalidArgument("nothing is playing".to_string()))
    }

    // Position

    fn current_slot(&self) -> Option<&DecoderSlot> {
        self.shared
            .table
            .current()
            .map(|index| self.shared.table.get(index))
    }

    /// Frame of the decoder being played, or the pending seek target.
    pub fn current_frame(&self) -> Option<u64> {
        let slot = self.current_slot()?;
        Some(slot.seek_target().unwrap_or_else(|| slot.frames_rendered()))
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.current_slot()?.total_frames()
    }

    pub fn remaining_frames(&self) -> Option<u64> {
        Some(self.total_frames()?.saturating_sub(self.current_frame()?))
    }

    pub fn current_time(&self) -> Option<f64> {
        Some(self.shared.format()?.frames_to_seconds(self.current_frame()?))
    }

    pub fn total_time(&self) -> Option<f64> {
        Some(self.shared.format()?.frames_to_seconds(self.total_frames()?))
    }

    pub fn remaining_time(&self) -> Option<f64> {
        Some(self.shared.format()?.frames_to_seconds(self.remaining_frames()?))
    }

    /// Location of the decoder being played.
    pub fn playing_url(&self) -> Option<String> {
        self.current_slot()?.url()
    }

    /// Stream format the output is configured for.
    pub fn format(&self) -> Option<AudioFormat> {
        self.shared.format()
    }

    // Gain

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// Set the output volume (0.0 to 1.0).
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::InvalidArgument(format!(
                "volume {volume} is outside 0.0..=1.0"
            )));
        }
        self.shared.set_volume(volume);
        Ok(())
    }

    pub fn pre_gain(&self) -> f32 {
        self.shared.pre_gain()
    }

    /// Set the linear gain applied before volume.
    pub fn set_pre_gain(&self, gain: f32) -> Result<()> {
        if !gain.is_finite() || gain < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "pre-gain {gain} must be finite and non-negative"
            )));
        }
        self.shared.set_pre_gain(gain);
        Ok(())
    }

    pub fn hard_limiting(&self) -> bool {
        self.shared.hard_limiting()
    }

    /// Clamp rendered samples to full scale.
    pub fn set_hard_limiting(&self, enabled: bool) -> Result<()> {
        self.shared.set_hard_limiting(enabled);
        Ok(())
    }

    // Effects

    /// Append an effect to the output chain.
    pub fn add_effect(&self, effect: Box<dyn Effect>) -> Result<EffectId> {
        let id = self.host.lock().add_effect(effect)?;
        self.effects.lock().push(id);
        Ok(id)
    }

    pub fn remove_effect(&self, id: EffectId) -> Result<()> {
        self.host.lock().remove_effect(id)?;
        self.effects.lock().retain(|existing| *existing != id);
        Ok(())
    }

    /// Effects in processing order.
    pub fn effects(&self) -> Vec<EffectId> {
        self.effects.lock().clone()
    }

    // Output device

    pub fn output_device_uid(&self) -> Option<String> {
        self.host.lock().device_uid()
    }

    /// Move output to another device.
    pub fn set_output_device_uid(&self, uid: &str) -> Result<()> {
        self.reconfigure_device(|host| host.set_device_uid(uid))?;
        info!("Output device: {uid}");
        Ok(())
    }

    pub fn output_sample_rate(&self) -> Option<u32> {
        self.host.lock().device_sample_rate()
    }

    /// Run the output device at `sample_rate`, converting as needed.
    pub fn set_output_sample_rate(&self, sample_rate: u32) -> Result<()> {
        self.reconfigure_device(|host| host.set_device_sample_rate(sample_rate))?;
        info!("Output sample rate: {sample_rate} Hz");
        Ok(())
    }

    pub fn output_devices(&self) -> Result<Vec<String>> {
        self.host.lock().output_devices()
    }

    /// Pause output, apply `change` with the pipeline quiesced, resume.
    fn reconfigure_device(
        &self,
        change: impl FnOnce(&mut dyn AudioHost) -> Result<()>,
    ) -> Result<()> {
        let _gate = self.shared.gate.lock();
        let mut host = self.host.lock();

        let was_running = host.is_running();
        if was_running {
            host.stop()
                .map_err(|e| Error::DeviceConfigurationFailed(e.to_string()))?;
        }

        let result = {
            let _exclusion = self.shared.fence.exclude();
            change(&mut **host)
        };

        if was_running {
            if let Err(e) = host.start() {
                error!("Failed to restart output: {e}");
            }
        }

        result.map_err(|e| match e {
            Error::DeviceConfigurationFailed(_) => e,
            other => Error::DeviceConfigurationFailed(other.to_string()),
        })
    }

    // Events

    /// Try to receive an event without blocking.
    pub fn try_recv_event(&self) -> Option<PlayerEvent> {
        self.events.try_recv().ok()
    }

    /// Receive events, blocking until one is available.
    pub fn recv_event(&self) -> Option<PlayerEvent> {
        self.events.recv().ok()
    }

    /// Receive an event, waiting at most `timeout`.
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<PlayerEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    // Diagnostics

    /// Frames decoded ahead of the read position.
    pub fn buffered_frames(&self) -> usize {
        self.shared
            .ring
            .read()
            .frames_ahead_of(self.shared.read_position())
    }

    /// Get the ring buffer fill level (0.0 to 1.0).
    #[allow(clippy::cast_precision_loss)]
    pub fn buffer_fill(&self) -> f32 {
        let ring = self.shared.ring.read();
        ring.frames_ahead_of(self.shared.read_position()) as f32 / ring.capacity() as f32
    }

    /// Render passes that came up short of audio.
    pub fn underrun_count(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    pub fn active_decoder_count(&self) -> usize {
        self.shared.table.active_count()
    }

    pub fn queued_decoder_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Whether any decoder is decoding or waiting to.
    pub fn is_decoding(&self) -> bool {
        self.shared.table.decoding().is_some() || !self.shared.queue.lock().is_empty()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Err(e) = self.host.lock().stop() {
            warn!("Failed to stop output: {e}");
        }

        self.shared.keep_running.store(false, Ordering::Release);
        self.shared.decoder_wake.post();
        self.shared.collector_wake.post();

        for handle in [self.decoder_thread.take(), self.collector_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        debug!("Player shut down");
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("state", &self.state())
            .field("format", &self.format())
            .field("active", &self.active_decoder_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    use segue_core::{GainEffect, ACTIVE_DECODER_SLOTS};

    use super::*;
    use crate::host::OfflineHost;
    use crate::test_support::{
        expected, left, offline_player, render_ready, render_to_end, sample_value, test_config,
        wait_for_event, wait_until, TestDecoder, TEST_RATE,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn seek_completed(player: &Player, frame: u64) -> bool {
        wait_for_event(player, |event| {
            *event == PlayerEvent::SeekCompleted { frame }
        })
        .is_some()
    }

    #[test]
    fn test_gapless_boundary() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 1000).boxed()).unwrap();
        player.enqueue(TestDecoder::new(2, 700).boxed()).unwrap();
        player.play().unwrap();

        let out = render_to_end(&player, &handle, 256);
        let left = left(&out, 2);
        let mut want = expected(1, 0..1000);
        want.extend(expected(2, 0..700));

        assert_eq!(&left[..1700], want.as_slice());
        assert!(left[1700..].iter().all(|sample| *sample == 0.0));
        assert_eq!(out[1], -sample_value(1, 0));
        assert_eq!(player.underrun_count(), 0);
        assert!(wait_for_event(&player, |event| *event == PlayerEvent::PlaybackFinished).is_some());
    }

    #[test]
    fn test_events_follow_decoder_lifecycle() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 300).boxed()).unwrap();
        player.play().unwrap();
        render_to_end(&player, &handle, 256);

        let url = Some("test://1".to_string());
        let mut seen = Vec::new();
        while let Some(event) = player.recv_event_timeout(Duration::from_millis(200)) {
            let finished = event == PlayerEvent::PlaybackFinished;
            seen.push(event);
            if finished {
                break;
            }
        }

        assert_eq!(
            seen[0],
            PlayerEvent::FormatChanged(AudioFormat::new(TEST_RATE, 2, 16))
        );
        let position = |wanted: &PlayerEvent| seen.iter().position(|event| event == wanted);
        let started = position(&PlayerEvent::DecodingStarted { url: url.clone() }).unwrap();
        let decoded = position(&PlayerEvent::DecodingFinished {
            url: url.clone(),
            frames: 300,
        })
        .unwrap();
        let rendered = position(&PlayerEvent::RenderingFinished { url }).unwrap();
        assert!(started < decoded && decoded < rendered);
        assert!(seen.contains(&PlayerEvent::StateChanged(PlaybackState::Playing)));
        assert_eq!(seen.last(), Some(&PlayerEvent::PlaybackFinished));
    }

    #[test]
    fn test_seek_is_frame_accurate_and_repeatable() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 20_000).boxed()).unwrap();
        player.play().unwrap();

        render_ready(&player, &handle, 256);
        assert_eq!(player.current_frame(), Some(256));

        assert_eq!(player.seek_to_frame(12_000).unwrap(), 12_000);
        assert_eq!(player.current_frame(), Some(12_000));
        assert!(seek_completed(&player, 12_000));
        assert_eq!(player.current_frame(), Some(12_000));

        let first = render_ready(&player, &handle, 256);
        assert_eq!(left(&first, 2), expected(1, 12_000..12_256));

        player.seek_to_frame(12_000).unwrap();
        assert!(seek_completed(&player, 12_000));
        let second = render_ready(&player, &handle, 256);
        assert_eq!(first, second);
        assert_eq!(player.current_frame(), Some(12_256));
    }

    #[test]
    fn test_seek_clamps_to_last_frame() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 5000).boxed()).unwrap();
        player.play().unwrap();
        render_ready(&player, &handle, 256);

        assert_eq!(player.seek_to_frame(1_000_000).unwrap(), 4999);
        assert!(seek_completed(&player, 4999));
        let out = render_ready(&player, &handle, 4);
        assert_eq!(left(&out, 2), vec![sample_value(1, 4999), 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_seek_rewinds_lookahead_decoders() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 3000).boxed()).unwrap();
        player.enqueue(TestDecoder::new(2, 3000).boxed()).unwrap();
        assert!(wait_until(WAIT, || player.active_decoder_count() == 2
            && player.buffered_frames() >= 4000));

        player.play().unwrap();
        render_ready(&player, &handle, 256);
        player.seek_to_frame(100).unwrap();
        assert!(seek_completed(&player, 100));

        let left = left(&render_to_end(&player, &handle, 256), 2);
        let mut want = expected(1, 100..3000);
        want.extend(expected(2, 0..3000));
        assert_eq!(&left[..want.len()], want.as_slice());
    }

    #[test]
    fn test_seek_without_support() {
        let (player, handle) = offline_player();
        assert!(matches!(
            player.seek_to_frame(10),
            Err(Error::InvalidArgument(_))
        ));

        player
            .enqueue(TestDecoder::new(1, 5000).unknown_length().boxed())
            .unwrap();
        player.play().unwrap();
        render_ready(&player, &handle, 256);
        assert!(!player.supports_seeking());
        assert!(matches!(player.seek_to_frame(10), Err(Error::SeekNotSupported)));
        assert_eq!(player.total_frames(), None);

        player.stop().unwrap();
        player
            .enqueue(TestDecoder::new(2, 5000).unseekable().boxed())
            .unwrap();
        player.play().unwrap();
        render_ready(&player, &handle, 256);
        assert!(matches!(player.seek_to_frame(10), Err(Error::SeekNotSupported)));
    }

    #[test]
    fn test_seek_refused_ahead_of_unseekable_decoder() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 3000).boxed()).unwrap();
        player
            .enqueue(TestDecoder::new(2, 3000).unseekable().boxed())
            .unwrap();
        assert!(wait_until(WAIT, || player.active_decoder_count() == 2));

        player.play().unwrap();
        render_ready(&player, &handle, 256);
        assert!(!player.supports_seeking());
        assert!(matches!(player.seek_to_frame(100), Err(Error::SeekNotSupported)));
        assert_eq!(player.current_frame(), Some(256));

        let left = left(&render_to_end(&player, &handle, 256), 2);
        let mut want = expected(1, 256..3000);
        want.extend(expected(2, 0..3000));
        assert_eq!(&left[..want.len()], want.as_slice());
    }

    #[test]
    fn test_seek_panic_moves_on() {
        let (player, handle) = offline_player();
        player
            .enqueue(TestDecoder::new(1, 5000).panicking_on_seek().boxed())
            .unwrap();
        player.enqueue(TestDecoder::new(2, 500).boxed()).unwrap();
        player.play().unwrap();
        render_ready(&player, &handle, 256);

        player.seek_to_frame(1000).unwrap();
        assert!(wait_for_event(&player, |event| matches!(
            event,
            PlayerEvent::DecodeError { url: Some(url), message }
                if url == "test://1" && message.contains("panicked")
        ))
        .is_some());

        let left = left(&render_to_end(&player, &handle, 256), 2);
        let start = left.iter().position(|sample| *sample != 0.0).unwrap();
        assert_eq!(&left[start..start + 500], expected(2, 0..500).as_slice());
    }

    #[test]
    fn test_underrun_renders_silence_then_recovers() {
        let (player, handle) = offline_player();
        let budget = Arc::new(AtomicU64::new(1024));
        player
            .enqueue(
                TestDecoder::new(1, 20_000)
                    .with_budget(Arc::clone(&budget))
                    .boxed(),
            )
            .unwrap();
        player.play().unwrap();

        let out = render_ready(&player, &handle, 1024);
        assert_eq!(left(&out, 2), expected(1, 0..1024));

        let starved = handle.render(256);
        assert!(starved.iter().all(|sample| *sample == 0.0));
        assert!(player.underrun_count() >= 1);
        assert_eq!(player.current_frame(), Some(1024));

        budget.store(u64::MAX, Ordering::Release);
        let out = render_ready(&player, &handle, 256);
        assert_eq!(left(&out, 2), expected(1, 1024..1280));
    }

    #[test]
    fn test_active_decoders_are_bounded() {
        let (player, handle) = offline_player();
        for id in 1..=12 {
            player.enqueue(TestDecoder::new(id, 100).boxed()).unwrap();
        }

        assert!(wait_until(WAIT, || {
            player.active_decoder_count() == ACTIVE_DECODER_SLOTS
                && player.queued_decoder_count() == 4
        }));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(player.active_decoder_count(), ACTIVE_DECODER_SLOTS);
        assert_eq!(player.queued_decoder_count(), 4);

        player.play().unwrap();
        let left = left(&render_to_end(&player, &handle, 256), 2);
        let want: Vec<f32> = (1..=12).flat_map(|id| expected(id, 0..100)).collect();
        assert_eq!(&left[..1200], want.as_slice());
    }

    #[test]
    fn test_decoders_outlive_their_audio() {
        let (player, handle) = offline_player();
        let drops = Arc::new(Mutex::new(Vec::new()));
        player
            .enqueue(
                TestDecoder::new(1, 500)
                    .recording_drops(Arc::clone(&drops))
                    .boxed(),
            )
            .unwrap();

        assert!(wait_until(WAIT, || !player.is_decoding()));
        // Give the collector several passes.
        std::thread::sleep(Duration::from_millis(200));
        assert!(drops.lock().is_empty());
        assert_eq!(player.active_decoder_count(), 1);

        player.play().unwrap();
        render_to_end(&player, &handle, 256);
        assert!(wait_until(WAIT, || drops.lock().as_slice() == [1]));
    }

    #[test]
    fn test_decode_error_moves_on() {
        let (player, handle) = offline_player();
        player
            .enqueue(TestDecoder::new(1, 1000).failing_at(300).boxed())
            .unwrap();
        player.enqueue(TestDecoder::new(2, 500).boxed()).unwrap();
        player.play().unwrap();

        let left = left(&render_to_end(&player, &handle, 256), 2);
        let mut want = expected(1, 0..300);
        want.extend(expected(2, 0..500));
        assert_eq!(&left[..800], want.as_slice());
        assert!(wait_for_event(&player, |event| matches!(
            event,
            PlayerEvent::DecodeError { url: Some(url), .. } if url == "test://1"
        ))
        .is_some());
    }

    #[test]
    fn test_decoder_panic_moves_on() {
        let (player, handle) = offline_player();
        player
            .enqueue(TestDecoder::new(1, 1000).panicking_at(300).boxed())
            .unwrap();
        player.enqueue(TestDecoder::new(2, 500).boxed()).unwrap();
        player.play().unwrap();

        let left = left(&render_to_end(&player, &handle, 256), 2);
        let mut want = expected(1, 0..300);
        want.extend(expected(2, 0..500));
        assert_eq!(&left[..800], want.as_slice());
        assert!(wait_for_event(&player, |event| matches!(
            event,
            PlayerEvent::DecodeError { url: Some(url), message }
                if url == "test://1" && message.contains("panicked")
        ))
        .is_some());
    }

    #[test]
    fn test_pause_holds_position() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 5000).boxed()).unwrap();
        player.play().unwrap();
        render_ready(&player, &handle, 256);

        player.pause().unwrap();
        assert_eq!(player.state(), PlaybackState::Paused);
        assert!(!handle.is_running());
        assert!(handle.render(256).iter().all(|sample| *sample == 0.0));
        assert_eq!(player.current_frame(), Some(256));

        player.play_pause().unwrap();
        assert!(player.is_playing());
        let out = render_ready(&player, &handle, 256);
        assert_eq!(left(&out, 2), expected(1, 256..512));
        assert!(wait_for_event(&player, |event| {
            *event == PlayerEvent::StateChanged(PlaybackState::Paused)
        })
        .is_some());
    }

    #[test]
    fn test_stop_then_play() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 10_000).boxed()).unwrap();
        player.enqueue(TestDecoder::new(2, 10_000).boxed()).unwrap();
        player.play().unwrap();
        render_ready(&player, &handle, 256);

        player.stop().unwrap();
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert_eq!(player.active_decoder_count(), 0);
        assert_eq!(player.queued_decoder_count(), 0);
        assert_eq!(player.buffered_frames(), 0);
        assert_eq!(player.current_frame(), None);
        assert!(handle.render(256).iter().all(|sample| *sample == 0.0));

        player.enqueue(TestDecoder::new(3, 300).boxed()).unwrap();
        player.play().unwrap();
        let out = render_ready(&player, &handle, 256);
        assert_eq!(left(&out, 2), expected(3, 0..256));
    }

    #[test]
    fn test_clear_queued_decoders() {
        let (player, _handle) = offline_player();
        for id in 1..=3 {
            player.enqueue(TestDecoder::new(id, 20_000).boxed()).unwrap();
        }
        assert!(wait_until(WAIT, || player.active_decoder_count() == 1));

        assert_eq!(player.clear_queued_decoders().unwrap(), 2);
        assert_eq!(player.queued_decoder_count(), 0);
        assert_eq!(player.active_decoder_count(), 1);
    }

    #[test]
    fn test_position_reporting() {
        let (player, handle) = offline_player();
        assert_eq!(player.current_frame(), None);
        assert_eq!(player.playing_url(), None);

        player
            .enqueue(TestDecoder::new(1, u64::from(TEST_RATE)).boxed())
            .unwrap();
        player.play().unwrap();
        render_ready(&player, &handle, 441);

        assert_eq!(player.playing_url().as_deref(), Some("test://1"));
        assert_eq!(player.total_frames(), Some(44_100));
        assert_eq!(player.remaining_frames(), Some(44_100 - 441));
        assert!((player.total_time().unwrap() - 1.0).abs() < 1e-9);
        assert!((player.current_time().unwrap() - 0.01).abs() < 1e-9);
        assert!(player.remaining_time().unwrap() > 0.98);
        assert!(player.buffer_fill() > 0.0 && player.buffer_fill() <= 1.0);
    }

    #[test]
    fn test_time_based_seeks() {
        let (player, handle) = offline_player();
        player
            .enqueue(TestDecoder::new(1, u64::from(TEST_RATE) * 10).boxed())
            .unwrap();
        player.play().unwrap();
        render_ready(&player, &handle, 256);

        assert_eq!(player.seek_to_time(2.0).unwrap(), 88_200);
        assert_eq!(player.seek_forward(1.0).unwrap(), 132_300);
        assert_eq!(player.seek_backward(5.0).unwrap(), 0);
        assert!(seek_completed(&player, 0));
    }

    #[test]
    fn test_enqueue_rejects_incompatible_format() {
        let (player, _handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 20_000).boxed()).unwrap();

        let mono = TestDecoder::new(2, 100).with_format(AudioFormat::new(TEST_RATE, 1, 16));
        assert!(matches!(
            player.enqueue(mono.boxed()),
            Err(Error::UnsupportedFormat(_))
        ));
        assert_eq!(player.format(), Some(AudioFormat::new(TEST_RATE, 2, 16)));

        let failing = TestDecoder::new(3, 100).failing_open();
        assert!(matches!(
            player.enqueue(failing.boxed()),
            Err(Error::OpenFailed(_))
        ));
    }

    #[test]
    fn test_enqueue_while_decoding() {
        let (player, handle) = offline_player();
        let budget = Arc::new(AtomicU64::new(512));
        player
            .enqueue(
                TestDecoder::new(1, 2000)
                    .with_budget(Arc::clone(&budget))
                    .boxed(),
            )
            .unwrap();
        // The worker now waits for budget inside the decoder.
        assert!(wait_until(WAIT, || player.buffered_frames() >= 512));

        let started = Instant::now();
        player.enqueue(TestDecoder::new(2, 300).boxed()).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(player.queued_decoder_count(), 1);

        budget.store(u64::MAX, Ordering::Release);
        player.play().unwrap();
        let left = left(&render_to_end(&player, &handle, 256), 2);
        let mut want = expected(1, 0..2000);
        want.extend(expected(2, 0..300));
        assert_eq!(&left[..2300], want.as_slice());
    }

    #[test]
    fn test_format_change_while_idle() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 300).boxed()).unwrap();
        player.play().unwrap();
        render_to_end(&player, &handle, 256);

        let format = AudioFormat::new(48_000, 2, 24);
        player
            .enqueue(TestDecoder::new(2, 300).with_format(format).boxed())
            .unwrap();
        assert_eq!(player.format(), Some(format));
        assert_eq!(handle.format(), Some(format));
        assert!(wait_for_event(&player, |event| {
            *event == PlayerEvent::FormatChanged(format)
        })
        .is_some());

        let out = render_ready(&player, &handle, 256);
        assert_eq!(left(&out, 2), expected(2, 0..256));
    }

    #[test]
    fn test_host_rejection_keeps_previous_format() {
        let (host, _handle) = OfflineHost::with_devices(vec!["a".to_string()], vec![44_100]);
        let player = Player::new(Box::new(host), test_config()).unwrap();

        let decoder = TestDecoder::new(1, 100).with_format(AudioFormat::new(48_000, 2, 16));
        assert!(matches!(
            player.enqueue(decoder.boxed()),
            Err(Error::UnsupportedFormat(_))
        ));
        assert_eq!(player.format(), None);

        player.enqueue(TestDecoder::new(2, 100).boxed()).unwrap();
        assert_eq!(player.format(), Some(AudioFormat::new(TEST_RATE, 2, 16)));
    }

    #[test]
    fn test_gain_controls() {
        let (player, handle) = offline_player();
        assert!(player.set_volume(1.5).is_err());
        assert!(player.set_pre_gain(-1.0).is_err());
        assert!(player.set_pre_gain(f32::NAN).is_err());

        player.set_volume(0.5).unwrap();
        player.set_pre_gain(0.25).unwrap();
        assert!((player.volume() - 0.5).abs() < f32::EPSILON);
        assert!((player.pre_gain() - 0.25).abs() < f32::EPSILON);

        player.enqueue(TestDecoder::new(1, 5000).boxed()).unwrap();
        player.play().unwrap();
        let out = render_ready(&player, &handle, 256);
        let want: Vec<f32> = expected(1, 0..256).iter().map(|s| s * 0.125).collect();
        assert_eq!(left(&out, 2), want);

        player.set_hard_limiting(true).unwrap();
        assert!(player.hard_limiting());
        let out = render_ready(&player, &handle, 256);
        assert!(out.iter().all(|sample| (-1.0..=1.0).contains(sample)));
        assert_eq!(out[0], 1.0);
        assert_eq!(out[1], -1.0);
    }

    #[test]
    fn test_effect_chain() {
        let (player, handle) = offline_player();
        let id = player.add_effect(Box::new(GainEffect::new(0.5))).unwrap();
        assert_eq!(player.effects(), vec![id]);

        player.enqueue(TestDecoder::new(1, 5000).boxed()).unwrap();
        player.play().unwrap();
        let out = render_ready(&player, &handle, 256);
        let want: Vec<f32> = expected(1, 0..256).iter().map(|s| s * 0.5).collect();
        assert_eq!(left(&out, 2), want);

        player.remove_effect(id).unwrap();
        assert!(player.effects().is_empty());
        assert!(matches!(
            player.remove_effect(id),
            Err(Error::InvalidArgument(_))
        ));
        let out = render_ready(&player, &handle, 256);
        assert_eq!(left(&out, 2), expected(1, 256..512));
    }

    #[test]
    fn test_device_change() {
        let devices = vec!["a".to_string(), "b".to_string()];
        let (host, handle) = OfflineHost::with_devices(devices, vec![44_100]);
        let player = Player::new(Box::new(host), test_config()).unwrap();
        assert_eq!(player.output_devices().unwrap().len(), 2);

        player.enqueue(TestDecoder::new(1, 5000).boxed()).unwrap();
        player.play().unwrap();
        render_ready(&player, &handle, 256);

        assert!(matches!(
            player.set_output_device_uid("missing"),
            Err(Error::DeviceConfigurationFailed(_))
        ));
        assert_eq!(player.output_device_uid().as_deref(), Some("a"));
        assert!(player.is_playing());
        assert!(handle.is_running());

        player.set_output_device_uid("b").unwrap();
        assert_eq!(handle.device(), "b");
        assert!(handle.is_running());
        let out = render_ready(&player, &handle, 256);
        assert_eq!(left(&out, 2), expected(1, 256..512));

        assert!(matches!(
            player.set_output_sample_rate(48_000),
            Err(Error::DeviceConfigurationFailed(_))
        ));
        assert_eq!(player.output_sample_rate(), Some(44_100));
    }

    #[test]
    fn test_output_rate_conversion() {
        let (player, handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 20_000).boxed()).unwrap();
        player.play().unwrap();
        assert!(wait_until(WAIT, || player.buffered_frames() >= 2048));

        player.set_output_sample_rate(48_000).unwrap();
        assert_eq!(player.output_sample_rate(), Some(48_000));
        assert_eq!(player.format(), Some(AudioFormat::new(TEST_RATE, 2, 16)));

        let out = handle.render(480);
        assert_eq!(out.len(), 960);
        assert!(player.current_frame().unwrap() > 0);
    }

    #[test]
    fn test_drop_joins_workers() {
        let (player, _handle) = offline_player();
        player.enqueue(TestDecoder::new(1, 20_000).boxed()).unwrap();
        player.play().unwrap();
        drop(player);
    }
}
