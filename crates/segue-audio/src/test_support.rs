//! Synthetic decoders and helpers for pipeline tests.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use segue_core::{AudioFormat, Decoder, EngineConfig, Error, PcmBuffer, Result};

use crate::host::{OfflineHandle, OfflineHost};
use crate::player::{Player, PlayerEvent};

pub const TEST_RATE: u32 = 44_100;

/// How long a budgeted decoder waits for more budget before failing.
const BUDGET_WAIT: Duration = Duration::from_secs(10);

/// Sample `frame` of decoder `id` on channel 0. Other channels carry the
/// negated value, so every frame of every test decoder is distinct.
#[allow(clippy::cast_precision_loss)]
pub fn sample_value(id: u32, frame: u64) -> f32 {
    (u64::from(id) * 100_000 + frame) as f32
}

/// Decoder producing [`sample_value`] frames.
pub struct TestDecoder {
    id: u32,
    url: String,
    format: AudioFormat,
    frames: u64,
    position: u64,
    opened: bool,
    known_length: bool,
    seekable: bool,
    open_fails: bool,
    fail_at: Option<u64>,
    panic_at: Option<u64>,
    seek_panics: bool,
    budget: Option<Arc<AtomicU64>>,
    drops: Option<Arc<Mutex<Vec<u32>>>>,
}

impl TestDecoder {
    pub fn new(id: u32, frames: u64) -> Self {
        Self {
            id,
            url: format!("test://{id}"),
            format: AudioFormat::new(TEST_RATE, 2, 16),
            frames,
            position: 0,
            opened: false,
            known_length: true,
            seekable: true,
            open_fails: false,
            fail_at: None,
            panic_at: None,
            seek_panics: false,
            budget: None,
            drops: None,
        }
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    pub fn unknown_length(mut self) -> Self {
        self.known_length = false;
        self
    }

    pub fn unseekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    /// Fail with a decode error once `frame` is reached.
    pub fn failing_at(mut self, frame: u64) -> Self {
        self.fail_at = Some(frame);
        self
    }

    /// Panic inside `decode_frames` once `frame` is reached.
    pub fn panicking_at(mut self, frame: u64) -> Self {
        self.panic_at = Some(frame);
        self
    }

    pub fn panicking_on_seek(mut self) -> Self {
        self.seek_panics = true;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.open_fails = true;
        self
    }

    /// Only decode frames below the shared budget, waiting for it to grow.
    pub fn with_budget(mut self, budget: Arc<AtomicU64>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Push the decoder id onto `log` when dropped.
    pub fn recording_drops(mut self, log: Arc<Mutex<Vec<u32>>>) -> Self {
        self.drops = Some(log);
        self
    }

    pub fn boxed(self) -> Box<dyn Decoder> {
        Box::new(self)
    }

    fn wait_for_budget(&self, budget: &AtomicU64) -> Result<u64> {
        let deadline = Instant::now() + BUDGET_WAIT;
        loop {
            let granted = budget.load(Ordering::Acquire);
            if granted > self.position {
                return Ok(granted);
            }
            if Instant::now() > deadline {
                return Err(Error::DecodeError("budget never granted".to_string()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Decoder for TestDecoder {
    fn open(&mut self) -> Result<()> {
        if self.open_fails {
            return Err(Error::OpenFailed(self.url.clone()));
        }
        self.opened = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn frame_length(&self) -> Option<u64> {
        self.known_length.then_some(self.frames)
    }

    fn supports_seeking(&self) -> bool {
        self.seekable
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64> {
        if !self.seekable {
            return Err(Error::SeekNotSupported);
        }
        assert!(!self.seek_panics, "{} panicked while seeking", self.url);
        self.position = frame.min(self.frames);
        Ok(self.position)
    }

    fn decode_frames(&mut self, buffer: &mut PcmBuffer, frame_count: usize) -> Result<usize> {
        let requested = frame_count.min(buffer.capacity()) as u64;
        let mut end = (self.position + requested).min(self.frames);

        if let Some(panic_at) = self.panic_at {
            assert!(
                self.position < panic_at,
                "{} panicked at frame {panic_at}",
                self.url
            );
            end = end.min(panic_at);
        }
        if let Some(fail_at) = self.fail_at {
            if self.position >= fail_at {
                return Err(Error::DecodeError(format!("{} failed", self.url)));
            }
            end = end.min(fail_at);
        }
        if end > self.position {
            if let Some(budget) = self.budget.clone() {
                end = end.min(self.wait_for_budget(&budget)?);
            }
        }

        let count = usize::try_from(end - self.position).unwrap();
        for channel in 0..buffer.channels() {
            let sign = if channel == 0 { 1.0 } else { -1.0 };
            let plane = buffer.plane_mut(channel);
            for (offset, sample) in plane.iter_mut().take(count).enumerate() {
                *sample = sign * sample_value(self.id, self.position + offset as u64);
            }
        }
        buffer.set_frames(count);
        self.position = end;
        Ok(count)
    }

    fn url(&self) -> Option<&str> {
        Some(&self.url)
    }
}

impl Drop for TestDecoder {
    fn drop(&mut self) {
        if let Some(log) = &self.drops {
            log.lock().push(self.id);
        }
    }
}

/// Small buffers and short timeouts so tests exercise wraparound and polling.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        ring_buffer_frames: 4096,
        decode_chunk_frames: 512,
        render_block_frames: 256,
        collector_timeout_ms: 50,
        decoder_idle_timeout_ms: 10,
        ..EngineConfig::default()
    }
}

pub fn offline_player() -> (Player, OfflineHandle) {
    let (host, handle) = OfflineHost::new();
    let player = Player::new(Box::new(host), test_config()).unwrap();
    (player, handle)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Wait until `frames` frames are buffered (or nothing is left to decode),
/// then render them.
pub fn render_ready(player: &Player, handle: &OfflineHandle, frames: usize) -> Vec<f32> {
    wait_until(Duration::from_secs(5), || {
        player.buffered_frames() >= frames || !player.is_decoding()
    });
    handle.render(frames)
}

/// Render until every decoder has been played and released.
pub fn render_to_end(player: &Player, handle: &OfflineHandle, block: usize) -> Vec<f32> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut out = Vec::new();
    while Instant::now() < deadline {
        out.extend(render_ready(player, handle, block));
        if player.active_decoder_count() == 0 && player.queued_decoder_count() == 0 {
            break;
        }
        if player.buffered_frames() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    out
}

/// Receive events until one matches `predicate`.
pub fn wait_for_event(
    player: &Player,
    mut predicate: impl FnMut(&PlayerEvent) -> bool,
) -> Option<PlayerEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let event = player.recv_event_timeout(remaining)?;
        if predicate(&event) {
            return Some(event);
        }
    }
    None
}

/// Channel-0 samples of an interleaved block.
pub fn left(samples: &[f32], channels: usize) -> Vec<f32> {
    samples.iter().step_by(channels).copied().collect()
}

/// Expected channel-0 samples of decoder `id` over `frames`.
pub fn expected(id: u32, frames: std::ops::Range<u64>) -> Vec<f32> {
    frames.map(|frame| sample_value(id, frame)).collect()
}
