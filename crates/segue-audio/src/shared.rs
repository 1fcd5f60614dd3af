//! State shared by the player, both workers, and the render callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use segue_core::{AudioFormat, Decoder, EngineConfig, PcmBuffer};
use tracing::trace;

use crate::buffer::RingBuffer;
use crate::fence::RenderFence;
use crate::player::{PlaybackState, PlayerEvent};
use crate::signal::WakeSignal;
use crate::slot::DecoderTable;

/// Lock order: `gate` -> `queue` -> host -> slot decoder mutex.
pub struct Shared {
    pub config: EngineConfig,
    /// Write-locked only while the worker is gated and the renderer fenced out.
    pub ring: RwLock<RingBuffer>,
    pub format: RwLock<Option<AudioFormat>>,
    pub table: DecoderTable,
    pub queue: Mutex<VecDeque<Box<dyn Decoder>>>,
    /// Held by the decoder worker for one iteration; holds its scratch buffer.
    pub gate: Mutex<PcmBuffer>,
    pub fence: RenderFence,
    pub decoder_wake: WakeSignal,
    pub collector_wake: WakeSignal,
    /// Global read position. Written by the renderer, or by an excluder.
    pub frames_rendered: AtomicU64,
    pub underruns: AtomicU64,
    pub keep_running: AtomicBool,
    state: AtomicU8,
    volume: AtomicU32,
    pre_gain: AtomicU32,
    hard_limiting: AtomicBool,
    events: Sender<PlayerEvent>,
}

impl Shared {
    pub fn new(config: EngineConfig, events: Sender<PlayerEvent>) -> Self {
        let ring = RingBuffer::new(0, config.ring_buffer_frames);
        Self {
            ring: RwLock::new(ring),
            format: RwLock::new(None),
            table: DecoderTable::new(),
            queue: Mutex::new(VecDeque::new()),
            gate: Mutex::new(PcmBuffer::default()),
            fence: RenderFence::new(),
            decoder_wake: WakeSignal::new(),
            collector_wake: WakeSignal::new(),
            frames_rendered: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            keep_running: AtomicBool::new(true),
            state: AtomicU8::new(PlaybackState::Stopped as u8),
            volume: AtomicU32::new(config.volume.to_bits()),
            pre_gain: AtomicU32::new(config.pre_gain.to_bits()),
            hard_limiting: AtomicBool::new(config.hard_limiting),
            events,
            config,
        }
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the previous state.
    pub fn set_state(&self, state: PlaybackState) -> PlaybackState {
        PlaybackState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn pre_gain(&self) -> f32 {
        f32::from_bits(self.pre_gain.load(Ordering::Relaxed))
    }

    pub fn set_pre_gain(&self, gain: f32) {
        self.pre_gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn hard_limiting(&self) -> bool {
        self.hard_limiting.load(Ordering::Relaxed)
    }

    pub fn set_hard_limiting(&self, enabled: bool) {
        self.hard_limiting.store(enabled, Ordering::Relaxed);
    }

    pub fn read_position(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    pub fn format(&self) -> Option<AudioFormat> {
        *self.format.read()
    }

    pub fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::Acquire)
    }

    /// Send an event to the player's receiver. Never called on the render path.
    pub fn emit(&self, event: PlayerEvent) {
        trace!("Event: {:?}", event);
        let _ = self.events.send(event);
    }
}
