//! Bookkeeping for decoders that have left the queue.
//!
//! The active table is a fixed arena of [`ACTIVE_DECODER_SLOTS`] slots. A slot
//! is filled by the decoder worker, advanced by the worker (decode side) and
//! the renderer (render side), and emptied only by the collector. Every
//! lifecycle transition happens with the slot's decoder mutex held; progress
//! counters are atomics so the renderer never takes a lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use segue_core::{Decoder, ACTIVE_DECODER_SLOTS};

/// Marker for "no value" in the `u64` atomics below.
const NONE: u64 = u64::MAX;

pub type DecoderGuard<'a> = MutexGuard<'a, Option<Box<dyn Decoder>>>;

/// One entry of the active decoder table.
#[derive(Debug)]
pub struct DecoderSlot {
    decoder: Mutex<Option<Box<dyn Decoder>>>,
    url: Mutex<Option<String>>,
    active: AtomicBool,
    generation: AtomicU64,
    /// Ring position where this decoder's current data begins.
    ring_start_frame: AtomicU64,
    /// Decoder frame stored at `ring_start_frame`.
    first_frame: AtomicU64,
    frames_decoded: AtomicU64,
    frames_rendered: AtomicU64,
    total_frames: AtomicU64,
    supports_seeking: AtomicBool,
    decoding_finished: AtomicBool,
    rendering_finished: AtomicBool,
    seek_target: AtomicU64,
    flush_requested: AtomicBool,
}

impl DecoderSlot {
    pub fn new() -> Self {
        Self {
            decoder: Mutex::new(None),
            url: Mutex::new(None),
            active: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            ring_start_frame: AtomicU64::new(0),
            first_frame: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            total_frames: AtomicU64::new(NONE),
            supports_seeking: AtomicBool::new(false),
            decoding_finished: AtomicBool::new(false),
            rendering_finished: AtomicBool::new(false),
            seek_target: AtomicU64::new(NONE),
            flush_requested: AtomicBool::new(false),
        }
    }

    /// Lock the decoder. Lifecycle changes require this guard.
    pub fn lock(&self) -> DecoderGuard<'_> {
        self.decoder.lock()
    }

    /// Move `decoder` into this (free) slot with its data starting at ring
    /// position `ring_start_frame`.
    pub fn activate(
        &self,
        guard: &mut DecoderGuard<'_>,
        decoder: Box<dyn Decoder>,
        ring_start_frame: u64,
    ) {
        debug_assert!(guard.is_none());
        *self.url.lock() = decoder.url().map(str::to_string);
        self.ring_start_frame.store(ring_start_frame, Ordering::Relaxed);
        self.first_frame.store(0, Ordering::Relaxed);
        self.frames_decoded.store(0, Ordering::Relaxed);
        self.frames_rendered.store(0, Ordering::Relaxed);
        self.total_frames
            .store(decoder.frame_length().unwrap_or(NONE), Ordering::Relaxed);
        self.supports_seeking
            .store(decoder.supports_seeking(), Ordering::Relaxed);
        self.decoding_finished.store(false, Ordering::Relaxed);
        self.rendering_finished.store(false, Ordering::Relaxed);
        self.seek_target.store(NONE, Ordering::Relaxed);
        self.flush_requested.store(false, Ordering::Relaxed);
        **guard = Some(decoder);
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }

    /// Empty the slot, handing back its decoder.
    pub fn retire(&self, guard: &mut DecoderGuard<'_>) -> Option<Box<dyn Decoder>> {
        self.active.store(false, Ordering::Release);
        self.seek_target.store(NONE, Ordering::Relaxed);
        self.flush_requested.store(false, Ordering::Relaxed);
        *self.url.lock() = None;
        guard.take()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn url(&self) -> Option<String> {
        self.url.lock().clone()
    }

    pub fn ring_start_frame(&self) -> u64 {
        self.ring_start_frame.load(Ordering::Acquire)
    }

    /// One past the last ring position holding this decoder's data.
    pub fn ring_end_frame(&self) -> u64 {
        let decoded = self
            .frames_decoded()
            .saturating_sub(self.first_frame.load(Ordering::Acquire));
        self.ring_start_frame() + decoded
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Acquire)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> Option<u64> {
        match self.total_frames.load(Ordering::Acquire) {
            NONE => None,
            total => Some(total),
        }
    }

    pub fn supports_seeking(&self) -> bool {
        self.supports_seeking.load(Ordering::Acquire)
    }

    pub fn is_decoding_finished(&self) -> bool {
        self.decoding_finished.load(Ordering::Acquire)
    }

    pub fn is_rendering_finished(&self) -> bool {
        self.rendering_finished.load(Ordering::Acquire)
    }

    /// Pending seek target, if any.
    pub fn seek_target(&self) -> Option<u64> {
        match self.seek_target.load(Ordering::Acquire) {
            NONE => None,
            target => Some(target),
        }
    }

    pub fn is_flush_requested(&self) -> bool {
        self.flush_requested.load(Ordering::Acquire)
    }

    /// Whether the collector may destroy this slot's decoder.
    pub fn is_collectable(&self) -> bool {
        self.is_active()
            && self.is_decoding_finished()
            && self.is_rendering_finished()
            && self.seek_target().is_none()
            && !self.is_flush_requested()
    }

    /// Record `frames` newly decoded frames. Must precede publishing them to
    /// the ring so the renderer never consumes unattributed data.
    pub(crate) fn add_decoded(&self, frames: u64) {
        self.frames_decoded.fetch_add(frames, Ordering::AcqRel);
    }

    pub(crate) fn remove_decoded(&self, frames: u64) {
        self.frames_decoded.fetch_sub(frames, Ordering::AcqRel);
    }

    pub(crate) fn finish_decoding(&self) {
        self.decoding_finished.store(true, Ordering::Release);
    }

    /// Renderer only.
    pub(crate) fn add_rendered(&self, frames: u64) {
        let rendered = self.frames_rendered.load(Ordering::Relaxed);
        self.frames_rendered.store(rendered + frames, Ordering::Release);
    }

    pub(crate) fn finish_rendering(&self) {
        self.rendering_finished.store(true, Ordering::Release);
    }

    /// Ask the worker to reposition this decoder. The renderer outputs silence
    /// for it until the worker has flushed.
    pub(crate) fn request_seek(&self, _guard: &DecoderGuard<'_>, frame: u64) {
        self.flush_requested.store(true, Ordering::Release);
        self.seek_target.store(frame, Ordering::Release);
    }

    /// Restart bookkeeping after the decoder moved to `frame`, with its data
    /// continuing at ring position `ring_start_frame`. Clears the seek target
    /// last, so readers that see no target see the new position.
    pub(crate) fn reset_after_seek(&self, ring_start_frame: u64, frame: u64) {
        self.ring_start_frame.store(ring_start_frame, Ordering::Relaxed);
        self.first_frame.store(frame, Ordering::Relaxed);
        self.frames_decoded.store(frame, Ordering::Relaxed);
        self.frames_rendered.store(frame, Ordering::Relaxed);
        self.decoding_finished.store(false, Ordering::Relaxed);
        self.rendering_finished.store(false, Ordering::Relaxed);
        self.flush_requested.store(false, Ordering::Release);
        self.seek_target.store(NONE, Ordering::Release);
    }

    /// Withdraw a seek request, leaving the decoder and its buffered audio
    /// where they were.
    pub(crate) fn cancel_seek(&self) {
        self.flush_requested.store(false, Ordering::Release);
        self.seek_target.store(NONE, Ordering::Release);
    }

    /// Give up on a decoder whose seek failed; its buffered data is gone.
    pub(crate) fn abandon(&self) {
        self.decoding_finished.store(true, Ordering::Release);
        self.rendering_finished.store(true, Ordering::Release);
        self.flush_requested.store(false, Ordering::Release);
        self.seek_target.store(NONE, Ordering::Release);
    }
}

impl Default for DecoderSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed arena of decoder slots.
#[derive(Debug)]
pub struct DecoderTable {
    slots: [DecoderSlot; ACTIVE_DECODER_SLOTS],
}

impl DecoderTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| DecoderSlot::new()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecoderSlot> {
        self.slots.iter()
    }

    pub fn get(&self, index: usize) -> &DecoderSlot {
        &self.slots[index]
    }

    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_active()).count()
    }

    /// The slot currently being decoded into. Decoding is strictly in
    /// playback order, so there is at most one.
    pub fn decoding(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.is_active() && !slot.is_decoding_finished())
    }

    /// The slot whose audio is at (or next after) the read position.
    pub fn current(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_active() && !slot.is_rendering_finished())
            .min_by_key(|(_, slot)| slot.ring_start_frame())
            .map(|(index, _)| index)
    }

    /// Active slots whose data begins after `ring_frame`, in playback order.
    pub fn after(&self, ring_frame: u64) -> Vec<usize> {
        let mut later: Vec<usize> = (0..ACTIVE_DECODER_SLOTS)
            .filter(|&index| {
                let slot = &self.slots[index];
                slot.is_active() && slot.ring_start_frame() > ring_frame
            })
            .collect();
        later.sort_by_key(|&index| self.slots[index].ring_start_frame());
        later
    }

    /// First active slot after `ring_frame` whose decoder cannot be rewound.
    pub fn unseekable_after(&self, ring_frame: u64) -> Option<usize> {
        self.after(ring_frame)
            .into_iter()
            .find(|&index| !self.slots[index].supports_seeking())
    }

    /// Index of the slot with a pending seek.
    pub fn pending_seek(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.is_active() && slot.seek_target().is_some())
    }

    /// Whether any slot is waiting for a seek flush. Lock-free.
    pub fn flush_pending(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.is_active() && slot.is_flush_requested())
    }
}

impl Default for DecoderTable {
    fn default() -> Self {
        Self::new()
    }
}
