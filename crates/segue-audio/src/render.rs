//! The render callback run by the host on its real-time thread.
//!
//! Nothing here blocks, allocates, or logs. Every failure mode degrades to
//! silence.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use segue_core::PcmBuffer;

use crate::player::PlaybackState;
use crate::shared::Shared;

/// Pulls frames from the ring buffer at the global read position.
///
/// Hosts call [`Renderer::render`] from their audio thread. Cloning yields an
/// independent renderer with its own scratch space, for hosts that rebuild
/// their streams.
pub struct Renderer {
    shared: Arc<Shared>,
    scratch: PcmBuffer,
}

impl Renderer {
    pub(crate) fn new(shared: Arc<Shared>, channels: usize) -> Self {
        let block = shared.config.render_block_frames;
        Self {
            shared,
            scratch: PcmBuffer::new(channels, block),
        }
    }

    /// Channels per interleaved output frame.
    pub fn channels(&self) -> usize {
        self.scratch.channels()
    }

    /// Fill `out` with interleaved samples.
    pub fn render(&mut self, out: &mut [f32]) {
        let Some(_pass) = self.shared.fence.enter() else {
            out.fill(0.0);
            return;
        };
        if self.shared.state() != PlaybackState::Playing {
            out.fill(0.0);
            return;
        }
        // Only a format change write-locks the ring.
        let Some(ring) = self.shared.ring.try_read() else {
            out.fill(0.0);
            return;
        };

        let channels = self.scratch.channels();
        if channels == 0 || ring.channels() != channels || self.shared.table.flush_pending() {
            out.fill(0.0);
            return;
        }

        let gain = self.shared.pre_gain() * self.shared.volume();
        let limit = self.shared.hard_limiting();
        let frames = out.len() / channels;
        let block = self.scratch.capacity();

        let start = self.shared.read_position();
        let mut position = start;
        let mut done = 0;
        let mut short = false;

        while done < frames {
            let count = (frames - done).min(block);
            let fetched = ring.fetch(position, &mut self.scratch, count);

            for channel in 0..channels {
                for sample in &mut self.scratch.plane_mut(channel)[..count] {
                    *sample *= gain;
                    if limit {
                        *sample = sample.clamp(-1.0, 1.0);
                    }
                }
            }
            self.scratch
                .interleave_into(&mut out[done * channels..], count);

            position += fetched as u64;
            done += count;
            if fetched < count {
                short = true;
                break;
            }
        }
        out[done * channels..].fill(0.0);
        drop(ring);

        if position != start {
            self.shared
                .frames_rendered
                .store(position, Ordering::Release);
        }

        let awaiting = self.attribute(start, position);
        if short && awaiting {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
        if short || position != start {
            self.shared.decoder_wake.post();
        }
    }

    /// Credit ring frames `[from, to)` to the slots that own them and mark
    /// slots whose audio has been fully played. Returns whether any slot
    /// still has audio to come.
    fn attribute(&self, from: u64, to: u64) -> bool {
        let mut awaiting = false;
        let mut finished = false;

        for slot in self.shared.table.iter() {
            if !slot.is_active() || slot.is_rendering_finished() || slot.is_flush_requested() {
                continue;
            }
            let generation = slot.generation();
            let decoding_finished = slot.is_decoding_finished();
            let start = slot.ring_start_frame();
            let end = slot.ring_end_frame();

            let overlap = to.min(end).saturating_sub(from.max(start));
            if overlap > 0 {
                slot.add_rendered(overlap);
            }

            let done = (decoding_finished && to >= end)
                || slot
                    .total_frames()
                    .is_some_and(|total| slot.frames_rendered() >= total);
            if done && slot.generation() == generation {
                slot.finish_rendering();
                finished = true;
            } else {
                awaiting = true;
            }
        }

        if finished {
            self.shared.collector_wake.post();
        }
        awaiting
    }
}

impl Clone for Renderer {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.shared), self.channels())
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("channels", &self.channels())
            .field("block_frames", &self.scratch.capacity())
            .finish_non_exhaustive()
    }
}
