//! Decoder worker: keeps the ring buffer filled ahead of the renderer.
//!
//! Decoding is strictly in playback order. The ring holds one contiguous
//! timeline, so only the decoder at the write head can be extended and the
//! next queued decoder starts only once the previous one has finished.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use segue_core::{AudioFormat, Decoder, Error, PcmBuffer, Result};
use tracing::{debug, error, info, trace, warn};

use crate::player::PlayerEvent;
use crate::shared::Shared;
use crate::slot::DecoderSlot;

pub(super) fn run(shared: Arc<Shared>) {
    info!("Decoder worker started");
    let worker = DecoderWorker { shared };

    while worker.shared.is_running() {
        let progressed = {
            let mut scratch = worker.shared.gate.lock();
            worker.step(&mut scratch)
        };
        if !progressed {
            worker
                .shared
                .decoder_wake
                .wait_timeout(worker.shared.config.decoder_idle_timeout());
        }
    }

    info!("Decoder worker stopped");
}

struct DecoderWorker {
    shared: Arc<Shared>,
}

impl DecoderWorker {
    /// One iteration under the decode gate. Returns whether anything changed.
    fn step(&self, scratch: &mut PcmBuffer) -> bool {
        if self.service_seek() {
            return true;
        }

        let Some(format) = self.shared.format() else {
            return false;
        };

        let index = match self.shared.table.decoding() {
            Some(index) => index,
            None => match self.start_next() {
                Some(index) => index,
                None => return false,
            },
        };

        self.decode_chunk(index, format, scratch)
    }

    /// Move the next queued decoder into the first free slot.
    fn start_next(&self) -> Option<usize> {
        let index = self.shared.table.first_free()?;
        // Hold the queue lock until the decoder is visible in the table.
        let mut queue = self.shared.queue.lock();
        let decoder = queue.pop_front()?;

        let ring_start = self.shared.ring.read().end_frame();
        let url = decoder.url().map(str::to_string);
        let slot = self.shared.table.get(index);
        {
            let mut guard = slot.lock();
            slot.activate(&mut guard, decoder, ring_start);
        }
        drop(queue);

        debug!(
            "Decoding {} in slot {} from ring frame {}",
            url.as_deref().unwrap_or("<unnamed>"),
            index,
            ring_start
        );
        self.shared.emit(PlayerEvent::DecodingStarted { url });
        Some(index)
    }

    fn decode_chunk(&self, index: usize, format: AudioFormat, scratch: &mut PcmBuffer) -> bool {
        let channels = usize::from(format.channels);
        let chunk = self.shared.config.decode_chunk_frames;
        if scratch.channels() != channels || scratch.capacity() < chunk {
            scratch.resize(channels, chunk);
        }

        let ring = self.shared.ring.read();
        let free = ring.free_frames(self.shared.read_position());
        if free == 0 {
            return false;
        }

        let slot = self.shared.table.get(index);
        let mut want = chunk.min(free);
        if let Some(total) = slot.total_frames() {
            let remaining = total.saturating_sub(slot.frames_decoded());
            if remaining == 0 {
                self.finish(slot, index);
                return true;
            }
            want = want.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        let result = {
            let mut guard = slot.lock();
            let Some(decoder) = guard.as_mut() else {
                return false;
            };
            contain_panic(|| decoder.decode_frames(scratch, want))
        };

        match result {
            Ok(0) => self.finish(slot, index),
            Ok(frames) => {
                let frames = frames.min(want).min(scratch.frames());
                // Attribute before publishing so the renderer never outruns it.
                slot.add_decoded(frames as u64);
                if let Err(e) = ring.store(ring.end_frame(), scratch, frames) {
                    slot.remove_decoded(frames as u64);
                    warn!("Failed to buffer decoded audio: {e}");
                    self.fail(slot, index, e.to_string());
                    return true;
                }
                trace!(
                    "Slot {}: decoded {} frames ({} total)",
                    index,
                    frames,
                    slot.frames_decoded()
                );
                if slot
                    .total_frames()
                    .is_some_and(|total| slot.frames_decoded() >= total)
                {
                    self.finish(slot, index);
                }
            }
            Err(e) => {
                warn!("Decode error in slot {index}: {e}");
                self.fail(slot, index, e.to_string());
            }
        }

        true
    }

    fn finish(&self, slot: &DecoderSlot, index: usize) {
        slot.finish_decoding();
        let frames = slot.frames_decoded();
        debug!("Slot {index}: decoding finished after {frames} frames");
        self.shared.emit(PlayerEvent::DecodingFinished {
            url: slot.url(),
            frames,
        });
        self.shared.collector_wake.post();
    }

    fn fail(&self, slot: &DecoderSlot, index: usize, message: String) {
        self.shared.emit(PlayerEvent::DecodeError {
            url: slot.url(),
            message,
        });
        self.finish(slot, index);
    }

    /// Flush and reposition for a pending seek.
    fn service_seek(&self) -> bool {
        let Some(index) = self.shared.table.pending_seek() else {
            return false;
        };
        let slot = self.shared.table.get(index);

        let _exclusion = self.shared.fence.exclude();
        let mut guard = slot.lock();
        // Requests need the slot lock, so the target is stable until reset.
        let Some(target) = slot.seek_target() else {
            return false;
        };
        // Decoders are only activated under the gate, so the lookahead is stable.
        if let Some(blocker) = self.shared.table.unseekable_after(slot.ring_start_frame()) {
            let blocker = self.shared.table.get(blocker).url();
            let blocker = blocker.as_deref().unwrap_or("<unnamed>");
            warn!("Seek in slot {index} withdrawn: {blocker} cannot be rewound");
            slot.cancel_seek();
            drop(guard);
            self.shared.emit(PlayerEvent::DecodeError {
                url: slot.url(),
                message: format!("seek withdrawn: {blocker} cannot be rewound"),
            });
            return true;
        }
        let Some(decoder) = guard.as_mut() else {
            return false;
        };
        let result = contain_panic(|| decoder.seek_to_frame(target));

        let lookahead = self.rewind_after(slot.ring_start_frame());

        let ring_end = {
            let ring = self.shared.ring.read();
            ring.flush();
            ring.end_frame()
        };
        self.shared.frames_rendered.store(ring_end, Ordering::Release);

        let completed = match result {
            Ok(frame) => {
                slot.reset_after_seek(ring_end, frame);
                debug!("Slot {index}: seeked to frame {frame} (requested {target})");
                Some(frame)
            }
            Err(e) => {
                warn!("Seek to frame {target} failed in slot {index}: {e}");
                slot.abandon();
                self.shared.emit(PlayerEvent::DecodeError {
                    url: slot.url(),
                    message: e.to_string(),
                });
                None
            }
        };
        drop(guard);

        if !lookahead.is_empty() {
            let mut queue = self.shared.queue.lock();
            for decoder in lookahead.into_iter().rev() {
                queue.push_front(decoder);
            }
        }

        match completed {
            Some(frame) => self.shared.emit(PlayerEvent::SeekCompleted { frame }),
            None => self.shared.collector_wake.post(),
        }
        true
    }

    /// Pull every decoder queued behind ring position `ring_frame` out of the
    /// table, rewound to its first frame, in playback order.
    fn rewind_after(&self, ring_frame: u64) -> Vec<Box<dyn Decoder>> {
        let mut rewound = Vec::new();

        for index in self.shared.table.after(ring_frame) {
            let slot = self.shared.table.get(index);
            let mut guard = slot.lock();
            let Some(mut decoder) = slot.retire(&mut guard) else {
                continue;
            };
            drop(guard);

            match contain_panic(|| decoder.seek_to_frame(0)) {
                Ok(_) => rewound.push(decoder),
                Err(e) => warn!(
                    "Dropping {} after seek: rewind failed: {e}",
                    decoder.url().unwrap_or("<unnamed>")
                ),
            }
        }

        if !rewound.is_empty() {
            debug!("Returned {} lookahead decoder(s) to the queue", rewound.len());
        }
        rewound
    }
}

/// Run a decoder call, reporting a panic as a decode error.
fn contain_panic<T>(call: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        let reason = panic_message(payload.as_ref());
        error!("Decoder panicked: {reason}");
        Err(Error::DecodeError(format!("decoder panicked: {reason}")))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
