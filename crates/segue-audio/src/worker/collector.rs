//! Collector: reclaims decoders once every frame they produced was rendered.
//!
//! This is the only place a finished decoder is destroyed, so the render
//! callback never observes a slot being torn down underneath it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::player::PlayerEvent;
use crate::shared::Shared;

pub(super) fn run(shared: Arc<Shared>) {
    info!("Collector started");
    let mut reported_underruns = 0;

    while shared.is_running() {
        shared
            .collector_wake
            .wait_timeout(shared.config.collector_timeout());
        if !shared.is_running() {
            break;
        }

        collect(&shared);

        let underruns = shared.underruns.load(Ordering::Relaxed);
        if underruns > reported_underruns {
            warn!(
                "Buffer underrun: {} render pass(es) short of audio",
                underruns - reported_underruns
            );
            reported_underruns = underruns;
        }
    }

    info!("Collector stopped");
}

/// Retire every slot that is done. Returns how many were collected.
pub(crate) fn collect(shared: &Shared) -> usize {
    let mut collected = 0;

    for (index, slot) in shared.table.iter().enumerate() {
        if !slot.is_collectable() {
            continue;
        }

        let mut guard = slot.lock();
        // Re-check now that nothing else can touch the slot.
        if !slot.is_collectable() {
            continue;
        }
        let url = slot.url();
        let decoder = slot.retire(&mut guard);
        drop(guard);
        drop(decoder);

        debug!(
            "Collected {} from slot {index}",
            url.as_deref().unwrap_or("<unnamed>")
        );
        shared.emit(PlayerEvent::RenderingFinished { url });
        collected += 1;
    }

    if collected > 0 {
        shared.decoder_wake.post();
        // Activation happens under the queue lock, so both checks agree.
        let queue = shared.queue.lock();
        let finished = queue.is_empty() && shared.table.active_count() == 0;
        drop(queue);
        if finished {
            info!("Playback finished");
            shared.emit(PlayerEvent::PlaybackFinished);
        }
    }

    collected
}
