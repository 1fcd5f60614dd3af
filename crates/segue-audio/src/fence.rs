//! Exclusion between the render callback and threads that rewrite shared
//! playback state underneath it.
//!
//! The renderer marks itself inside a pass and then checks for an excluder;
//! an excluder raises its flag and then waits for any pass in progress to
//! leave. Both sides use sequentially consistent operations, so at least one
//! of them always observes the other.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct RenderFence {
    in_render: AtomicBool,
    excluders: AtomicUsize,
}

impl RenderFence {
    pub const fn new() -> Self {
        Self {
            in_render: AtomicBool::new(false),
            excluders: AtomicUsize::new(0),
        }
    }

    /// Enter a render pass. Returns `None` while the renderer is excluded.
    ///
    /// Never blocks.
    pub fn enter(&self) -> Option<RenderPass<'_>> {
        self.in_render.store(true, Ordering::SeqCst);
        if self.excluders.load(Ordering::SeqCst) > 0 {
            self.in_render.store(false, Ordering::SeqCst);
            return None;
        }
        Some(RenderPass { fence: self })
    }

    /// Keep the renderer out until the returned guard is dropped.
    ///
    /// Waits at most one render pass.
    pub fn exclude(&self) -> Exclusion<'_> {
        self.excluders.fetch_add(1, Ordering::SeqCst);
        while self.in_render.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        Exclusion { fence: self }
    }

    pub fn is_excluded(&self) -> bool {
        self.excluders.load(Ordering::SeqCst) > 0
    }
}

/// Held by the renderer for the length of one pass.
#[derive(Debug)]
pub struct RenderPass<'a> {
    fence: &'a RenderFence,
}

impl Drop for RenderPass<'_> {
    fn drop(&mut self) {
        self.fence.in_render.store(false, Ordering::SeqCst);
    }
}

/// Held by a thread that must not race the renderer.
#[derive(Debug)]
pub struct Exclusion<'a> {
    fence: &'a RenderFence,
}

impl Drop for Exclusion<'_> {
    fn drop(&mut self) {
        self.fence.excluders.fetch_sub(1, Ordering::SeqCst);
    }
}
