//! Lock-free ring buffer addressed by absolute frame positions.
//!
//! This buffer is designed for single-producer, single-consumer use where the
//! decoder thread stores frames and the render callback fetches them. Frame
//! positions are 64-bit counters that never wrap; the physical index is the
//! position masked by the (power of two) capacity, computed at access time.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use segue_core::PcmBuffer;
use thiserror::Error;

/// Errors returned by [`RingBuffer::store`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("cannot store {requested} frames in a {capacity}-frame ring")]
    TooMuch { requested: usize, capacity: usize },

    #[error("buffer has {actual} channels, ring has {expected}")]
    ChannelMismatch { expected: usize, actual: usize },
}

/// Multi-channel single-producer, single-consumer ring of float frames.
///
/// Valid data always lies in `[start_frame, end_frame)` and spans at most
/// `capacity` frames. The producer advances `start` before overwriting old
/// sample memory and publishes `end` after writing new frames, so a consumer
/// that loads `end` first only ever observes committed data.
pub struct RingBuffer {
    /// Planar sample storage, `channels * capacity` cells.
    samples: Box<[UnsafeCell<f32>]>,
    channels: usize,
    /// Capacity in frames (power of 2 for efficient modulo).
    capacity: usize,
    /// Mask for efficient modulo (capacity - 1).
    mask: usize,
    /// First valid frame.
    start: AtomicU64,
    /// One past the last valid frame; the producer's write position.
    end: AtomicU64,
}

impl RingBuffer {
    /// Create a ring with `channels` planes.
    ///
    /// The capacity will be rounded up to the next power of 2.
    pub fn new(channels: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let samples = (0..channels * capacity)
            .map(|_| UnsafeCell::new(0.0f32))
            .collect();

        Self {
            samples,
            channels,
            capacity,
            mask: capacity - 1,
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
        }
    }

    /// Get the buffer capacity in frames.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// First frame still held by the buffer.
    pub fn start_frame(&self) -> u64 {
        self.start.load(Ordering::Acquire)
    }

    /// Frame position the next contiguous store begins at.
    pub fn end_frame(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    /// Frames stored past `read_position` that a consumer has yet to fetch.
    pub fn frames_ahead_of(&self, read_position: u64) -> usize {
        let end = self.end_frame();
        end.saturating_sub(read_position).min(self.capacity as u64) as usize
    }

    /// Frames the producer may store without overwriting anything at or past
    /// `read_position`.
    pub fn free_frames(&self, read_position: u64) -> usize {
        self.capacity - self.frames_ahead_of(read_position)
    }

    /// Store `frame_count` frames from `buffer` at absolute `frame_position`.
    ///
    /// Storing behind the current end invalidates everything held; storing
    /// past it zero-fills the gap. Older frames are dropped so at most
    /// `capacity` frames remain valid. The caller is responsible for not
    /// outrunning the consumer.
    pub fn store(
        &self,
        frame_position: u64,
        buffer: &PcmBuffer,
        frame_count: usize,
    ) -> Result<(), RingBufferError> {
        if buffer.channels() != self.channels {
            return Err(RingBufferError::ChannelMismatch {
                expected: self.channels,
                actual: buffer.channels(),
            });
        }
        if frame_count > self.capacity {
            return Err(RingBufferError::TooMuch {
                requested: frame_count,
                capacity: self.capacity,
            });
        }

        let frame_count = frame_count.min(buffer.frames());
        if frame_count == 0 {
            return Ok(());
        }

        // The producer is the only writer of both bounds.
        let mut start = self.start.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Relaxed);
        let end_write = frame_position + frame_count as u64;
        let floor = end_write.saturating_sub(self.capacity as u64);

        if frame_position < end {
            self.end.store(frame_position, Ordering::Release);
            self.start.store(frame_position, Ordering::Release);
            start = frame_position;
        }

        let new_start = start.max(floor);
        if new_start != start {
            self.start.store(new_start, Ordering::Relaxed);
            fence(Ordering::Release);
        }

        if frame_position > end {
            let gap_from = end.max(new_start);
            let gap = (frame_position - gap_from) as usize;
            for channel in 0..self.channels {
                // SAFETY: frames in [gap_from, frame_position) lie at or past
                // `end`, so no consumer can be reading them.
                #[allow(unsafe_code)]
                unsafe {
                    self.zero_frames(channel, gap_from, gap);
                }
            }
        }

        for channel in 0..self.channels {
            let src = &buffer.plane(channel)[..frame_count];
            // SAFETY: frames in [frame_position, end_write) are either past the
            // published end or below the freshly advanced start.
            #[allow(unsafe_code)]
            unsafe {
                self.write_frames(channel, frame_position, src);
            }
        }

        self.end.store(end_write, Ordering::Release);
        Ok(())
    }

    /// Copy `frame_count` frames starting at absolute `frame_position` into
    /// the start of `out`.
    ///
    /// Frames outside the valid range are zero-filled. Returns the number of
    /// valid frames copied; never blocks.
    pub fn fetch(&self, frame_position: u64, out: &mut PcmBuffer, frame_count: usize) -> usize {
        let frame_count = frame_count.min(out.capacity());
        out.set_frames(frame_count);
        if out.channels() != self.channels {
            out.silence(0, frame_count);
            return 0;
        }

        let end = self.end.load(Ordering::Acquire);
        let start = self.start.load(Ordering::Acquire);
        let request_end = frame_position + frame_count as u64;
        let valid_start = frame_position.max(start);
        let valid_end = request_end.min(end);

        if valid_start >= valid_end {
            out.silence(0, frame_count);
            return 0;
        }

        let lead = (valid_start - frame_position) as usize;
        let len = (valid_end - valid_start) as usize;
        out.silence(0, lead);
        out.silence(lead + len, frame_count - lead - len);

        for channel in 0..self.channels {
            let dst = &mut out.plane_mut(channel)[lead..lead + len];
            // SAFETY: [valid_start, valid_end) was published by the producer
            // before we loaded `end`.
            #[allow(unsafe_code)]
            unsafe {
                self.read_frames(channel, valid_start, dst);
            }
        }

        // A store may have advanced `start` over frames we just copied.
        fence(Ordering::Acquire);
        let start_after = self.start.load(Ordering::Relaxed);
        if start_after > valid_start {
            let clobbered = ((start_after - valid_start) as usize).min(len);
            out.silence(lead, clobbered);
            return len - clobbered;
        }

        len
    }

    /// Drop all stored frames, keeping positions.
    pub fn flush(&self) {
        let end = self.end.load(Ordering::Relaxed);
        self.start.store(end, Ordering::Release);
    }

    /// Reset both positions to zero.
    ///
    /// Only valid while neither the producer nor the consumer is running.
    pub fn reset(&self) {
        self.end.store(0, Ordering::Release);
        self.start.store(0, Ordering::Release);
    }

    fn plane_ptr(&self, channel: usize) -> *mut f32 {
        debug_assert!(channel < self.channels);
        // SAFETY: channel * capacity is within the allocation.
        #[allow(unsafe_code)]
        unsafe {
            UnsafeCell::raw_get(self.samples.as_ptr().add(channel * self.capacity))
        }
    }

    #[allow(unsafe_code)]
    unsafe fn write_frames(&self, channel: usize, position: u64, src: &[f32]) {
        let base = self.plane_ptr(channel);
        let offset = (position as usize) & self.mask;
        let first = src.len().min(self.capacity - offset);
        ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), first);
        ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
    }

    #[allow(unsafe_code)]
    unsafe fn read_frames(&self, channel: usize, position: u64, dst: &mut [f32]) {
        let base = self.plane_ptr(channel);
        let offset = (position as usize) & self.mask;
        let first = dst.len().min(self.capacity - offset);
        ptr::copy_nonoverlapping(base.add(offset), dst.as_mut_ptr(), first);
        ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
    }

    #[allow(unsafe_code)]
    unsafe fn zero_frames(&self, channel: usize, position: u64, count: usize) {
        let base = self.plane_ptr(channel);
        let count = count.min(self.capacity);
        let offset = (position as usize) & self.mask;
        let first = count.min(self.capacity - offset);
        // All-zero bits are 0.0f32.
        base.add(offset).write_bytes(0, first);
        base.write_bytes(0, count - first);
    }
}

// SAFETY: RingBuffer is safe to share between threads.
// The producer only writes sample cells outside [start, end) as published to
// the consumer, and the consumer only reads cells inside it; the bounds are
// atomics with release/acquire ordering.
#[allow(unsafe_code)]
unsafe impl Sync for RingBuffer {}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("channels", &self.channels)
            .field("capacity", &self.capacity)
            .field("start", &self.start_frame())
            .field("end", &self.end_frame())
            .finish()
    }
}
