//! Planar sample buffers passed between decoders, the ring buffer, and the renderer.

/// Planar 32-bit float PCM buffer with a fixed frame capacity.
///
/// Storage is allocated once; `frames` tracks how many leading frames of each
/// plane hold valid audio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcmBuffer {
    planes: Vec<Vec<f32>>,
    capacity: usize,
    frames: usize,
}

impl PcmBuffer {
    /// Create a silent buffer with `channels` planes of `capacity` frames.
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            planes: vec![vec![0.0; capacity]; channels],
            capacity,
            frames: 0,
        }
    }

    /// Build a buffer from whole planes; frame count is the shortest plane.
    pub fn from_planes(planes: Vec<Vec<f32>>) -> Self {
        let frames = planes.iter().map(Vec::len).min().unwrap_or(0);
        let mut planes = planes;
        for plane in &mut planes {
            plane.truncate(frames);
        }
        Self {
            planes,
            capacity: frames,
            frames,
        }
    }

    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid frames.
    pub const fn frames(&self) -> usize {
        self.frames
    }

    pub const fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Set the number of valid frames, clamped to capacity.
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity);
    }

    /// Mark the buffer empty without touching sample memory.
    pub fn clear(&mut self) {
        self.frames = 0;
    }

    /// Valid frames of one channel.
    pub fn plane(&self, channel: usize) -> &[f32] {
        &self.planes[channel][..self.frames]
    }

    /// Whole-capacity storage of one channel, for writers.
    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.planes[channel]
    }

    /// Zero `len` frames starting at `offset` in every channel.
    pub fn silence(&mut self, offset: usize, len: usize) {
        let end = (offset + len).min(self.capacity);
        if offset >= end {
            return;
        }
        for plane in &mut self.planes {
            plane[offset..end].fill(0.0);
        }
    }

    /// Reallocate for a new geometry; contents are discarded.
    pub fn resize(&mut self, channels: usize, capacity: usize) {
        if channels == self.channels() && capacity == self.capacity {
            self.frames = 0;
            return;
        }
        *self = Self::new(channels, capacity);
    }

    /// Write the first `frames` frames as interleaved samples into `out`.
    ///
    /// `out` must hold at least `frames * channels` samples.
    pub fn interleave_into(&self, out: &mut [f32], frames: usize) {
        let channels = self.channels();
        let frames = frames.min(self.capacity);
        for (ch, plane) in self.planes.iter().enumerate() {
            for (frame, sample) in plane[..frames].iter().enumerate() {
                out[frame * channels + ch] = *sample;
            }
        }
    }

    /// Copy interleaved samples into the planes starting at frame `offset`.
    ///
    /// Returns the number of frames copied.
    pub fn deinterleave_from(&mut self, interleaved: &[f32], offset: usize) -> usize {
        let channels = self.channels();
        if channels == 0 || offset >= self.capacity {
            return 0;
        }
        let frames = (interleaved.len() / channels).min(self.capacity - offset);
        for (ch, plane) in self.planes.iter_mut().enumerate() {
            for frame in 0..frames {
                plane[offset + frame] = interleaved[frame * channels + ch];
            }
        }
        frames
    }
}
