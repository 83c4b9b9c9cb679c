//! Attribute values with linear slides driven by the audio clock

/// An attribute value that can glide towards a target
///
/// Slides advance by rendered frames, so a slide on a stream that is not
/// being rendered does not progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    current: f32,
    target: f32,
    remaining_frames: u64,
}

impl Ramp {
    pub fn new(value: f32) -> Self {
        Self {
            current: value,
            target: value,
            remaining_frames: 0,
        }
    }

    /// Jump to a value, cancelling any running slide
    pub fn set(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.remaining_frames = 0;
    }

    /// Start a slide from the current value; replaces any running slide
    pub fn slide(&mut self, target: f32, frames: u64) {
        if frames == 0 {
            self.set(target);
        } else {
            self.target = target;
            self.remaining_frames = frames;
        }
    }

    #[inline]
    pub fn current(&self) -> f32 {
        self.current
    }

    #[inline]
    pub fn is_sliding(&self) -> bool {
        self.remaining_frames > 0
    }

    /// Value after `frames` more frames, without advancing
    pub fn peek(&self, frames: u64) -> f32 {
        if frames >= self.remaining_frames {
            self.target
        } else {
            let t = frames as f32 / self.remaining_frames as f32;
            self.current + (self.target - self.current) * t
        }
    }

    /// Advance the slide by `frames`
    pub fn advance(&mut self, frames: u64) {
        self.current = self.peek(frames);
        self.remaining_frames = self.remaining_frames.saturating_sub(frames);
    }
}
