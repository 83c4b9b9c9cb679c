//! Common types for Stemline
//!
//! This module contains the fundamental audio types used throughout the
//! engine: the stem tag, stereo samples and stereo buffers.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default engine sample rate (48kHz)
///
/// Sources decoded at other rates are resampled to this rate at load time.
pub const SAMPLE_RATE: u32 = 48000;

/// Maximum render block size to pre-allocate for real-time safety
pub const MAX_BUFFER_SIZE: usize = 8192;

/// Audio sample type
pub type Sample = f32;

/// Musical part carried by a stem channel
///
/// Immutable per channel. Used to look up the default base volume and
/// whether pitch bend ("whammy") is allowed for the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SongStem {
    Song,
    Guitar,
    Rhythm,
    Bass,
    Keys,
    Vocals,
    Vocals1,
    Vocals2,
    Drums,
    Drums1,
    Drums2,
    Drums3,
    Drums4,
    Crowd,
    Sfx,
    Audio,
}

impl SongStem {
    /// All stems in declaration order
    pub const ALL: [SongStem; 16] = [
        SongStem::Song,
        SongStem::Guitar,
        SongStem::Rhythm,
        SongStem::Bass,
        SongStem::Keys,
        SongStem::Vocals,
        SongStem::Vocals1,
        SongStem::Vocals2,
        SongStem::Drums,
        SongStem::Drums1,
        SongStem::Drums2,
        SongStem::Drums3,
        SongStem::Drums4,
        SongStem::Crowd,
        SongStem::Sfx,
        SongStem::Audio,
    ];

    /// Get the name of this stem (lowercase, matches the serialized form)
    pub fn name(&self) -> &'static str {
        match self {
            SongStem::Song => "song",
            SongStem::Guitar => "guitar",
            SongStem::Rhythm => "rhythm",
            SongStem::Bass => "bass",
            SongStem::Keys => "keys",
            SongStem::Vocals => "vocals",
            SongStem::Vocals1 => "vocals1",
            SongStem::Vocals2 => "vocals2",
            SongStem::Drums => "drums",
            SongStem::Drums1 => "drums1",
            SongStem::Drums2 => "drums2",
            SongStem::Drums3 => "drums3",
            SongStem::Drums4 => "drums4",
            SongStem::Crowd => "crowd",
            SongStem::Sfx => "sfx",
            SongStem::Audio => "audio",
        }
    }
}

impl fmt::Display for SongStem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a stem name cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown stem name: {0}")]
pub struct UnknownStem(pub String);

impl FromStr for SongStem {
    type Err = UnknownStem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        SongStem::ALL
            .iter()
            .copied()
            .find(|stem| stem.name() == lower)
            .ok_or_else(|| UnknownStem(s.to_string()))
    }
}

/// A single stereo sample (left and right channels)
///
/// Uses `#[repr(C)]` to ensure predictable memory layout: [left, right].
/// This enables zero-copy conversion between `&[StereoSample]` and `&[f32]`
/// (interleaved format) using bytemuck.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    /// Create a new stereo sample
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// Create a silent stereo sample
    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Create a mono sample (same value in both channels)
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Get the peak amplitude (max of abs(left), abs(right))
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, factor: Sample) {
        self.left *= factor;
        self.right *= factor;
    }
}

/// A buffer of stereo samples
#[derive(Debug, Clone, Default)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Create a buffer filled with silence
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Create a buffer from an existing Vec of StereoSamples
    pub fn from_vec(samples: Vec<StereoSample>) -> Self {
        Self { samples }
    }

    /// Get the number of stereo samples in the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Set the working length of a pre-allocated buffer
    ///
    /// Fills any newly exposed elements with silence. Does not allocate as
    /// long as `new_len` stays within the existing capacity.
    #[inline]
    pub fn set_len_from_capacity(&mut self, new_len: usize) {
        if new_len > self.samples.len() {
            debug_assert!(
                new_len <= self.samples.capacity(),
                "set_len_from_capacity called with len > capacity"
            );
            self.samples.resize(new_len, StereoSample::silence());
        } else {
            self.samples.truncate(new_len);
        }
    }

    /// Fill the buffer with silence
    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    /// Get a slice of the samples
    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    /// Get a mutable slice of the samples
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Get a zero-copy view of samples as interleaved f32 [L, R, L, R, ...]
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }

    /// Get a zero-copy mutable view of samples as interleaved f32
    #[inline]
    pub fn as_interleaved_mut(&mut self) -> &mut [Sample] {
        bytemuck::cast_slice_mut(&mut self.samples)
    }

    /// Scale all samples by a factor
    pub fn scale(&mut self, factor: Sample) {
        for sample in &mut self.samples {
            *sample *= factor;
        }
    }

    /// Get an iterator over the samples
    pub fn iter(&self) -> impl Iterator<Item = &StereoSample> {
        self.samples.iter()
    }

    /// Get a mutable iterator over the samples
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StereoSample> {
        self.samples.iter_mut()
    }

    /// Get the peak amplitude in the buffer
    pub fn peak(&self) -> Sample {
        self.samples.iter().map(|s| s.peak()).fold(0.0, Sample::max)
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

impl IndexMut<usize> for StereoBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.samples[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_and_gain_in_place() {
        let mut a = StereoSample::new(1.0, 2.0);
        a += StereoSample::new(0.5, 0.5);
        assert_eq!(a, StereoSample::new(1.5, 2.5));

        a *= 0.5;
        assert_eq!(a, StereoSample::new(0.75, 1.25));
        assert_eq!(a.peak(), 1.25);
    }

    #[test]
    fn test_interleaved_view_matches_frames() {
        let buffer = StereoBuffer::from_vec(vec![
            StereoSample::new(1.0, 2.0),
            StereoSample::new(3.0, 4.0),
            StereoSample::new(5.0, 6.0),
        ]);

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.as_interleaved(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_set_len_from_capacity_keeps_allocation() {
        let mut buffer = StereoBuffer::silence(MAX_BUFFER_SIZE);
        let capacity = buffer.as_slice().len();
        buffer.set_len_from_capacity(256);
        assert_eq!(buffer.len(), 256);
        buffer.set_len_from_capacity(capacity);
        assert_eq!(buffer.len(), capacity);
    }

    #[test]
    fn test_stem_parsing() {
        assert_eq!("Drums".parse::<SongStem>(), Ok(SongStem::Drums));
        assert_eq!(" vocals2 ".parse::<SongStem>(), Ok(SongStem::Vocals2));
        assert!("kazoo".parse::<SongStem>().is_err());
        for stem in SongStem::ALL {
            assert_eq!(stem.name().parse::<SongStem>(), Ok(stem));
        }
    }

    #[test]
    fn test_stem_serde_lowercase() {
        let yaml = serde_yaml::to_string(&SongStem::Guitar).unwrap();
        assert_eq!(yaml.trim(), "guitar");
        let stem: SongStem = serde_yaml::from_str("crowd").unwrap();
        assert_eq!(stem, SongStem::Crowd);
    }
}
