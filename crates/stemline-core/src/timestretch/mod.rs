//! Tempo and pitch processing via signalsmith-stretch
//!
//! The tempo stage of a stream consumes `speed × output_len` source frames
//! per block and lets the stretcher squeeze them into `output_len` frames.
//! Transposition is independent of tempo and is set in semitones.

use signalsmith_stretch::Stretch;

use crate::types::StereoBuffer;

/// Number of channels (stereo)
const CHANNELS: u32 = 2;

/// Slowest supported playback speed
pub const MIN_SPEED: f64 = 0.05;

/// Fastest supported playback speed
pub const MAX_SPEED: f64 = 50.0;

/// Transpose range in semitones
pub const MAX_TRANSPOSE_SEMITONES: f64 = 60.0;

/// Time stretcher for tempo changes and pitch shifting
///
/// Uses zero-copy format conversion: `StereoBuffer` is reinterpreted as
/// interleaved f32 without per-frame copying.
pub struct TimeStretcher {
    stretcher: Stretch,
    /// Playback speed (input frames consumed per output frame)
    speed: f64,
    /// Pitch shift in semitones (positive = up, negative = down)
    pitch_semitones: f64,
}

impl TimeStretcher {
    /// Create a new time stretcher with the specified sample rate
    pub fn new_with_sample_rate(sample_rate: u32) -> Self {
        Self {
            stretcher: Stretch::preset_default(CHANNELS, sample_rate),
            speed: 1.0,
            pitch_semitones: 0.0,
        }
    }

    /// Set the playback speed (1.0 = original tempo)
    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed.clamp(MIN_SPEED, MAX_SPEED);
    }

    /// Get the current playback speed
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Convert a relative tempo in percent (0 = unchanged, 100 = double) to a speed
    pub fn speed_from_tempo_percent(percent: f64) -> f64 {
        (1.0 + percent / 100.0).clamp(MIN_SPEED, MAX_SPEED)
    }

    /// Set pitch shift in semitones, clamped to ±60
    pub fn set_pitch_semitones(&mut self, semitones: f64) {
        self.pitch_semitones = semitones.clamp(-MAX_TRANSPOSE_SEMITONES, MAX_TRANSPOSE_SEMITONES);
        // None for tonality_limit means no limit on formant preservation
        self.stretcher
            .set_transpose_factor_semitones(self.pitch_semitones as f32, None);
    }

    /// Get the current pitch shift in semitones
    pub fn pitch_semitones(&self) -> f64 {
        self.pitch_semitones
    }

    /// Whether the stage currently changes neither tempo nor pitch
    pub fn is_unity(&self) -> bool {
        self.speed == 1.0 && self.pitch_semitones == 0.0
    }

    /// Reset the stretcher state
    pub fn reset(&mut self) {
        self.stretcher.reset();
    }

    /// Process audio through the time stretcher
    ///
    /// The effective stretch is `input.len() / output.len()`: the caller
    /// sizes the input from [`TimeStretcher::speed`].
    pub fn process(&mut self, input: &StereoBuffer, output: &mut StereoBuffer) {
        if input.is_empty() {
            output.fill_silence();
            return;
        }

        let input_len = input.len();
        let output_len = output.len();

        let input_interleaved = input.as_interleaved();
        let output_interleaved = output.as_interleaved_mut();

        output_interleaved[..output_len * 2].fill(0.0);

        self.stretcher.process(
            &input_interleaved[..input_len * 2],
            &mut output_interleaved[..output_len * 2],
        );
    }

}
