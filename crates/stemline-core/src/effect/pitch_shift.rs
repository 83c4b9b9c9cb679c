//! Whammy pitch shift
//!
//! Runs a [`TimeStretcher`] at unity speed with a transpose. The frequency
//! ratio and the semitone offset of the parameter block are combined into a
//! single transpose in semitones.

use crate::backend::{EffectKind, EffectParams, PitchShiftParams};
use crate::timestretch::TimeStretcher;
use crate::types::{StereoBuffer, MAX_BUFFER_SIZE};

use super::{check_range, ParamError, StreamEffect};

/// Lowest accepted frequency ratio (one octave down)
pub const MIN_PITCH_RATIO: f32 = 0.5;

/// Highest accepted frequency ratio (one octave up)
pub const MAX_PITCH_RATIO: f32 = 2.0;

pub(super) fn check_params(p: &PitchShiftParams) -> Result<(), ParamError> {
    check_range("pitch_shift", p.pitch_shift, MIN_PITCH_RATIO, MAX_PITCH_RATIO)?;
    check_range("semitones", p.semitones, -12.0, 12.0)?;
    if !p.fft_size.is_power_of_two() || !(32..=8192).contains(&p.fft_size) {
        return Err(ParamError::OutOfRange {
            name: "fft_size",
            value: p.fft_size as f32,
        });
    }
    if !(4..=32).contains(&p.oversample_factor) {
        return Err(ParamError::OutOfRange {
            name: "oversample_factor",
            value: p.oversample_factor as f32,
        });
    }
    Ok(())
}

pub struct PitchShiftEffect {
    params: PitchShiftParams,
    stretcher: TimeStretcher,
    /// Copy of the block being shifted (the stretcher cannot work in place)
    scratch: StereoBuffer,
}

impl PitchShiftEffect {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            params: PitchShiftParams {
                pitch_shift: 1.0,
                semitones: 0.0,
                fft_size: 2048,
                oversample_factor: 8,
            },
            stretcher: TimeStretcher::new_with_sample_rate(sample_rate),
            scratch: StereoBuffer::silence(MAX_BUFFER_SIZE),
        }
    }

    pub fn params(&self) -> &PitchShiftParams {
        &self.params
    }

    /// Total transpose in semitones for a parameter block
    pub fn transpose_semitones(params: &PitchShiftParams) -> f64 {
        12.0 * (params.pitch_shift as f64).log2() + params.semitones as f64
    }
}

impl StreamEffect for PitchShiftEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::PitchShift
    }

    fn set_params(&mut self, params: &EffectParams) -> Result<(), ParamError> {
        let EffectParams::PitchShift(p) = params else {
            return Err(ParamError::WrongKind {
                expected: EffectKind::PitchShift,
                got: params.kind(),
            });
        };
        check_params(p)?;

        self.params = *p;
        self.stretcher.set_pitch_semitones(Self::transpose_semitones(p));
        Ok(())
    }

    fn process(&mut self, buffer: &mut StereoBuffer) {
        let len = buffer.len().min(MAX_BUFFER_SIZE);
        self.scratch.set_len_from_capacity(len);
        self.scratch
            .as_mut_slice()
            .copy_from_slice(&buffer.as_slice()[..len]);
        self.stretcher.process(&self.scratch, buffer);
    }

    fn reset(&mut self) {
        self.stretcher.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pitch_shift: f32) -> EffectParams {
        EffectParams::PitchShift(PitchShiftParams {
            pitch_shift,
            semitones: 0.0,
            fft_size: 512,
            oversample_factor: 8,
        })
    }

    #[test]
    fn test_transpose_from_ratio() {
        let p = PitchShiftParams {
            pitch_shift: 2.0_f32.powf(-0.5),
            semitones: 0.0,
            fft_size: 512,
            oversample_factor: 8,
        };
        assert!((PitchShiftEffect::transpose_semitones(&p) + 6.0).abs() < 1e-4);

        let p = PitchShiftParams { pitch_shift: 1.0, semitones: 3.0, ..p };
        assert!((PitchShiftEffect::transpose_semitones(&p) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_params_applied() {
        let mut effect = PitchShiftEffect::new(48000);
        effect.set_params(&params(0.5)).unwrap();
        assert_eq!(effect.params().pitch_shift, 0.5);
        assert!((effect.stretcher.pitch_semitones() + 12.0).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_fft_size_rejected() {
        let mut effect = PitchShiftEffect::new(48000);
        let bad = EffectParams::PitchShift(PitchShiftParams {
            pitch_shift: 1.0,
            semitones: 0.0,
            fft_size: 500,
            oversample_factor: 8,
        });
        assert!(matches!(
            effect.set_params(&bad),
            Err(ParamError::OutOfRange { name: "fft_size", .. })
        ));
        assert!(effect.set_params(&params(3.0)).is_err());
    }

    #[test]
    fn test_process_keeps_length() {
        let mut effect = PitchShiftEffect::new(48000);
        let mut buffer = StereoBuffer::silence(256);
        effect.process(&mut buffer);
        assert_eq!(buffer.len(), 256);
    }
}
