//! Feed-forward compressor
//!
//! Peak detection in the dB domain with separate attack/release smoothing of
//! the gain reduction, followed by makeup gain. Applied to both paths of every
//! stem so stems sit at a similar loudness.

use crate::backend::{CompressorParams, EffectKind, EffectParams};
use crate::types::StereoBuffer;

use super::{check_range, ParamError, StreamEffect};

/// Floor used when converting silence to dB
const MIN_LEVEL: f32 = 1e-9;

pub(super) fn check_params(p: &CompressorParams) -> Result<(), ParamError> {
    check_range("gain_db", p.gain_db, -60.0, 60.0)?;
    check_range("threshold_db", p.threshold_db, -60.0, 0.0)?;
    check_range("attack_ms", p.attack_ms, 0.01, 1000.0)?;
    check_range("release_ms", p.release_ms, 0.01, 5000.0)?;
    check_range("ratio", p.ratio, 1.0, 100.0)
}

pub struct CompressorEffect {
    sample_rate: u32,
    params: CompressorParams,
    /// Attack smoothing coefficient
    attack_coeff: f32,
    /// Release smoothing coefficient
    release_coeff: f32,
    /// Makeup gain (linear)
    makeup: f32,
    /// Smoothed gain reduction in dB (>= 0)
    envelope_db: f32,
}

impl CompressorEffect {
    pub fn new(sample_rate: u32) -> Self {
        let params = CompressorParams {
            gain_db: 0.0,
            threshold_db: -15.0,
            attack_ms: 1.0,
            release_ms: 100.0,
            ratio: 3.0,
        };
        let mut effect = Self {
            sample_rate,
            params,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            makeup: 1.0,
            envelope_db: 0.0,
        };
        effect.update_coefficients();
        effect
    }

    /// Current parameters
    pub fn params(&self) -> &CompressorParams {
        &self.params
    }

    fn update_coefficients(&mut self) {
        let fs = self.sample_rate as f32;
        // coeff = exp(-1 / (tau * fs))
        self.attack_coeff = (-1.0 / (self.params.attack_ms * 0.001 * fs)).exp();
        self.release_coeff = (-1.0 / (self.params.release_ms * 0.001 * fs)).exp();
        self.makeup = 10.0_f32.powf(self.params.gain_db / 20.0);
    }

    /// Static gain reduction in dB for an input level
    #[inline]
    fn gain_reduction_db(&self, level_db: f32) -> f32 {
        let over = level_db - self.params.threshold_db;
        if over > 0.0 {
            over * (1.0 - 1.0 / self.params.ratio)
        } else {
            0.0
        }
    }
}

impl StreamEffect for CompressorEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::Compressor
    }

    fn set_params(&mut self, params: &EffectParams) -> Result<(), ParamError> {
        let EffectParams::Compressor(p) = params else {
            return Err(ParamError::WrongKind {
                expected: EffectKind::Compressor,
                got: params.kind(),
            });
        };
        check_params(p)?;

        self.params = *p;
        self.update_coefficients();
        Ok(())
    }

    fn process(&mut self, buffer: &mut StereoBuffer) {
        for sample in buffer.iter_mut() {
            let level_db = 20.0 * sample.peak().max(MIN_LEVEL).log10();
            let target = self.gain_reduction_db(level_db);

            let coeff = if target > self.envelope_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope_db = coeff * self.envelope_db + (1.0 - coeff) * target;

            let gain = self.makeup * 10.0_f32.powf(-self.envelope_db / 20.0);
            *sample *= gain;
        }
    }

    fn reset(&mut self) {
        self.envelope_db = 0.0;
    }
}
