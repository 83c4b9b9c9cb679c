//! Peaking EQ band (RBJ cookbook biquad)

use std::f32::consts::{LN_2, PI};

use crate::backend::{EffectKind, EffectParams, PeakEqParams};
use crate::types::StereoBuffer;

use super::{check_range, ParamError, StreamEffect};

/// Biquad filter state (direct form I, per channel)
#[derive(Debug, Clone, Default)]
struct BiquadState {
    x1_l: f32, x2_l: f32, y1_l: f32, y2_l: f32,
    x1_r: f32, x2_r: f32, y1_r: f32, y2_r: f32,
}

impl BiquadState {
    #[inline]
    fn process(&mut self, input_l: f32, input_r: f32, coeffs: &BiquadCoeffs) -> (f32, f32) {
        let out_l = coeffs.b0 * input_l + coeffs.b1 * self.x1_l + coeffs.b2 * self.x2_l
                  - coeffs.a1 * self.y1_l - coeffs.a2 * self.y2_l;
        self.x2_l = self.x1_l;
        self.x1_l = input_l;
        self.y2_l = self.y1_l;
        self.y1_l = out_l;

        let out_r = coeffs.b0 * input_r + coeffs.b1 * self.x1_r + coeffs.b2 * self.x2_r
                  - coeffs.a1 * self.y1_r - coeffs.a2 * self.y2_r;
        self.x2_r = self.x1_r;
        self.x1_r = input_r;
        self.y2_r = self.y1_r;
        self.y1_r = out_r;

        (out_l, out_r)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Normalized biquad coefficients (a0 = 1)
#[derive(Debug, Clone, PartialEq)]
struct BiquadCoeffs {
    b0: f32, b1: f32, b2: f32,
    a1: f32, a2: f32,
}

impl BiquadCoeffs {
    /// Peaking filter with the bandwidth given in octaves
    fn peaking(freq: f32, gain_db: f32, bandwidth_octaves: f32, sample_rate: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * freq / sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();
        let alpha = sin_w0 * (LN_2 / 2.0 * bandwidth_octaves * w0 / sin_w0).sinh();

        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_w0) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }

    fn passthrough() -> Self {
        Self { b0: 1.0, b1: 0.0, b2: 0.0, a1: 0.0, a2: 0.0 }
    }
}

/// Center must stay below Nyquist for the stream rate
pub(super) fn check_params(p: &PeakEqParams, sample_rate: u32) -> Result<(), ParamError> {
    let nyquist = sample_rate as f32 / 2.0;
    check_range("center_hz", p.center_hz, 1.0, nyquist - 1.0)?;
    check_range("bandwidth_octaves", p.bandwidth_octaves, 0.1, 10.0)?;
    check_range("gain_db", p.gain_db, -15.0, 15.0)
}

pub struct PeakEqEffect {
    sample_rate: u32,
    params: PeakEqParams,
    coeffs: BiquadCoeffs,
    state: BiquadState,
}

impl PeakEqEffect {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            params: PeakEqParams {
                center_hz: 1000.0,
                bandwidth_octaves: 1.0,
                gain_db: 0.0,
            },
            coeffs: BiquadCoeffs::passthrough(),
            state: BiquadState::default(),
        }
    }

    pub fn params(&self) -> &PeakEqParams {
        &self.params
    }
}

impl StreamEffect for PeakEqEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::PeakEq
    }

    fn set_params(&mut self, params: &EffectParams) -> Result<(), ParamError> {
        let EffectParams::PeakEq(p) = params else {
            return Err(ParamError::WrongKind {
                expected: EffectKind::PeakEq,
                got: params.kind(),
            });
        };
        check_params(p, self.sample_rate)?;

        self.params = *p;
        self.coeffs = if p.gain_db == 0.0 {
            BiquadCoeffs::passthrough()
        } else {
            BiquadCoeffs::peaking(p.center_hz, p.gain_db, p.bandwidth_octaves, self.sample_rate as f32)
        };
        Ok(())
    }

    fn process(&mut self, buffer: &mut StereoBuffer) {
        for sample in buffer.iter_mut() {
            let (l, r) = self.state.process(sample.left, sample.right, &self.coeffs);
            sample.left = l;
            sample.right = r;
        }
    }

    fn reset(&mut self) {
        self.state.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;

    fn sine(freq: f32, len: usize) -> StereoBuffer {
        StereoBuffer::from_vec(
            (0..len)
                .map(|i| StereoSample::mono((2.0 * PI * freq * i as f32 / 48000.0).sin()))
                .collect(),
        )
    }

    fn tail_peak(buffer: &StereoBuffer) -> f32 {
        buffer.as_slice()[buffer.len() / 2..]
            .iter()
            .map(|s| s.peak())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_zero_gain_is_passthrough() {
        let mut eq = PeakEqEffect::new(48000);
        let mut buffer = sine(440.0, 1024);
        let original = buffer.clone();
        eq.process(&mut buffer);
        assert_eq!(buffer.as_slice(), original.as_slice());
    }

    #[test]
    fn test_cut_at_center_frequency() {
        let mut eq = PeakEqEffect::new(48000);
        eq.set_params(&EffectParams::PeakEq(PeakEqParams {
            center_hz: 1000.0,
            bandwidth_octaves: 1.0,
            gain_db: -12.0,
        }))
        .unwrap();

        let mut buffer = sine(1000.0, 9600);
        eq.process(&mut buffer);

        // -12 dB ~= 0.25
        let peak = tail_peak(&buffer);
        assert!((peak - 0.251).abs() < 0.02, "peak {peak}");
    }

    #[test]
    fn test_far_frequency_unaffected() {
        let mut eq = PeakEqEffect::new(48000);
        eq.set_params(&EffectParams::PeakEq(PeakEqParams {
            center_hz: 8000.0,
            bandwidth_octaves: 1.0,
            gain_db: -12.0,
        }))
        .unwrap();

        let mut buffer = sine(100.0, 9600);
        eq.process(&mut buffer);
        assert!((tail_peak(&buffer) - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_center_above_nyquist_rejected() {
        let mut eq = PeakEqEffect::new(48000);
        let result = eq.set_params(&EffectParams::PeakEq(PeakEqParams {
            center_hz: 30000.0,
            bandwidth_octaves: 1.0,
            gain_db: -3.0,
        }));
        assert!(matches!(result, Err(ParamError::OutOfRange { name: "center_hz", .. })));
    }
}
