//! Freeverb stereo reverb
//!
//! Eight parallel comb filters per channel (one-pole damped feedback) feed
//! four series allpass filters for diffusion. Delay lengths are the classic
//! Freeverb tunings at 44.1kHz, scaled to the stream sample rate.

use crate::backend::{EffectKind, EffectParams, ReverbParams};
use crate::types::StereoBuffer;

use super::{check_range, ParamError, StreamEffect};

/// Comb filter delay line lengths (in samples at 44.1kHz)
const COMB_LENGTHS: [usize; 8] = [1557, 1617, 1491, 1422, 1277, 1356, 1188, 1116];

/// Allpass filter delay line lengths
const ALLPASS_LENGTHS: [usize; 4] = [225, 556, 441, 341];

/// Stereo spread offset for the right channel (in samples at 44.1kHz)
const STEREO_SPREAD: usize = 23;

const ALLPASS_FEEDBACK: f32 = 0.5;

/// Gain compensation for comb filter summing
const COMB_GAIN: f32 = 0.015 * 8.0 / COMB_LENGTHS.len() as f32;

struct CombFilter {
    buffer: Vec<f32>,
    pos: usize,
    filter_state: f32,
}

impl CombFilter {
    fn new(length: usize) -> Self {
        Self {
            buffer: vec![0.0; length.max(1)],
            pos: 0,
            filter_state: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32, feedback: f32, damp: f32) -> f32 {
        let output = self.buffer[self.pos];

        self.filter_state = output * (1.0 - damp) + self.filter_state * damp;

        self.buffer[self.pos] = input + self.filter_state * feedback;
        self.pos = (self.pos + 1) % self.buffer.len();

        output
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.filter_state = 0.0;
    }
}

struct AllpassFilter {
    buffer: Vec<f32>,
    pos: usize,
}

impl AllpassFilter {
    fn new(length: usize) -> Self {
        Self {
            buffer: vec![0.0; length.max(1)],
            pos: 0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let buffered = self.buffer[self.pos];
        let output = -input + buffered;
        self.buffer[self.pos] = input + buffered * ALLPASS_FEEDBACK;
        self.pos = (self.pos + 1) % self.buffer.len();
        output
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
    }
}

pub(super) fn check_params(p: &ReverbParams) -> Result<(), ParamError> {
    check_range("dry_mix", p.dry_mix, 0.0, 1.0)?;
    check_range("wet_mix", p.wet_mix, 0.0, 3.0)?;
    check_range("room_size", p.room_size, 0.0, 1.0)?;
    check_range("damping", p.damping, 0.0, 1.0)?;
    check_range("width", p.width, 0.0, 1.0)
}

pub struct ReverbEffect {
    params: ReverbParams,
    combs_l: Vec<CombFilter>,
    combs_r: Vec<CombFilter>,
    allpass_l: Vec<AllpassFilter>,
    allpass_r: Vec<AllpassFilter>,
}

impl ReverbEffect {
    pub fn new(sample_rate: u32) -> Self {
        let scale = sample_rate as f32 / 44100.0;
        let scaled = |len: usize| (len as f32 * scale) as usize;

        Self {
            params: ReverbParams {
                dry_mix: 1.0,
                wet_mix: 0.3,
                room_size: 0.5,
                damping: 0.5,
                width: 1.0,
            },
            combs_l: COMB_LENGTHS.iter().map(|&len| CombFilter::new(scaled(len))).collect(),
            combs_r: COMB_LENGTHS
                .iter()
                .map(|&len| CombFilter::new(scaled(len + STEREO_SPREAD)))
                .collect(),
            allpass_l: ALLPASS_LENGTHS.iter().map(|&len| AllpassFilter::new(scaled(len))).collect(),
            allpass_r: ALLPASS_LENGTHS
                .iter()
                .map(|&len| AllpassFilter::new(scaled(len + STEREO_SPREAD)))
                .collect(),
        }
    }

    pub fn params(&self) -> &ReverbParams {
        &self.params
    }

    /// Comb feedback derived from room size (0.7-0.98)
    fn feedback(&self) -> f32 {
        0.7 + self.params.room_size * 0.28
    }
}

impl StreamEffect for ReverbEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::Reverb
    }

    fn set_params(&mut self, params: &EffectParams) -> Result<(), ParamError> {
        let EffectParams::Reverb(p) = params else {
            return Err(ParamError::WrongKind {
                expected: EffectKind::Reverb,
                got: params.kind(),
            });
        };
        check_params(p)?;

        self.params = *p;
        Ok(())
    }

    fn process(&mut self, buffer: &mut StereoBuffer) {
        let feedback = self.feedback();
        let damp = self.params.damping;
        let width = self.params.width;
        let wet = self.params.wet_mix;
        let dry = self.params.dry_mix;

        let wet1 = wet * (width / 2.0 + 0.5);
        let wet2 = wet * ((1.0 - width) / 2.0);

        for sample in buffer.iter_mut() {
            let input = (sample.left + sample.right) * COMB_GAIN;

            let mut out_l = 0.0f32;
            let mut out_r = 0.0f32;
            for comb in &mut self.combs_l {
                out_l += comb.process(input, feedback, damp);
            }
            for comb in &mut self.combs_r {
                out_r += comb.process(input, feedback, damp);
            }

            for ap in &mut self.allpass_l {
                out_l = ap.process(out_l);
            }
            for ap in &mut self.allpass_r {
                out_r = ap.process(out_r);
            }

            let out_left = out_l * wet1 + out_r * wet2 + sample.left * dry;
            let out_right = out_r * wet1 + out_l * wet2 + sample.right * dry;

            sample.left = out_left;
            sample.right = out_right;
        }
    }

    fn reset(&mut self) {
        self.combs_l.iter_mut().for_each(CombFilter::reset);
        self.combs_r.iter_mut().for_each(CombFilter::reset);
        self.allpass_l.iter_mut().for_each(AllpassFilter::reset);
        self.allpass_r.iter_mut().for_each(AllpassFilter::reset);
    }
}
