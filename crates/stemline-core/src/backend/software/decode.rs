//! File decoding into engine-rate stereo frames
//!
//! Sources are decoded completely at stream creation ("pre-scan"), folded to
//! stereo and brought to the engine sample rate, so every later read is a
//! plain slice copy on the audio thread.

use std::fs::File;
use std::path::Path;

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::backend::{BackendError, BackendResult};
use crate::types::StereoSample;

/// Decode a file into stereo frames at `target_rate`
pub fn decode_file(path: &Path, target_rate: u32) -> BackendResult<Vec<StereoSample>> {
    let file = File::open(path).map_err(|e| BackendError::FileOpen {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| BackendError::Format(e.to_string()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| BackendError::Format("No audio track found".to_string()))?;

    let track_id = track.id;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| BackendError::Format("Unknown sample rate".to_string()))?;

    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(2);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| BackendError::Format(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                log::warn!("[BACKEND] Error reading packet from {:?}: {}", path, e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("[BACKEND] Error decoding packet from {:?}: {}", path, e);
                continue;
            }
        };

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            let duration = decoded.capacity() as u64;
            sample_buf = Some(SampleBuffer::new(duration, spec));
        }

        if let Some(ref mut buf) = sample_buf {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    let stereo = fold_to_stereo(&samples, channels);
    log::debug!(
        "[BACKEND] Decoded {:?}: {} frames, {} ch @ {} Hz",
        path,
        stereo.len(),
        channels,
        sample_rate
    );

    resample(stereo, sample_rate, target_rate)
}

/// Fold interleaved audio with any channel count to stereo
///
/// Mono is duplicated. For more than two channels, even channels go left and
/// odd channels go right, each side averaged.
pub fn fold_to_stereo(interleaved: &[f32], channels: usize) -> Vec<StereoSample> {
    match channels {
        0 => Vec::new(),
        1 => interleaved.iter().map(|&s| StereoSample::mono(s)).collect(),
        2 => interleaved
            .chunks_exact(2)
            .map(|c| StereoSample::new(c[0], c[1]))
            .collect(),
        n => {
            let left_count = n.div_ceil(2) as f32;
            let right_count = (n / 2) as f32;
            interleaved
                .chunks_exact(n)
                .map(|frame| {
                    let (mut l, mut r) = (0.0, 0.0);
                    for (i, &s) in frame.iter().enumerate() {
                        if i % 2 == 0 {
                            l += s;
                        } else {
                            r += s;
                        }
                    }
                    StereoSample::new(l / left_count, r / right_count)
                })
                .collect()
        }
    }
}

/// Frames fed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

fn resample_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::Unknown(format!("Resampling failed: {}", e))
}

/// Band-limited sample rate conversion with rubato's sinc resampler
///
/// The output is aligned with the input (the filter delay is trimmed) and
/// holds `round(len * to_rate / from_rate)` frames.
pub fn resample(frames: Vec<StereoSample>, from_rate: u32, to_rate: u32) -> BackendResult<Vec<StereoSample>> {
    if from_rate == to_rate || frames.is_empty() || from_rate == 0 {
        return Ok(frames);
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (frames.len() as f64 * ratio).round() as usize;

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.925,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 2).map_err(resample_error)?;
    let delay = resampler.output_delay();

    let (left, right): (Vec<f32>, Vec<f32>) = frames.iter().map(|s| (s.left, s.right)).unzip();
    drop(frames);

    let mut out_left = Vec::with_capacity(out_len + delay + RESAMPLE_CHUNK * 2);
    let mut out_right = Vec::with_capacity(out_len + delay + RESAMPLE_CHUNK * 2);
    let mut append = |block: Vec<Vec<f32>>| match block.as_slice() {
        [l, r] => {
            out_left.extend_from_slice(l);
            out_right.extend_from_slice(r);
            l.len()
        }
        _ => 0,
    };

    let mut pos = 0;
    let mut produced = 0;
    while left.len() - pos >= resampler.input_frames_next() {
        let next = resampler.input_frames_next();
        let chunk: [&[f32]; 2] = [&left[pos..pos + next], &right[pos..pos + next]];
        produced += append(resampler.process(&chunk[..], None).map_err(resample_error)?);
        pos += next;
    }
    if pos < left.len() {
        let chunk: [&[f32]; 2] = [&left[pos..], &right[pos..]];
        produced += append(resampler.process_partial(Some(&chunk[..]), None).map_err(resample_error)?);
    }

    // Flush the filter tail
    while produced < out_len + delay {
        let block = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(resample_error)?;
        let added = append(block);
        if added == 0 {
            break;
        }
        produced += added;
    }

    Ok(out_left
        .into_iter()
        .zip(out_right)
        .skip(delay)
        .take(out_len)
        .map(|(l, r)| StereoSample::new(l, r))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_wav(path: &Path, channels: u16, sample_rate: u32, samples: &[f32]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_decode_stereo_wav() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("drums.wav");
        let samples: Vec<f32> = (0..2000).map(|i| if i % 2 == 0 { 0.25 } else { -0.25 }).collect();
        write_wav(&path, 2, 48000, &samples);

        let frames = decode_file(&path, 48000).unwrap();
        assert_eq!(frames.len(), 1000);
        assert_eq!(frames[10], StereoSample::new(0.25, -0.25));
    }

    #[test]
    fn test_decode_mono_is_duplicated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vocals.wav");
        write_wav(&path, 1, 48000, &[0.5; 480]);

        let frames = decode_file(&path, 48000).unwrap();
        assert_eq!(frames.len(), 480);
        assert!(frames.iter().all(|f| *f == StereoSample::mono(0.5)));
    }

    #[test]
    fn test_decode_resamples_to_engine_rate() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bass.wav");
        write_wav(&path, 2, 24000, &vec![0.1; 2 * 2400]);

        let frames = decode_file(&path, 48000).unwrap();
        assert_eq!(frames.len(), 4800);
        // Interior frames keep the level once the filter has settled
        assert!(frames[1000..3800].iter().all(|f| (f.left - 0.1).abs() < 1e-2));
    }

    #[test]
    fn test_missing_file_is_file_open_error() {
        let err = decode_file(Path::new("/nonexistent/song.ogg"), 48000).unwrap_err();
        assert_eq!(err.code(), 2);
    }

    #[test]
    fn test_garbage_file_is_format_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notes.txt");
        std::fs::write(&path, b"definitely not audio").unwrap();

        let err = decode_file(&path, 48000).unwrap_err();
        assert!(matches!(err, BackendError::Format(_)));
    }

    #[test]
    fn test_fold_multichannel() {
        // 4 channels: L = avg(ch0, ch2), R = avg(ch1, ch3)
        let frames = fold_to_stereo(&[1.0, 0.0, 0.0, 1.0], 4);
        assert_eq!(frames, vec![StereoSample::new(0.5, 0.5)]);
    }

    #[test]
    fn test_resample_identity() {
        let frames = vec![StereoSample::mono(0.3); 10];
        assert_eq!(resample(frames.clone(), 48000, 48000).unwrap(), frames);
    }

    #[test]
    fn test_resample_keeps_alignment() {
        // A step at 0.5s should land at 0.5s after conversion
        let mut frames = vec![StereoSample::silence(); 22050];
        frames.extend(vec![StereoSample::mono(1.0); 22050]);

        let out = resample(frames, 44100, 48000).unwrap();
        assert_eq!(out.len(), 48000);
        assert!(out[23000].left.abs() < 0.05);
        assert!((out[25000].left - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_resample_short_input() {
        let out = resample(vec![StereoSample::mono(0.5); 100], 44100, 48000).unwrap();
        assert_eq!(out.len(), 109);
    }
}
