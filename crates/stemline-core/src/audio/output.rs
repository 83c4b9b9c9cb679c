//! CPAL output stream driving the software backend

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use super::error::{AudioError, AudioResult};
use crate::backend::software::BackendRenderer;
use crate::config::OutputConfig;
use crate::types::{StereoBuffer, MAX_BUFFER_SIZE};

/// Keeps the output stream alive; drop it to stop audio
pub struct OutputHandle {
    _stream: Stream,
    device_name: String,
    sample_rate: u32,
    buffer_size: u32,
}

impl OutputHandle {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Buffer size in frames as requested from the device
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Names of the output devices of the default host
pub fn output_device_names() -> AudioResult<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?;
    let names: Vec<String> = devices.filter_map(|d| d.name().ok()).collect();
    if names.is_empty() {
        return Err(AudioError::NoDevices);
    }
    Ok(names)
}

fn find_device(name: Option<&str>) -> AudioResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::NoDefaultDevice("No default output device".to_string())),
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::ConfigError(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
    }
}

/// Pick an f32 stereo configuration at the engine's sample rate
fn output_config(device: &cpal::Device, sample_rate: u32) -> AudioResult<cpal::SupportedStreamConfig> {
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .collect();

    if supported.is_empty() {
        return Err(AudioError::ConfigError(
            "No supported output configurations".to_string(),
        ));
    }

    let in_range = |c: &&cpal::SupportedStreamConfigRange| {
        sample_rate >= c.min_sample_rate().0 && sample_rate <= c.max_sample_rate().0
    };

    let best = supported
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| c.channels() >= 2)
        .find(in_range)
        .or_else(|| supported.iter().filter(|c| c.sample_format() == SampleFormat::F32).find(in_range));

    match best {
        Some(config) => Ok(config.clone().with_sample_rate(cpal::SampleRate(sample_rate))),
        None => {
            let device_max = supported
                .iter()
                .map(|c| c.max_sample_rate().0)
                .max()
                .unwrap_or(0);
            Err(AudioError::SampleRateMismatch {
                device: device_max,
                engine: sample_rate,
            })
        }
    }
}

/// Open the configured output device and move `renderer` into its callback
///
/// The device runs at the renderer's sample rate; stems are resampled to
/// that rate when decoded, so no resampling happens on the audio thread.
pub fn start_output(renderer: BackendRenderer, config: &OutputConfig) -> AudioResult<OutputHandle> {
    let device = find_device(config.device.as_deref())?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("[AUDIO] Using audio device: {}", device_name);

    let sample_rate = renderer.sample_rate();
    if config.sample_rate != sample_rate {
        log::warn!(
            "[AUDIO] Configured {}Hz differs from the engine rate, using {}Hz",
            config.sample_rate,
            sample_rate
        );
    }

    let supported = output_config(&device, sample_rate)?;
    let buffer_size = config.buffer_size.clamp(64, MAX_BUFFER_SIZE as u32);
    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: CpalBufferSize::Fixed(buffer_size),
    };

    log::info!(
        "[AUDIO] {} channels, {}Hz, {} frames (~{:.1}ms latency)",
        stream_config.channels,
        sample_rate,
        buffer_size,
        buffer_size as f32 / sample_rate as f32 * 1000.0
    );

    let stream = build_output_stream(&device, &stream_config, renderer)?;
    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    Ok(OutputHandle {
        _stream: stream,
        device_name,
        sample_rate,
        buffer_size,
    })
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    mut renderer: BackendRenderer,
) -> AudioResult<Stream> {
    let channels = config.channels as usize;
    // Allocated once, the callback only resizes within capacity
    let mut block = StereoBuffer::silence(MAX_BUFFER_SIZE);

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                for chunk in data.chunks_mut(MAX_BUFFER_SIZE * channels) {
                    let frames = chunk.len() / channels;
                    block.set_len_from_capacity(frames);
                    renderer.render(&mut block);

                    for (frame, sample) in chunk.chunks_mut(channels).zip(block.iter()) {
                        frame[0] = sample.left;
                        if channels > 1 {
                            frame[1] = sample.right;
                        }
                        for ch in frame.iter_mut().skip(2) {
                            *ch = 0.0;
                        }
                    }
                }
            },
            move |err| {
                log::error!("[AUDIO] Output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}
