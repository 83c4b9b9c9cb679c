//! Stem channel - one stem of a song on two synchronized paths
//!
//! A channel derives two split streams from one decode source and wraps each
//! in a tempo stage:
//!
//! ```text
//!                  ┌─ split ─ tempo ─ compressor ─ [pitch bend] ─────────────────── primary (user volume)
//! decode source ──┤
//!                  └─ split ─ tempo ─ compressor ─ [pitch bend] ─ [EQ ×3 ─ reverb] ─ reverb send (0.7 × volume or muted)
//! ```
//!
//! Transport (speed, seeks) is applied to both paths in the same call so they
//! never drift apart. Native handles are `Option`s: `None` is the released
//! state, and every release path checks it, so disposing twice (explicitly and
//! then on drop) frees nothing twice.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::backend::{
    BackendError, ChannelAttribute, CompressorParams, DecodeBackend, EffectKind, EffectParams,
    FxHandle, PeakEqParams, PitchShiftParams, ReverbParams, Route, StreamHandle,
};
use crate::config::{AudioManager, AudioOptions};
use crate::effect::{MAX_PITCH_RATIO, MIN_PITCH_RATIO};
use crate::timestretch::{MAX_SPEED, MIN_SPEED};
use crate::types::{SongStem, SAMPLE_RATE};

use super::dispatch::{DispatchHandle, EndCallback, EndOfStream, SubscriptionId};
use super::fade::{FadeOut, FadeOutcome, FadeTracker};

/// Duration of fade-in and fade-out ramps
pub const FADE_DURATION: Duration = Duration::from_millis(1000);

/// Ramp of the reverb send when reverb is switched on
pub const REVERB_SLIDE_IN: Duration = Duration::from_millis(500);

/// Ramp of the reverb send when reverb is switched off
pub const REVERB_SLIDE_OUT: Duration = Duration::from_millis(300);

/// Ramp of the reverb send following a volume change
pub const SEND_VOLUME_SLIDE: Duration = Duration::from_millis(1);

/// Reverb send level relative to the primary path
pub const REVERB_SEND_LEVEL: f64 = 0.7;

const COMPRESSOR_PRIORITY: i32 = 1;
const PITCH_SHIFT_PRIORITY: i32 = 0;
const EQ_PRIORITY: i32 = 0;
const REVERB_PRIORITY: i32 = -1;

/// Loudness normalization applied to both paths of every stem
pub const STEM_COMPRESSOR: CompressorParams = CompressorParams {
    gain_db: -3.0,
    threshold_db: -2.0,
    attack_ms: 10.0,
    release_ms: 100.0,
    ratio: 4.0,
};

pub const REVERB_EQ_LOW: PeakEqParams = PeakEqParams {
    center_hz: 100.0,
    bandwidth_octaves: 2.5,
    gain_db: -10.0,
};

pub const REVERB_EQ_MID: PeakEqParams = PeakEqParams {
    center_hz: 1000.0,
    bandwidth_octaves: 2.0,
    gain_db: -3.0,
};

pub const REVERB_EQ_HIGH: PeakEqParams = PeakEqParams {
    center_hz: 8000.0,
    bandwidth_octaves: 2.0,
    gain_db: -6.0,
};

pub const REVERB_ROOM: ReverbParams = ReverbParams {
    dry_mix: 0.3,
    wet_mix: 1.0,
    room_size: 0.9,
    damping: 0.7,
    width: 1.0,
};

/// Clamp a playback speed to the supported range and round it to 2 decimals
pub fn normalize_speed(speed: f32) -> f32 {
    let speed = (speed as f64).clamp(MIN_SPEED, MAX_SPEED);
    ((speed * 100.0).round() / 100.0) as f32
}

/// Relative tempo in percent for a normalized speed (1.05 -> 5.0)
pub fn tempo_percent(speed: f32) -> f32 {
    speed * 100.0 - 100.0
}

/// Pitch correction in semitones for chipmunk speedup
pub fn chipmunk_semitones(speed: f32) -> f32 {
    let shift = if speed > 1.0 {
        speed / 9.0 - 1.0 / 9.0
    } else if speed < 1.0 {
        speed / 3.0 - 1.0 / 3.0
    } else {
        0.0
    };
    shift.clamp(-60.0, 60.0)
}

/// Frequency ratio of the whammy pitch bend
///
/// Limited to the range the pitch-shift effect accepts, so a configured
/// range above an octave bottoms out at one octave down.
pub fn whammy_ratio(max_semitones: f32, percent: f32) -> f32 {
    let percent = percent.clamp(0.0, 1.0);
    2.0_f32
        .powf(-(max_semitones * percent) / 12.0)
        .clamp(MIN_PITCH_RATIO, MAX_PITCH_RATIO)
}

/// Errors returned by [`StemChannel::load`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Channel is disposed")]
    Disposed,

    #[error("Channel has no source")]
    NoSource,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ChannelError {
    /// Numeric load status (-1 for a channel without a usable source)
    pub fn status_code(&self) -> i32 {
        match self {
            ChannelError::Disposed | ChannelError::NoSource => -1,
            ChannelError::Backend(e) => e.code(),
        }
    }
}

/// Collaborators shared by every channel of a session
#[derive(Clone)]
pub struct ChannelContext {
    pub backend: Arc<dyn DecodeBackend>,
    pub manager: Arc<dyn AudioManager>,
    pub dispatch: DispatchHandle,
}

/// Effects of the reverb send, present while reverb is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverbSend {
    pub eq_low: FxHandle,
    pub eq_mid: FxHandle,
    pub eq_high: FxHandle,
    pub reverb: FxHandle,
}

/// Pitch-bend effects, present only if attached to both paths
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchBend {
    pub primary: FxHandle,
    pub reverb: FxHandle,
    pub params: PitchShiftParams,
}

pub struct StemChannel {
    stem: SongStem,
    path: Option<PathBuf>,
    backend: Arc<dyn DecodeBackend>,
    manager: Arc<dyn AudioManager>,
    dispatch: DispatchHandle,

    /// User volume multiplier
    volume: f64,
    /// Base volume the last written effective volume was derived from
    last_stem_volume: f64,
    length_seconds: f64,
    sample_rate: f64,
    is_mixed: bool,
    disposed: bool,

    source: Option<StreamHandle>,
    owns_source: bool,
    source_is_split: bool,
    stream: Option<StreamHandle>,
    reverb_stream: Option<StreamHandle>,

    reverb: Option<ReverbSend>,
    pitch_bend: Option<PitchBend>,

    end: EndOfStream,
    fade: FadeTracker,
}

impl StemChannel {
    /// Channel that opens and owns its own decode source
    pub fn new(context: &ChannelContext, path: impl Into<PathBuf>, stem: SongStem) -> Self {
        let mut channel = Self::unloaded(context, stem);
        channel.path = Some(path.into());
        channel
    }

    /// Channel over a decode source owned by the caller
    ///
    /// `is_split` marks a source shared with sibling channels; seeks then
    /// reset the source's splits so all siblings read from the same place.
    pub fn from_source(context: &ChannelContext, stem: SongStem, source: StreamHandle, is_split: bool) -> Self {
        let mut channel = Self::unloaded(context, stem);
        channel.source = Some(source);
        channel.source_is_split = is_split;
        channel
    }

    fn unloaded(context: &ChannelContext, stem: SongStem) -> Self {
        Self {
            stem,
            path: None,
            backend: context.backend.clone(),
            manager: context.manager.clone(),
            dispatch: context.dispatch.clone(),
            volume: 1.0,
            last_stem_volume: context.manager.volume_setting(stem),
            length_seconds: 0.0,
            sample_rate: SAMPLE_RATE as f64,
            is_mixed: false,
            disposed: false,
            source: None,
            owns_source: false,
            source_is_split: false,
            stream: None,
            reverb_stream: None,
            reverb: None,
            pitch_bend: None,
            end: EndOfStream::new(),
            fade: FadeTracker::default(),
        }
    }

    // --- accessors ---

    pub fn stem(&self) -> SongStem {
        self.stem
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn length_seconds(&self) -> f64 {
        self.length_seconds
    }

    pub fn is_loaded(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn is_mixed(&self) -> bool {
        self.is_mixed
    }

    /// Mark the channel as plugged into a parent mixer
    ///
    /// Seeks and end syncs then go through the mixer.
    pub fn set_mixed(&mut self, mixed: bool) {
        self.is_mixed = mixed;
    }

    pub fn stream_handle(&self) -> Option<StreamHandle> {
        self.stream
    }

    pub fn reverb_stream_handle(&self) -> Option<StreamHandle> {
        self.reverb_stream
    }

    pub fn source_handle(&self) -> Option<StreamHandle> {
        self.source
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_reverb_enabled(&self) -> bool {
        self.reverb.is_some()
    }

    pub fn reverb_send(&self) -> Option<ReverbSend> {
        self.reverb
    }

    pub fn pitch_bend(&self) -> Option<PitchBend> {
        self.pitch_bend
    }

    fn route(&self) -> Route {
        if self.is_mixed {
            Route::Mixer
        } else {
            Route::Standalone
        }
    }

    /// Both paths, if loaded
    fn paths(&self) -> Option<(StreamHandle, StreamHandle)> {
        self.stream.zip(self.reverb_stream)
    }

    // --- loading ---

    /// Acquire native resources and prepare both paths for `speed`
    ///
    /// Loading a loaded channel succeeds without doing anything.
    pub fn load(&mut self, speed: f32) -> Result<(), ChannelError> {
        if self.disposed {
            return Err(ChannelError::Disposed);
        }
        if self.stream.is_some() {
            return Ok(());
        }

        let source = match self.source {
            Some(source) => source,
            None => {
                let path = self
                    .path
                    .as_deref()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or(ChannelError::NoSource)?;
                let source = self.backend.create_stream(path)?;
                self.source = Some(source);
                self.owns_source = true;
                source
            }
        };

        let (stream, reverb_stream) = match self.create_paths(source) {
            Ok(paths) => paths,
            Err(e) => {
                if self.owns_source {
                    self.free_stream(source, "source");
                    self.source = None;
                    self.owns_source = false;
                }
                return Err(e.into());
            }
        };
        self.stream = Some(stream);
        self.reverb_stream = Some(reverb_stream);

        match self.backend.get_attribute(stream, ChannelAttribute::Frequency) {
            Ok(rate) if rate > 0.0 => self.sample_rate = rate as f64,
            Ok(_) => {}
            Err(e) => log::warn!("[STEM] {}: failed to read sample rate: {}", self.stem, e),
        }

        for (path, label) in [(stream, "primary"), (reverb_stream, "reverb")] {
            self.attach_compressor(path, label);
        }

        let options = self.manager.options();
        let stem_volume = self.manager.volume_setting(self.stem);
        self.last_stem_volume = stem_volume;
        self.write_attribute(stream, ChannelAttribute::Volume, (stem_volume * self.volume) as f32);
        self.write_attribute(reverb_stream, ChannelAttribute::Volume, 0.0);

        if options.is_pitch_bend_stem(self.stem) {
            self.pitch_bend = self.attach_pitch_bend(stream, reverb_stream, &options);
            // Seek so the pitch-shift latency is compensated from the start
            self.set_position(0.0, true);
        }

        if (speed - 1.0).abs() > f32::EPSILON {
            self.set_speed(speed);

            if options.chipmunk_speedup {
                let shift = chipmunk_semitones(speed);
                self.write_attribute(stream, ChannelAttribute::Pitch, shift);
                self.write_attribute(reverb_stream, ChannelAttribute::Pitch, shift);
            }
        }

        self.length_seconds = self.length_in_seconds();

        if self.end.subscriber_count() > 0 {
            self.register_end_sync();
        }

        log::info!(
            "[STEM] Loaded {} ({:.2}s, whammy: {}, speed: {})",
            self.stem,
            self.length_seconds,
            self.pitch_bend.is_some(),
            speed
        );
        Ok(())
    }

    /// Create both split + tempo paths, releasing partial work on failure
    fn create_paths(&self, source: StreamHandle) -> Result<(StreamHandle, StreamHandle), BackendError> {
        let main_split = self.backend.create_split_stream(source)?;
        let reverb_split = match self.backend.create_split_stream(source) {
            Ok(split) => split,
            Err(e) => {
                self.free_stream(main_split, "primary split");
                return Err(e);
            }
        };

        let stream = match self.backend.create_tempo_stream(main_split) {
            Ok(stream) => stream,
            Err(e) => {
                self.free_stream(main_split, "primary split");
                self.free_stream(reverb_split, "reverb split");
                return Err(e);
            }
        };

        match self.backend.create_tempo_stream(reverb_split) {
            Ok(reverb_stream) => Ok((stream, reverb_stream)),
            Err(e) => {
                self.free_stream(stream, "primary");
                self.free_stream(reverb_split, "reverb split");
                Err(e)
            }
        }
    }

    fn attach_compressor(&self, stream: StreamHandle, label: &str) {
        let result = self
            .backend
            .set_fx(stream, EffectKind::Compressor, COMPRESSOR_PRIORITY)
            .and_then(|fx| {
                self.backend
                    .set_fx_parameters(fx, &EffectParams::Compressor(STEM_COMPRESSOR))
            });
        if let Err(e) = result {
            log::warn!("[STEM] {}: failed to add compressor ({}): {}", self.stem, label, e);
        }
    }

    fn attach_pitch_bend(
        &self,
        stream: StreamHandle,
        reverb_stream: StreamHandle,
        options: &AudioOptions,
    ) -> Option<PitchBend> {
        let params = PitchShiftParams {
            pitch_shift: 1.0,
            semitones: 0.0,
            fft_size: options.whammy_fft_size,
            oversample_factor: options.whammy_oversample_factor,
        };

        let primary = self.attach_pitch_shift(stream, &params, "primary");
        let reverb = self.attach_pitch_shift(reverb_stream, &params, "reverb");

        match (primary, reverb) {
            (Some(primary), Some(reverb)) => Some(PitchBend {
                primary,
                reverb,
                params,
            }),
            (primary, reverb) => {
                if let Some(fx) = primary {
                    self.remove_fx(stream, fx);
                }
                if let Some(fx) = reverb {
                    self.remove_fx(reverb_stream, fx);
                }
                log::warn!("[STEM] {}: whammy disabled for this channel", self.stem);
                None
            }
        }
    }

    fn attach_pitch_shift(&self, stream: StreamHandle, params: &PitchShiftParams, label: &str) -> Option<FxHandle> {
        let fx = match self
            .backend
            .set_fx(stream, EffectKind::PitchShift, PITCH_SHIFT_PRIORITY)
        {
            Ok(fx) => fx,
            Err(e) => {
                log::warn!("[STEM] {}: failed to add pitch shift ({}): {}", self.stem, label, e);
                return None;
            }
        };

        if let Err(e) = self
            .backend
            .set_fx_parameters(fx, &EffectParams::PitchShift(*params))
        {
            log::warn!(
                "[STEM] {}: failed to set pitch shift params ({}): {}",
                self.stem,
                label,
                e
            );
            self.remove_fx(stream, fx);
            return None;
        }
        Some(fx)
    }

    // --- volume ---

    /// Set the primary volume to 0 and ramp it to `target`
    pub fn fade_in(&mut self, target: f32) {
        let Some(stream) = self.stream else {
            return;
        };
        self.fade.resolve(FadeOutcome::Superseded);
        self.write_attribute(stream, ChannelAttribute::Volume, 0.0);
        self.slide_attribute(stream, ChannelAttribute::Volume, target, FADE_DURATION);
    }

    /// Ramp the primary volume to 0
    ///
    /// The returned future resolves once a control tick ([`StemChannel::poll_fade`])
    /// measures the volume within tolerance of zero.
    pub fn fade_out(&mut self) -> FadeOut {
        let Some(stream) = self.stream else {
            return FadeOut::completed();
        };
        self.slide_attribute(stream, ChannelAttribute::Volume, 0.0, FADE_DURATION);
        self.fade.start(Instant::now(), FADE_DURATION)
    }

    /// Check a running fade-out; call once per control tick
    ///
    /// Returns true when a fade-out was resolved by this call.
    pub fn poll_fade(&mut self) -> bool {
        self.poll_fade_at(Instant::now())
    }

    pub fn poll_fade_at(&mut self, now: Instant) -> bool {
        if !self.fade.due(now) {
            return false;
        }
        let Some(stream) = self.stream else {
            self.fade.resolve(FadeOutcome::Superseded);
            return true;
        };
        match self.backend.get_attribute(stream, ChannelAttribute::Volume) {
            Ok(volume) => self.fade.check(volume),
            Err(e) => {
                log::warn!("[STEM] {}: failed to read volume: {}", self.stem, e);
                self.fade.resolve(FadeOutcome::Superseded);
                true
            }
        }
    }

    pub fn is_fading_out(&self) -> bool {
        self.fade.is_pending()
    }

    /// Set the user volume multiplier
    ///
    /// Nothing is written when the effective volume (base × user) is unchanged.
    pub fn set_volume(&mut self, volume: f64) {
        let Some((stream, reverb_stream)) = self.paths() else {
            return;
        };

        let stem_volume = self.manager.volume_setting(self.stem);
        let old_volume = self.last_stem_volume * self.volume;
        let new_volume = stem_volume * volume;
        if (old_volume - new_volume).abs() < f64::EPSILON {
            return;
        }

        self.volume = volume;
        self.last_stem_volume = stem_volume;
        self.fade.resolve(FadeOutcome::Superseded);

        self.write_attribute(stream, ChannelAttribute::Volume, new_volume as f32);

        let send = if self.reverb.is_some() {
            new_volume * REVERB_SEND_LEVEL
        } else {
            0.0
        };
        self.slide_attribute(reverb_stream, ChannelAttribute::Volume, send as f32, SEND_VOLUME_SLIDE);
    }

    /// Re-derive the effective volume after the base volume setting changed
    pub fn refresh_volume(&mut self) {
        self.set_volume(self.volume);
    }

    // --- reverb ---

    /// Switch the reverb send on or off
    ///
    /// Switching to the current state does nothing.
    pub fn set_reverb(&mut self, enabled: bool) {
        let Some(reverb_stream) = self.reverb_stream else {
            return;
        };

        if enabled {
            if self.reverb.is_some() {
                return;
            }
            let Some(send) = self.attach_reverb_send(reverb_stream) else {
                return;
            };
            self.reverb = Some(send);

            let stem_volume = self.manager.volume_setting(self.stem);
            let send_volume = stem_volume * self.volume * REVERB_SEND_LEVEL;
            self.slide_attribute(reverb_stream, ChannelAttribute::Volume, send_volume as f32, REVERB_SLIDE_IN);
        } else {
            let Some(send) = self.reverb.take() else {
                return;
            };
            for fx in [send.eq_low, send.eq_mid, send.eq_high, send.reverb] {
                self.remove_fx(reverb_stream, fx);
            }
            self.slide_attribute(reverb_stream, ChannelAttribute::Volume, 0.0, REVERB_SLIDE_OUT);
        }
    }

    fn attach_reverb_send(&self, reverb_stream: StreamHandle) -> Option<ReverbSend> {
        let chain = [
            (EffectKind::PeakEq, EQ_PRIORITY, EffectParams::PeakEq(REVERB_EQ_LOW)),
            (EffectKind::PeakEq, EQ_PRIORITY, EffectParams::PeakEq(REVERB_EQ_MID)),
            (EffectKind::PeakEq, EQ_PRIORITY, EffectParams::PeakEq(REVERB_EQ_HIGH)),
            (EffectKind::Reverb, REVERB_PRIORITY, EffectParams::Reverb(REVERB_ROOM)),
        ];

        let mut handles: Vec<FxHandle> = Vec::with_capacity(chain.len());
        for (kind, priority, params) in chain {
            let result = self
                .backend
                .set_fx(reverb_stream, kind, priority)
                .and_then(|fx| {
                    handles.push(fx);
                    self.backend.set_fx_parameters(fx, &params)
                });
            if let Err(e) = result {
                log::error!("[STEM] {}: failed to add {:?} to reverb send: {}", self.stem, kind, e);
                for fx in handles {
                    self.remove_fx(reverb_stream, fx);
                }
                return None;
            }
        }

        match handles[..] {
            [eq_low, eq_mid, eq_high, reverb] => Some(ReverbSend {
                eq_low,
                eq_mid,
                eq_high,
                reverb,
            }),
            _ => None,
        }
    }

    // --- transport ---

    /// Set the playback speed of both paths
    pub fn set_speed(&mut self, speed: f32) {
        let relative = tempo_percent(normalize_speed(speed));
        for stream in [self.stream, self.reverb_stream].into_iter().flatten() {
            self.write_attribute(stream, ChannelAttribute::Tempo, relative);
        }
    }

    /// Bend the pitch down by `percent` of the configured whammy range
    pub fn set_whammy_pitch(&mut self, percent: f32) {
        let max_semitones = self.manager.options().whammy_pitch_shift_semitones;
        let Some(bend) = self.pitch_bend.as_mut() else {
            return;
        };

        bend.params.pitch_shift = whammy_ratio(max_semitones, percent);
        let params = EffectParams::PitchShift(bend.params);

        for (fx, label) in [(bend.primary, "primary"), (bend.reverb, "reverb")] {
            if let Err(e) = self.backend.set_fx_parameters(fx, &params) {
                log::warn!("[STEM] {}: failed to set whammy params ({}): {}", self.stem, label, e);
            }
        }
    }

    /// Latency compensated in reported and requested positions, in seconds
    pub fn desync_offset(&self) -> f64 {
        let mut desync = self.manager.options().playback_buffer_desync;
        if let Some(bend) = &self.pitch_bend {
            desync += bend.params.fft_size as f64 / self.sample_rate;
        }
        desync
    }

    /// Playback position in seconds
    pub fn position(&self, compensate: bool) -> f64 {
        let Some(stream) = self.stream else {
            return 0.0;
        };
        let frames = match self.backend.position(stream) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("[STEM] {}: failed to read position: {}", self.stem, e);
                return 0.0;
            }
        };

        let position = frames as f64 / self.sample_rate;
        if compensate {
            position - self.desync_offset()
        } else {
            position
        }
    }

    /// Seek both paths to `position` seconds
    pub fn set_position(&mut self, position: f64, compensate: bool) {
        let Some((stream, reverb_stream)) = self.paths() else {
            return;
        };

        let position = if compensate {
            position + self.desync_offset()
        } else {
            position
        };
        let frame = (position.max(0.0) * self.sample_rate).round() as u64;
        let route = self.route();

        for (path, label) in [(stream, "primary"), (reverb_stream, "reverb")] {
            if let Err(e) = self.backend.set_position(path, frame, route) {
                log::warn!("[STEM] {}: failed to seek {} path: {}", self.stem, label, e);
            }
        }

        if self.source_is_split {
            if let Some(source) = self.source {
                if let Err(e) = self.backend.split_stream_reset(source) {
                    log::error!("[STEM] {}: failed to reset stream: {}", self.stem, e);
                }
            }
        }
    }

    /// Length of the primary path in seconds
    pub fn length_in_seconds(&self) -> f64 {
        let Some(stream) = self.stream else {
            return 0.0;
        };
        match self.backend.length(stream) {
            Ok(frames) => frames as f64 / self.sample_rate,
            Err(e) => {
                log::warn!("[STEM] {}: failed to read length: {}", self.stem, e);
                0.0
            }
        }
    }

    // --- end of stream ---

    /// Subscribe to the end of the primary path
    ///
    /// The callback runs on the control thread when the dispatcher's
    /// pending jobs are run, never on the audio thread.
    pub fn subscribe_end(&mut self, callback: EndCallback) -> SubscriptionId {
        let id = self.end.subscribe(callback);
        if !self.end.is_registered() {
            self.register_end_sync();
        }
        id
    }

    pub fn unsubscribe_end(&mut self, id: SubscriptionId) -> bool {
        self.end.unsubscribe(id)
    }

    fn register_end_sync(&mut self) {
        let Some(stream) = self.stream else {
            return;
        };
        let callback = self.end.sync_callback(self.dispatch.clone());
        match self.backend.set_end_sync(stream, self.route(), callback) {
            Ok(_) => self.end.mark_registered(),
            Err(e) => log::warn!("[STEM] {}: failed to register end sync: {}", self.stem, e),
        }
    }

    // --- teardown ---

    /// Release every native handle and drop subscribers
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.release_native();
        self.end.clear();
        self.fade.resolve(FadeOutcome::Superseded);
        log::debug!("[STEM] Disposed {}", self.stem);
    }

    /// Free primary, reverb, then the owned source
    fn release_native(&mut self) {
        if self.disposed {
            return;
        }
        if let Some(stream) = self.stream.take() {
            self.free_stream(stream, "primary");
        }
        if let Some(stream) = self.reverb_stream.take() {
            self.free_stream(stream, "reverb");
        }
        if let Some(source) = self.source.take() {
            if self.owns_source {
                self.free_stream(source, "source");
            }
        }
        self.reverb = None;
        self.pitch_bend = None;
        self.disposed = true;
    }

    // --- backend helpers (failures are logged, never propagated) ---

    fn free_stream(&self, stream: StreamHandle, label: &str) {
        if let Err(e) = self.backend.stream_free(stream) {
            log::warn!("[STEM] {}: failed to free {} stream: {}", self.stem, label, e);
        }
    }

    fn remove_fx(&self, stream: StreamHandle, fx: FxHandle) {
        if let Err(e) = self.backend.remove_fx(stream, fx) {
            log::warn!("[STEM] {}: failed to remove {}: {}", self.stem, fx, e);
        }
    }

    fn write_attribute(&self, stream: StreamHandle, attribute: ChannelAttribute, value: f32) {
        if let Err(e) = self.backend.set_attribute(stream, attribute, value) {
            log::warn!("[STEM] {}: failed to set {:?}: {}", self.stem, attribute, e);
        }
    }

    fn slide_attribute(&self, stream: StreamHandle, attribute: ChannelAttribute, value: f32, duration: Duration) {
        if let Err(e) = self.backend.slide_attribute(stream, attribute, value, duration) {
            log::warn!("[STEM] {}: failed to slide {:?}: {}", self.stem, attribute, e);
        }
    }
}

impl Drop for StemChannel {
    fn drop(&mut self) {
        self.release_native();
    }
}
