//! Stem mixer - the set of channels playing one song
//!
//! Transport actions are broadcast so every stem stays tempo- and
//! position-locked. The mixer never disposes channels: removing a channel
//! only forgets it, and the caller decides when to dispose.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::types::SongStem;

use super::channel::{normalize_speed, ChannelError, StemChannel};
use super::dispatch::{EndCallback, SubscriptionId};
use super::fade::FadeOut;

/// Shared handle to a channel; identity is the allocation, not the stem
pub type ChannelRef = Arc<Mutex<StemChannel>>;

/// Wrap a channel for use in a [`StemMixer`]
pub fn channel_ref(channel: StemChannel) -> ChannelRef {
    Arc::new(Mutex::new(channel))
}

fn lock(channel: &ChannelRef) -> MutexGuard<'_, StemChannel> {
    channel.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(channel: &ChannelRef) -> usize {
    Arc::as_ptr(channel) as *const () as usize
}

/// Song-wide completion: fires once every loaded channel has ended
#[derive(Default)]
struct SongEnd {
    ended: HashSet<usize>,
    /// Loaded channels; a stem that failed to load never ends
    expected: usize,
    fired: bool,
    subscribers: Vec<EndCallback>,
}

impl SongEnd {
    /// Record one channel's end; returns the subscribers to run if the song ended
    fn channel_ended(&mut self, key: usize) -> Vec<EndCallback> {
        self.ended.insert(key);
        if self.fired || self.expected == 0 || self.ended.len() < self.expected {
            return Vec::new();
        }
        self.fired = true;
        self.subscribers.clone()
    }

    fn is_finished(&self) -> bool {
        self.expected > 0 && self.ended.len() >= self.expected
    }

    fn rearm(&mut self) {
        self.ended.clear();
        self.fired = false;
    }
}

struct Entry {
    channel: ChannelRef,
    subscription: SubscriptionId,
}

pub struct StemMixer {
    entries: Vec<Entry>,
    speed: f32,
    song_end: Arc<Mutex<SongEnd>>,
}

impl Default for StemMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl StemMixer {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            speed: 1.0,
            song_end: Arc::new(Mutex::new(SongEnd::default())),
        }
    }

    fn song_end(&self) -> MutexGuard<'_, SongEnd> {
        self.song_end.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recount the channels the song end waits for
    fn recount(&self) {
        let loaded = self.channels().filter(|channel| lock(channel).is_loaded()).count();
        self.song_end().expected = loaded;
    }

    /// Add a channel; a channel already present is ignored
    pub fn add(&mut self, channel: ChannelRef) -> bool {
        if self.contains(&channel) {
            return false;
        }

        let channel_key = key(&channel);
        let song_end = self.song_end.clone();
        let subscription = lock(&channel).subscribe_end(Arc::new(move || {
            let subscribers = song_end
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .channel_ended(channel_key);
            for subscriber in subscribers {
                subscriber();
            }
        }));

        self.entries.push(Entry {
            channel,
            subscription,
        });
        self.recount();
        true
    }

    /// Forget a channel without disposing it
    pub fn remove(&mut self, channel: &ChannelRef) -> bool {
        let Some(index) = self.entries.iter().position(|e| Arc::ptr_eq(&e.channel, channel)) else {
            return false;
        };
        let entry = self.entries.remove(index);
        lock(&entry.channel).unsubscribe_end(entry.subscription);

        self.song_end().ended.remove(&key(&entry.channel));
        self.recount();
        true
    }

    pub fn contains(&self, channel: &ChannelRef) -> bool {
        self.entries.iter().any(|e| Arc::ptr_eq(&e.channel, channel))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Channels in insertion order
    pub fn channels(&self) -> impl Iterator<Item = &ChannelRef> {
        self.entries.iter().map(|e| &e.channel)
    }

    /// Speed applied to every channel
    pub fn speed(&self) -> f32 {
        self.speed
    }

    /// Load every channel at `speed`
    ///
    /// A stem that fails to load is left out of playback; its error is
    /// returned so the caller can decide what to do.
    pub fn load_all(&mut self, speed: f32) -> Vec<(SongStem, ChannelError)> {
        self.speed = normalize_speed(speed);
        let mut failures = Vec::new();
        for channel in self.channels() {
            let mut channel = lock(channel);
            if let Err(e) = channel.load(self.speed) {
                log::error!("[MIXER] Failed to load {} (status {}): {}", channel.stem(), e.status_code(), e);
                failures.push((channel.stem(), e));
            }
        }
        self.recount();
        failures
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.speed = normalize_speed(speed);
        for channel in self.channels() {
            lock(channel).set_speed(self.speed);
        }
        log::debug!("[MIXER] Speed {}", self.speed);
    }

    /// Seek every channel, compensating processing latency
    pub fn set_position(&mut self, seconds: f64) {
        for channel in self.channels() {
            lock(channel).set_position(seconds, true);
        }
        self.recount();
        self.song_end().rearm();
    }

    /// Song position, taken from the first channel
    pub fn position(&self) -> f64 {
        self.channels()
            .next()
            .map_or(0.0, |channel| lock(channel).position(true))
    }

    /// Length of the longest channel in seconds
    pub fn length_seconds(&self) -> f64 {
        self.channels()
            .map(|channel| lock(channel).length_seconds())
            .fold(0.0, f64::max)
    }

    /// Switch the reverb send of every channel playing `stem`
    pub fn set_reverb(&mut self, stem: SongStem, enabled: bool) {
        for channel in self.channels() {
            let mut channel = lock(channel);
            if channel.stem() == stem {
                channel.set_reverb(enabled);
            }
        }
    }

    /// Bend the pitch of every channel playing `stem`
    pub fn set_whammy_pitch(&mut self, stem: SongStem, percent: f32) {
        for channel in self.channels() {
            let mut channel = lock(channel);
            if channel.stem() == stem {
                channel.set_whammy_pitch(percent);
            }
        }
    }

    /// Re-derive effective volumes after base volume settings changed
    pub fn refresh_volumes(&mut self) {
        for channel in self.channels() {
            lock(channel).refresh_volume();
        }
    }

    pub fn fade_out_all(&mut self) -> Vec<FadeOut> {
        self.channels().map(|channel| lock(channel).fade_out()).collect()
    }

    /// Control tick: poll running fade-outs; returns how many resolved
    pub fn tick(&mut self) -> usize {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> usize {
        self.channels()
            .filter(|channel| lock(channel).poll_fade_at(now))
            .count()
    }

    /// Run `callback` on the control thread once every channel has ended
    pub fn subscribe_song_end(&mut self, callback: EndCallback) {
        self.song_end().subscribers.push(callback);
    }

    pub fn is_finished(&self) -> bool {
        self.song_end().is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::backend::testing::{Call, RecordingBackend};
    use crate::backend::{ChannelAttribute, DecodeBackend, EffectKind, StreamHandle};
    use crate::config::{EngineConfig, SettingsManager};
    use crate::engine::channel::ChannelContext;
    use crate::engine::channel::FADE_DURATION;
    use crate::engine::dispatch::MainThreadDispatcher;
    use crate::engine::fade::FadeOutcome;
    use crate::types::{StereoBuffer, StereoSample};
    use std::time::Instant;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        backend: Arc<RecordingBackend>,
        dispatcher: MainThreadDispatcher,
        context: ChannelContext,
    }

    fn harness() -> Harness {
        let backend = Arc::new(RecordingBackend::new());
        let dispatcher = MainThreadDispatcher::new();
        let context = ChannelContext {
            backend: backend.clone(),
            manager: Arc::new(SettingsManager::new(EngineConfig::default())),
            dispatch: dispatcher.handle(),
        };
        Harness {
            backend,
            dispatcher,
            context,
        }
    }

    fn loaded(h: &Harness, stem: SongStem) -> ChannelRef {
        let mut channel = StemChannel::new(&h.context, format!("{}.ogg", stem), stem);
        channel.load(1.0).unwrap();
        channel_ref(channel)
    }

    fn stream_of(channel: &ChannelRef) -> StreamHandle {
        lock(channel).stream_handle().unwrap()
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let h = harness();
        let mut mixer = StemMixer::new();
        let drums = loaded(&h, SongStem::Drums);

        assert!(mixer.add(drums.clone()));
        assert!(!mixer.add(drums.clone()));
        assert_eq!(mixer.len(), 1);

        // Same stem, different channel
        assert!(mixer.add(loaded(&h, SongStem::Drums)));
        assert_eq!(mixer.len(), 2);
    }

    #[test]
    fn test_remove_does_not_dispose() {
        let h = harness();
        let mut mixer = StemMixer::new();
        let bass = loaded(&h, SongStem::Bass);
        mixer.add(bass.clone());

        assert!(mixer.remove(&bass));
        assert!(!mixer.remove(&bass));
        assert!(mixer.is_empty());

        let channel = lock(&bass);
        assert!(!channel.is_disposed());
        assert!(h.backend.is_live(channel.stream_handle().unwrap()));
    }

    #[test]
    fn test_set_speed_broadcasts_to_every_path() {
        let h = harness();
        let mut mixer = StemMixer::new();
        for stem in [SongStem::Drums, SongStem::Vocals, SongStem::Keys] {
            mixer.add(loaded(&h, stem));
        }
        h.backend.clear_calls();

        mixer.set_speed(1.5);
        assert_eq!(mixer.speed(), 1.5);
        let tempo_writes = h
            .backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SetAttribute(_, ChannelAttribute::Tempo, v) if *v == 50.0))
            .count();
        assert_eq!(tempo_writes, 6);
    }

    #[test]
    fn test_load_all_reports_failures() {
        let h = harness();
        let mut mixer = StemMixer::new();
        mixer.add(channel_ref(StemChannel::new(&h.context, "drums.ogg", SongStem::Drums)));
        mixer.add(channel_ref(StemChannel::new(&h.context, "", SongStem::Crowd)));

        let failures = mixer.load_all(1.0);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, SongStem::Crowd);
        assert_eq!(failures[0].1.status_code(), -1);
        assert!(lock(mixer.channels().next().unwrap()).is_loaded());
    }

    #[test]
    fn test_set_position_keeps_stems_locked() {
        let h = harness();
        let mut mixer = StemMixer::new();
        let guitar = loaded(&h, SongStem::Guitar);
        let drums = loaded(&h, SongStem::Drums);
        mixer.add(guitar.clone());
        mixer.add(drums.clone());

        mixer.set_position(20.0);
        assert!((mixer.position() - 20.0).abs() < 1e-4);
        assert!((lock(&drums).position(true) - 20.0).abs() < 1e-4);
        assert!((mixer.length_seconds() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_reverb_targets_one_stem() {
        let h = harness();
        let mut mixer = StemMixer::new();
        let drums = loaded(&h, SongStem::Drums);
        let vocals = loaded(&h, SongStem::Vocals);
        mixer.add(drums.clone());
        mixer.add(vocals.clone());

        mixer.set_reverb(SongStem::Drums, true);
        assert!(lock(&drums).is_reverb_enabled());
        assert!(!lock(&vocals).is_reverb_enabled());
    }

    #[test]
    fn test_whammy_targets_one_stem() {
        let h = harness();
        let mut mixer = StemMixer::new();
        let guitar = loaded(&h, SongStem::Guitar);
        let bass = loaded(&h, SongStem::Bass);
        mixer.add(guitar.clone());
        mixer.add(bass.clone());

        mixer.set_whammy_pitch(SongStem::Guitar, 1.0);
        let guitar_ratio = lock(&guitar).pitch_bend().unwrap().params.pitch_shift;
        let bass_ratio = lock(&bass).pitch_bend().unwrap().params.pitch_shift;
        assert!((guitar_ratio - 2.0_f32.powf(-2.0 / 12.0)).abs() < 1e-6);
        assert_eq!(bass_ratio, 1.0);
        assert!(h.backend.effects_on(stream_of(&guitar)).iter().any(|(_, k)| *k == EffectKind::PitchShift));
    }

    #[test]
    fn test_fade_out_all_resolves_on_tick() {
        let h = harness();
        let mut mixer = StemMixer::new();
        mixer.add(loaded(&h, SongStem::Song));
        mixer.add(loaded(&h, SongStem::Crowd));

        let mut fades = mixer.fade_out_all();
        assert_eq!(mixer.tick(), 0);

        let later = Instant::now() + FADE_DURATION;
        assert_eq!(mixer.tick_at(later), 0);
        h.backend.finish_slides();
        assert_eq!(mixer.tick_at(later), 2);
        assert!(fades.iter_mut().all(|f| f.try_outcome() == Some(FadeOutcome::Completed)));
    }

    #[test]
    fn test_song_end_fires_after_every_channel() {
        let h = harness();
        let mut mixer = StemMixer::new();
        let drums = loaded(&h, SongStem::Drums);
        let bass = loaded(&h, SongStem::Bass);
        mixer.add(drums.clone());
        mixer.add(bass.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        mixer.subscribe_song_end(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        h.backend.fire_end(stream_of(&drums));
        h.dispatcher.run_pending();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!mixer.is_finished());

        h.backend.fire_end(stream_of(&bass));
        h.backend.fire_end(stream_of(&bass));
        h.dispatcher.run_pending();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(mixer.is_finished());

        // A seek re-arms the song end
        mixer.set_position(0.0);
        assert!(!mixer.is_finished());
    }

    #[test]
    fn test_song_end_skips_channel_that_failed_to_load() {
        let h = harness();
        let mut mixer = StemMixer::new();
        let drums = channel_ref(StemChannel::new(&h.context, "drums.ogg", SongStem::Drums));
        mixer.add(drums.clone());
        mixer.add(channel_ref(StemChannel::new(&h.context, "", SongStem::Crowd)));
        assert_eq!(mixer.load_all(1.0).len(), 1);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        mixer.subscribe_song_end(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        h.backend.fire_end(stream_of(&drums));
        h.dispatcher.run_pending();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(mixer.is_finished());
    }

    #[test]
    fn test_removed_channel_no_longer_counts() {
        let h = harness();
        let mut mixer = StemMixer::new();
        let drums = loaded(&h, SongStem::Drums);
        let bass = loaded(&h, SongStem::Bass);
        mixer.add(drums.clone());
        mixer.add(bass.clone());
        mixer.remove(&bass);

        h.backend.fire_end(stream_of(&drums));
        h.dispatcher.run_pending();
        assert!(mixer.is_finished());
    }

    fn tone_source(backend: &SoftwareBackend, frames: usize) -> StreamHandle {
        let samples = (0..frames)
            .map(|i| StereoSample::mono((i as f32 * 0.05).sin() * 0.5))
            .collect();
        backend
            .create_memory_stream(StereoBuffer::from_vec(samples), 48000)
            .unwrap()
    }

    #[test]
    fn test_software_backend_song_plays_to_end() {
        let (backend, mut renderer) = SoftwareBackend::new(48000);
        let backend = Arc::new(backend);
        let dispatcher = MainThreadDispatcher::new();
        let context = ChannelContext {
            backend: backend.clone(),
            manager: Arc::new(SettingsManager::new(EngineConfig::default())),
            dispatch: dispatcher.handle(),
        };

        // Two stems split from one shared source, one from its own source
        let shared = tone_source(&backend, 12000);
        let mut mixer = StemMixer::new();
        let stems = [
            StemChannel::from_source(&context, SongStem::Drums1, shared, true),
            StemChannel::from_source(&context, SongStem::Drums2, shared, true),
            StemChannel::from_source(&context, SongStem::Vocals, tone_source(&backend, 9000), false),
        ];
        for channel in stems {
            mixer.add(channel_ref(channel));
        }
        assert!(mixer.load_all(1.0).is_empty());

        for channel in mixer.channels() {
            let mut channel = lock(channel);
            for stream in [channel.stream_handle(), channel.reverb_stream_handle()].into_iter().flatten() {
                backend.mixer_add(stream).unwrap();
            }
            channel.set_mixed(true);
        }
        mixer.set_reverb(SongStem::Vocals, true);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        mixer.subscribe_song_end(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut out = StereoBuffer::silence(1024);
        let mut heard = false;
        for _ in 0..32 {
            renderer.render(&mut out);
            heard |= out.peak() > 0.01;
            dispatcher.run_pending();
        }

        assert!(heard);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(mixer.is_finished());

        for channel in mixer.channels() {
            lock(channel).dispose();
        }
        // Only the two caller-owned sources remain
        assert_eq!(backend.stream_count(), 2);
    }
}
