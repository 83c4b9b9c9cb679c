//! Call-recording backend for unit tests
//!
//! Keeps just enough state to answer reads (attributes, positions, effect
//! attachments) and records every mutating call for exact-call assertions.
//! Slides do not progress on their own: `finish_slides()` jumps every
//! attribute to its slide target.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{
    BackendError, BackendResult, ChannelAttribute, DecodeBackend, EffectKind, EffectParams,
    EndSyncCallback, FxHandle, Route, StreamHandle, SyncHandle,
};

/// A mutating call received by the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateStream(PathBuf),
    CreateSplit(StreamHandle),
    CreateTempo(StreamHandle),
    SplitReset(StreamHandle),
    Free(StreamHandle),
    SetAttribute(StreamHandle, ChannelAttribute, f32),
    SlideAttribute(StreamHandle, ChannelAttribute, f32, Duration),
    SetFx(StreamHandle, EffectKind, i32),
    SetFxParameters(FxHandle, EffectParams),
    RemoveFx(StreamHandle, FxHandle),
    SetPosition(StreamHandle, u64, Route),
    SetEndSync(StreamHandle, Route),
}

#[derive(Clone, Copy)]
struct Attribute {
    current: f32,
    target: f32,
}

struct Fx {
    stream: StreamHandle,
    kind: EffectKind,
    params: Option<EffectParams>,
}

#[derive(Default)]
struct State {
    next_id: u32,
    calls: Vec<Call>,
    live: HashSet<StreamHandle>,
    /// Tempo stream -> owned input
    tempo_inputs: HashMap<StreamHandle, StreamHandle>,
    attributes: HashMap<(StreamHandle, ChannelAttribute), Attribute>,
    positions: HashMap<StreamHandle, u64>,
    effects: HashMap<FxHandle, Fx>,
    syncs: HashMap<StreamHandle, Vec<EndSyncCallback>>,
    fail_open: Option<BackendError>,
    fail_fx: HashSet<EffectKind>,
    fail_fx_parameters: HashSet<EffectKind>,
    fail_split_reset: bool,
    /// Split/tempo creations so far, and the 1-based call to fail
    splits_created: usize,
    tempos_created: usize,
    fail_split_at: Option<usize>,
    fail_tempo_at: Option<usize>,
}

pub struct RecordingBackend {
    state: Mutex<State>,
    length: u64,
    sample_rate: u32,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    /// Backend whose streams are 60 seconds long at 48kHz
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..Default::default()
            }),
            length: 48000 * 60,
            sample_rate: 48000,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_raw(state: &mut State) -> u32 {
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    fn new_stream(state: &mut State) -> StreamHandle {
        let handle = StreamHandle::from_raw(Self::next_raw(state)).unwrap();
        state.live.insert(handle);
        handle
    }

    fn check_live(state: &State, stream: StreamHandle) -> BackendResult<()> {
        if state.live.contains(&stream) {
            Ok(())
        } else {
            Err(BackendError::Handle(stream.raw()))
        }
    }

    // --- failure injection ---

    pub fn fail_open(&self, error: BackendError) {
        self.lock().fail_open = Some(error);
    }

    pub fn fail_fx(&self, kind: EffectKind) {
        self.lock().fail_fx.insert(kind);
    }

    pub fn fail_fx_parameters(&self, kind: EffectKind) {
        self.lock().fail_fx_parameters.insert(kind);
    }

    pub fn fail_split_reset(&self) {
        self.lock().fail_split_reset = true;
    }

    /// Fail the `n`th split creation from now on (1-based)
    pub fn fail_nth_split(&self, n: usize) {
        let mut state = self.lock();
        state.fail_split_at = Some(state.splits_created + n);
    }

    /// Fail the `n`th tempo creation from now on (1-based)
    pub fn fail_nth_tempo(&self, n: usize) {
        let mut state = self.lock();
        state.fail_tempo_at = Some(state.tempos_created + n);
    }

    /// Drop every pending failure
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_open = None;
        state.fail_fx.clear();
        state.fail_fx_parameters.clear();
        state.fail_split_reset = false;
        state.fail_split_at = None;
        state.fail_tempo_at = None;
    }

    // --- inspection ---

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Set and slide calls for one attribute of one stream
    pub fn attribute_writes(&self, stream: StreamHandle, attribute: ChannelAttribute) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|call| match call {
                Call::SetAttribute(s, a, _) | Call::SlideAttribute(s, a, _, _) => *s == stream && *a == attribute,
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Target value of an attribute (the value a running slide ends at)
    pub fn attribute_target(&self, stream: StreamHandle, attribute: ChannelAttribute) -> Option<f32> {
        self.lock().attributes.get(&(stream, attribute)).map(|a| a.target)
    }

    pub fn live_streams(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_live(&self, stream: StreamHandle) -> bool {
        self.lock().live.contains(&stream)
    }

    /// Effects attached to a stream, in attach order
    pub fn effects_on(&self, stream: StreamHandle) -> Vec<(FxHandle, EffectKind)> {
        let state = self.lock();
        let mut effects: Vec<_> = state
            .effects
            .iter()
            .filter(|(_, fx)| fx.stream == stream)
            .map(|(handle, fx)| (*handle, fx.kind))
            .collect();
        effects.sort_by_key(|(handle, _)| *handle);
        effects
    }

    pub fn fx_params(&self, fx: FxHandle) -> Option<EffectParams> {
        self.lock().effects.get(&fx).and_then(|fx| fx.params)
    }

    /// Complete every running slide
    pub fn finish_slides(&self) {
        for attribute in self.lock().attributes.values_mut() {
            attribute.current = attribute.target;
        }
    }

    /// Invoke the end syncs of a stream as the audio thread would
    pub fn fire_end(&self, stream: StreamHandle) {
        let callbacks = self.lock().syncs.get(&stream).cloned().unwrap_or_default();
        for callback in callbacks {
            callback();
        }
    }

    pub fn sync_count(&self, stream: StreamHandle) -> usize {
        self.lock().syncs.get(&stream).map_or(0, Vec::len)
    }
}

impl DecodeBackend for RecordingBackend {
    fn create_stream(&self, path: &Path) -> BackendResult<StreamHandle> {
        let mut state = self.lock();
        state.calls.push(Call::CreateStream(path.to_path_buf()));
        if let Some(error) = state.fail_open.clone() {
            return Err(error);
        }
        Ok(Self::new_stream(&mut state))
    }

    fn create_split_stream(&self, source: StreamHandle) -> BackendResult<StreamHandle> {
        let mut state = self.lock();
        state.calls.push(Call::CreateSplit(source));
        Self::check_live(&state, source)?;
        state.splits_created += 1;
        if state.fail_split_at == Some(state.splits_created) {
            return Err(BackendError::NotAvailable("split stream".into()));
        }
        Ok(Self::new_stream(&mut state))
    }

    fn create_tempo_stream(&self, input: StreamHandle) -> BackendResult<StreamHandle> {
        let mut state = self.lock();
        state.calls.push(Call::CreateTempo(input));
        Self::check_live(&state, input)?;
        state.tempos_created += 1;
        if state.fail_tempo_at == Some(state.tempos_created) {
            return Err(BackendError::NotAvailable("tempo stream".into()));
        }
        let handle = Self::new_stream(&mut state);
        state.tempo_inputs.insert(handle, input);
        Ok(handle)
    }

    fn split_stream_reset(&self, source: StreamHandle) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::SplitReset(source));
        if state.fail_split_reset {
            return Err(BackendError::NotAvailable("split reset".into()));
        }
        Self::check_live(&state, source)
    }

    fn stream_free(&self, stream: StreamHandle) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Free(stream));
        if !state.live.remove(&stream) {
            return Err(BackendError::Handle(stream.raw()));
        }
        if let Some(input) = state.tempo_inputs.remove(&stream) {
            state.live.remove(&input);
        }
        state.effects.retain(|_, fx| fx.stream != stream);
        Ok(())
    }

    fn set_attribute(&self, stream: StreamHandle, attribute: ChannelAttribute, value: f32) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::SetAttribute(stream, attribute, value));
        Self::check_live(&state, stream)?;
        state.attributes.insert(
            (stream, attribute),
            Attribute {
                current: value,
                target: value,
            },
        );
        Ok(())
    }

    fn slide_attribute(
        &self,
        stream: StreamHandle,
        attribute: ChannelAttribute,
        value: f32,
        duration: Duration,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        state
            .calls
            .push(Call::SlideAttribute(stream, attribute, value, duration));
        Self::check_live(&state, stream)?;
        let entry = state.attributes.entry((stream, attribute)).or_insert(Attribute {
            current: if attribute == ChannelAttribute::Volume { 1.0 } else { 0.0 },
            target: 0.0,
        });
        entry.target = value;
        Ok(())
    }

    fn get_attribute(&self, stream: StreamHandle, attribute: ChannelAttribute) -> BackendResult<f32> {
        let state = self.lock();
        Self::check_live(&state, stream)?;
        if attribute == ChannelAttribute::Frequency {
            return Ok(self.sample_rate as f32);
        }
        let default = if attribute == ChannelAttribute::Volume { 1.0 } else { 0.0 };
        Ok(state
            .attributes
            .get(&(stream, attribute))
            .map_or(default, |a| a.current))
    }

    fn set_fx(&self, stream: StreamHandle, kind: EffectKind, priority: i32) -> BackendResult<FxHandle> {
        let mut state = self.lock();
        state.calls.push(Call::SetFx(stream, kind, priority));
        Self::check_live(&state, stream)?;
        if state.fail_fx.contains(&kind) {
            return Err(BackendError::NotAvailable(format!("{:?}", kind)));
        }
        let handle = FxHandle::from_raw(Self::next_raw(&mut state)).unwrap();
        state.effects.insert(
            handle,
            Fx {
                stream,
                kind,
                params: None,
            },
        );
        Ok(handle)
    }

    fn set_fx_parameters(&self, fx: FxHandle, params: &EffectParams) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::SetFxParameters(fx, *params));
        let fail = state.fail_fx_parameters.contains(&params.kind());
        let entry = state.effects.get_mut(&fx).ok_or(BackendError::Handle(fx.raw()))?;
        if entry.kind != params.kind() {
            return Err(BackendError::IllegalType(format!("{:?}", params.kind())));
        }
        if fail {
            return Err(BackendError::IllegalParam(format!("{:?}", params.kind())));
        }
        entry.params = Some(*params);
        Ok(())
    }

    fn remove_fx(&self, stream: StreamHandle, fx: FxHandle) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::RemoveFx(stream, fx));
        match state.effects.get(&fx) {
            Some(entry) if entry.stream == stream => {
                state.effects.remove(&fx);
                Ok(())
            }
            _ => Err(BackendError::Handle(fx.raw())),
        }
    }

    fn position(&self, stream: StreamHandle) -> BackendResult<u64> {
        let state = self.lock();
        Self::check_live(&state, stream)?;
        Ok(state.positions.get(&stream).copied().unwrap_or(0))
    }

    fn set_position(&self, stream: StreamHandle, frame: u64, route: Route) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::SetPosition(stream, frame, route));
        Self::check_live(&state, stream)?;
        // Frames past the end park the stream
        state.positions.insert(stream, frame);
        Ok(())
    }

    fn length(&self, stream: StreamHandle) -> BackendResult<u64> {
        let state = self.lock();
        Self::check_live(&state, stream)?;
        Ok(self.length)
    }

    fn set_end_sync(&self, stream: StreamHandle, route: Route, callback: EndSyncCallback) -> BackendResult<SyncHandle> {
        let mut state = self.lock();
        state.calls.push(Call::SetEndSync(stream, route));
        Self::check_live(&state, stream)?;
        state.syncs.entry(stream).or_default().push(callback);
        Ok(SyncHandle::from_raw(Self::next_raw(&mut state)).unwrap())
    }
}
