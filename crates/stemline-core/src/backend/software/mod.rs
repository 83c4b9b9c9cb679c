//! Pure-Rust decode backend
//!
//! Files are decoded up front with symphonia, brought to the engine rate
//! with rubato and shared between a source and its splits through
//! `basedrop::Shared`. Tempo stages run signalsmith-stretch.
//!
//! The backend comes in two halves:
//! - [`SoftwareBackend`] implements [`DecodeBackend`] for control threads.
//!   It keeps a registry of streams and effects, validates every call
//!   against it and queues the resulting mutation.
//! - [`BackendRenderer`] owns the stream nodes and is driven by the audio
//!   output. It drains the queue at the start of every block.
//!
//! The halves share only an `rtrb` ring buffer and per-stream atomics for
//! readbacks, so a control call never silences a block and rendering never
//! waits on a control call.

mod command;
mod decode;
mod node;
mod ramp;
mod renderer;

pub use command::{COMMAND_QUEUE_CAPACITY, MAX_STREAMS};
pub use decode::{decode_file, fold_to_stereo, resample};
pub use node::{MAX_EFFECTS, MAX_SYNCS};
pub use renderer::BackendRenderer;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use basedrop::{Owned, Shared};

use crate::backend::{
    BackendError, BackendResult, ChannelAttribute, DecodeBackend, EffectKind, EffectParams,
    EndSyncCallback, FxHandle, Route, StreamHandle, SyncHandle,
};
use crate::effect::{create_effect, validate_params, ParamError};
use crate::engine::gc::gc_handle;
use crate::types::{StereoBuffer, StereoSample};

use command::{command_channel, BackendCommand};
use node::{NodeKind, SourceFrames, StreamAtomics, StreamNode, TempoStage};

/// Count of attribute writes that reached the backend, per attribute
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    pub volume: u64,
    pub tempo: u64,
    pub pitch: u64,
}

#[derive(Default)]
struct WriteCounters {
    volume: AtomicU64,
    tempo: AtomicU64,
    pitch: AtomicU64,
}

impl WriteCounters {
    fn record(&self, attribute: ChannelAttribute) {
        let counter = match attribute {
            ChannelAttribute::Volume => &self.volume,
            ChannelAttribute::Tempo => &self.tempo,
            ChannelAttribute::Pitch => &self.pitch,
            ChannelAttribute::Frequency => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WriteStats {
        WriteStats {
            volume: self.volume.load(Ordering::Relaxed),
            tempo: self.tempo.load(Ordering::Relaxed),
            pitch: self.pitch.load(Ordering::Relaxed),
        }
    }
}

enum StreamKind {
    Source { frames: SourceFrames },
    Split { source: StreamHandle },
    Tempo { input: StreamHandle },
}

/// Control-side record of a live stream
struct StreamEntry {
    kind: StreamKind,
    /// Renderer slot of the top-level node holding this stream
    slot: usize,
    /// Tempo stream this one is embedded in
    owner: Option<StreamHandle>,
    length: u64,
    atomics: Arc<StreamAtomics>,
    effects: usize,
    syncs: usize,
}

struct FxEntry {
    stream: StreamHandle,
    kind: EffectKind,
}

/// Everything control calls validate against
///
/// Only control threads lock it; the renderer never does.
struct Registry {
    next_id: u32,
    streams: HashMap<StreamHandle, StreamEntry>,
    fx: HashMap<FxHandle, FxEntry>,
    /// Streams plugged into the output mix
    mixer: HashSet<StreamHandle>,
    free_slots: Vec<usize>,
    commands: rtrb::Producer<BackendCommand>,
}

fn exhausted() -> BackendError {
    BackendError::Unknown("Handle space exhausted".into())
}

impl Registry {
    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }

    fn alloc_stream(&mut self) -> BackendResult<StreamHandle> {
        let id = self.alloc_id();
        StreamHandle::from_raw(id).ok_or_else(exhausted)
    }

    fn entry(&self, handle: StreamHandle) -> BackendResult<&StreamEntry> {
        self.streams.get(&handle).ok_or(BackendError::Handle(handle.raw()))
    }

    fn entry_mut(&mut self, handle: StreamHandle) -> BackendResult<&mut StreamEntry> {
        self.streams.get_mut(&handle).ok_or(BackendError::Handle(handle.raw()))
    }

    /// The source or split a stream ultimately reads from
    fn leaf(&self, handle: StreamHandle) -> BackendResult<&StreamEntry> {
        let mut entry = self.entry(handle)?;
        while let StreamKind::Tempo { input } = entry.kind {
            entry = self.entry(input)?;
        }
        Ok(entry)
    }

    fn ensure_room(&self) -> BackendResult<()> {
        if self.commands.slots() == 0 {
            return Err(BackendError::NotAvailable("Render command queue is full".into()));
        }
        Ok(())
    }

    fn send(&mut self, cmd: BackendCommand) -> BackendResult<()> {
        self.commands
            .push(cmd)
            .map_err(|_| BackendError::NotAvailable("Render command queue is full".into()))
    }

    fn take_slot(&mut self) -> BackendResult<usize> {
        self.free_slots
            .pop()
            .ok_or_else(|| BackendError::NotAvailable(format!("All {} stream slots are in use", MAX_STREAMS)))
    }

    /// Hand a new top-level node to the renderer
    fn insert(&mut self, node: StreamNode, kind: StreamKind, length: u64) -> BackendResult<StreamHandle> {
        self.ensure_room()?;
        let handle = node.handle;
        let slot = self.take_slot()?;
        let atomics = node.atomics();
        if let Err(e) = self.send(BackendCommand::Insert {
            slot,
            node: Owned::new(&gc_handle(), node),
        }) {
            self.free_slots.push(slot);
            return Err(e);
        }
        self.streams.insert(
            handle,
            StreamEntry {
                kind,
                slot,
                owner: None,
                length,
                atomics,
                effects: 0,
                syncs: 0,
            },
        );
        Ok(handle)
    }

    fn require_mixed(&self, stream: StreamHandle, route: Route) -> BackendResult<()> {
        if route == Route::Mixer && !self.mixer.contains(&stream) {
            return Err(BackendError::IllegalType(format!("{} is not plugged into the mixer", stream)));
        }
        Ok(())
    }
}

/// Control half of the software implementation of [`DecodeBackend`]
pub struct SoftwareBackend {
    sample_rate: u32,
    registry: Mutex<Registry>,
    writes: WriteCounters,
}

impl SoftwareBackend {
    /// Create a backend rendering at `sample_rate`
    ///
    /// The renderer goes to whatever drives the output: the audio callback
    /// or an offline render loop.
    pub fn new(sample_rate: u32) -> (Self, BackendRenderer) {
        log::info!("[BACKEND] Software backend at {} Hz", sample_rate);
        let (producer, consumer) = command_channel();
        let backend = Self {
            sample_rate,
            registry: Mutex::new(Registry {
                next_id: 1,
                streams: HashMap::new(),
                fx: HashMap::new(),
                mixer: HashSet::new(),
                free_slots: (0..MAX_STREAMS).rev().collect(),
                commands: producer,
            }),
            writes: WriteCounters::default(),
        };
        (backend, BackendRenderer::new(sample_rate, consumer))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_source(&self, frames: Vec<StereoSample>) -> BackendResult<StreamHandle> {
        let length = frames.len() as u64;
        let frames = Shared::new(&gc_handle(), frames);
        let mut registry = self.lock();
        let handle = registry.alloc_stream()?;
        let node = StreamNode::new(
            handle,
            NodeKind::Source {
                frames: frames.clone(),
                cursor: 0,
            },
        );
        registry.insert(node, StreamKind::Source { frames }, length)
    }

    /// Create a decode source from audio already in memory
    pub fn create_memory_stream(&self, buffer: StereoBuffer, sample_rate: u32) -> BackendResult<StreamHandle> {
        if sample_rate == 0 {
            return Err(BackendError::IllegalParam("sample rate 0".into()));
        }
        let frames = resample(buffer.as_slice().to_vec(), sample_rate, self.sample_rate)?;
        self.insert_source(frames)
    }

    /// Plug a stream into the output mixer
    pub fn mixer_add(&self, stream: StreamHandle) -> BackendResult<()> {
        let mut registry = self.lock();
        let entry = registry.entry(stream)?;
        if entry.owner.is_some() {
            return Err(BackendError::IllegalType(format!("{} is owned by a tempo stream", stream)));
        }
        let slot = entry.slot;
        if registry.mixer.contains(&stream) {
            return Ok(());
        }
        registry.send(BackendCommand::Plug { slot })?;
        registry.mixer.insert(stream);
        Ok(())
    }

    /// Whether a stream is plugged into the output mixer
    pub fn is_mixed(&self, stream: StreamHandle) -> bool {
        self.lock().mixer.contains(&stream)
    }

    /// Number of live top-level streams
    pub fn stream_count(&self) -> usize {
        self.lock().streams.values().filter(|e| e.owner.is_none()).count()
    }

    /// Attribute writes received so far
    pub fn stats(&self) -> WriteStats {
        self.writes.snapshot()
    }

    fn slide_frames(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as u64
    }

    /// Queue an attribute write, validating the attribute first
    ///
    /// `slide` is the glide length in frames, `None` for a jump.
    fn write_attribute(
        &self,
        stream: StreamHandle,
        attribute: ChannelAttribute,
        value: f32,
        slide: Option<u64>,
    ) -> BackendResult<()> {
        if !value.is_finite() {
            return Err(BackendError::IllegalParam(format!("{:?} = {}", attribute, value)));
        }

        let mut registry = self.lock();
        let entry = registry.entry(stream)?;
        let is_tempo = matches!(entry.kind, StreamKind::Tempo { .. });
        let value = match attribute {
            ChannelAttribute::Volume => value.max(0.0),
            ChannelAttribute::Tempo | ChannelAttribute::Pitch if !is_tempo => {
                return Err(BackendError::IllegalType(format!(
                    "{:?} needs a tempo stream",
                    attribute
                )));
            }
            ChannelAttribute::Tempo => value.clamp(-95.0, 4900.0),
            ChannelAttribute::Pitch => value.clamp(-60.0, 60.0),
            ChannelAttribute::Frequency => {
                return Err(BackendError::IllegalType("Frequency is read-only".into()));
            }
        };
        let slot = entry.slot;
        let atomics = entry.atomics.clone();

        let cmd = match slide {
            Some(frames) if frames > 0 => BackendCommand::SlideAttribute {
                slot,
                stream,
                attribute,
                value,
                frames,
            },
            _ => BackendCommand::SetAttribute {
                slot,
                stream,
                attribute,
                value,
            },
        };
        let jump = matches!(cmd, BackendCommand::SetAttribute { .. });
        registry.send(cmd)?;
        drop(registry);

        if jump {
            atomics.store_attribute(attribute, value);
        }
        self.writes.record(attribute);
        Ok(())
    }
}

impl DecodeBackend for SoftwareBackend {
    fn create_stream(&self, path: &Path) -> BackendResult<StreamHandle> {
        // Decoding holds no lock
        let frames = decode_file(path, self.sample_rate)?;
        let handle = self.insert_source(frames)?;
        log::debug!("[BACKEND] Opened {:?} as {}", path, handle);
        Ok(handle)
    }

    fn create_split_stream(&self, source: StreamHandle) -> BackendResult<StreamHandle> {
        let mut registry = self.lock();
        let entry = registry.entry(source)?;
        let StreamKind::Source { frames } = &entry.kind else {
            return Err(BackendError::IllegalType(format!("{} is not a decode source", source)));
        };
        let frames = frames.clone();
        let cursor = entry.atomics.position();
        let length = entry.length;

        let handle = registry.alloc_stream()?;
        let node = StreamNode::new(handle, NodeKind::Split { source, frames, cursor });
        registry.insert(node, StreamKind::Split { source }, length)
    }

    fn create_tempo_stream(&self, input: StreamHandle) -> BackendResult<StreamHandle> {
        let mut registry = self.lock();
        let registry = &mut *registry;
        if registry.mixer.contains(&input) {
            return Err(BackendError::IllegalType(format!("{} is plugged into the mixer", input)));
        }
        let entry = registry.entry(input)?;
        if entry.owner.is_some() {
            return Err(BackendError::IllegalType(format!("{} is owned by a tempo stream", input)));
        }
        let input_slot = entry.slot;
        let length = entry.length;

        registry.ensure_room()?;
        let handle = registry.alloc_stream()?;
        let slot = registry.take_slot()?;
        let node = StreamNode::new(handle, NodeKind::Tempo(Box::new(TempoStage::new(self.sample_rate))));
        let atomics = node.atomics();
        if let Err(e) = registry.send(BackendCommand::WrapTempo {
            slot,
            input_slot,
            node: Owned::new(&gc_handle(), node),
        }) {
            registry.free_slots.push(slot);
            return Err(e);
        }

        // The input and anything embedded in it move into the new slot
        for embedded in registry.streams.values_mut().filter(|e| e.slot == input_slot) {
            embedded.slot = slot;
        }
        registry.free_slots.push(input_slot);
        registry.entry_mut(input)?.owner = Some(handle);
        registry.streams.insert(
            handle,
            StreamEntry {
                kind: StreamKind::Tempo { input },
                slot,
                owner: None,
                length,
                atomics,
                effects: 0,
                syncs: 0,
            },
        );
        Ok(handle)
    }

    fn split_stream_reset(&self, source: StreamHandle) -> BackendResult<()> {
        let mut registry = self.lock();
        let entry = registry.entry(source)?;
        if !matches!(entry.kind, StreamKind::Source { .. }) {
            return Err(BackendError::IllegalType(format!("{} is not a decode source", source)));
        }
        let frame = entry.atomics.position();
        let source_slot = entry.slot;

        registry.send(BackendCommand::ResetSplits { source_slot, source })?;

        let mut reset = 0;
        for entry in registry.streams.values() {
            if matches!(entry.kind, StreamKind::Split { source: s } if s == source) {
                entry.atomics.store_position(frame);
                reset += 1;
            }
        }
        log::debug!("[BACKEND] Reset {} split(s) of {} to frame {}", reset, source, frame);
        Ok(())
    }

    fn stream_free(&self, stream: StreamHandle) -> BackendResult<()> {
        let mut registry = self.lock();
        let registry = &mut *registry;
        let entry = registry.entry(stream)?;
        if entry.owner.is_some() {
            return Err(BackendError::IllegalType(format!("{} is owned by a tempo stream", stream)));
        }
        let slot = entry.slot;
        registry.send(BackendCommand::Free { slot })?;
        registry.free_slots.push(slot);

        // The stream and everything embedded in it share the slot
        registry.streams.retain(|_, entry| entry.slot != slot);
        registry.mixer.retain(|handle| registry.streams.contains_key(handle));
        registry.fx.retain(|_, fx| registry.streams.contains_key(&fx.stream));
        Ok(())
    }

    fn set_attribute(&self, stream: StreamHandle, attribute: ChannelAttribute, value: f32) -> BackendResult<()> {
        self.write_attribute(stream, attribute, value, None)
    }

    fn slide_attribute(
        &self,
        stream: StreamHandle,
        attribute: ChannelAttribute,
        value: f32,
        duration: Duration,
    ) -> BackendResult<()> {
        let frames = self.slide_frames(duration);
        self.write_attribute(stream, attribute, value, Some(frames))
    }

    fn get_attribute(&self, stream: StreamHandle, attribute: ChannelAttribute) -> BackendResult<f32> {
        let registry = self.lock();
        let entry = registry.entry(stream)?;
        match attribute {
            ChannelAttribute::Frequency => Ok(self.sample_rate as f32),
            _ => entry
                .atomics
                .attribute(attribute)
                .ok_or_else(|| BackendError::IllegalType(format!("{:?} cannot be read", attribute))),
        }
    }

    fn set_fx(&self, stream: StreamHandle, kind: EffectKind, priority: i32) -> BackendResult<FxHandle> {
        // Effects are built here so the renderer only ever moves them
        let effect = Owned::new(&gc_handle(), create_effect(kind, self.sample_rate));

        let mut registry = self.lock();
        let entry = registry.entry(stream)?;
        if entry.effects >= MAX_EFFECTS {
            return Err(BackendError::NotAvailable(format!(
                "{} already carries {} effects",
                stream, MAX_EFFECTS
            )));
        }
        let slot = entry.slot;
        registry.ensure_room()?;

        let id = registry.alloc_id();
        let handle = FxHandle::from_raw(id).ok_or_else(exhausted)?;
        registry.send(BackendCommand::AttachFx {
            slot,
            stream,
            fx: handle,
            priority,
            effect,
        })?;
        registry.entry_mut(stream)?.effects += 1;
        registry.fx.insert(handle, FxEntry { stream, kind });
        Ok(handle)
    }

    fn set_fx_parameters(&self, fx: FxHandle, params: &EffectParams) -> BackendResult<()> {
        let mut registry = self.lock();
        let entry = registry.fx.get(&fx).ok_or(BackendError::Handle(fx.raw()))?;
        let stream = entry.stream;
        validate_params(entry.kind, params, self.sample_rate).map_err(|e| match e {
            ParamError::WrongKind { .. } => BackendError::IllegalType(e.to_string()),
            ParamError::OutOfRange { .. } => BackendError::IllegalParam(e.to_string()),
        })?;

        let slot = registry.entry(stream)?.slot;
        registry.send(BackendCommand::SetFxParams {
            slot,
            stream,
            fx,
            params: *params,
        })
    }

    fn remove_fx(&self, stream: StreamHandle, fx: FxHandle) -> BackendResult<()> {
        let mut registry = self.lock();
        if registry.fx.get(&fx).map(|entry| entry.stream) != Some(stream) {
            return Err(BackendError::Handle(fx.raw()));
        }
        let slot = registry.entry(stream)?.slot;
        registry.send(BackendCommand::RemoveFx { slot, stream, fx })?;

        registry.fx.remove(&fx);
        let entry = registry.entry_mut(stream)?;
        entry.effects = entry.effects.saturating_sub(1);
        Ok(())
    }

    fn position(&self, stream: StreamHandle) -> BackendResult<u64> {
        Ok(self.lock().leaf(stream)?.atomics.position())
    }

    fn set_position(&self, stream: StreamHandle, frame: u64, route: Route) -> BackendResult<()> {
        let mut registry = self.lock();
        registry.require_mixed(stream, route)?;
        let slot = registry.entry(stream)?.slot;

        // Seeking a split moves its source as well
        let leaf = registry.leaf(stream)?;
        let leaf_atomics = leaf.atomics.clone();
        let source = match leaf.kind {
            StreamKind::Split { source } => registry
                .streams
                .get(&source)
                .map(|entry| (entry.slot, source, entry.atomics.clone())),
            _ => None,
        };

        registry.send(BackendCommand::Seek {
            slot,
            stream,
            frame,
            source: source.as_ref().map(|(slot, handle, _)| (*slot, *handle)),
        })?;

        leaf_atomics.store_position(frame);
        if let Some((_, _, atomics)) = source {
            atomics.store_position(frame);
        }
        Ok(())
    }

    fn length(&self, stream: StreamHandle) -> BackendResult<u64> {
        Ok(self.lock().entry(stream)?.length)
    }

    fn set_end_sync(&self, stream: StreamHandle, route: Route, callback: EndSyncCallback) -> BackendResult<SyncHandle> {
        let mut registry = self.lock();
        registry.require_mixed(stream, route)?;
        let entry = registry.entry(stream)?;
        if entry.syncs >= MAX_SYNCS {
            return Err(BackendError::NotAvailable(format!(
                "{} already carries {} end syncs",
                stream, MAX_SYNCS
            )));
        }
        let slot = entry.slot;
        registry.ensure_room()?;

        let id = registry.alloc_id();
        let handle = SyncHandle::from_raw(id).ok_or_else(exhausted)?;
        registry.send(BackendCommand::AddSync { slot, stream, callback })?;
        registry.entry_mut(stream)?.syncs += 1;
        log::debug!("[BACKEND] End sync {} on {} ({:?})", handle, stream, route);
        Ok(handle)
    }
}
