//! Stream graph nodes of the software backend
//!
//! A node is a decode source, a split view over a source, or a tempo stage
//! that owns its input node. Every node carries its own attributes, effect
//! chain and end syncs; reading a node pulls audio through its input (if
//! any), then its effects, then its volume ramp.
//!
//! Nodes live on the audio thread. They are built on the control thread,
//! handed over as `basedrop::Owned` and only ever dropped through the
//! collector. Effect and sync lists are allocated with fixed capacity up
//! front; the control side keeps them within it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use basedrop::{Owned, Shared};

use crate::backend::{ChannelAttribute, EndSyncCallback, FxHandle, StreamHandle};
use crate::effect::StreamEffect;
use crate::timestretch::TimeStretcher;
use crate::types::{StereoBuffer, StereoSample};

use super::ramp::Ramp;

/// Effects one node can carry
pub const MAX_EFFECTS: usize = 8;

/// End syncs one node can carry
pub const MAX_SYNCS: usize = 4;

/// Output frames a tempo stage produces per stretcher call
const TEMPO_BLOCK: usize = 256;

/// Whole-number form of [`crate::timestretch::MAX_SPEED`]
const MAX_SPEED_FACTOR: usize = 50;

/// Source frames one tempo block can consume at the fastest speed
const TEMPO_INPUT_CAPACITY: usize = MAX_SPEED_FACTOR * TEMPO_BLOCK + 1;

/// Decoded frames shared between a source and its splits
pub type SourceFrames = Shared<Vec<StereoSample>>;

/// Lock-free readbacks of one node
///
/// The audio thread publishes after every read. The control thread writes
/// through on sets and seeks so readbacks reflect a call immediately, before
/// the matching command reaches the audio thread.
pub struct StreamAtomics {
    /// Read cursor in source frames (sources and splits only)
    position: AtomicU64,
    /// Attribute values as `f32` bits
    volume: AtomicU32,
    tempo: AtomicU32,
    pitch: AtomicU32,
}

impl StreamAtomics {
    pub fn new(position: u64) -> Self {
        Self {
            position: AtomicU64::new(position),
            volume: AtomicU32::new(1.0_f32.to_bits()),
            tempo: AtomicU32::new(0.0_f32.to_bits()),
            pitch: AtomicU32::new(0.0_f32.to_bits()),
        }
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn store_position(&self, frame: u64) {
        self.position.store(frame, Ordering::Release);
    }

    fn cell(&self, attribute: ChannelAttribute) -> Option<&AtomicU32> {
        match attribute {
            ChannelAttribute::Volume => Some(&self.volume),
            ChannelAttribute::Tempo => Some(&self.tempo),
            ChannelAttribute::Pitch => Some(&self.pitch),
            ChannelAttribute::Frequency => None,
        }
    }

    /// Current value of a rampable attribute
    pub fn attribute(&self, attribute: ChannelAttribute) -> Option<f32> {
        self.cell(attribute)
            .map(|cell| f32::from_bits(cell.load(Ordering::Acquire)))
    }

    pub fn store_attribute(&self, attribute: ChannelAttribute, value: f32) {
        if let Some(cell) = self.cell(attribute) {
            cell.store(value.to_bits(), Ordering::Release);
        }
    }
}

/// Values last published by the audio thread
#[derive(Debug, Clone, Copy)]
struct Published {
    position: u64,
    volume: u32,
    tempo: u32,
    pitch: u32,
}

/// Publish `value` unless a control write landed since the last publish
#[inline]
fn publish_u32(cell: &AtomicU32, last: &mut u32, value: u32) {
    if value == *last {
        return;
    }
    match cell.compare_exchange(*last, value, Ordering::AcqRel, Ordering::Relaxed) {
        Ok(_) => *last = value,
        // The control write already matches
        Err(current) if current == value => *last = value,
        Err(_) => {}
    }
}

#[inline]
fn publish_u64(cell: &AtomicU64, last: &mut u64, value: u64) {
    if value == *last {
        return;
    }
    match cell.compare_exchange(*last, value, Ordering::AcqRel, Ordering::Relaxed) {
        Ok(_) => *last = value,
        Err(current) if current == value => *last = value,
        Err(_) => {}
    }
}

/// An effect attached to a node
pub struct EffectSlot {
    pub handle: FxHandle,
    pub priority: i32,
    pub effect: Owned<Box<dyn StreamEffect>>,
}

pub enum NodeKind {
    /// Decode source with its own read cursor
    Source { frames: SourceFrames, cursor: u64 },
    /// Independent cursor over a source's frames
    Split {
        source: StreamHandle,
        frames: SourceFrames,
        cursor: u64,
    },
    /// Tempo/pitch stage wrapping an owned input node
    Tempo(Box<TempoStage>),
}

pub struct TempoStage {
    /// Attached on the audio thread once the input leaves its slot
    input: Option<Owned<StreamNode>>,
    stretcher: TimeStretcher,
    input_buf: StereoBuffer,
    output_buf: StereoBuffer,
    /// Fractional source frames carried between blocks
    carry: f64,
    /// Whether the stretcher was used for the previous block
    stretching: bool,
}

impl TempoStage {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            input: None,
            stretcher: TimeStretcher::new_with_sample_rate(sample_rate),
            input_buf: StereoBuffer::silence(TEMPO_INPUT_CAPACITY),
            output_buf: StereoBuffer::silence(TEMPO_BLOCK),
            carry: 0.0,
            stretching: false,
        }
    }

    /// Take ownership of the input node
    pub fn attach(&mut self, input: Owned<StreamNode>) {
        self.input = Some(input);
    }

    fn reset(&mut self) {
        self.stretcher.reset();
        self.carry = 0.0;
    }

    /// Fill `out`; returns true once the input is exhausted
    fn read(&mut self, tempo_percent: f32, pitch: f32, out: &mut StereoBuffer) -> bool {
        let Some(input) = self.input.as_mut() else {
            out.fill_silence();
            return true;
        };

        self.stretcher
            .set_speed(TimeStretcher::speed_from_tempo_percent(tempo_percent as f64));
        if (pitch as f64 - self.stretcher.pitch_semitones()).abs() > 1e-6 {
            self.stretcher.set_pitch_semitones(pitch as f64);
        }

        if self.stretcher.is_unity() {
            if self.stretching {
                self.stretcher.reset();
                self.carry = 0.0;
                self.stretching = false;
            }
            return input.read(out);
        }

        if !self.stretching {
            self.stretcher.reset();
            self.carry = 0.0;
            self.stretching = true;
        }

        let speed = self.stretcher.speed();
        let total = out.len();
        let mut ended = false;
        let mut offset = 0;
        while offset < total {
            let len = (total - offset).min(TEMPO_BLOCK);

            let wanted = speed * len as f64 + self.carry;
            let frames = (wanted.floor() as usize).min(TEMPO_INPUT_CAPACITY);
            self.carry = (wanted - frames as f64).clamp(0.0, 1.0);

            self.input_buf.set_len_from_capacity(frames);
            ended |= input.read(&mut self.input_buf);

            self.output_buf.set_len_from_capacity(len);
            self.stretcher.process(&self.input_buf, &mut self.output_buf);
            out.as_mut_slice()[offset..offset + len].copy_from_slice(self.output_buf.as_slice());

            offset += len;
        }
        ended
    }
}

pub struct StreamNode {
    pub handle: StreamHandle,
    pub kind: NodeKind,
    pub volume: Ramp,
    pub tempo: Ramp,
    pub pitch: Ramp,
    /// Sorted by descending priority
    pub effects: Vec<EffectSlot>,
    /// End-of-stream callbacks, fired once per end
    pub syncs: Vec<EndSyncCallback>,
    /// End already reported since the last seek
    pub ended: bool,
    atomics: Arc<StreamAtomics>,
    published: Published,
}

impl StreamNode {
    pub fn new(handle: StreamHandle, kind: NodeKind) -> Self {
        let position = match &kind {
            NodeKind::Source { cursor, .. } | NodeKind::Split { cursor, .. } => *cursor,
            NodeKind::Tempo(_) => 0,
        };
        Self {
            handle,
            kind,
            volume: Ramp::new(1.0),
            tempo: Ramp::new(0.0),
            pitch: Ramp::new(0.0),
            effects: Vec::with_capacity(MAX_EFFECTS),
            syncs: Vec::with_capacity(MAX_SYNCS),
            ended: false,
            atomics: Arc::new(StreamAtomics::new(position)),
            published: Published {
                position,
                volume: 1.0_f32.to_bits(),
                tempo: 0.0_f32.to_bits(),
                pitch: 0.0_f32.to_bits(),
            },
        }
    }

    /// Readbacks shared with the control side
    pub fn atomics(&self) -> Arc<StreamAtomics> {
        self.atomics.clone()
    }

    pub fn is_tempo(&self) -> bool {
        matches!(self.kind, NodeKind::Tempo(_))
    }

    /// Find this node or a node embedded in it by handle
    pub fn find_mut(&mut self, handle: StreamHandle) -> Option<&mut StreamNode> {
        if self.handle == handle {
            return Some(self);
        }
        match &mut self.kind {
            NodeKind::Tempo(stage) => stage.input.as_mut().and_then(|input| input.find_mut(handle)),
            _ => None,
        }
    }

    /// Read cursor in source frames
    pub fn position(&self) -> u64 {
        match &self.kind {
            NodeKind::Source { cursor, .. } | NodeKind::Split { cursor, .. } => *cursor,
            NodeKind::Tempo(stage) => stage.input.as_ref().map_or(0, |input| input.position()),
        }
    }

    fn store_position(&mut self, frame: u64) {
        self.published.position = frame;
        self.atomics.store_position(frame);
    }

    /// Move the read cursor and clear buffered processing state
    ///
    /// A frame at or past the end parks the node there: the next read is
    /// silent and reports the end.
    pub fn seek(&mut self, frame: u64) {
        match &mut self.kind {
            NodeKind::Source { cursor, .. } | NodeKind::Split { cursor, .. } => {
                *cursor = frame;
                self.store_position(frame);
            }
            NodeKind::Tempo(stage) => {
                if let Some(input) = stage.input.as_mut() {
                    input.seek(frame);
                }
                stage.reset();
            }
        }
        self.reset_effects();
        self.ended = false;
    }

    /// Snap every split of `source` inside this node to `frame`
    ///
    /// Returns the number of splits reset.
    pub fn reset_splits_of(&mut self, source: StreamHandle, frame: u64) -> usize {
        match &mut self.kind {
            NodeKind::Split { source: s, cursor, .. } if *s == source => {
                *cursor = frame;
                self.store_position(frame);
                self.ended = false;
                self.reset_effects();
                1
            }
            NodeKind::Tempo(stage) => {
                let count = stage
                    .input
                    .as_mut()
                    .map_or(0, |input| input.reset_splits_of(source, frame));
                if count > 0 {
                    stage.reset();
                    self.ended = false;
                    self.reset_effects();
                }
                count
            }
            _ => 0,
        }
    }

    fn reset_effects(&mut self) {
        for slot in &mut self.effects {
            slot.effect.reset();
        }
    }

    /// Jump an attribute to a value
    pub fn set_attribute(&mut self, attribute: ChannelAttribute, value: f32) {
        if let Some(ramp) = self.ramp_mut(attribute) {
            ramp.set(value);
            self.store_attribute(attribute, value);
        }
    }

    /// Glide an attribute to a value over `frames` rendered frames
    pub fn slide_attribute(&mut self, attribute: ChannelAttribute, value: f32, frames: u64) {
        if frames == 0 {
            self.set_attribute(attribute, value);
        } else if let Some(ramp) = self.ramp_mut(attribute) {
            ramp.slide(value, frames);
        }
    }

    fn ramp_mut(&mut self, attribute: ChannelAttribute) -> Option<&mut Ramp> {
        match attribute {
            ChannelAttribute::Volume => Some(&mut self.volume),
            ChannelAttribute::Tempo => Some(&mut self.tempo),
            ChannelAttribute::Pitch => Some(&mut self.pitch),
            ChannelAttribute::Frequency => None,
        }
    }

    fn store_attribute(&mut self, attribute: ChannelAttribute, value: f32) {
        let bits = value.to_bits();
        match attribute {
            ChannelAttribute::Volume => self.published.volume = bits,
            ChannelAttribute::Tempo => self.published.tempo = bits,
            ChannelAttribute::Pitch => self.published.pitch = bits,
            ChannelAttribute::Frequency => return,
        }
        self.atomics.store_attribute(attribute, value);
    }

    /// Insert an effect keeping the chain ordered by descending priority
    pub fn insert_effect(&mut self, slot: EffectSlot) {
        let index = self
            .effects
            .iter()
            .position(|existing| existing.priority < slot.priority)
            .unwrap_or(self.effects.len());
        self.effects.insert(index, slot);
    }

    pub fn effect_mut(&mut self, fx: FxHandle) -> Option<&mut EffectSlot> {
        self.effects.iter_mut().find(|slot| slot.handle == fx)
    }

    pub fn remove_effect(&mut self, fx: FxHandle) {
        self.effects.retain(|slot| slot.handle != fx);
    }

    /// Publish readbacks the control side has not overwritten since
    fn publish(&mut self) {
        if let NodeKind::Source { cursor, .. } | NodeKind::Split { cursor, .. } = &self.kind {
            publish_u64(&self.atomics.position, &mut self.published.position, *cursor);
        }
        publish_u32(&self.atomics.volume, &mut self.published.volume, self.volume.current().to_bits());
        publish_u32(&self.atomics.tempo, &mut self.published.tempo, self.tempo.current().to_bits());
        publish_u32(&self.atomics.pitch, &mut self.published.pitch, self.pitch.current().to_bits());
    }

    /// Fill `out` with the next block; returns true once the node is exhausted
    pub fn read(&mut self, out: &mut StereoBuffer) -> bool {
        let frames = out.len() as u64;

        let exhausted = match &mut self.kind {
            NodeKind::Source { frames: data, cursor } | NodeKind::Split { frames: data, cursor, .. } => {
                read_frames(data.as_slice(), cursor, out)
            }
            NodeKind::Tempo(stage) => stage.read(self.tempo.current(), self.pitch.current(), out),
        };

        for slot in &mut self.effects {
            slot.effect.process(out);
        }

        let start = self.volume.current();
        let end = self.volume.peek(frames);
        if start == end {
            if start != 1.0 {
                out.scale(start);
            }
        } else {
            let step = (end - start) / frames.max(1) as f32;
            for (i, sample) in out.iter_mut().enumerate() {
                *sample *= start + step * i as f32;
            }
        }

        self.volume.advance(frames);
        self.tempo.advance(frames);
        self.pitch.advance(frames);
        self.publish();

        exhausted
    }
}

/// Copy frames from a source at `cursor`, padding with silence past the end
///
/// A cursor parked past the end stays where it is.
fn read_frames(data: &[StereoSample], cursor: &mut u64, out: &mut StereoBuffer) -> bool {
    let start = (*cursor).min(data.len() as u64) as usize;
    let count = out.len().min(data.len() - start);

    let dst = out.as_mut_slice();
    dst[..count].copy_from_slice(&data[start..start + count]);
    dst[count..].fill(StereoSample::silence());

    *cursor = (*cursor).max((start + count) as u64);
    start + count >= data.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gc::gc_handle;
    use crate::timestretch::MAX_SPEED;

    fn ramp_frames(len: usize) -> SourceFrames {
        Shared::new(
            &gc_handle(),
            (0..len).map(|i| StereoSample::mono(i as f32)).collect(),
        )
    }

    fn handle(raw: u32) -> StreamHandle {
        StreamHandle::from_raw(raw).unwrap()
    }

    fn tempo_over_split(len: usize) -> StreamNode {
        let split = StreamNode::new(
            handle(2),
            NodeKind::Split {
                source: handle(1),
                frames: ramp_frames(len),
                cursor: 0,
            },
        );
        let mut stage = TempoStage::new(48000);
        stage.attach(Owned::new(&gc_handle(), split));
        StreamNode::new(handle(3), NodeKind::Tempo(Box::new(stage)))
    }

    #[test]
    fn test_source_read_advances_and_pads() {
        let mut node = StreamNode::new(
            handle(1),
            NodeKind::Source {
                frames: ramp_frames(10),
                cursor: 0,
            },
        );

        let mut out = StereoBuffer::silence(6);
        assert!(!node.read(&mut out));
        assert_eq!(out[5].left, 5.0);
        assert_eq!(node.position(), 6);
        assert_eq!(node.atomics().position(), 6);

        assert!(node.read(&mut out));
        assert_eq!(out[3].left, 9.0);
        assert_eq!(out[4].left, 0.0);
        assert_eq!(node.position(), 10);
    }

    #[test]
    fn test_seek_past_end_parks() {
        let mut node = StreamNode::new(
            handle(1),
            NodeKind::Source {
                frames: ramp_frames(10),
                cursor: 0,
            },
        );
        node.seek(14);
        assert_eq!(node.position(), 14);

        let mut out = StereoBuffer::silence(4);
        out.as_mut_slice().fill(StereoSample::mono(1.0));
        assert!(node.read(&mut out));
        assert!(out.iter().all(|s| *s == StereoSample::silence()));
        assert_eq!(node.position(), 14);
        assert_eq!(node.atomics().position(), 14);
    }

    #[test]
    fn test_tempo_unity_is_transparent() {
        let mut tempo = tempo_over_split(100);

        let mut out = StereoBuffer::silence(32);
        tempo.read(&mut out);
        assert_eq!(out[31].left, 31.0);
        assert_eq!(tempo.position(), 32);
    }

    #[test]
    fn test_tempo_double_speed_consumes_twice() {
        let mut tempo = tempo_over_split(10_000);
        tempo.tempo.set(100.0);

        let mut out = StereoBuffer::silence(512);
        tempo.read(&mut out);
        tempo.read(&mut out);
        assert_eq!(tempo.position(), 2048);
    }

    #[test]
    fn test_tempo_fastest_speed_with_large_block() {
        assert_eq!(MAX_SPEED_FACTOR as f64, MAX_SPEED);

        let mut tempo = tempo_over_split(500_000);
        tempo.tempo.set(4900.0);

        let mut out = StereoBuffer::silence(8192);
        assert!(!tempo.read(&mut out));
        assert_eq!(tempo.position(), 409_600);
    }

    #[test]
    fn test_tempo_without_input_is_silent_and_ended() {
        let mut tempo = StreamNode::new(handle(3), NodeKind::Tempo(Box::new(TempoStage::new(48000))));
        let mut out = StereoBuffer::silence(16);
        assert!(tempo.read(&mut out));
        assert_eq!(tempo.position(), 0);
    }

    #[test]
    fn test_volume_ramp_applied_across_block() {
        let frames = Shared::new(&gc_handle(), vec![StereoSample::mono(1.0); 100]);
        let mut node = StreamNode::new(handle(1), NodeKind::Source { frames, cursor: 0 });
        node.set_attribute(ChannelAttribute::Volume, 0.0);
        node.slide_attribute(ChannelAttribute::Volume, 1.0, 10);

        let mut out = StereoBuffer::silence(10);
        node.read(&mut out);
        assert_eq!(out[0].left, 0.0);
        assert!((out[5].left - 0.5).abs() < 1e-6);
        assert_eq!(node.volume.current(), 1.0);
        assert_eq!(node.atomics().attribute(ChannelAttribute::Volume), Some(1.0));
    }

    #[test]
    fn test_control_write_wins_over_stale_publish() {
        let frames = Shared::new(&gc_handle(), vec![StereoSample::mono(1.0); 100]);
        let mut node = StreamNode::new(handle(1), NodeKind::Source { frames, cursor: 0 });
        let atomics = node.atomics();

        // Control wrote through a seek that has not been applied yet
        atomics.store_position(50);
        let mut out = StereoBuffer::silence(10);
        node.read(&mut out);
        assert_eq!(atomics.position(), 50);

        node.seek(50);
        node.read(&mut out);
        assert_eq!(atomics.position(), 60);
    }

    #[test]
    fn test_find_embedded_node() {
        let mut tempo = tempo_over_split(10);
        assert!(tempo.find_mut(handle(2)).is_some());
        assert!(tempo.find_mut(handle(3)).is_some());
        assert!(tempo.find_mut(handle(9)).is_none());
    }
}
