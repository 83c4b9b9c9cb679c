//! Audio-thread half of the software backend
//!
//! [`BackendRenderer`] owns every stream node. It is moved into the output
//! callback (or driven directly by an offline render loop) and never shares
//! a lock with control calls: those reach it only through the command queue.

use basedrop::Owned;

use crate::backend::{EndSyncCallback, StreamHandle};
use crate::types::{StereoBuffer, MAX_BUFFER_SIZE};

use super::command::{BackendCommand, MAX_STREAMS};
use super::node::{EffectSlot, NodeKind, StreamNode, MAX_SYNCS};

/// Renders the mix of every plugged stream
pub struct BackendRenderer {
    sample_rate: u32,
    commands: rtrb::Consumer<BackendCommand>,
    /// Top-level nodes by slot; embedded tempo inputs live inside their owner
    slots: Vec<Option<Owned<StreamNode>>>,
    /// Slots pulled by `render`, in plug order
    mixer: Vec<usize>,
    /// Per-stream render scratch
    block: StereoBuffer,
    /// End syncs collected during a render pass
    fired: Vec<EndSyncCallback>,
}

impl BackendRenderer {
    pub(super) fn new(sample_rate: u32, commands: rtrb::Consumer<BackendCommand>) -> Self {
        Self {
            sample_rate,
            commands,
            slots: (0..MAX_STREAMS).map(|_| None).collect(),
            mixer: Vec::with_capacity(MAX_STREAMS),
            block: StereoBuffer::silence(MAX_BUFFER_SIZE),
            fired: Vec::with_capacity(MAX_STREAMS * MAX_SYNCS),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn node_mut(&mut self, slot: usize, stream: StreamHandle) -> Option<&mut StreamNode> {
        self.slots
            .get_mut(slot)
            .and_then(|node| node.as_mut())
            .and_then(|node| node.find_mut(stream))
    }

    /// Apply every queued control command
    fn process_commands(&mut self) {
        while let Ok(cmd) = self.commands.pop() {
            match cmd {
                BackendCommand::Insert { slot, node } => {
                    if let Some(entry) = self.slots.get_mut(slot) {
                        *entry = Some(node);
                    }
                }
                BackendCommand::WrapTempo { slot, input_slot, mut node } => {
                    let input = self.slots.get_mut(input_slot).and_then(Option::take);
                    self.mixer.retain(|s| *s != input_slot);
                    if let (NodeKind::Tempo(stage), Some(input)) = (&mut node.kind, input) {
                        stage.attach(input);
                    }
                    if let Some(entry) = self.slots.get_mut(slot) {
                        *entry = Some(node);
                    }
                }
                BackendCommand::Free { slot } => {
                    self.mixer.retain(|s| *s != slot);
                    if let Some(entry) = self.slots.get_mut(slot) {
                        // Owned nodes are reclaimed by the collector thread
                        *entry = None;
                    }
                }
                BackendCommand::Plug { slot } => {
                    if !self.mixer.contains(&slot) && self.mixer.len() < self.mixer.capacity() {
                        self.mixer.push(slot);
                    }
                }
                BackendCommand::SetAttribute {
                    slot,
                    stream,
                    attribute,
                    value,
                } => {
                    if let Some(node) = self.node_mut(slot, stream) {
                        node.set_attribute(attribute, value);
                    }
                }
                BackendCommand::SlideAttribute {
                    slot,
                    stream,
                    attribute,
                    value,
                    frames,
                } => {
                    if let Some(node) = self.node_mut(slot, stream) {
                        node.slide_attribute(attribute, value, frames);
                    }
                }
                BackendCommand::AttachFx {
                    slot,
                    stream,
                    fx,
                    priority,
                    effect,
                } => {
                    if let Some(node) = self.node_mut(slot, stream) {
                        if node.effects.len() < node.effects.capacity() {
                            node.insert_effect(EffectSlot {
                                handle: fx,
                                priority,
                                effect,
                            });
                        }
                    }
                }
                BackendCommand::SetFxParams {
                    slot,
                    stream,
                    fx,
                    params,
                } => {
                    if let Some(effect) = self.node_mut(slot, stream).and_then(|node| node.effect_mut(fx)) {
                        // Validated before queueing
                        let _ = effect.effect.set_params(&params);
                    }
                }
                BackendCommand::RemoveFx { slot, stream, fx } => {
                    if let Some(node) = self.node_mut(slot, stream) {
                        node.remove_effect(fx);
                    }
                }
                BackendCommand::Seek {
                    slot,
                    stream,
                    frame,
                    source,
                } => {
                    if let Some(node) = self.node_mut(slot, stream) {
                        node.seek(frame);
                    }
                    if let Some((source_slot, source)) = source {
                        if let Some(node) = self.node_mut(source_slot, source) {
                            node.seek(frame);
                        }
                    }
                }
                BackendCommand::ResetSplits { source_slot, source } => {
                    let Some(frame) = self.node_mut(source_slot, source).map(|n| n.position()) else {
                        continue;
                    };
                    for node in self.slots.iter_mut().flatten() {
                        node.reset_splits_of(source, frame);
                    }
                }
                BackendCommand::AddSync { slot, stream, callback } => {
                    if let Some(node) = self.node_mut(slot, stream) {
                        if node.syncs.len() < node.syncs.capacity() {
                            node.syncs.push(callback);
                        }
                    }
                }
            }
        }
    }

    /// Render the mix of every plugged stream into `out`
    ///
    /// Queued commands are applied first. End syncs of streams that reached
    /// their end during this block run after mixing.
    pub fn render(&mut self, out: &mut StereoBuffer) {
        self.process_commands();
        out.fill_silence();

        let total = out.len();
        let mut offset = 0;
        while offset < total {
            let len = (total - offset).min(MAX_BUFFER_SIZE);
            self.block.set_len_from_capacity(len);

            for &slot in &self.mixer {
                let Some(node) = self.slots.get_mut(slot).and_then(|n| n.as_mut()) else {
                    continue;
                };
                let exhausted = node.read(&mut self.block);

                for (dst, src) in out.as_mut_slice()[offset..offset + len]
                    .iter_mut()
                    .zip(self.block.iter())
                {
                    *dst += *src;
                }

                if exhausted && !node.ended {
                    node.ended = true;
                    self.fired.extend(node.syncs.iter().cloned());
                }
            }
            offset += len;
        }

        for callback in self.fired.drain(..) {
            callback();
        }
    }
}
