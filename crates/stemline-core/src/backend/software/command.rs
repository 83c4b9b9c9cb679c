//! Lock-free command queue from the control side to the renderer
//!
//! Control calls validate against the registry, build whatever the audio
//! thread needs (nodes, effect instances) and push a command. The renderer
//! drains the queue at the start of every block, so applying a command never
//! allocates or frees on the audio thread: everything it drops is `Owned`
//! and goes to the collector.

use basedrop::Owned;

use crate::backend::{ChannelAttribute, EffectParams, EndSyncCallback, FxHandle, StreamHandle};
use crate::effect::StreamEffect;

use super::node::StreamNode;

/// Commands the queue holds before control calls report it as full
pub const COMMAND_QUEUE_CAPACITY: usize = 4096;

/// Top-level node slots the renderer preallocates
pub const MAX_STREAMS: usize = 256;

/// Commands sent from control threads to the renderer
///
/// `slot` is always the top-level slot; `stream` picks the node inside it
/// when the target is embedded in a tempo stream.
pub enum BackendCommand {
    /// Place a new top-level node
    Insert { slot: usize, node: Owned<StreamNode> },
    /// Place a tempo node and move the node in `input_slot` into it
    WrapTempo {
        slot: usize,
        input_slot: usize,
        node: Owned<StreamNode>,
    },
    /// Drop a top-level node and everything embedded in it
    Free { slot: usize },
    /// Pull the node into the output mix
    Plug { slot: usize },
    SetAttribute {
        slot: usize,
        stream: StreamHandle,
        attribute: ChannelAttribute,
        value: f32,
    },
    SlideAttribute {
        slot: usize,
        stream: StreamHandle,
        attribute: ChannelAttribute,
        value: f32,
        frames: u64,
    },
    AttachFx {
        slot: usize,
        stream: StreamHandle,
        fx: FxHandle,
        priority: i32,
        effect: Owned<Box<dyn StreamEffect>>,
    },
    /// Parameters are validated before they are queued
    SetFxParams {
        slot: usize,
        stream: StreamHandle,
        fx: FxHandle,
        params: EffectParams,
    },
    RemoveFx {
        slot: usize,
        stream: StreamHandle,
        fx: FxHandle,
    },
    /// Move a cursor; a split's source (slot, handle) follows it
    Seek {
        slot: usize,
        stream: StreamHandle,
        frame: u64,
        source: Option<(usize, StreamHandle)>,
    },
    /// Snap every split of `source` to the source cursor
    ResetSplits { source_slot: usize, source: StreamHandle },
    AddSync {
        slot: usize,
        stream: StreamHandle,
        callback: EndSyncCallback,
    },
}

/// Create the control/renderer command queue
pub fn command_channel() -> (rtrb::Producer<BackendCommand>, rtrb::Consumer<BackendCommand>) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}
