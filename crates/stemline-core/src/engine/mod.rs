//! Stem engine - channels, the stem mixer, end-of-stream dispatch
//!
//! - StemChannel: one stem on a primary path and a reverb-send path
//! - StemMixer: the set of channels of one song, transport broadcast
//! - MainThreadDispatcher: hands audio-thread notifications to the control loop
//! - FadeOut: completion of a fade-out ramp

pub mod channel;
pub mod dispatch;
pub mod fade;
pub mod gc;
pub mod mixer;

pub use channel::*;
pub use dispatch::{DispatchHandle, EndCallback, EndOfStream, EndToken, Job, MainThreadDispatcher, SubscriptionId};
pub use fade::{FadeOut, FadeOutcome, FadeTracker, FADE_EPSILON};
pub use mixer::{channel_ref, ChannelRef, StemMixer};
