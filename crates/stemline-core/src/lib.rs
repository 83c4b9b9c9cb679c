//! Stemline Core - synchronized multi-stem playback
//!
//! Each stem of a song plays on two locked paths (dry primary and reverb
//! send) derived from one decode source, with tempo, whammy pitch bend and
//! end-of-stream notification dispatched to the control thread.

pub mod audio;
pub mod backend;
pub mod config;
pub mod effect;
pub mod engine;
pub mod timestretch;
pub mod types;

pub use types::*;
