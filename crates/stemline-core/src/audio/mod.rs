//! Audio output through CPAL
//!
//! The CPAL callback thread is the real-time audio thread: it pulls the
//! software backend's mix with `BackendRenderer::render`, which never blocks
//! on control calls. Everything else runs on the control thread.

mod error;
mod output;

pub use error::{AudioError, AudioResult};
pub use output::{output_device_names, start_output, OutputHandle};
