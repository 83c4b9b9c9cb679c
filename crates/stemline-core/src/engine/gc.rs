//! RT-safe deferred deallocation for audio-thread data
//!
//! Decoded sources are held in `basedrop::Shared`; stream nodes and effect
//! instances handed to the renderer are `basedrop::Owned`. Both are created
//! against a global collector. When the audio thread drops one (a freed
//! stream, a removed effect, the last split of a source), the allocation is
//! only enqueued; a background thread frees it later, so the render callback
//! never calls into the allocator.
//!
//! ```ignore
//! use basedrop::Shared;
//! use crate::engine::gc::gc_handle;
//!
//! let samples = Shared::new(&gc_handle(), decoded);
//! let split_view = samples.clone();
//! drop(samples);
//! drop(split_view); // queued for the GC thread
//! ```

use basedrop::{Collector, Handle};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Global handle for creating `Shared<T>` allocations
static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

/// Interval between collection passes
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

/// Create the collector and move it onto its own thread
fn init_gc() -> Handle {
    let mut collector = Collector::new();
    let handle = collector.handle();

    let spawned = thread::Builder::new()
        .name("stemline-gc".to_string())
        .spawn(move || {
            log::info!("[GC] Collector thread started");
            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        });

    if let Err(e) = spawned {
        // Allocations made through the handle are leaked instead of freed
        log::error!("[GC] Failed to spawn collector thread: {}", e);
    }

    handle
}

/// Get a handle for creating `Shared<T>` allocations
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;

    #[test]
    fn test_shared_clone_and_drop() {
        let data = Shared::new(&gc_handle(), vec![0.5f32; 1024]);
        let view = data.clone();
        drop(data);
        assert_eq!(view.len(), 1024);
        assert_eq!(view[1023], 0.5);
    }
}
