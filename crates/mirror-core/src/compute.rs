//! Process-wide acceleration context.
//!
//! Inference backends share one context per process. It is created when the
//! first engine acquires it and torn down when the last engine releases it,
//! so its lifetime is always scoped to live engines.

use parking_lot::{const_mutex, Mutex};

static ACTIVE: Mutex<usize> = const_mutex(0);

/// RAII handle on the shared acceleration context.
#[derive(Debug)]
pub struct ComputeContext {
    _private: (),
}

impl ComputeContext {
    pub fn acquire() -> Self {
        let mut active = ACTIVE.lock();
        if *active == 0 {
            tracing::info!("compute context created");
        }
        *active += 1;
        tracing::debug!(holders = *active, "compute context acquired");
        Self { _private: () }
    }

    /// Number of live handles across the process.
    pub fn holders() -> usize {
        *ACTIVE.lock()
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        let mut active = ACTIVE.lock();
        *active = active.saturating_sub(1);
        tracing::debug!(holders = *active, "compute context released");
        if *active == 0 {
            tracing::info!("compute context destroyed");
        }
    }
}
