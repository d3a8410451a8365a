//! Process-wide backend state shared by every loaded model.
//!
//! The engine backend is initialized when the first model is loaded and torn
//! down when the last one is freed. Models hold a [`BackendRef`], so the count
//! follows model lifetimes and never a single session's.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::InferenceEngine;

/// Reference-counted owner of the engine's process-wide state.
///
/// Create one per process (typically behind a `OnceLock`) and load every
/// model through it.
pub struct Backend<E: InferenceEngine> {
    engine: E,
    numa: bool,
    refs: Mutex<usize>,
    live: AtomicUsize,
}

impl<E: InferenceEngine> Backend<E> {
    pub fn new(engine: E) -> Arc<Self> {
        Self::with_numa(engine, false)
    }

    /// Like [`Backend::new`], requesting NUMA-aware initialization.
    pub fn with_numa(engine: E, numa: bool) -> Arc<Self> {
        Arc::new(Self {
            engine,
            numa,
            refs: Mutex::new(0),
            live: AtomicUsize::new(0),
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Number of models currently holding the backend open.
    pub fn live_models(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.live_models() > 0
    }

    /// Take a reference, initializing the backend on the 0 -> 1 transition.
    ///
    /// The lock is held across `init_backend` so a concurrent acquirer cannot
    /// observe a count of one before initialization has finished.
    pub(crate) fn acquire(self: &Arc<Self>) -> BackendRef<E> {
        let mut refs = self.refs.lock();
        if *refs == 0 {
            debug!(numa = self.numa, "initializing inference backend");
            self.engine.init_backend(self.numa);
        }
        *refs += 1;
        self.live.store(*refs, Ordering::Release);
        BackendRef {
            backend: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut refs = self.refs.lock();
        debug_assert!(*refs > 0, "backend released more often than acquired");
        *refs = refs.saturating_sub(1);
        self.live.store(*refs, Ordering::Release);
        if *refs == 0 {
            debug!("freeing inference backend");
            self.engine.free_backend();
        }
    }
}

impl<E: InferenceEngine> fmt::Debug for Backend<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("numa", &self.numa)
            .field("live_models", &self.live_models())
            .finish()
    }
}

/// One counted reference on a [`Backend`]; dropping it releases the count.
pub(crate) struct BackendRef<E: InferenceEngine> {
    backend: Arc<Backend<E>>,
}

impl<E: InferenceEngine> BackendRef<E> {
    pub(crate) fn engine(&self) -> &E {
        &self.backend.engine
    }
}

impl<E: InferenceEngine> Drop for BackendRef<E> {
    fn drop(&mut self) {
        self.backend.release();
    }
}
