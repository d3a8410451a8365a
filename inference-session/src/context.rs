//! Sessions: one engine context (compute cache and cursor) on a shared model.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::Backend;
use crate::engine::{ContextParams, InferenceEngine, ModelParams, Token};
use crate::error::{ConstructionError, ContextCreationError, GenerationError};
use crate::model::{ModelHandle, ModelShared};
use crate::tokenize;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    /// An evaluation failed and the engine cursor can no longer be trusted.
    Poisoned,
    Released,
}

/// Native resources held by a session until it is released.
pub(crate) struct Live<E: InferenceEngine> {
    pub(crate) model: Arc<ModelShared<E>>,
    pub(crate) context: E::Context,
}

/// A context on a loaded model, driven by one generate call at a time.
///
/// `generate` takes `&mut self`, so concurrent calls on one session do not
/// compile; distinct sessions may run on different threads.
pub struct Session<E: InferenceEngine> {
    id: u64,
    pub(crate) live: Option<Live<E>>,
    pub(crate) params: ContextParams,
    pub(crate) cursor: usize,
    pub(crate) poisoned: bool,
}

impl<E: InferenceEngine> Session<E> {
    /// Allocate a context on `model`.
    ///
    /// On failure the model is untouched and still owned by the caller.
    pub fn new(model: &ModelHandle<E>, params: ContextParams) -> Result<Self, ContextCreationError> {
        let shared = Arc::clone(model.shared());
        let context = shared.engine().new_context(shared.raw(), &params)?;
        shared.attach_session();

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            session = id,
            capacity = params.context_capacity,
            threads = params.threads,
            "context created"
        );
        Ok(Self {
            id,
            live: Some(Live {
                model: shared,
                context,
            }),
            params,
            cursor: 0,
            poisoned: false,
        })
    }

    /// Load a model and open a session on it in one step.
    ///
    /// The session owns the only reference to the model, so releasing the
    /// session frees the model and, if it was the last one, the backend. A
    /// context failure unwinds the model load before returning.
    pub fn construct(
        backend: &Arc<Backend<E>>,
        model_path: impl AsRef<Path>,
        threads: usize,
        context_capacity: usize,
    ) -> Result<Self, ConstructionError> {
        if threads == 0 {
            return Err(ConstructionError::InvalidArgument("threads must be positive"));
        }
        if context_capacity == 0 {
            return Err(ConstructionError::InvalidArgument(
                "context capacity must be positive",
            ));
        }

        let model = ModelHandle::load(
            backend,
            model_path,
            ModelParams::new(threads, context_capacity),
        )?;
        let session = Session::new(
            &model,
            ContextParams {
                context_capacity,
                threads,
            },
        )?;
        info!(session = session.id, path = %model.path().display(), "session constructed");
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn threads(&self) -> usize {
        self.params.threads
    }

    pub fn capacity(&self) -> usize {
        self.params.context_capacity
    }

    /// Next position to be evaluated.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Positions still free in the context window.
    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.cursor)
    }

    pub fn state(&self) -> SessionState {
        if self.live.is_none() {
            SessionState::Released
        } else if self.poisoned {
            SessionState::Poisoned
        } else {
            SessionState::Ready
        }
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.live.as_ref().map(|live| live.model.path())
    }

    /// Tokenize `text` as a fresh prompt, bounded by this session's capacity.
    pub fn tokenize(&self, text: &str) -> Result<Vec<Token>, GenerationError> {
        let live = self.live.as_ref().ok_or(GenerationError::SessionReleased)?;
        tokenize::tokenize_prompt(
            live.model.engine(),
            live.model.raw(),
            text,
            true,
            0,
            self.capacity(),
        )
    }

    /// Forget evaluated positions; the next request starts at position 0.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Free the context and drop this session's reference to the model.
    ///
    /// Returns `false` if the session was already released.
    pub fn release(&mut self) -> bool {
        let Some(Live { model, context }) = self.live.take() else {
            return false;
        };
        model.engine().free_context(context);
        model.detach_session();
        debug!(session = self.id, "context freed");
        drop(model);
        true
    }
}

impl<E: InferenceEngine> Drop for Session<E> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<E: InferenceEngine> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cursor", &self.cursor)
            .field("capacity", &self.params.context_capacity)
            .field("threads", &self.params.threads)
            .finish()
    }
}
