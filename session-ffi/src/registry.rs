use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use inference_session::{
    Backend, ConstructionError, GenerationError, GenerationRequest, GenerationResult,
    InferenceEngine, Session,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no live session with handle {0}")]
    InvalidHandle(u64),

    /// Another thread is generating on this session.
    #[error("session {0} is busy")]
    Busy(u64),

    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// Live sessions keyed by handle, all sharing one backend.
pub struct SessionRegistry<E: InferenceEngine> {
    backend: Arc<Backend<E>>,
    sessions: Mutex<HashMap<u64, Arc<Mutex<Session<E>>>>>,
}

impl<E: InferenceEngine> SessionRegistry<E> {
    pub fn new(backend: Arc<Backend<E>>) -> Self {
        Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<Backend<E>> {
        &self.backend
    }

    pub fn construct(
        &self,
        model_path: impl AsRef<Path>,
        threads: usize,
        context_capacity: usize,
    ) -> Result<u64, RegistryError> {
        let session = Session::construct(&self.backend, model_path, threads, context_capacity)?;
        let id = session.id();
        self.sessions
            .lock()
            .insert(id, Arc::new(Mutex::new(session)));
        debug!(session = id, "session registered");
        Ok(id)
    }

    /// Run `request` on session `id`.
    ///
    /// Fails with [`RegistryError::Busy`] rather than queueing when another
    /// call is already generating on the same session.
    pub fn generate(
        &self,
        id: u64,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, RegistryError> {
        let session = self.get(id)?;
        let mut session = session.try_lock().ok_or(RegistryError::Busy(id))?;
        Ok(session.generate(request)?)
    }

    /// Remove session `id` and free it, waiting for an in-flight generate call
    /// to finish first.
    pub fn release(&self, id: u64) -> Result<(), RegistryError> {
        let session = self
            .sessions
            .lock()
            .remove(&id)
            .ok_or(RegistryError::InvalidHandle(id))?;
        session.lock().release();
        debug!(session = id, "session unregistered");
        Ok(())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, id: u64) -> Result<Arc<Mutex<Session<E>>>, RegistryError> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::InvalidHandle(id))
    }
}
