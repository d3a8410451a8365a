//! Loaded model weights.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendRef};
use crate::engine::{InferenceEngine, ModelParams};
use crate::error::{ModelInUse, ModelLoadError};

/// State shared between a [`ModelHandle`] and the sessions built on it.
pub(crate) struct ModelShared<E: InferenceEngine> {
    // Emptied only by `Drop`.
    raw: Option<E::Model>,
    path: PathBuf,
    params: ModelParams,
    sessions: AtomicUsize,
    // Dropped after `raw` is freed, which may tear the backend down.
    backend: BackendRef<E>,
}

impl<E: InferenceEngine> ModelShared<E> {
    pub(crate) fn raw(&self) -> &E::Model {
        match &self.raw {
            Some(raw) => raw,
            None => unreachable!("model used after free"),
        }
    }

    pub(crate) fn engine(&self) -> &E {
        self.backend.engine()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn attach_session(&self) {
        self.sessions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach_session(&self) {
        self.sessions.fetch_sub(1, Ordering::AcqRel);
    }

    fn live_sessions(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }
}

impl<E: InferenceEngine> Drop for ModelShared<E> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.backend.engine().free_model(raw);
            debug!(path = %self.path.display(), "model freed");
        }
    }
}

/// Exclusive owner of a loaded model.
///
/// Sessions keep the weights alive through an internal reference, so the
/// native model is freed only once the handle *and* every session built from
/// it are gone.
pub struct ModelHandle<E: InferenceEngine> {
    shared: Arc<ModelShared<E>>,
}

impl<E: InferenceEngine> ModelHandle<E> {
    /// Load weights from `path`, initializing the backend if this is the first
    /// live model.
    ///
    /// On failure the backend reference taken for the load is returned, so a
    /// failed load never keeps the backend initialized.
    pub fn load(
        backend: &Arc<Backend<E>>,
        path: impl AsRef<Path>,
        params: ModelParams,
    ) -> Result<Self, ModelLoadError> {
        let path = path.as_ref().to_path_buf();
        let backend_ref = backend.acquire();

        let raw = backend_ref
            .engine()
            .load_model(&path, &params)
            .map_err(|e| ModelLoadError::from_engine(path.clone(), e))?;

        info!(path = %path.display(), threads = params.threads, "model loaded");
        Ok(Self {
            shared: Arc::new(ModelShared {
                raw: Some(raw),
                path,
                params,
                sessions: AtomicUsize::new(0),
                backend: backend_ref,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn params(&self) -> &ModelParams {
        &self.shared.params
    }

    /// Sessions currently built on this model.
    pub fn live_sessions(&self) -> usize {
        self.shared.live_sessions()
    }

    /// Release the model, refusing while sessions still reference it.
    ///
    /// A refused release hands the handle back. Dropping the handle instead
    /// defers the free until the last session is released.
    pub fn release(self) -> Result<(), (Self, ModelInUse)> {
        let sessions = self.live_sessions();
        if sessions > 0 {
            warn!(path = %self.path().display(), sessions, "model release refused");
            let err = ModelInUse {
                path: self.path().to_path_buf(),
                sessions,
            };
            return Err((self, err));
        }
        drop(self);
        Ok(())
    }

    pub(crate) fn shared(&self) -> &Arc<ModelShared<E>> {
        &self.shared
    }
}

impl<E: InferenceEngine> fmt::Debug for ModelHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("path", &self.shared.path)
            .field("params", &self.shared.params)
            .field("live_sessions", &self.live_sessions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{ReferenceEngine, ReferenceWeights};
    use tempfile::NamedTempFile;

    fn model_file() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        ReferenceWeights::random(ReferenceWeights::demo_vocab(), 8, 2)
            .save(file.path())
            .unwrap();
        file
    }

    #[test]
    fn test_model_freed_once_on_release() {
        let file = model_file();
        let backend = Backend::new(ReferenceEngine::new());
        let model = ModelHandle::load(&backend, file.path(), ModelParams::new(1, 32)).unwrap();
        assert_eq!(model.live_sessions(), 0);
        assert_eq!(model.shared().raw().vocab().len(), 55);

        model.release().unwrap();
        assert_eq!(backend.engine().models_loaded(), 1);
        assert_eq!(backend.engine().models_freed(), 1);
        assert!(!backend.is_initialized());
    }

    #[test]
    fn test_failed_load_frees_nothing() {
        let backend = Backend::new(ReferenceEngine::new());
        let err = ModelHandle::load(&backend, "/no/model.q8", ModelParams::new(1, 32)).unwrap_err();
        assert!(matches!(err, ModelLoadError::NotFound { .. }));
        assert_eq!(backend.engine().models_freed(), 0);
        assert_eq!(backend.engine().backend_inits(), backend.engine().backend_frees());
    }
}
