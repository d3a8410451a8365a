//! Interface consumed from the inference engine.
//!
//! The engine owns everything numeric: weight storage, the tokenizer
//! vocabulary and logits computation. This crate only drives it through the
//! [`InferenceEngine`] trait, treating models and contexts as opaque handles.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// A single vocabulary entry as understood by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(pub i32);

impl Token {
    /// Index form of the token, for engines that store vocabularies in a `Vec`.
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

/// Parameters fixed when weights are loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelParams {
    /// Worker threads the engine may use while loading.
    pub threads: usize,
    /// Context capacity the model is expected to serve.
    pub context_capacity: usize,
    /// Memory-map the weight file instead of reading it into memory.
    pub use_mmap: bool,
}

impl ModelParams {
    pub fn new(threads: usize, context_capacity: usize) -> Self {
        Self {
            threads,
            context_capacity,
            use_mmap: true,
        }
    }
}

/// Parameters for allocating a context (compute cache) on a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextParams {
    /// Maximum number of token positions the context can hold.
    pub context_capacity: usize,
    /// Worker threads used by evaluation.
    pub threads: usize,
}

/// Failure codes reported by the engine.
///
/// Each variant maps onto exactly one kind of the crate's error taxonomy, see
/// [`crate::error`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no model file at {0}")]
    InvalidPath(PathBuf),

    #[error("weights rejected: {0}")]
    RejectedWeights(String),

    #[error("cannot allocate a context of {requested} positions")]
    OutOfMemory { requested: usize },

    #[error("token buffer too small: {required} tokens required")]
    TokenBufferTooSmall { required: usize },

    #[error("tokenizer failure: {0}")]
    Tokenizer(String),

    #[error("evaluation failed with code {code}")]
    Evaluation { code: i32 },

    #[error("token {token:?} needs {required} bytes, buffer holds {capacity}")]
    PieceTruncated {
        token: Token,
        required: usize,
        capacity: usize,
    },

    #[error("unknown token {0:?}")]
    UnknownToken(Token),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The numeric engine behind a session.
///
/// Implementations must tolerate concurrent read-only use of a `Model` from
/// several contexts; a `Context` is only ever driven by one caller at a time.
pub trait InferenceEngine: Send + Sync + 'static {
    type Model: Send + Sync;
    type Context: Send;

    /// Process-wide backend initialization. Called once before the first
    /// model is loaded.
    fn init_backend(&self, numa: bool);

    /// Process-wide backend teardown. Called once after the last model is
    /// freed.
    fn free_backend(&self);

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, EngineError>;

    fn free_model(&self, model: Self::Model);

    fn new_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, EngineError>;

    fn free_context(&self, context: Self::Context);

    /// Tokenize `text` into at most `capacity` tokens.
    ///
    /// When the result would not fit, engines report
    /// [`EngineError::TokenBufferTooSmall`] with the count they needed.
    fn tokenize(
        &self,
        model: &Self::Model,
        text: &str,
        add_bos: bool,
        capacity: usize,
    ) -> Result<Vec<Token>, EngineError>;

    /// Evaluate `tokens` starting at position `n_past` of the context.
    fn evaluate(
        &self,
        model: &Self::Model,
        context: &mut Self::Context,
        tokens: &[Token],
        n_past: usize,
        threads: usize,
    ) -> Result<(), EngineError>;

    /// Logits of the last evaluated position, one weight per vocabulary entry.
    fn logits<'a>(&self, context: &'a Self::Context) -> &'a [f32];

    /// Render `token` into `buf`, returning the number of bytes written.
    fn token_to_bytes(
        &self,
        model: &Self::Model,
        token: Token,
        buf: &mut [u8],
    ) -> Result<usize, EngineError>;

    /// Longest byte span any single token renders to.
    fn max_token_bytes(&self, model: &Self::Model) -> usize;

    fn is_eos(&self, model: &Self::Model, token: Token) -> bool;
}
