//! Inference sessions over an opaque language-model engine.
//!
//! A [`Backend`] owns the engine's process-wide state, [`ModelHandle`]s own
//! loaded weights and each [`Session`] owns one context on a model. A session
//! turns a prompt into text by evaluating the prompt, then sampling, decoding
//! and re-evaluating one token at a time until a [`StopReason`] fires.
//!
//! The [`reference`] module provides a small pure-Rust engine used by the
//! binaries and tests.

pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod generate;
pub mod model;
pub mod reference;
pub mod sampling;
mod tokenize;

pub use backend::Backend;
pub use config::SessionConfig;
pub use context::{Session, SessionState};
pub use engine::{ContextParams, EngineError, InferenceEngine, ModelParams, Token};
pub use error::{
    ConfigError, ConstructionError, ContextCreationError, GenerationError, ModelInUse,
    ModelLoadError,
};
pub use generate::{CancelToken, GenerationRequest, GenerationResult, StopReason};
pub use model::ModelHandle;
pub use sampling::{Sampler, SamplingConfig};
