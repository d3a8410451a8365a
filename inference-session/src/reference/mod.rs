//! A small pure-Rust engine: a quantized embedding and output head over a
//! whitespace vocabulary.
//!
//! Logits depend only on the last evaluated token, so it is a bigram model.
//! It exists to drive sessions end to end without a native library and keeps
//! counters of every lifecycle call so callers can check acquire/release
//! symmetry.

pub mod vocab;
pub mod weights;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{Array1, Array2};
use tracing::debug;

use crate::engine::{ContextParams, EngineError, InferenceEngine, ModelParams, Token};

pub use vocab::Vocab;
pub use weights::{QuantizedMatrix, ReferenceWeights};

/// Dequantized weights ready for evaluation.
pub struct ReferenceModel {
    vocab: Vocab,
    bos: usize,
    eos: usize,
    embedding: Array2<f32>,
    head: Array2<f32>,
    bias: Option<Array1<f32>>,
    max_piece: usize,
}

impl ReferenceModel {
    pub fn from_weights(weights: ReferenceWeights) -> Self {
        let bias = weights.bias_array();
        Self {
            max_piece: weights.vocab.max_render_len(),
            embedding: weights.embedding.dequantize(),
            head: weights.head.dequantize(),
            bias,
            bos: weights.bos,
            eos: weights.eos,
            vocab: weights.vocab,
        }
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn bos(&self) -> Token {
        Token(self.bos as i32)
    }

    pub fn eos(&self) -> Token {
        Token(self.eos as i32)
    }

    fn logits_for(&self, id: usize, out: &mut Vec<f32>) {
        let mut y = self.head.dot(&self.embedding.row(id));
        if let Some(bias) = &self.bias {
            y += bias;
        }
        out.clear();
        out.extend(y.iter().copied());
    }

    fn check(&self, token: Token) -> Result<usize, EngineError> {
        token
            .index()
            .filter(|&id| id < self.vocab.len())
            .ok_or(EngineError::UnknownToken(token))
    }
}

/// Evaluated positions and the logits of the last one.
pub struct ReferenceContext {
    cache: Vec<Token>,
    capacity: usize,
    logits: Vec<f32>,
}

impl ReferenceContext {
    pub fn evaluated(&self) -> &[Token] {
        &self.cache
    }
}

#[derive(Debug, Default)]
pub struct ReferenceEngine {
    backend_inits: AtomicUsize,
    backend_frees: AtomicUsize,
    models_loaded: AtomicUsize,
    models_freed: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_freed: AtomicUsize,
    evaluations: AtomicUsize,
}

impl ReferenceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend_inits(&self) -> usize {
        self.backend_inits.load(Ordering::Acquire)
    }

    pub fn backend_frees(&self) -> usize {
        self.backend_frees.load(Ordering::Acquire)
    }

    pub fn models_loaded(&self) -> usize {
        self.models_loaded.load(Ordering::Acquire)
    }

    pub fn models_freed(&self) -> usize {
        self.models_freed.load(Ordering::Acquire)
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::Acquire)
    }

    pub fn contexts_freed(&self) -> usize {
        self.contexts_freed.load(Ordering::Acquire)
    }

    /// Total `evaluate` calls, successful or not.
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Acquire)
    }
}

impl InferenceEngine for ReferenceEngine {
    type Model = ReferenceModel;
    type Context = ReferenceContext;

    fn init_backend(&self, numa: bool) {
        debug!(numa, "reference backend up");
        self.backend_inits.fetch_add(1, Ordering::AcqRel);
    }

    fn free_backend(&self) {
        debug!("reference backend down");
        self.backend_frees.fetch_add(1, Ordering::AcqRel);
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<ReferenceModel, EngineError> {
        let weights = ReferenceWeights::load(path, params.use_mmap)?;
        self.models_loaded.fetch_add(1, Ordering::AcqRel);
        Ok(ReferenceModel::from_weights(weights))
    }

    fn free_model(&self, model: ReferenceModel) {
        drop(model);
        self.models_freed.fetch_add(1, Ordering::AcqRel);
    }

    fn new_context(
        &self,
        model: &ReferenceModel,
        params: &ContextParams,
    ) -> Result<ReferenceContext, EngineError> {
        let requested = params.context_capacity;
        let mut cache = Vec::new();
        cache
            .try_reserve_exact(requested)
            .map_err(|_| EngineError::OutOfMemory { requested })?;
        self.contexts_created.fetch_add(1, Ordering::AcqRel);
        Ok(ReferenceContext {
            cache,
            capacity: requested,
            logits: Vec::with_capacity(model.vocab.len()),
        })
    }

    fn free_context(&self, context: ReferenceContext) {
        drop(context);
        self.contexts_freed.fetch_add(1, Ordering::AcqRel);
    }

    fn tokenize(
        &self,
        model: &ReferenceModel,
        text: &str,
        add_bos: bool,
        capacity: usize,
    ) -> Result<Vec<Token>, EngineError> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(model.bos());
        }
        tokens.extend(model.vocab.encode(text).into_iter().map(|id| Token(id as i32)));
        if tokens.len() > capacity {
            return Err(EngineError::TokenBufferTooSmall {
                required: tokens.len(),
            });
        }
        Ok(tokens)
    }

    fn evaluate(
        &self,
        model: &ReferenceModel,
        context: &mut ReferenceContext,
        tokens: &[Token],
        n_past: usize,
        _threads: usize,
    ) -> Result<(), EngineError> {
        self.evaluations.fetch_add(1, Ordering::AcqRel);
        let Some(&last) = tokens.last() else {
            return Err(EngineError::Evaluation { code: -1 });
        };
        if n_past > context.cache.len() {
            return Err(EngineError::Evaluation { code: -2 });
        }
        if n_past + tokens.len() > context.capacity {
            return Err(EngineError::Evaluation { code: 1 });
        }
        // Validate everything before touching the cache so a failure leaves it intact.
        for &token in tokens {
            model.check(token)?;
        }
        let last = model.check(last)?;

        context.cache.truncate(n_past);
        context.cache.extend_from_slice(tokens);
        model.logits_for(last, &mut context.logits);
        Ok(())
    }

    fn logits<'a>(&self, context: &'a ReferenceContext) -> &'a [f32] {
        &context.logits
    }

    fn token_to_bytes(
        &self,
        model: &ReferenceModel,
        token: Token,
        buf: &mut [u8],
    ) -> Result<usize, EngineError> {
        let id = model.check(token)?;
        let bytes = model.vocab.render(id).ok_or(EngineError::UnknownToken(token))?;
        if bytes.len() > buf.len() {
            return Err(EngineError::PieceTruncated {
                token,
                required: bytes.len(),
                capacity: buf.len(),
            });
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn max_token_bytes(&self, model: &ReferenceModel) -> usize {
        model.max_piece
    }

    fn is_eos(&self, model: &ReferenceModel, token: Token) -> bool {
        token == model.eos()
    }
}
