//! A scripted engine for driving sessions through exact token sequences and
//! injected failures.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use inference_session::{ContextParams, EngineError, InferenceEngine, ModelParams, Token};

pub const UNK: Token = Token(0);
pub const BOS: Token = Token(1);
pub const EOS: Token = Token(2);
pub const HELLO: Token = Token(3);
pub const WORLD: Token = Token(4);
pub const USER: Token = Token(5);
pub const OK: Token = Token(6);
/// Renders to more bytes than `max_token_bytes` admits.
pub const LONG: Token = Token(7);
/// Script entry producing logits with nothing drawable.
pub const NOTHING: Token = Token(-1);

const PIECES: [&str; 8] = ["?", "", "", " hello", " world", " User:", " ok", ""];
const LONG_PIECE_LEN: usize = 32;
const MAX_TOKEN_BYTES: usize = 8;

pub struct ScriptedModel {
    pub path: PathBuf,
}

pub struct ScriptedContext {
    capacity: usize,
    evaluated: usize,
    step: usize,
    logits: Vec<f32>,
}

/// Engine whose "model" predicts `script` in order, one entry per evaluate
/// call, then repeats `OK`.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Vec<Token>,
    fail_eval_at: Option<usize>,
    max_context: Option<usize>,
    pub backend_inits: AtomicUsize,
    pub backend_frees: AtomicUsize,
    pub models_loaded: AtomicUsize,
    pub models_freed: AtomicUsize,
    pub contexts_created: AtomicUsize,
    pub contexts_freed: AtomicUsize,
    pub evaluations: AtomicUsize,
    /// `(n_past, token count)` of every evaluate call.
    pub eval_log: Mutex<Vec<(usize, usize)>>,
}

impl ScriptedEngine {
    pub fn new(script: &[Token]) -> Self {
        Self {
            script: script.to_vec(),
            ..Default::default()
        }
    }

    /// Fail the `n`-th evaluate call (0-based, counted across all contexts).
    pub fn failing_eval_at(mut self, n: usize) -> Self {
        self.fail_eval_at = Some(n);
        self
    }

    /// Refuse contexts larger than `positions`.
    pub fn with_max_context(mut self, positions: usize) -> Self {
        self.max_context = Some(positions);
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn evals(&self) -> usize {
        Self::count(&self.evaluations)
    }

    pub fn last_eval(&self) -> Option<(usize, usize)> {
        self.eval_log.lock().last().copied()
    }

    pub fn balanced(&self) -> bool {
        Self::count(&self.backend_inits) == Self::count(&self.backend_frees)
            && Self::count(&self.models_loaded) == Self::count(&self.models_freed)
            && Self::count(&self.contexts_created) == Self::count(&self.contexts_freed)
    }

    fn predict(&self, step: usize, logits: &mut Vec<f32>) {
        let next = self.script.get(step).copied().unwrap_or(OK);
        logits.clear();
        logits.resize(PIECES.len(), f32::NEG_INFINITY);
        if let Some(id) = next.index() {
            logits[id] = 0.0;
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    type Model = ScriptedModel;
    type Context = ScriptedContext;

    fn init_backend(&self, _numa: bool) {
        self.backend_inits.fetch_add(1, Ordering::SeqCst);
    }

    fn free_backend(&self) {
        self.backend_frees.fetch_add(1, Ordering::SeqCst);
    }

    fn load_model(&self, path: &Path, _params: &ModelParams) -> Result<ScriptedModel, EngineError> {
        let name = path.to_string_lossy();
        if name.contains("missing") {
            return Err(EngineError::InvalidPath(path.to_path_buf()));
        }
        if name.contains("corrupt") {
            return Err(EngineError::RejectedWeights("bad magic".into()));
        }
        self.models_loaded.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedModel {
            path: path.to_path_buf(),
        })
    }

    fn free_model(&self, _model: ScriptedModel) {
        self.models_freed.fetch_add(1, Ordering::SeqCst);
    }

    fn new_context(
        &self,
        _model: &ScriptedModel,
        params: &ContextParams,
    ) -> Result<ScriptedContext, EngineError> {
        if self
            .max_context
            .is_some_and(|max| params.context_capacity > max)
        {
            return Err(EngineError::OutOfMemory {
                requested: params.context_capacity,
            });
        }
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedContext {
            capacity: params.context_capacity,
            evaluated: 0,
            step: 0,
            logits: Vec::new(),
        })
    }

    fn free_context(&self, _context: ScriptedContext) {
        self.contexts_freed.fetch_add(1, Ordering::SeqCst);
    }

    fn tokenize(
        &self,
        _model: &ScriptedModel,
        text: &str,
        add_bos: bool,
        capacity: usize,
    ) -> Result<Vec<Token>, EngineError> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS);
        }
        for word in text.split_whitespace() {
            let piece = format!(" {word}");
            let id = PIECES[3..7]
                .iter()
                .position(|p| *p == piece)
                .map_or(UNK, |i| Token(i as i32 + 3));
            tokens.push(id);
        }
        if tokens.len() > capacity {
            return Err(EngineError::TokenBufferTooSmall {
                required: tokens.len(),
            });
        }
        Ok(tokens)
    }

    fn evaluate(
        &self,
        _model: &ScriptedModel,
        context: &mut ScriptedContext,
        tokens: &[Token],
        n_past: usize,
        _threads: usize,
    ) -> Result<(), EngineError> {
        let call = self.evaluations.fetch_add(1, Ordering::SeqCst);
        self.eval_log.lock().push((n_past, tokens.len()));
        if self.fail_eval_at == Some(call) {
            return Err(EngineError::Evaluation { code: 1 });
        }
        if n_past > context.evaluated || n_past + tokens.len() > context.capacity {
            return Err(EngineError::Evaluation { code: 2 });
        }
        context.evaluated = n_past + tokens.len();
        self.predict(context.step, &mut context.logits);
        context.step += 1;
        Ok(())
    }

    fn logits<'a>(&self, context: &'a ScriptedContext) -> &'a [f32] {
        &context.logits
    }

    fn token_to_bytes(
        &self,
        _model: &ScriptedModel,
        token: Token,
        buf: &mut [u8],
    ) -> Result<usize, EngineError> {
        if token == LONG {
            return Err(EngineError::PieceTruncated {
                token,
                required: LONG_PIECE_LEN,
                capacity: buf.len(),
            });
        }
        let piece = token
            .index()
            .and_then(|i| PIECES.get(i))
            .ok_or(EngineError::UnknownToken(token))?;
        buf[..piece.len()].copy_from_slice(piece.as_bytes());
        Ok(piece.len())
    }

    fn max_token_bytes(&self, _model: &ScriptedModel) -> usize {
        MAX_TOKEN_BYTES
    }

    fn is_eos(&self, _model: &ScriptedModel, token: Token) -> bool {
        token == EOS
    }
}
