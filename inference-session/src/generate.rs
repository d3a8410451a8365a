//! The generation loop: prompt evaluation, then sample / decode / evaluate one
//! token at a time until a stop condition fires.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::context::{Live, Session};
use crate::engine::InferenceEngine;
use crate::error::GenerationError;
use crate::sampling::{Sampler, SamplingConfig};
use crate::tokenize;

/// Generation budget used when none is configured.
pub const DEFAULT_MAX_TOKENS: usize = 256;

/// Shared flag a caller sets to stop a running request.
///
/// Checked at the top of every decoding step.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Why decoding ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The model drew its end-of-sequence token.
    Eos,
    MaxTokens,
    /// Output matched one of the request's stop sequences.
    StopSequence,
    /// A token could not be rendered to bytes.
    DecodeFailure,
    /// The next token would not fit in the context window.
    ContextWindowExceeded,
    /// The engine failed to evaluate a generated token or produced no logits.
    EvaluationFailure,
    Cancelled,
    DeadlineExceeded,
}

impl StopReason {
    /// Whether the text is a complete answer rather than a truncated one.
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            StopReason::Eos | StopReason::MaxTokens | StopReason::StopSequence
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Eos => "eos",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::DecodeFailure => "decode_failure",
            StopReason::ContextWindowExceeded => "context_window_exceeded",
            StopReason::EvaluationFailure => "evaluation_failure",
            StopReason::Cancelled => "cancelled",
            StopReason::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generate call.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub sampling: SamplingConfig,
    /// Start from position 0 (`true`) or continue after what the session has
    /// already evaluated (`false`).
    pub reset_context: bool,
    pub stop_sequences: Vec<String>,
    pub cancel: Option<CancelToken>,
    /// Wall-clock budget measured from the start of the call.
    pub deadline: Option<Duration>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            sampling: SamplingConfig::default(),
            reset_context: true,
            stop_sequences: Vec::new(),
            cancel: None,
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    /// Continue the session's existing context instead of resetting it.
    #[must_use]
    pub fn append(mut self) -> Self {
        self.reset_context = false;
        self
    }

    #[must_use]
    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        let stop = stop.into();
        if !stop.is_empty() {
            self.stop_sequences.push(stop);
        }
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.max_tokens == 0 {
            return Err(GenerationError::InvalidRequest(
                "max_tokens must be positive".to_string(),
            ));
        }
        self.sampling
            .validate()
            .map_err(GenerationError::InvalidRequest)
    }
}

/// Outcome of a request that got past prompt evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub stop_reason: StopReason,
    /// Generated tokens, excluding the end-of-sequence token.
    pub token_count: usize,
    pub prompt_tokens: usize,
    pub elapsed: Duration,
}

impl<E: InferenceEngine> Session<E> {
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        self.generate_streaming(request, |_| {})
    }

    /// Like [`Session::generate`], handing each decoded piece to `on_piece` as
    /// soon as it is produced.
    ///
    /// Bytes are delivered raw; a multi-byte character may span two pieces. A
    /// piece that completes a stop sequence is delivered only up to the match.
    pub fn generate_streaming<F>(
        &mut self,
        request: &GenerationRequest,
        mut on_piece: F,
    ) -> Result<GenerationResult, GenerationError>
    where
        F: FnMut(&[u8]),
    {
        request.validate()?;
        if self.live.is_none() {
            return Err(GenerationError::SessionReleased);
        }
        if self.poisoned {
            return Err(GenerationError::SessionPoisoned);
        }

        let started = Instant::now();
        let deadline = request.deadline.map(|budget| started + budget);
        let capacity = self.params.context_capacity;
        let threads = self.params.threads;
        let session_id = self.id();
        let start = if request.reset_context { 0 } else { self.cursor };

        let Some(Live { model, context }) = self.live.as_mut() else {
            return Err(GenerationError::SessionReleased);
        };
        let engine = model.engine();
        let raw = model.raw();

        // Prompt evaluation
        let prompt = tokenize::tokenize_prompt(
            engine,
            raw,
            &request.prompt,
            start == 0,
            start,
            capacity,
        )?;
        if let Err(err) = engine.evaluate(raw, context, &prompt, start, threads) {
            warn!(session = session_id, %err, "prompt evaluation failed; session poisoned");
            self.poisoned = true;
            return Err(GenerationError::Evaluation(err));
        }
        self.cursor = start + prompt.len();
        debug!(
            session = session_id,
            prompt_tokens = prompt.len(),
            cursor = self.cursor,
            "prompt evaluated"
        );

        // Decoding
        let mut sampler = Sampler::new(request.sampling.clone());
        let mut piece = vec![0u8; engine.max_token_bytes(raw).max(1)];
        let mut text: Vec<u8> = Vec::new();
        let mut token_count = 0;
        let mut stop_reason = StopReason::MaxTokens;

        for step in 0..request.max_tokens {
            if request.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                stop_reason = StopReason::Cancelled;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                stop_reason = StopReason::DeadlineExceeded;
                break;
            }

            let Some(token) = sampler.sample(engine.logits(context)) else {
                debug!(session = session_id, step, "no drawable token in logits");
                stop_reason = StopReason::EvaluationFailure;
                break;
            };
            if engine.is_eos(raw, token) {
                stop_reason = StopReason::Eos;
                break;
            }

            let len = match engine.token_to_bytes(raw, token, &mut piece) {
                Ok(len) if len <= piece.len() => len,
                Ok(len) => {
                    debug!(session = session_id, ?token, len, "token rendering overran buffer");
                    stop_reason = StopReason::DecodeFailure;
                    break;
                }
                Err(err) => {
                    debug!(session = session_id, ?token, %err, "token rendering failed");
                    stop_reason = StopReason::DecodeFailure;
                    break;
                }
            };

            let before = text.len();
            text.extend_from_slice(&piece[..len]);
            token_count += 1;
            if let Some(cut) = find_stop(&text, len, &request.stop_sequences) {
                if cut > before {
                    on_piece(&text[before..cut]);
                }
                text.truncate(cut);
                stop_reason = StopReason::StopSequence;
                break;
            }
            on_piece(&piece[..len]);

            if self.cursor >= capacity {
                stop_reason = StopReason::ContextWindowExceeded;
                break;
            }
            if let Err(err) = engine.evaluate(raw, context, &[token], self.cursor, threads) {
                warn!(session = session_id, step, %err, "token evaluation failed; session poisoned");
                self.poisoned = true;
                stop_reason = StopReason::EvaluationFailure;
                break;
            }
            self.cursor += 1;
            trace!(session = session_id, step, ?token, cursor = self.cursor, "token evaluated");
        }

        let result = GenerationResult {
            text: String::from_utf8_lossy(&text).into_owned(),
            stop_reason,
            token_count,
            prompt_tokens: prompt.len(),
            elapsed: started.elapsed(),
        };
        info!(
            session = session_id,
            stop_reason = %result.stop_reason,
            tokens = result.token_count,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "generation finished"
        );
        Ok(result)
    }
}

/// Earliest start of a stop sequence that overlaps the last `new_bytes` of
/// `text`. Earlier matches are impossible because `text` was checked before
/// those bytes were appended.
fn find_stop(text: &[u8], new_bytes: usize, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .map(String::as_bytes)
        .filter(|needle| !needle.is_empty() && needle.len() <= text.len())
        .filter_map(|needle| {
            let from = text.len().saturating_sub(new_bytes + needle.len() - 1);
            text[from..]
                .windows(needle.len())
                .position(|window| window == needle)
                .map(|pos| from + pos)
        })
        .min()
}
