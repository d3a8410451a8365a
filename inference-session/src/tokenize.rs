//! Prompt tokenization bounded by the context window.

use tracing::trace;

use crate::engine::{EngineError, InferenceEngine, Token};
use crate::error::GenerationError;

/// Tokenize a prompt that will be evaluated starting at position `start`.
///
/// The engine gets a buffer of exactly the positions left in the window. A
/// prompt that would fill the window (leaving no room for a generated token)
/// is refused with [`GenerationError::CapacityExceeded`] rather than being
/// truncated.
pub(crate) fn tokenize_prompt<E: InferenceEngine>(
    engine: &E,
    model: &E::Model,
    text: &str,
    add_bos: bool,
    start: usize,
    capacity: usize,
) -> Result<Vec<Token>, GenerationError> {
    let available = capacity.saturating_sub(start);
    let tokens = match engine.tokenize(model, text, add_bos, available) {
        Ok(tokens) => tokens,
        Err(EngineError::TokenBufferTooSmall { required }) => {
            return Err(GenerationError::CapacityExceeded {
                tokens: start.saturating_add(required),
                capacity,
            })
        }
        Err(err) => return Err(GenerationError::Tokenization(err)),
    };

    if tokens.is_empty() {
        return Err(GenerationError::Tokenization(EngineError::Tokenizer(
            "prompt produced no tokens".to_string(),
        )));
    }

    let needed = start.saturating_add(tokens.len());
    if needed >= capacity {
        return Err(GenerationError::CapacityExceeded {
            tokens: needed,
            capacity,
        });
    }

    trace!(tokens = tokens.len(), start, capacity, "prompt tokenized");
    Ok(tokens)
}
