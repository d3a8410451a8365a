use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::warn;

use inference_session::reference::ReferenceEngine;
use inference_session::{
    Backend, ConstructionError, GenerationError, GenerationRequest, SamplingConfig, StopReason,
};

use crate::registry::{RegistryError, SessionRegistry};

pub const SESSION_OK: c_int = 0;
pub const SESSION_ERR_INVALID_ARGUMENT: c_int = -1;
pub const SESSION_ERR_MODEL_LOAD: c_int = -2;
pub const SESSION_ERR_CONTEXT_CREATION: c_int = -3;
pub const SESSION_ERR_TOKENIZATION: c_int = -4;
pub const SESSION_ERR_CAPACITY: c_int = -5;
pub const SESSION_ERR_EVALUATION: c_int = -6;
pub const SESSION_ERR_INVALID_HANDLE: c_int = -7;
pub const SESSION_ERR_BUSY: c_int = -8;
pub const SESSION_ERR_POISONED: c_int = -9;

pub const STOP_EOS: c_int = 0;
pub const STOP_MAX_TOKENS: c_int = 1;
pub const STOP_SEQUENCE: c_int = 2;
pub const STOP_DECODE_FAILURE: c_int = 3;
pub const STOP_CONTEXT_WINDOW: c_int = 4;
pub const STOP_EVALUATION_FAILURE: c_int = 5;
pub const STOP_CANCELLED: c_int = 6;
pub const STOP_DEADLINE: c_int = 7;

/// Sampling settings; `has_seed == 0` draws from OS entropy.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SessionSamplingParams {
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub seed: u64,
    pub has_seed: u8,
}

/// Filled by `session_generate` on success. `text` is owned by the caller and
/// must be freed with `string_free`.
#[repr(C)]
#[derive(Debug)]
pub struct GenerationOutput {
    pub text: *mut c_char,
    pub stop_reason: c_int,
    pub token_count: usize,
    pub prompt_tokens: usize,
}

impl From<&SessionSamplingParams> for SamplingConfig {
    fn from(p: &SessionSamplingParams) -> Self {
        SamplingConfig {
            seed: (p.has_seed != 0).then_some(p.seed),
            top_k: p.top_k as usize,
            top_p: p.top_p,
            temperature: p.temperature,
        }
    }
}

fn registry() -> &'static SessionRegistry<ReferenceEngine> {
    static REGISTRY: OnceLock<SessionRegistry<ReferenceEngine>> = OnceLock::new();
    REGISTRY.get_or_init(|| SessionRegistry::new(Backend::new(ReferenceEngine::new())))
}

fn status(err: &RegistryError) -> c_int {
    match err {
        RegistryError::InvalidHandle(_) => SESSION_ERR_INVALID_HANDLE,
        RegistryError::Busy(_) => SESSION_ERR_BUSY,
        RegistryError::Construction(err) => match err {
            ConstructionError::InvalidArgument(_) => SESSION_ERR_INVALID_ARGUMENT,
            ConstructionError::ModelLoad(_) => SESSION_ERR_MODEL_LOAD,
            ConstructionError::ContextCreation(_) => SESSION_ERR_CONTEXT_CREATION,
        },
        RegistryError::Generation(err) => match err {
            GenerationError::InvalidRequest(_) => SESSION_ERR_INVALID_ARGUMENT,
            GenerationError::SessionReleased => SESSION_ERR_INVALID_HANDLE,
            GenerationError::SessionPoisoned => SESSION_ERR_POISONED,
            GenerationError::Tokenization(_) => SESSION_ERR_TOKENIZATION,
            GenerationError::CapacityExceeded { .. } => SESSION_ERR_CAPACITY,
            GenerationError::Evaluation(_) => SESSION_ERR_EVALUATION,
        },
    }
}

pub fn stop_reason_code(reason: StopReason) -> c_int {
    match reason {
        StopReason::Eos => STOP_EOS,
        StopReason::MaxTokens => STOP_MAX_TOKENS,
        StopReason::StopSequence => STOP_SEQUENCE,
        StopReason::DecodeFailure => STOP_DECODE_FAILURE,
        StopReason::ContextWindowExceeded => STOP_CONTEXT_WINDOW,
        StopReason::EvaluationFailure => STOP_EVALUATION_FAILURE,
        StopReason::Cancelled => STOP_CANCELLED,
        StopReason::DeadlineExceeded => STOP_DEADLINE,
    }
}

/// Borrow a C string as UTF-8.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn utf8<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn report(op: &str, err: RegistryError) -> c_int {
    warn!(op, %err, "session call failed");
    status(&err)
}

/// Load a model and open a session on it, writing its handle to `out_id`.
///
/// # Safety
/// `model_path` must be a NUL-terminated string and `out_id` a writable
/// pointer.
#[no_mangle]
pub unsafe extern "C" fn session_construct(
    model_path: *const c_char,
    threads: u32,
    context_capacity: u32,
    out_id: *mut u64,
) -> c_int {
    if out_id.is_null() {
        return SESSION_ERR_INVALID_ARGUMENT;
    }
    let Some(path) = utf8(model_path) else {
        return SESSION_ERR_INVALID_ARGUMENT;
    };
    match registry().construct(
        PathBuf::from(path),
        threads as usize,
        context_capacity as usize,
    ) {
        Ok(id) => {
            *out_id = id;
            SESSION_OK
        }
        Err(err) => report("construct", err),
    }
}

/// Generate up to `max_tokens` tokens for `prompt` on session `id`.
///
/// A null `sampling` selects the defaults. `reset_context == 0` continues
/// the session's previous context.
///
/// # Safety
/// `prompt` must be a NUL-terminated string, `sampling` null or valid, and
/// `out` a writable pointer.
#[no_mangle]
pub unsafe extern "C" fn session_generate(
    id: u64,
    prompt: *const c_char,
    max_tokens: u32,
    sampling: *const SessionSamplingParams,
    reset_context: u8,
    out: *mut GenerationOutput,
) -> c_int {
    if out.is_null() {
        return SESSION_ERR_INVALID_ARGUMENT;
    }
    let Some(prompt) = utf8(prompt) else {
        return SESSION_ERR_INVALID_ARGUMENT;
    };

    let mut request = GenerationRequest::new(prompt, max_tokens as usize);
    if let Some(params) = sampling.as_ref() {
        request = request.with_sampling(params.into());
    }
    request.reset_context = reset_context != 0;

    match registry().generate(id, &request) {
        Ok(result) => {
            // Interior NULs cannot cross the ABI; drop them.
            let text = CString::new(result.text.replace('\0', "")).unwrap_or_default();
            *out = GenerationOutput {
                text: text.into_raw(),
                stop_reason: stop_reason_code(result.stop_reason),
                token_count: result.token_count,
                prompt_tokens: result.prompt_tokens,
            };
            SESSION_OK
        }
        Err(err) => report("generate", err),
    }
}

/// Free session `id`. Unknown or already-released handles return
/// `SESSION_ERR_INVALID_HANDLE`.
#[no_mangle]
pub extern "C" fn session_release(id: u64) -> c_int {
    match registry().release(id) {
        Ok(()) => SESSION_OK,
        Err(err) => report("release", err),
    }
}

/// Free a string returned by this library.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by this library and
/// not yet freed.
#[no_mangle]
pub unsafe extern "C" fn string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}
