//! C ABI over inference sessions.
//!
//! Sessions live in a process-wide [`SessionRegistry`] and are addressed by
//! integer handles, so a stale or repeated handle is reported as an error
//! instead of touching freed memory.

pub mod ffi;
mod registry;

pub use ffi::*;
pub use registry::{RegistryError, SessionRegistry};
