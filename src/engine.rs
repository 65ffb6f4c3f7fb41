//! Native engine adapter contract
//!
//! A flat, typed view of the native inference API. Every resource is an
//! opaque [`Handle`]; nothing here tracks lifetimes. The session state
//! machine is the only place that allocates and frees handles, and all calls
//! happen on the execution lane, so implementations never see concurrent use.

use crate::error::{BridgeError, Result};
use std::num::NonZeroU64;
use std::path::Path;

/// Opaque reference to a native resource (model, context, batch, sampler,
/// vision context or image embedding)
///
/// The failure sentinel (0/null) cannot be represented. Handles are neither
/// `Copy` nor `Clone`: the free operations consume them, so one handle can be
/// freed at most once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Wrap a raw token produced by an engine implementation
    ///
    /// Returns `None` for the null sentinel.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Handle)
    }

    pub fn as_raw(&self) -> u64 {
        self.0.get()
    }
}

/// Convert a raw native return value into a handle, mapping the sentinel to
/// `EngineFailure`
pub fn checked(raw: u64, operation: &str) -> Result<Handle> {
    Handle::from_raw(raw)
        .ok_or_else(|| BridgeError::EngineFailure(format!("{}() returned null", operation)))
}

/// Outcome of one completion step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStep {
    /// Text produced by this step; may be empty while a multi-byte character
    /// is still incomplete
    Fragment(String),
    EndOfStream,
}

/// The native inference API as seen by the lane
///
/// None of these operations is reentrant and none may be called from more
/// than one thread. Failures carry no partial side effects the caller has to
/// undo, except that a failed completion may leave the context cache dirty.
pub trait NativeEngine {
    /// Route native log output into `tracing`
    fn install_log_redirect(&mut self) {}

    fn backend_init(&mut self, numa: bool) -> Result<()>;
    fn backend_free(&mut self);

    /// Build and hardware description of the native library
    fn system_info(&mut self) -> String;

    fn load_model(&mut self, path: &Path) -> Result<Handle>;
    fn free_model(&mut self, model: Handle);
    fn new_context(&mut self, model: &Handle) -> Result<Handle>;
    fn free_context(&mut self, context: Handle);
    fn new_batch(&mut self, n_tokens: i32, embd: i32, n_seq_max: i32) -> Result<Handle>;
    fn free_batch(&mut self, batch: Handle);
    fn new_sampler(&mut self) -> Result<Handle>;
    fn free_sampler(&mut self, sampler: Handle);

    /// Evaluate the prompt; returns the cursor of the first generated token
    fn completion_init(
        &mut self,
        context: &Handle,
        batch: &Handle,
        text: &str,
        n_len: i32,
    ) -> Result<i32>;

    /// Sample one token at `cursor` and feed it back into the context
    fn completion_step(
        &mut self,
        context: &Handle,
        batch: &Handle,
        sampler: &Handle,
        n_len: i32,
        cursor: i32,
    ) -> Result<CompletionStep>;

    /// Forget the key/value cache so the context can serve the next turn
    fn clear_cache(&mut self, context: &Handle);

    fn vision_init_context(&mut self) -> Result<Handle>;
    fn vision_init_sampler(&mut self) -> Result<Handle>;
    fn load_image_bytes(&mut self, vision: &Handle, bytes: &[u8]) -> Result<Handle>;

    fn vision_completion_init(
        &mut self,
        vision: &Handle,
        embedding: &Handle,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<i32>;

    fn vision_completion_step(
        &mut self,
        sampler: &Handle,
        embedding: &Handle,
        vision: &Handle,
        cursor: i32,
    ) -> Result<CompletionStep>;

    fn free_embedding(&mut self, embedding: Handle);
    fn free_vision_sampler(&mut self, sampler: Handle);
    fn free_vision_context(&mut self, vision: Handle);

    /// Prompt-processing / text-generation throughput report
    #[allow(clippy::too_many_arguments)]
    fn bench(
        &mut self,
        _context: &Handle,
        _model: &Handle,
        _batch: &Handle,
        _pp: i32,
        _tg: i32,
        _pl: i32,
        _nr: i32,
    ) -> Result<String> {
        Err(BridgeError::EngineFailure(
            "benchmarking is not supported by this engine".to_string(),
        ))
    }
}
