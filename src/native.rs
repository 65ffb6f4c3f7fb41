//! llama.cpp implementation of [`NativeEngine`]
//!
//! Handles are raw pointers widened to `u64`. Batches and vision contexts are
//! Rust-side boxes whose pointers are handed out the same way. Nothing here
//! keeps track of what is live; [`crate::state::SessionMachine`] does.

use crate::batch::{self, Batch};
use crate::config::BridgeConfig;
use crate::engine::{checked, CompletionStep, Handle, NativeEngine};
use crate::error::{BridgeError, Result};
use crate::logging::NATIVE_TARGET;
use crate::sys;
use crate::token::{PieceBuffer, TokenId};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::ptr;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Text model, clip projector and context of a vision session
struct VisionContext {
    model: *mut sys::llama_model,
    context: *mut sys::llama_context,
    clip: *mut sys::clip_ctx,
    batch: Batch,
}

impl Drop for VisionContext {
    fn drop(&mut self) {
        unsafe {
            sys::clip_free(self.clip);
            sys::llama_free(self.context);
            sys::llama_model_free(self.model);
        }
    }
}

fn into_handle<T>(pointer: *mut T, operation: &str) -> Result<Handle> {
    checked(pointer as usize as u64, operation)
}

fn pointer<T>(handle: &Handle) -> *mut T {
    handle.as_raw() as usize as *mut T
}

/// A path the native loader cannot be handed fails the load itself
fn path_to_cstring(path: &Path) -> Result<CString> {
    let path = path
        .to_str()
        .ok_or_else(|| BridgeError::EngineFailure(format!("Path is not valid UTF-8: {}", path.display())))?;
    CString::new(path)
        .map_err(|_| BridgeError::EngineFailure(format!("Path contains null bytes: {:?}", path)))
}

fn byte_count(len: usize) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| {
        BridgeError::EngineFailure(format!("image of {} bytes exceeds the native size limit", len))
    })
}

/// Forward native log lines into `tracing`
unsafe extern "C" fn forward_log(level: c_int, text: *const c_char, _user_data: *mut c_void) {
    if text.is_null() {
        return;
    }
    let message = CStr::from_ptr(text).to_string_lossy();
    let message = message.trim_end();
    if message.is_empty() {
        return;
    }
    match level {
        sys::GGML_LOG_LEVEL_ERROR => error!(target: NATIVE_TARGET, "{}", message),
        sys::GGML_LOG_LEVEL_WARN => warn!(target: NATIVE_TARGET, "{}", message),
        sys::GGML_LOG_LEVEL_INFO => info!(target: NATIVE_TARGET, "{}", message),
        sys::GGML_LOG_LEVEL_DEBUG => debug!(target: NATIVE_TARGET, "{}", message),
        _ => trace!(target: NATIVE_TARGET, "{}", message),
    }
}

unsafe fn tokenize(
    vocab: *const sys::llama_vocab,
    text: &str,
    add_special: bool,
    parse_special: bool,
) -> Result<Vec<TokenId>> {
    let mut tokens: Vec<TokenId> = vec![0; text.len() + 2];
    let mut count = sys::llama_tokenize(
        vocab,
        text.as_ptr() as *const c_char,
        text.len() as i32,
        tokens.as_mut_ptr(),
        tokens.len() as i32,
        add_special,
        parse_special,
    );
    if count < 0 {
        tokens.resize(count.unsigned_abs() as usize, 0);
        count = sys::llama_tokenize(
            vocab,
            text.as_ptr() as *const c_char,
            text.len() as i32,
            tokens.as_mut_ptr(),
            tokens.len() as i32,
            add_special,
            parse_special,
        );
    }
    if count < 0 {
        return Err(BridgeError::EngineFailure("llama_tokenize() failed".to_string()));
    }
    tokens.truncate(count as usize);
    Ok(tokens)
}

unsafe fn token_to_piece(vocab: *const sys::llama_vocab, token: TokenId) -> Vec<u8> {
    let mut buffer = vec![0u8; 32];
    let mut written = sys::llama_token_to_piece(
        vocab,
        token,
        buffer.as_mut_ptr() as *mut c_char,
        buffer.len() as i32,
        0,
        false,
    );
    if written < 0 {
        buffer.resize(written.unsigned_abs() as usize, 0);
        written = sys::llama_token_to_piece(
            vocab,
            token,
            buffer.as_mut_ptr() as *mut c_char,
            buffer.len() as i32,
            0,
            false,
        );
    }
    buffer.truncate(written.max(0) as usize);
    buffer
}

unsafe fn context_vocab(context: *mut sys::llama_context) -> *const sys::llama_vocab {
    sys::llama_model_get_vocab(sys::llama_get_model(context))
}

unsafe fn greedy_sampler() -> *mut sys::llama_sampler {
    let mut params = sys::llama_sampler_chain_default_params();
    params.no_perf = true;
    let chain = sys::llama_sampler_chain_init(params);
    if !chain.is_null() {
        sys::llama_sampler_chain_add(chain, sys::llama_sampler_init_greedy());
    }
    chain
}

/// Native engine backed by llama.cpp
pub struct LlamaCppEngine {
    config: BridgeConfig,
    pieces: PieceBuffer,
}

impl LlamaCppEngine {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            pieces: PieceBuffer::new(),
        }
    }

    fn model_params(&self) -> sys::llama_model_params {
        let mut params = unsafe { sys::llama_model_default_params() };
        params.n_gpu_layers = self.config.model.gpu_layers;
        params.use_mmap = self.config.model.use_mmap;
        params.use_mlock = self.config.model.use_mlock;
        params
    }

    fn context_params(&self, n_ctx: u32, n_batch: u32) -> sys::llama_context_params {
        let mut params = unsafe { sys::llama_context_default_params() };
        params.n_ctx = n_ctx;
        params.n_batch = n_batch;
        params.n_threads = self.config.context.n_threads;
        params.n_threads_batch = self.config.context.n_threads_batch;
        params
    }

    /// Sample, stop on end-of-generation, otherwise feed the token back at
    /// `cursor`
    unsafe fn step(
        &mut self,
        context: *mut sys::llama_context,
        sampler: *mut sys::llama_sampler,
        batch: &mut Batch,
        cursor: i32,
        at_limit: bool,
    ) -> Result<CompletionStep> {
        let vocab = context_vocab(context);
        let token = sys::llama_sampler_sample(sampler, context, -1);

        if sys::llama_vocab_is_eog(vocab, token) || at_limit {
            self.pieces.clear();
            return Ok(CompletionStep::EndOfStream);
        }

        let piece = token_to_piece(vocab, token);
        let text = self.pieces.push(&piece);
        trace!(token, cursor, text = %text, "sampled token");

        batch::decode_tokens(context, batch, &[token], cursor)?;
        Ok(CompletionStep::Fragment(text))
    }
}

impl NativeEngine for LlamaCppEngine {
    fn install_log_redirect(&mut self) {
        unsafe { sys::llama_log_set(Some(forward_log), ptr::null_mut()) };
    }

    fn backend_init(&mut self, numa: bool) -> Result<()> {
        unsafe {
            sys::llama_backend_init();
            if numa {
                sys::llama_numa_init(sys::ggml_numa_strategy::GGML_NUMA_STRATEGY_DISTRIBUTE);
            }
        }
        Ok(())
    }

    fn backend_free(&mut self) {
        unsafe { sys::llama_backend_free() };
    }

    fn system_info(&mut self) -> String {
        unsafe {
            let info = sys::llama_print_system_info();
            if info.is_null() {
                String::new()
            } else {
                CStr::from_ptr(info).to_string_lossy().into_owned()
            }
        }
    }

    fn load_model(&mut self, path: &Path) -> Result<Handle> {
        let c_path = path_to_cstring(path)?;
        info!(path = %path.display(), "loading model");
        let model = unsafe { sys::llama_model_load_from_file(c_path.as_ptr(), self.model_params()) };
        into_handle(model, "load_model")
    }

    fn free_model(&mut self, model: Handle) {
        unsafe { sys::llama_model_free(pointer(&model)) };
    }

    fn new_context(&mut self, model: &Handle) -> Result<Handle> {
        let params = self.context_params(self.config.context.n_ctx, self.config.context.n_batch);
        debug!(threads = params.n_threads, n_ctx = params.n_ctx, "creating context");
        let context = unsafe { sys::llama_init_from_model(pointer(model), params) };
        into_handle(context, "new_context")
    }

    fn free_context(&mut self, context: Handle) {
        unsafe { sys::llama_free(pointer(&context)) };
    }

    fn new_batch(&mut self, n_tokens: i32, embd: i32, n_seq_max: i32) -> Result<Handle> {
        if n_tokens <= 0 || n_seq_max <= 0 {
            return Err(BridgeError::EngineFailure(
                "new_batch() needs positive sizes".to_string(),
            ));
        }
        let batch = Box::new(Batch::new(n_tokens as usize, embd, n_seq_max as usize));
        into_handle(Box::into_raw(batch), "new_batch")
    }

    fn free_batch(&mut self, batch: Handle) {
        drop(unsafe { Box::from_raw(pointer::<Batch>(&batch)) });
    }

    fn new_sampler(&mut self) -> Result<Handle> {
        into_handle(unsafe { greedy_sampler() }, "new_sampler")
    }

    fn free_sampler(&mut self, sampler: Handle) {
        unsafe { sys::llama_sampler_free(pointer(&sampler)) };
    }

    fn completion_init(&mut self, context: &Handle, batch: &Handle, text: &str, n_len: i32) -> Result<i32> {
        self.pieces.clear();
        let context = pointer::<sys::llama_context>(context);
        let batch = unsafe { &mut *pointer::<Batch>(batch) };

        unsafe {
            let tokens = tokenize(context_vocab(context), text, true, false)?;
            if tokens.is_empty() {
                return Err(BridgeError::EngineFailure("prompt produced no tokens".to_string()));
            }

            let n_ctx = sys::llama_n_ctx(context);
            debug!(n_len, n_ctx, prompt_tokens = tokens.len(), "completion init");
            if n_len as u32 > n_ctx {
                warn!(n_len, n_ctx, "the required KV cache size is not big enough");
            }

            batch::decode_tokens(context, batch, &tokens, 0)?;
            Ok(tokens.len() as i32)
        }
    }

    fn completion_step(
        &mut self,
        context: &Handle,
        batch: &Handle,
        sampler: &Handle,
        n_len: i32,
        cursor: i32,
    ) -> Result<CompletionStep> {
        let batch = unsafe { &mut *pointer::<Batch>(batch) };
        unsafe { self.step(pointer(context), pointer(sampler), batch, cursor, cursor == n_len) }
    }

    fn clear_cache(&mut self, context: &Handle) {
        unsafe {
            let memory = sys::llama_get_memory(pointer::<sys::llama_context>(context));
            sys::llama_memory_clear(memory, true);
        }
    }

    fn vision_init_context(&mut self) -> Result<Handle> {
        let vision = &self.config.vision;
        if vision.model_path.is_empty() || vision.mmproj_path.is_empty() {
            return Err(BridgeError::EngineFailure(
                "vision.model_path and vision.mmproj_path must be set".to_string(),
            ));
        }
        let model_path = path_to_cstring(Path::new(&vision.model_path))?;
        let clip_path = path_to_cstring(Path::new(&vision.mmproj_path))?;
        let n_batch = self.config.context.n_batch.max(vision.n_ubatch);

        let mut params = self.context_params(vision.n_ctx, n_batch);
        params.n_ubatch = vision.n_ubatch;

        unsafe {
            let model = sys::llama_model_load_from_file(model_path.as_ptr(), self.model_params());
            if model.is_null() {
                return Err(BridgeError::EngineFailure("load_model() returned null".to_string()));
            }

            let clip = sys::clip_model_load(clip_path.as_ptr(), 1);
            if clip.is_null() {
                sys::llama_model_free(model);
                return Err(BridgeError::EngineFailure("clip_model_load() returned null".to_string()));
            }

            let context = sys::llama_init_from_model(model, params);
            if context.is_null() {
                sys::clip_free(clip);
                sys::llama_model_free(model);
                return Err(BridgeError::EngineFailure("new_context() returned null".to_string()));
            }

            let vision_context = Box::new(VisionContext {
                model,
                context,
                clip,
                batch: Batch::new(n_batch as usize, 0, 1),
            });
            if !sys::llava_validate_embed_size(context, clip) {
                drop(vision_context);
                return Err(BridgeError::EngineFailure(
                    "projector embedding size does not match the model".to_string(),
                ));
            }

            info!(model = %vision.model_path, mmproj = %vision.mmproj_path, "vision context ready");
            into_handle(Box::into_raw(vision_context), "vision_init_context")
        }
    }

    fn vision_init_sampler(&mut self) -> Result<Handle> {
        into_handle(unsafe { greedy_sampler() }, "vision_init_sampler")
    }

    fn load_image_bytes(&mut self, vision: &Handle, bytes: &[u8]) -> Result<Handle> {
        let len = byte_count(bytes.len())?;
        let vision = unsafe { &*pointer::<VisionContext>(vision) };
        let embed = unsafe {
            sys::llava_image_embed_make_with_bytes(
                vision.clip,
                self.config.context.n_threads,
                bytes.as_ptr(),
                len,
            )
        };
        into_handle(embed, "load_image")
    }

    fn vision_completion_init(
        &mut self,
        vision: &Handle,
        embedding: &Handle,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<i32> {
        self.pieces.clear();
        let vision = unsafe { &mut *pointer::<VisionContext>(vision) };
        let embed = pointer::<sys::llava_image_embed>(embedding);

        unsafe {
            let vocab = context_vocab(vision.context);
            let memory = sys::llama_get_memory(vision.context);
            // continue after whatever the conversation already holds
            let mut n_past: c_int = sys::llama_memory_seq_pos_max(memory, 0) + 1;

            let system_tokens = tokenize(vocab, system_prompt, n_past == 0, true)?;
            batch::decode_tokens(vision.context, &mut vision.batch, &system_tokens, n_past)?;
            n_past += system_tokens.len() as c_int;

            let n_batch = sys::llama_n_batch(vision.context) as c_int;
            if !sys::llava_eval_image_embed(vision.context, embed, n_batch, &mut n_past) {
                return Err(BridgeError::EngineFailure(
                    "llava_eval_image_embed() failed".to_string(),
                ));
            }

            let user_tokens = tokenize(vocab, user_prompt, false, true)?;
            batch::decode_tokens(vision.context, &mut vision.batch, &user_tokens, n_past)?;
            n_past += user_tokens.len() as c_int;

            debug!(
                system_tokens = system_tokens.len(),
                image_positions = (*embed).n_image_pos,
                user_tokens = user_tokens.len(),
                "vision completion init"
            );
            Ok(n_past)
        }
    }

    fn vision_completion_step(
        &mut self,
        sampler: &Handle,
        _embedding: &Handle,
        vision: &Handle,
        cursor: i32,
    ) -> Result<CompletionStep> {
        let vision = unsafe { &mut *pointer::<VisionContext>(vision) };
        unsafe { self.step(vision.context, pointer(sampler), &mut vision.batch, cursor, false) }
    }

    fn free_embedding(&mut self, embedding: Handle) {
        unsafe { sys::llava_image_embed_free(pointer(&embedding)) };
    }

    fn free_vision_sampler(&mut self, sampler: Handle) {
        unsafe { sys::llama_sampler_free(pointer(&sampler)) };
    }

    fn free_vision_context(&mut self, vision: Handle) {
        drop(unsafe { Box::from_raw(pointer::<VisionContext>(&vision)) });
    }

    #[allow(clippy::too_many_arguments)]
    fn bench(
        &mut self,
        context: &Handle,
        model: &Handle,
        batch: &Handle,
        pp: i32,
        tg: i32,
        pl: i32,
        nr: i32,
    ) -> Result<String> {
        if pp <= 0 || tg <= 0 || pl <= 0 || nr <= 0 {
            return Err(BridgeError::EngineFailure(
                "bench() needs positive pp, tg, pl and nr".to_string(),
            ));
        }
        let context = pointer::<sys::llama_context>(context);
        let model = pointer::<sys::llama_model>(model);
        let batch = unsafe { &mut *pointer::<Batch>(batch) };

        let mut pp_speeds = Vec::with_capacity(nr as usize);
        let mut tg_speeds = Vec::with_capacity(nr as usize);

        unsafe {
            let memory = sys::llama_get_memory(context);
            debug!(n_ctx = sys::llama_n_ctx(context), "benchmark start");

            for run in 0..nr {
                batch.clear();
                for i in 0..pp {
                    batch.push(0, i, &[0], false)?;
                }
                batch.mark_last_logits();
                sys::llama_memory_clear(memory, true);

                let pp_start = Instant::now();
                if sys::llama_decode(context, batch.as_llama_batch()) != 0 {
                    warn!(run, "llama_decode() failed during prompt processing");
                }
                let t_pp = pp_start.elapsed().as_secs_f64();

                sys::llama_memory_clear(memory, true);
                let tg_start = Instant::now();
                for i in 0..tg {
                    batch.clear();
                    for j in 0..pl {
                        batch.push(0, i, &[j], true)?;
                    }
                    if sys::llama_decode(context, batch.as_llama_batch()) != 0 {
                        warn!(run, step = i, "llama_decode() failed during text generation");
                    }
                }
                let t_tg = tg_start.elapsed().as_secs_f64();
                sys::llama_memory_clear(memory, true);

                let speed_pp = f64::from(pp) / t_pp;
                let speed_tg = f64::from(pl * tg) / t_tg;
                info!(run, speed_pp, speed_tg, "benchmark run");
                pp_speeds.push(speed_pp);
                tg_speeds.push(speed_tg);
            }

            let (pp_avg, pp_std) = mean_and_stddev(&pp_speeds);
            let (tg_avg, tg_std) = mean_and_stddev(&tg_speeds);

            let mut desc = [0 as c_char; 128];
            sys::llama_model_desc(model, desc.as_mut_ptr(), desc.len());
            let desc = CStr::from_ptr(desc.as_ptr()).to_string_lossy();
            let size_gib = sys::llama_model_size(model) as f64 / 1024.0 / 1024.0 / 1024.0;
            let params_b = sys::llama_model_n_params(model) as f64 / 1e9;
            let backend = if sys::llama_supports_gpu_offload() { "GPU" } else { "CPU" };

            Ok(format!(
                "| model | size | params | backend | test | t/s |\n\
                 | --- | --- | --- | --- | --- | --- |\n\
                 | {desc} | {size_gib:.2}GiB | {params_b:.2}B | {backend} | pp {pp} | {pp_avg:.2} ± {pp_std:.2} |\n\
                 | {desc} | {size_gib:.2}GiB | {params_b:.2}B | {backend} | tg {tg} | {tg_avg:.2} ± {tg_std:.2} |\n"
            ))
        }
    }
}

/// Sample mean and standard deviation; the deviation is 0 for a single run
fn mean_and_stddev(samples: &[f64]) -> (f64, f64) {
    let n = samples.len() as f64;
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, 0.0);
    }
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}
