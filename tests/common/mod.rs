//! Scripted in-memory engine shared by the integration tests
//!
//! Every native call is recorded. Failures, panics and token scripts are set
//! up through [`Script`] before the session is spawned; the test keeps a
//! handle to the same script to inspect what the lane did.

#![allow(dead_code)]

use mullama_bridge::{BridgeConfig, BridgeError, CompletionStep, Handle, NativeEngine, Result, Session};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InstallLogRedirect,
    BackendInit,
    BackendFree,
    SystemInfo,
    LoadModel(String),
    FreeModel(u64),
    NewContext,
    FreeContext(u64),
    NewBatch(i32, i32, i32),
    FreeBatch(u64),
    NewSampler,
    FreeSampler(u64),
    CompletionInit(String),
    CompletionStep(i32),
    ClearCache,
    VisionInitContext,
    VisionInitSampler,
    LoadImage(usize),
    VisionCompletionInit { system: String, user: String },
    VisionCompletionStep(i32),
    FreeEmbedding(u64),
    FreeVisionSampler(u64),
    FreeVisionContext(u64),
    Bench(i32, i32, i32, i32),
}

impl Call {
    pub fn is_generation(&self) -> bool {
        matches!(
            self,
            Call::CompletionInit(_)
                | Call::CompletionStep(_)
                | Call::ClearCache
                | Call::VisionCompletionInit { .. }
                | Call::VisionCompletionStep(_)
        )
    }
}

#[derive(Debug)]
pub struct Script {
    pub calls: Vec<Call>,
    /// Operations that fail every time
    pub fail: HashSet<&'static str>,
    /// Operations that fail on their next call only
    pub fail_once: HashSet<&'static str>,
    pub panic_on: HashSet<&'static str>,
    /// Fragments produced by successive steps; `EndOfStream` afterwards
    pub fragments: Vec<String>,
    /// Step index (0-based) that fails
    pub fail_step_at: Option<usize>,
    pub prompt_len: i32,
    pub step_delay: Option<Duration>,
    /// Names of the threads that made native calls
    pub threads: HashSet<String>,
    pub live: HashSet<u64>,
    pub double_frees: Vec<u64>,
    next_handle: u64,
    start: i32,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            fail: HashSet::new(),
            fail_once: HashSet::new(),
            panic_on: HashSet::new(),
            fragments: Vec::new(),
            fail_step_at: None,
            prompt_len: 4,
            step_delay: None,
            threads: HashSet::new(),
            live: HashSet::new(),
            double_frees: Vec::new(),
            next_handle: 0,
            start: 0,
        }
    }
}

pub type Shared = Arc<Mutex<Script>>;

pub fn script() -> Shared {
    Arc::new(Mutex::new(Script::default()))
}

pub fn script_with_fragments(fragments: &[&str]) -> Shared {
    let shared = script();
    shared.lock().unwrap().fragments = fragments.iter().map(|f| f.to_string()).collect();
    shared
}

/// Calls recorded so far
pub fn calls(shared: &Shared) -> Vec<Call> {
    shared.lock().unwrap().calls.clone()
}

pub fn generation_calls(shared: &Shared) -> Vec<Call> {
    calls(shared).into_iter().filter(Call::is_generation).collect()
}

pub fn count(shared: &Shared, call: &Call) -> usize {
    calls(shared).iter().filter(|c| *c == call).count()
}

pub struct ScriptedEngine {
    script: Shared,
}

impl ScriptedEngine {
    pub fn new(script: Shared) -> Self {
        Self { script }
    }

    /// Record `call`, then fail or panic as scripted for `operation`
    fn enter(&self, operation: &'static str, call: Call) -> Result<()> {
        let should_panic = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(call);
            let name = std::thread::current().name().unwrap_or("<unnamed>").to_string();
            script.threads.insert(name);
            if script.fail_once.remove(operation) || script.fail.contains(operation) {
                return Err(BridgeError::EngineFailure(format!("{}() returned null", operation)));
            }
            script.panic_on.contains(operation)
        };
        if should_panic {
            panic!("scripted panic in {}", operation);
        }
        Ok(())
    }

    fn allocate(&self, operation: &'static str, call: Call) -> Result<Handle> {
        self.enter(operation, call)?;
        let mut script = self.script.lock().unwrap();
        script.next_handle += 1;
        let raw = script.next_handle;
        script.live.insert(raw);
        Ok(Handle::from_raw(raw).unwrap())
    }

    fn free(&self, call: Call, handle: Handle) {
        let mut script = self.script.lock().unwrap();
        script.calls.push(call);
        if !script.live.remove(&handle.as_raw()) {
            script.double_frees.push(handle.as_raw());
        }
    }

    fn step(&self, operation: &'static str, call: Call, cursor: i32) -> Result<CompletionStep> {
        self.enter(operation, call)?;
        let (delay, outcome) = {
            let script = self.script.lock().unwrap();
            let index = (cursor - script.start) as usize;
            let outcome = if script.fail_step_at == Some(index) {
                Err(BridgeError::EngineFailure("llama_decode() failed".to_string()))
            } else {
                Ok(match script.fragments.get(index) {
                    Some(fragment) => CompletionStep::Fragment(fragment.clone()),
                    None => CompletionStep::EndOfStream,
                })
            };
            (script.step_delay, outcome)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        outcome
    }
}

impl NativeEngine for ScriptedEngine {
    fn install_log_redirect(&mut self) {
        self.script.lock().unwrap().calls.push(Call::InstallLogRedirect);
    }

    fn backend_init(&mut self, _numa: bool) -> Result<()> {
        self.enter("backend_init", Call::BackendInit)
    }

    fn backend_free(&mut self) {
        self.script.lock().unwrap().calls.push(Call::BackendFree);
    }

    fn system_info(&mut self) -> String {
        self.script.lock().unwrap().calls.push(Call::SystemInfo);
        "AVX = 1 | NEON = 0 | scripted".to_string()
    }

    fn load_model(&mut self, path: &Path) -> Result<Handle> {
        self.allocate("load_model", Call::LoadModel(path.display().to_string()))
    }

    fn free_model(&mut self, model: Handle) {
        self.free(Call::FreeModel(model.as_raw()), model);
    }

    fn new_context(&mut self, _model: &Handle) -> Result<Handle> {
        self.allocate("new_context", Call::NewContext)
    }

    fn free_context(&mut self, context: Handle) {
        self.free(Call::FreeContext(context.as_raw()), context);
    }

    fn new_batch(&mut self, n_tokens: i32, embd: i32, n_seq_max: i32) -> Result<Handle> {
        self.allocate("new_batch", Call::NewBatch(n_tokens, embd, n_seq_max))
    }

    fn free_batch(&mut self, batch: Handle) {
        self.free(Call::FreeBatch(batch.as_raw()), batch);
    }

    fn new_sampler(&mut self) -> Result<Handle> {
        self.allocate("new_sampler", Call::NewSampler)
    }

    fn free_sampler(&mut self, sampler: Handle) {
        self.free(Call::FreeSampler(sampler.as_raw()), sampler);
    }

    fn completion_init(&mut self, _context: &Handle, _batch: &Handle, text: &str, _n_len: i32) -> Result<i32> {
        self.enter("completion_init", Call::CompletionInit(text.to_string()))?;
        let mut script = self.script.lock().unwrap();
        script.start = script.prompt_len;
        Ok(script.prompt_len)
    }

    fn completion_step(
        &mut self,
        _context: &Handle,
        _batch: &Handle,
        _sampler: &Handle,
        n_len: i32,
        cursor: i32,
    ) -> Result<CompletionStep> {
        if cursor == n_len {
            self.script.lock().unwrap().calls.push(Call::CompletionStep(cursor));
            return Ok(CompletionStep::EndOfStream);
        }
        self.step("completion_step", Call::CompletionStep(cursor), cursor)
    }

    fn clear_cache(&mut self, _context: &Handle) {
        self.script.lock().unwrap().calls.push(Call::ClearCache);
    }

    fn vision_init_context(&mut self) -> Result<Handle> {
        self.allocate("vision_init_context", Call::VisionInitContext)
    }

    fn vision_init_sampler(&mut self) -> Result<Handle> {
        self.allocate("vision_init_sampler", Call::VisionInitSampler)
    }

    fn load_image_bytes(&mut self, _vision: &Handle, bytes: &[u8]) -> Result<Handle> {
        self.allocate("load_image", Call::LoadImage(bytes.len()))
    }

    fn vision_completion_init(
        &mut self,
        _vision: &Handle,
        _embedding: &Handle,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<i32> {
        self.enter(
            "vision_completion_init",
            Call::VisionCompletionInit {
                system: system_prompt.to_string(),
                user: user_prompt.to_string(),
            },
        )?;
        let mut script = self.script.lock().unwrap();
        script.start = script.prompt_len;
        Ok(script.prompt_len)
    }

    fn vision_completion_step(
        &mut self,
        _sampler: &Handle,
        _embedding: &Handle,
        _vision: &Handle,
        cursor: i32,
    ) -> Result<CompletionStep> {
        self.step("vision_completion_step", Call::VisionCompletionStep(cursor), cursor)
    }

    fn free_embedding(&mut self, embedding: Handle) {
        self.free(Call::FreeEmbedding(embedding.as_raw()), embedding);
    }

    fn free_vision_sampler(&mut self, sampler: Handle) {
        self.free(Call::FreeVisionSampler(sampler.as_raw()), sampler);
    }

    fn free_vision_context(&mut self, vision: Handle) {
        self.free(Call::FreeVisionContext(vision.as_raw()), vision);
    }

    fn bench(
        &mut self,
        _context: &Handle,
        _model: &Handle,
        _batch: &Handle,
        pp: i32,
        tg: i32,
        pl: i32,
        nr: i32,
    ) -> Result<String> {
        self.enter("bench", Call::Bench(pp, tg, pl, nr))?;
        Ok(format!("| model | size | params | backend | test | t/s |\n| scripted | 0GiB | 0B | CPU | pp {} | 1.00 ± 0.00 |\n", pp))
    }
}

/// Factory for [`Session::spawn`] building a scripted engine on the lane
pub fn factory(
    shared: &Shared,
) -> impl FnOnce(&BridgeConfig) -> Result<Box<dyn NativeEngine>> + Send + 'static {
    let shared = Arc::clone(shared);
    move |_config: &BridgeConfig| Ok(Box::new(ScriptedEngine::new(shared)) as Box<dyn NativeEngine>)
}

pub fn session(shared: &Shared) -> Session {
    session_with_config(shared, BridgeConfig::default())
}

pub fn session_with_config(shared: &Shared, config: BridgeConfig) -> Session {
    Session::spawn(config, factory(shared)).expect("session should start")
}

/// Wait until the lane has processed everything queued before this call
pub async fn barrier(session: &Session) {
    session.system_info().await.expect("lane should answer");
}
