//! Streaming generation
//!
//! A generation is a lazily started, demand-driven sequence of text
//! fragments. Its lane unit is queued on the first poll of the stream, and the
//! whole completion loop then runs as that one unit, so two generations can
//! never interleave. The consumer side, [`FragmentStream`], sends one pull per
//! element; the lane performs native steps only while a pull is outstanding.
//! Dropping the stream is cancellation: the lane notices the missing pull (or
//! the dropped reply) and stops without another native call.
//!
//! ## Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use mullama_bridge::{BridgeConfig, Session};
//!
//! # async fn run() -> Result<(), mullama_bridge::BridgeError> {
//! # #[cfg(feature = "native")]
//! # {
//! let session = Session::native(BridgeConfig::default())?;
//! session.load("model.gguf").await?;
//!
//! let mut stream = session.generate("Hello");
//! while let Some(fragment) = stream.next().await {
//!     print!("{}", fragment?);
//! }
//! # }
//! # Ok(())
//! # }
//! ```

use crate::config::BridgeConfig;
use crate::engine::CompletionStep;
use crate::error::{panic_message, BridgeError, Result};
use crate::lane::LaneWorker;
use crate::prompt::{self, VisionPrompt};
use crate::state::{SessionState, VisionResources};
use async_stream::stream;
use futures::Stream;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// One pull: the lane answers with the next element, or `None` at the end
pub(crate) type Pull = oneshot::Sender<Option<Result<String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Vision,
}

/// Generation settings captured from the configuration at the start of a
/// sequence
#[derive(Debug, Clone)]
struct Limits {
    n_len: i32,
    text_ctx: u32,
    text_max_steps: Option<u32>,
    vision_ctx: u32,
    vision_max_steps: Option<u32>,
    system_prompt: String,
    stop_markers: Vec<String>,
}

impl Limits {
    fn from_config(config: &BridgeConfig) -> Self {
        Self {
            n_len: config.generation.n_len as i32,
            text_ctx: config.context.n_ctx,
            text_max_steps: config.generation.max_steps,
            vision_ctx: config.vision.n_ctx,
            vision_max_steps: config.vision.max_steps,
            system_prompt: config.vision.system_prompt.clone(),
            stop_markers: config.vision.stop_markers.clone(),
        }
    }
}

/// Position of the running loop; never leaves the lane
#[derive(Debug)]
struct GenerationCursor {
    mode: Mode,
    position: i32,
    steps: u32,
    limit: u32,
    /// Accumulated reply, for stop-marker detection in vision mode
    reply: String,
}

impl GenerationCursor {
    fn new(mode: Mode, start: i32, n_ctx: u32, max_steps: Option<u32>) -> Self {
        Self {
            mode,
            position: start,
            steps: 0,
            limit: step_limit(n_ctx, start, max_steps),
            reply: String::new(),
        }
    }
}

/// `min(max_steps, n_ctx - prompt_len)`
fn step_limit(n_ctx: u32, start: i32, max_steps: Option<u32>) -> u32 {
    let room = (i64::from(n_ctx) - i64::from(start)).max(0) as u32;
    max_steps.map_or(room, |max| max.min(room))
}

/// How a sequence ended, as seen by the lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
    Failed,
}

/// Lane-side body of one generation
pub(crate) fn drive(worker: &mut LaneWorker, prompt: String, mut pulls: mpsc::UnboundedReceiver<Pull>) {
    worker.set_generating(true);

    let outcome = match pulls.blocking_recv() {
        Some(first) => {
            let mut pending = Some(first);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                run(worker, &prompt, &mut pending, &mut pulls)
            }));
            result.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "generation panicked");
                respond(
                    &mut pending,
                    Some(Err(BridgeError::EngineFailure(format!(
                        "generation panicked: {}",
                        message
                    )))),
                );
                Outcome::Failed
            })
        }
        None => {
            debug!("generation dropped before its first pull");
            Outcome::Cancelled
        }
    };

    if outcome != Outcome::Completed {
        mark_cache_dirty(worker);
    }
    debug!(?outcome, "generation finished");
    worker.set_generating(false);
}

/// Answer the outstanding pull, if any; false when the consumer is gone
fn respond(pending: &mut Option<Pull>, item: Option<Result<String>>) -> bool {
    pending.take().is_some_and(|reply| reply.send(item).is_ok())
}

/// `pending` holds the pull being served; it stays reachable if a native
/// call unwinds
fn run(
    worker: &mut LaneWorker,
    prompt: &str,
    pending: &mut Option<Pull>,
    pulls: &mut mpsc::UnboundedReceiver<Pull>,
) -> Outcome {
    let limits = Limits::from_config(worker.config());

    let started = worker
        .ensure_initialized()
        .and_then(|()| begin(worker, &limits, prompt));
    let mut cursor = match started {
        Ok(cursor) => cursor,
        Err(e) => {
            warn!(error = %e, "generation failed to start");
            respond(pending, Some(Err(e)));
            return Outcome::Failed;
        }
    };

    loop {
        match step(worker, &limits, &mut cursor) {
            Ok(Some(fragment)) => {
                if !respond(pending, Some(Ok(fragment))) {
                    return Outcome::Cancelled;
                }
                match pulls.blocking_recv() {
                    Some(next) => *pending = Some(next),
                    None => return Outcome::Cancelled,
                }
            }
            Ok(None) => {
                if cursor.mode == Mode::Text {
                    clear_text_cache(worker);
                }
                info!(steps = cursor.steps, "generation complete");
                respond(pending, None);
                return Outcome::Completed;
            }
            Err(e) => {
                warn!(error = %e, steps = cursor.steps, "generation step failed");
                respond(pending, Some(Err(e)));
                return Outcome::Failed;
            }
        }
    }
}

/// Pick the mode from the held state and evaluate the prompt
fn begin(worker: &mut LaneWorker, limits: &Limits, prompt: &str) -> Result<GenerationCursor> {
    let (engine, state) = worker.machine().parts();

    match state {
        SessionState::Loaded(text) => {
            if text.cache_dirty {
                debug!("clearing cache left by an interrupted turn");
                engine.clear_cache(&text.context);
                text.cache_dirty = false;
            }
            let start = engine
                .completion_init(&text.context, &text.batch, prompt, limits.n_len)
                .map_err(|e| {
                    text.cache_dirty = true;
                    e
                })?;
            debug!(prompt_tokens = start, "text completion started");
            Ok(GenerationCursor::new(
                Mode::Text,
                start,
                limits.text_ctx,
                limits.text_max_steps,
            ))
        }
        SessionState::LoadedVision(VisionResources {
            context,
            embedding: Some(embedding),
            ..
        }) => {
            let vision_prompt = VisionPrompt::build(prompt, &limits.system_prompt);
            let start = engine.vision_completion_init(
                context,
                embedding,
                &vision_prompt.system,
                &vision_prompt.user,
            )?;
            debug!(position = start, "vision completion started");
            Ok(GenerationCursor::new(
                Mode::Vision,
                start,
                limits.vision_ctx,
                limits.vision_max_steps,
            ))
        }
        SessionState::LoadedVision(_) => Err(BridgeError::NotReady(
            "no image loaded for the vision session".to_string(),
        )),
        SessionState::Idle => Err(BridgeError::NotReady("no model loaded".to_string())),
    }
}

/// Advance until a non-empty fragment is ready or the sequence ends
fn step(worker: &mut LaneWorker, limits: &Limits, cursor: &mut GenerationCursor) -> Result<Option<String>> {
    loop {
        if cursor.steps >= cursor.limit {
            debug!(limit = cursor.limit, "step limit reached");
            return Ok(None);
        }

        let (engine, state) = worker.machine().parts();
        let outcome = match (cursor.mode, state) {
            (Mode::Text, SessionState::Loaded(text)) => engine.completion_step(
                &text.context,
                &text.batch,
                &text.sampler,
                limits.n_len,
                cursor.position,
            )?,
            (
                Mode::Vision,
                SessionState::LoadedVision(VisionResources {
                    context,
                    embedding: Some(embedding),
                    sampler,
                }),
            ) => engine.vision_completion_step(sampler, embedding, context, cursor.position)?,
            _ => {
                return Err(BridgeError::NotReady(
                    "session state changed during generation".to_string(),
                ))
            }
        };
        cursor.steps += 1;

        match outcome {
            CompletionStep::EndOfStream => return Ok(None),
            CompletionStep::Fragment(fragment) => {
                cursor.position += 1;
                if fragment.is_empty() {
                    continue;
                }
                if cursor.mode == Mode::Vision {
                    cursor.reply.push_str(&fragment);
                    if prompt::contains_stop_marker(&cursor.reply, &limits.stop_markers[..]) {
                        debug!("stop marker in reply");
                        return Ok(None);
                    }
                }
                return Ok(Some(fragment));
            }
        }
    }
}

fn clear_text_cache(worker: &mut LaneWorker) {
    let (engine, state) = worker.machine().parts();
    if let SessionState::Loaded(text) = state {
        engine.clear_cache(&text.context);
        text.cache_dirty = false;
    }
}

fn mark_cache_dirty(worker: &mut LaneWorker) {
    if let (_, SessionState::Loaded(text)) = worker.machine().parts() {
        text.cache_dirty = true;
    }
}

/// Lazy stream of generated fragments
///
/// Ends after the last fragment, after a terminal `Err`, or never starts if
/// dropped before the first poll.
pub struct FragmentStream {
    inner: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
}

impl FragmentStream {
    /// `start` queues the lane unit serving the pull receiver it is given;
    /// it runs on the first poll, never before
    pub(crate) fn new<F>(start: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedReceiver<Pull>) -> Result<()> + Send + 'static,
    {
        let inner = stream! {
            let (pulls, pull_receiver) = mpsc::unbounded_channel();
            match start(pull_receiver) {
                Err(e) => yield Err(e),
                Ok(()) => loop {
                    let (reply, response) = oneshot::channel();
                    if pulls.send(reply).is_err() {
                        // the lane dropped the unit without running it
                        yield Err(BridgeError::Cancelled);
                        break;
                    }
                    match response.await {
                        Ok(Some(Ok(fragment))) => yield Ok(fragment),
                        Ok(Some(Err(e))) => {
                            yield Err(e);
                            break;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            yield Err(BridgeError::Cancelled);
                            break;
                        }
                    }
                },
            }
        };

        Self {
            inner: Box::pin(inner),
        }
    }
}

impl Stream for FragmentStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for FragmentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStream").finish_non_exhaustive()
    }
}

/// Utility functions for streaming
pub mod utils {
    use super::*;
    use futures::StreamExt;

    /// Concatenate every fragment, stopping at the first error
    pub async fn collect_to_string<S>(mut stream: S) -> Result<String>
    where
        S: Stream<Item = Result<String>> + Unpin,
    {
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    /// Drain the stream, calling `on_fragment` for each fragment
    pub async fn for_each_fragment<S, F>(mut stream: S, mut on_fragment: F) -> Result<()>
    where
        S: Stream<Item = Result<String>> + Unpin,
        F: FnMut(&str),
    {
        while let Some(fragment) = stream.next().await {
            on_fragment(&fragment?);
        }
        Ok(())
    }
}
