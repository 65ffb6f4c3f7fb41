//! Session facade
//!
//! The one object callers talk to. Every method marshals its work onto the
//! execution lane, so the session can be shared freely between tasks while
//! the native engine only ever sees one thread.

use crate::config::BridgeConfig;
use crate::engine::NativeEngine;
use crate::error::{BridgeError, Result};
use crate::lane::{self, Lane, LaneWorker};
use crate::state::{SessionState, SessionStatus};
use crate::streaming::{self, FragmentStream};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::info;

/// Handle to one inference session and its execution lane
///
/// Dropping the session closes the lane: units still queued are dropped
/// (their callers see [`BridgeError::Cancelled`]) and held resources are
/// released on the lane thread. Use [`Session::shutdown`] to wait for that.
pub struct Session {
    lane: Lane,
}

impl Session {
    /// Start a session whose engine is built by `factory` on the lane thread
    pub fn spawn<F>(config: BridgeConfig, factory: F) -> Result<Self>
    where
        F: FnOnce(&BridgeConfig) -> Result<Box<dyn NativeEngine>> + Send + 'static,
    {
        config.validate()?;
        info!(lane = %config.lane.thread_name, "starting session");
        let lane = Lane::spawn(config, factory)?;
        Ok(Self { lane })
    }

    /// Start a session backed by llama.cpp
    #[cfg(feature = "native")]
    pub fn native(config: BridgeConfig) -> Result<Self> {
        Self::spawn(config, |config| {
            Ok(Box::new(crate::native::LlamaCppEngine::new(config.clone())) as Box<dyn NativeEngine>)
        })
    }

    /// Load a text model; fails with `AlreadyLoaded` unless the session is idle
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path: PathBuf = path.as_ref().to_path_buf();
        self.lane
            .submit(move |worker| worker.transition(|machine| machine.load(&path)))
            .await
    }

    /// Load the configured vision model and projector
    pub async fn load_vision_session(&self) -> Result<()> {
        self.lane
            .submit(|worker| worker.transition(|machine| machine.load_vision()))
            .await
    }

    /// Compute an image embedding for the vision session, replacing any
    /// previous one
    pub async fn load_image(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let bytes = bytes.into();
        self.lane
            .submit(move |worker| worker.transition(|machine| machine.load_image(&bytes)))
            .await
    }

    /// Drain `reader` into one buffer and load it as an image
    pub async fn load_image_from_reader<R>(&self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        self.load_image(bytes).await
    }

    /// Release everything held; a no-op when idle
    pub async fn unload(&self) -> Result<()> {
        self.lane
            .submit(|worker| {
                worker.transition(|machine| {
                    machine.unload();
                    Ok(())
                })
            })
            .await
    }

    /// Start a generation for `prompt`
    ///
    /// Nothing is queued until the stream is first polled; its place in the
    /// lane order is fixed at that point. A stream that is held but never
    /// polled does not block other work.
    pub fn generate(&self, prompt: impl Into<String>) -> FragmentStream {
        let prompt = prompt.into();
        let queue = self.lane.queue();
        FragmentStream::new(move |pulls| {
            queue.enqueue(Box::new(move |worker: &mut LaneWorker| {
                streaming::drive(worker, prompt, pulls)
            }))
        })
    }

    /// Prompt-processing and text-generation benchmark on the loaded model
    pub async fn bench(&self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String> {
        self.lane
            .submit(move |worker| {
                let (engine, state) = worker.machine().parts();
                match state {
                    SessionState::Loaded(text) => {
                        engine.bench(&text.context, &text.model, &text.batch, pp, tg, pl, nr)
                    }
                    _ => Err(BridgeError::NotReady(
                        "benchmarking needs a loaded text model".to_string(),
                    )),
                }
            })
            .await
    }

    /// Build and hardware description of the native library
    pub async fn system_info(&self) -> Result<String> {
        self.lane
            .submit(|worker| Ok(worker.machine().engine_mut().system_info()))
            .await
    }

    pub fn is_generating(&self) -> bool {
        *self.lane.generating().borrow()
    }

    pub fn watch_generating(&self) -> watch::Receiver<bool> {
        self.lane.generating()
    }

    pub fn status(&self) -> SessionStatus {
        *self.lane.status().borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.lane.status()
    }

    /// Close the lane and wait until its resources are released
    ///
    /// Waits for a generation that is still running on the lane to end.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(thread) = self.lane.close() {
            tokio::task::spawn_blocking(move || lane::join(thread))
                .await
                .map_err(|e| BridgeError::EngineFailure(format!("lane join failed: {}", e)))?;
        }
        info!("session shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status())
            .field("generating", &self.is_generating())
            .finish()
    }
}
