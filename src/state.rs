//! Session state machine
//!
//! Owns the native engine and the single live [`SessionState`]. Every
//! allocation and every free of a native handle happens in this file: the
//! transitions below allocate, [`release`] frees, and a failed multi-step
//! transition rolls back through the same table. An allocation that panics
//! counts as failed, so it rolls back too.
//!
//! | Operation      | Valid from           | Result                         |
//! |----------------|----------------------|--------------------------------|
//! | `load`         | Idle                 | Loaded                         |
//! | `load_vision`  | Idle                 | LoadedVision (no image)        |
//! | `load_image`   | LoadedVision         | LoadedVision (with image)      |
//! | `unload`       | any (no-op from Idle)| Idle                           |

use crate::engine::{Handle, NativeEngine};
use crate::error::{guarded, BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Resources of a text-completion session
#[derive(Debug)]
pub struct TextResources {
    pub(crate) model: Handle,
    pub(crate) context: Handle,
    pub(crate) batch: Handle,
    pub(crate) sampler: Handle,
    /// Set when a turn ended without clearing the cache
    pub(crate) cache_dirty: bool,
}

/// Resources of a vision-chat session
#[derive(Debug)]
pub struct VisionResources {
    pub(crate) context: Handle,
    pub(crate) embedding: Option<Handle>,
    pub(crate) sampler: Handle,
}

/// The one live lifecycle state
#[derive(Debug, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Loaded(TextResources),
    LoadedVision(VisionResources),
}

/// Read-only snapshot of [`SessionState`] published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionStatus {
    #[default]
    Idle,
    Loaded,
    LoadedVision { has_image: bool },
}

impl From<&SessionState> for SessionStatus {
    fn from(state: &SessionState) -> Self {
        match state {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Loaded(_) => SessionStatus::Loaded,
            SessionState::LoadedVision(vision) => SessionStatus::LoadedVision {
                has_image: vision.embedding.is_some(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceKind {
    Model,
    Context,
    Batch,
    Sampler,
    VisionContext,
    VisionSampler,
    Embedding,
}

/// The single place where native handles are freed
fn release(engine: &mut dyn NativeEngine, kind: ResourceKind, handle: Handle) {
    debug!(?kind, handle = handle.as_raw(), "freeing native resource");
    match kind {
        ResourceKind::Model => engine.free_model(handle),
        ResourceKind::Context => engine.free_context(handle),
        ResourceKind::Batch => engine.free_batch(handle),
        ResourceKind::Sampler => engine.free_sampler(handle),
        ResourceKind::VisionContext => engine.free_vision_context(handle),
        ResourceKind::VisionSampler => engine.free_vision_sampler(handle),
        ResourceKind::Embedding => engine.free_embedding(handle),
    }
}

/// Free the handles allocated so far by a failed transition, newest first
fn rollback(
    engine: &mut dyn NativeEngine,
    error: BridgeError,
    allocated: Vec<(ResourceKind, Handle)>,
) -> BridgeError {
    warn!(error = %error, released = allocated.len(), "transition failed, rolling back");
    for (kind, handle) in allocated.into_iter().rev() {
        release(engine, kind, handle);
    }
    error
}

/// Owner of the engine and of the session state; lives on the lane only
pub struct SessionMachine {
    engine: Box<dyn NativeEngine>,
    state: SessionState,
    batch_size: u32,
}

impl SessionMachine {
    /// `batch_size` is the token capacity of the batch allocated by `load`
    pub fn new(engine: Box<dyn NativeEngine>, batch_size: u32) -> Self {
        Self {
            engine,
            state: SessionState::Idle,
            batch_size,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from(&self.state)
    }

    pub fn engine_mut(&mut self) -> &mut dyn NativeEngine {
        self.engine.as_mut()
    }

    /// Engine and state borrowed together, for the generation loop
    pub(crate) fn parts(&mut self) -> (&mut dyn NativeEngine, &mut SessionState) {
        (self.engine.as_mut(), &mut self.state)
    }

    /// Idle -> Loaded
    pub fn load(&mut self, path: &Path) -> Result<()> {
        if !matches!(self.state, SessionState::Idle) {
            return Err(BridgeError::AlreadyLoaded);
        }

        let n_tokens = i32::try_from(self.batch_size).map_err(|_| {
            BridgeError::EngineFailure(format!("batch size {} does not fit the engine", self.batch_size))
        })?;

        let engine = self.engine.as_mut();
        let model = guarded("load_model", || engine.load_model(path))?;

        let context = match guarded("new_context", || engine.new_context(&model)) {
            Ok(context) => context,
            Err(e) => return Err(rollback(engine, e, vec![(ResourceKind::Model, model)])),
        };

        let batch = match guarded("new_batch", || engine.new_batch(n_tokens, 0, 1)) {
            Ok(batch) => batch,
            Err(e) => {
                return Err(rollback(
                    engine,
                    e,
                    vec![(ResourceKind::Model, model), (ResourceKind::Context, context)],
                ))
            }
        };

        let sampler = match guarded("new_sampler", || engine.new_sampler()) {
            Ok(sampler) => sampler,
            Err(e) => {
                return Err(rollback(
                    engine,
                    e,
                    vec![
                        (ResourceKind::Model, model),
                        (ResourceKind::Context, context),
                        (ResourceKind::Batch, batch),
                    ],
                ))
            }
        };

        info!(path = %path.display(), "loaded model");
        self.state = SessionState::Loaded(TextResources {
            model,
            context,
            batch,
            sampler,
            cache_dirty: false,
        });
        Ok(())
    }

    /// Idle -> LoadedVision without an image
    pub fn load_vision(&mut self) -> Result<()> {
        if !matches!(self.state, SessionState::Idle) {
            return Err(BridgeError::AlreadyLoaded);
        }

        let engine = self.engine.as_mut();
        let context = guarded("vision_init_context", || engine.vision_init_context())?;

        let sampler = match guarded("vision_init_sampler", || engine.vision_init_sampler()) {
            Ok(sampler) => sampler,
            Err(e) => {
                return Err(rollback(
                    engine,
                    e,
                    vec![(ResourceKind::VisionContext, context)],
                ))
            }
        };

        info!("loaded vision session");
        self.state = SessionState::LoadedVision(VisionResources {
            context,
            embedding: None,
            sampler,
        });
        Ok(())
    }

    /// LoadedVision -> LoadedVision with the embedding of `bytes`
    ///
    /// A previous embedding is freed once the new one exists; on failure it
    /// stays installed and valid.
    pub fn load_image(&mut self, bytes: &[u8]) -> Result<()> {
        let SessionState::LoadedVision(vision) = &mut self.state else {
            return Err(BridgeError::NotReady(
                "images need a loaded vision session".to_string(),
            ));
        };

        let engine = self.engine.as_mut();
        let embedding = guarded("load_image", || engine.load_image_bytes(&vision.context, bytes))?;
        if let Some(previous) = vision.embedding.replace(embedding) {
            release(engine, ResourceKind::Embedding, previous);
        }

        info!(bytes = bytes.len(), "loaded image");
        Ok(())
    }

    /// Any -> Idle, freeing in reverse allocation order
    ///
    /// Returns whether anything was held.
    pub fn unload(&mut self) -> bool {
        let engine = self.engine.as_mut();
        match std::mem::take(&mut self.state) {
            SessionState::Idle => false,
            SessionState::Loaded(text) => {
                release(engine, ResourceKind::Sampler, text.sampler);
                release(engine, ResourceKind::Batch, text.batch);
                release(engine, ResourceKind::Context, text.context);
                release(engine, ResourceKind::Model, text.model);
                info!("unloaded model");
                true
            }
            SessionState::LoadedVision(vision) => {
                if let Some(embedding) = vision.embedding {
                    release(engine, ResourceKind::Embedding, embedding);
                }
                release(engine, ResourceKind::VisionSampler, vision.sampler);
                release(engine, ResourceKind::VisionContext, vision.context);
                info!("unloaded vision session");
                true
            }
        }
    }
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("state", &self.state)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
