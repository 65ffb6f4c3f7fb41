//! # Mullama Bridge
//!
//! Session coordinator between chat front-ends and a llama.cpp inference
//! engine.
//!
//! ## Features
//!
//! - One execution lane: every native call runs on a single dedicated thread
//! - Explicit session lifecycle (idle, text model loaded, vision session)
//!   with rollback on partial failures
//! - Lazy, cancellable token streaming over [`futures::Stream`]
//! - Vision chat with llava image embeddings
//! - Engine-agnostic core: anything implementing [`NativeEngine`] can be
//!   driven, llama.cpp is behind the `native` feature
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
//! let session = Session::native(BridgeConfig::from_env()?)?;
//! session.load("path/to/model.gguf").await?;
//!
//! let mut stream = session.generate("Hello, world!");
//! while let Some(fragment) = stream.next().await {
//!     print!("{}", fragment?);
//! }
//!
//! session.unload().await?;
//! # }
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
mod lane;
pub mod logging;
pub mod prompt;
pub mod session;
pub mod state;
pub mod streaming;
pub mod token;

#[cfg(feature = "native")]
pub mod batch;
#[cfg(feature = "native")]
pub mod native;
#[cfg(feature = "native")]
pub mod sys;

pub use chat::{Author, ChatMessage, Conversation, MessageKind};
pub use config::BridgeConfig;
pub use engine::{CompletionStep, Handle, NativeEngine};
pub use error::{BridgeError, Result};
pub use logging::init_logging;
pub use prompt::VisionPrompt;
pub use session::Session;
pub use state::{SessionMachine, SessionState, SessionStatus};
pub use streaming::FragmentStream;
pub use token::{PieceBuffer, TokenId};

#[cfg(feature = "native")]
pub use native::LlamaCppEngine;

pub mod prelude {
    pub use crate::{
        BridgeConfig, BridgeError, ChatMessage, CompletionStep, Conversation, FragmentStream,
        Handle, NativeEngine, Session, SessionStatus,
    };
    pub use futures::StreamExt;
}
