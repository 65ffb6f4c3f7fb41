use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Errors reported by the session, the lane and the native engine adapter
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A load was attempted while resources are already held
    #[error("Model already loaded")]
    AlreadyLoaded,

    /// The operation needs a session state that is not currently held
    #[error("Session not ready: {0}")]
    NotReady(String),

    /// A native call returned its failure sentinel or raised
    #[error("Engine failure: {0}")]
    EngineFailure(String),

    /// The unit or sequence was dropped before it could finish
    #[error("Operation cancelled")]
    Cancelled,

    /// The lane thread is gone; nothing can be submitted anymore
    #[error("Execution lane is closed")]
    LaneClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BridgeError {
    /// `Cancelled` is a normal termination mode, not a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BridgeError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one native call, turning a panic into `EngineFailure`
pub(crate) fn guarded<T>(operation: &str, call: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(BridgeError::EngineFailure(format!(
            "{}() panicked: {}",
            operation,
            panic_message(payload.as_ref())
        )))
    })
}
