//! Configuration management with serde integration
//!
//! Every section can be loaded from JSON, partially specified (missing fields
//! fall back to their defaults) or overridden from `MULLAMA_*` environment
//! variables.
//!
//! ## Example
//!
//! ```rust
//! use mullama_bridge::config::{BridgeConfig, GenerationConfig};
//!
//! let config = BridgeConfig {
//!     generation: GenerationConfig {
//!         n_len: 256,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//!
//! let json = serde_json::to_string_pretty(&config).unwrap();
//! let loaded: BridgeConfig = serde_json::from_str(&json).unwrap();
//! assert_eq!(loaded.generation.n_len, 256);
//! ```

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default system prompt used for llava-1.5 style vision chat
pub const DEFAULT_VISION_SYSTEM_PROMPT: &str = "A chat between a curious human and an artificial intelligence assistant. The assistant gives helpful, detailed, and polite answers to the human's questions.\nUSER:";

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub lane: LaneConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Text model loading options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default model path used by front-ends that do not pass one explicitly
    #[serde(default)]
    pub path: String,
    /// Number of layers to offload to the GPU
    #[serde(default)]
    pub gpu_layers: i32,
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    #[serde(default)]
    pub use_mlock: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Execution context options shared by the text session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context size (sequence length)
    #[serde(default = "default_context_size")]
    pub n_ctx: u32,
    /// Capacity of the token batch allocated with the context
    #[serde(default = "default_batch_size")]
    pub n_batch: u32,
    #[serde(default = "default_threads")]
    pub n_threads: i32,
    #[serde(default = "default_threads")]
    pub n_threads_batch: i32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_ctx: default_context_size(),
            n_batch: default_batch_size(),
            n_threads: default_threads(),
            n_threads_batch: default_threads(),
        }
    }
}

/// Text-mode generation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Position at which the native step reports end-of-stream
    #[serde(default = "default_n_len")]
    pub n_len: u32,
    /// Hard cap on completion steps; `None` means context length minus prompt length
    #[serde(default)]
    pub max_steps: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            n_len: default_n_len(),
            max_steps: None,
        }
    }
}

/// Vision chat session options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Language model used by the vision session
    #[serde(default)]
    pub model_path: String,
    /// Multimodal projector (clip) weights
    #[serde(default)]
    pub mmproj_path: String,
    #[serde(default = "default_context_size")]
    pub n_ctx: u32,
    #[serde(default = "default_vision_ubatch")]
    pub n_ubatch: u32,
    #[serde(default = "default_vision_max_steps")]
    pub max_steps: Option<u32>,
    #[serde(default = "default_vision_system_prompt")]
    pub system_prompt: String,
    /// Reply substrings that end a vision sequence
    #[serde(default = "default_stop_markers")]
    pub stop_markers: Vec<String>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            mmproj_path: String::new(),
            n_ctx: default_context_size(),
            n_ubatch: default_vision_ubatch(),
            max_steps: default_vision_max_steps(),
            system_prompt: default_vision_system_prompt(),
            stop_markers: default_stop_markers(),
        }
    }
}

/// Execution lane options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// Passed to the native backend initialization
    #[serde(default)]
    pub numa: bool,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
            numa: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub structured: bool,
    /// Forward native engine log lines into `tracing`
    #[serde(default = "default_true")]
    pub redirect_native: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            structured: false,
            redirect_native: true,
        }
    }
}

fn default_context_size() -> u32 {
    2048
}
fn default_batch_size() -> u32 {
    512
}
fn default_n_len() -> u32 {
    128
}
fn default_vision_ubatch() -> u32 {
    1024
}
fn default_vision_max_steps() -> Option<u32> {
    Some(64)
}
fn default_vision_system_prompt() -> String {
    DEFAULT_VISION_SYSTEM_PROMPT.to_string()
}
fn default_stop_markers() -> Vec<String> {
    ["###", "<|im_end|>", "<|im_start|>", "USER:"]
        .iter()
        .map(|marker| marker.to_string())
        .collect()
}
fn default_thread_name() -> String {
    "llm-runloop".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

/// Leave two cores to the UI, never use more than eight
pub fn default_threads() -> i32 {
    (num_cpus::get() as i32 - 2).clamp(1, 8)
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| BridgeError::ConfigError(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to parse JSON config: {}", e)))
    }

    /// Save configuration to a JSON file
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to write config file: {}", e)))
    }

    /// Defaults overridden by `MULLAMA_*` environment variables
    ///
    /// Recognized: `MULLAMA_MODEL_PATH`, `MULLAMA_MODEL_GPU_LAYERS`,
    /// `MULLAMA_CONTEXT_N_CTX`, `MULLAMA_CONTEXT_N_BATCH`,
    /// `MULLAMA_CONTEXT_N_THREADS`, `MULLAMA_GENERATION_N_LEN`,
    /// `MULLAMA_GENERATION_MAX_STEPS`, `MULLAMA_VISION_MODEL_PATH`,
    /// `MULLAMA_VISION_MMPROJ_PATH`, `MULLAMA_LANE_NUMA`, `MULLAMA_LOG_LEVEL`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `MULLAMA_*` overrides on top of the current values
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("MULLAMA_MODEL_PATH") {
            self.model.path = path;
        }
        if let Some(gpu_layers) = env_parse("MULLAMA_MODEL_GPU_LAYERS")? {
            self.model.gpu_layers = gpu_layers;
        }
        if let Some(n_ctx) = env_parse("MULLAMA_CONTEXT_N_CTX")? {
            self.context.n_ctx = n_ctx;
        }
        if let Some(n_batch) = env_parse("MULLAMA_CONTEXT_N_BATCH")? {
            self.context.n_batch = n_batch;
        }
        if let Some(n_threads) = env_parse("MULLAMA_CONTEXT_N_THREADS")? {
            self.context.n_threads = n_threads;
            self.context.n_threads_batch = n_threads;
        }
        if let Some(n_len) = env_parse("MULLAMA_GENERATION_N_LEN")? {
            self.generation.n_len = n_len;
        }
        if let Some(max_steps) = env_parse("MULLAMA_GENERATION_MAX_STEPS")? {
            self.generation.max_steps = Some(max_steps);
        }
        if let Ok(path) = std::env::var("MULLAMA_VISION_MODEL_PATH") {
            self.vision.model_path = path;
        }
        if let Ok(path) = std::env::var("MULLAMA_VISION_MMPROJ_PATH") {
            self.vision.mmproj_path = path;
        }
        if let Some(numa) = env_parse("MULLAMA_LANE_NUMA")? {
            self.lane.numa = numa;
        }
        if let Ok(level) = std::env::var("MULLAMA_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Check for invalid values before any native resource is touched
    pub fn validate(&self) -> Result<()> {
        if self.context.n_ctx == 0 {
            return Err(BridgeError::ConfigError(
                "Context size must be greater than 0".to_string(),
            ));
        }
        if self.context.n_batch == 0 {
            return Err(BridgeError::ConfigError(
                "Batch size must be greater than 0".to_string(),
            ));
        }
        if i32::try_from(self.context.n_batch).is_err() || i32::try_from(self.context.n_ctx).is_err() {
            return Err(BridgeError::ConfigError(
                "Context and batch sizes must fit in a 32-bit signed integer".to_string(),
            ));
        }
        if self.context.n_threads <= 0 || self.context.n_threads_batch <= 0 {
            return Err(BridgeError::ConfigError(
                "Thread counts must be positive".to_string(),
            ));
        }
        if self.generation.n_len == 0 {
            return Err(BridgeError::ConfigError(
                "n_len must be greater than 0".to_string(),
            ));
        }
        if self.generation.max_steps == Some(0) || self.vision.max_steps == Some(0) {
            return Err(BridgeError::ConfigError(
                "max_steps must be greater than 0 when set".to_string(),
            ));
        }
        if self.vision.n_ctx < 2048 {
            return Err(BridgeError::ConfigError(
                "Vision context needs at least 2048 positions for image embeddings".to_string(),
            ));
        }
        if self.lane.thread_name.trim().is_empty() {
            return Err(BridgeError::ConfigError(
                "Lane thread name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
