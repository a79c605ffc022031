//! Pipeline configuration
//!
//! Configuration is loaded from environment variables; every field has a
//! working default so the library is usable with `Config::default()`.

use std::env;
use std::path::PathBuf;

/// Encoder input resolution (pixels per side). Baked into the model export.
pub const ENCODER_INPUT_SIZE: u32 = 1024;

/// Decoder mask resolution (pixels per side). Baked into the model export.
pub const DECODER_MASK_SIZE: u32 = 256;

/// Below this VRAM estimate the GPU is flagged as low-memory.
pub const LOW_VRAM_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024 * 1024;

const DEFAULT_ENCODER_URL: &str =
    "https://huggingface.co/g-ronimo/sam2-tiny/resolve/main/sam2_hiera_tiny_encoder.onnx";
const DEFAULT_DECODER_URL: &str =
    "https://huggingface.co/g-ronimo/sam2-tiny/resolve/main/sam2_hiera_tiny_decoder.onnx";

const DEFAULT_ENCODER_BYTES: u64 = 42 * 1024 * 1024;
const DEFAULT_DECODER_BYTES: u64 = 15 * 1024 * 1024;

/// Main pipeline configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Model artifact locations and cache
    pub models: ModelConfig,
    /// Inference engine tuning
    pub engine: EngineConfig,
}

/// Model artifact configuration
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Encoder artifact URL
    pub encoder_url: String,
    /// Decoder artifact URL
    pub decoder_url: String,
    /// Expected encoder size in bytes (progress estimation only)
    pub encoder_expected_bytes: u64,
    /// Expected decoder size in bytes (progress estimation only)
    pub decoder_expected_bytes: u64,
    /// Root directory for the durable model cache
    pub cache_dir: PathBuf,
}

/// Inference engine configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Prefer CPU execution even when a GPU provider is available
    pub prefer_cpu: bool,
    /// Threshold applied to mask logits when binarizing candidates
    pub mask_threshold: f32,
    /// Skip candidate index 0 during IoU ranking. Some decoder exports emit
    /// four channels where the first is an auxiliary mask.
    pub exclude_aux_candidate: bool,
    /// Maximum number of per-image embedding sets kept in the engine cache
    pub max_cached_embeddings: usize,
    /// Verbose session logging
    pub verbose: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            encoder_url: DEFAULT_ENCODER_URL.to_string(),
            decoder_url: DEFAULT_DECODER_URL.to_string(),
            encoder_expected_bytes: DEFAULT_ENCODER_BYTES,
            decoder_expected_bytes: DEFAULT_DECODER_BYTES,
            cache_dir: default_cache_dir(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefer_cpu: false,
            mask_threshold: 0.0,
            exclude_aux_candidate: false,
            max_cached_embeddings: 4,
            verbose: false,
        }
    }
}

/// Cache root: `$XDG_CACHE_HOME` or `~/.cache`, falling back to the cwd.
fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = env::var("XDG_CACHE_HOME")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    if let Ok(home) = env::var("HOME")
        && !home.is_empty()
    {
        return PathBuf::from(home).join(".cache");
    }
    PathBuf::from(".cache")
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("SAM_ENCODER_URL")
            && !url.is_empty()
        {
            config.models.encoder_url = url;
        }
        if let Ok(url) = env::var("SAM_DECODER_URL")
            && !url.is_empty()
        {
            config.models.decoder_url = url;
        }
        if let Ok(val) = env::var("SAM_ENCODER_EXPECTED_MB")
            && let Ok(mb) = val.parse::<u64>()
        {
            config.models.encoder_expected_bytes = mb * 1024 * 1024;
        }
        if let Ok(val) = env::var("SAM_DECODER_EXPECTED_MB")
            && let Ok(mb) = val.parse::<u64>()
        {
            config.models.decoder_expected_bytes = mb * 1024 * 1024;
        }
        if let Ok(dir) = env::var("SAM_MODEL_CACHE_DIR")
            && !dir.is_empty()
        {
            config.models.cache_dir = PathBuf::from(dir);
        }

        if let Ok(val) = env::var("SAM_PREFER_CPU") {
            config.engine.prefer_cpu = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("SAM_MASK_THRESHOLD")
            && let Ok(t) = val.parse()
        {
            config.engine.mask_threshold = t;
        }
        if let Ok(val) = env::var("SAM_EXCLUDE_AUX_CANDIDATE") {
            config.engine.exclude_aux_candidate = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("SAM_MAX_CACHED_EMBEDDINGS")
            && let Ok(n) = val.parse()
        {
            config.engine.max_cached_embeddings = n;
        }
        if let Ok(val) = env::var("SAM_VERBOSE") {
            config.engine.verbose = val.to_lowercase() == "true" || val == "1";
        }

        config
    }
}
