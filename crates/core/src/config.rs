//! Typed configuration with defaults, validation, and unknown-key passthrough
//!
//! `config.json` deserializes into [`StoreConfig`]. Every field is named and
//! defaulted; unknown keys at any level are preserved opaquely in `extra`
//! maps so a newer writer's config survives a round-trip through an older
//! reader. Validation happens once at load: a config whose confidence
//! weights do not sum to 1.0 (±1e-6) or whose video options are out of range
//! is rejected with `InvalidInput` rather than silently corrected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

// ============================================================================
// Ranking
// ============================================================================

/// Per-field BM25 contribution weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldWeights {
    pub title: f32,
    pub text: f32,
    pub code: f32,
    pub tag: f32,
}

impl Default for FieldWeights {
    fn default() -> Self {
        FieldWeights {
            title: 5.0,
            text: 2.0,
            code: 1.5,
            tag: 3.0,
        }
    }
}

/// BM25 shape parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Params {
    /// Term-frequency saturation
    pub k1: f32,
    /// Length normalization
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Bm25Params { k1: 1.5, b: 0.75 }
    }
}

/// Additive score bonus per scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopeBonus {
    pub global: f32,
    pub local: f32,
    pub committed: f32,
}

impl Default for ScopeBonus {
    fn default() -> Self {
        ScopeBonus {
            global: 0.5,
            local: 1.0,
            committed: 1.5,
        }
    }
}

/// Recency boost shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecencyConfig {
    pub half_life_days: f32,
    pub scale: f32,
}

impl Default for RecencyConfig {
    fn default() -> Self {
        RecencyConfig {
            half_life_days: 7.0,
            scale: 1.0,
        }
    }
}

/// Phrase-match bonuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhraseConfig {
    /// Added when all terms occur in order and adjacent in one field
    pub bonus: f32,
    /// Added when the entire query matches the title case-insensitively
    pub exact_title_bonus: f32,
}

impl Default for PhraseConfig {
    fn default() -> Self {
        PhraseConfig {
            bonus: 2.5,
            exact_title_bonus: 6.0,
        }
    }
}

/// Hybrid lexical/vector blending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HybridConfig {
    pub enabled: bool,
    pub w_bm25: f32,
    pub w_vec: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for HybridConfig {
    fn default() -> Self {
        HybridConfig {
            enabled: false,
            w_bm25: 0.7,
            w_vec: 0.3,
            model: None,
        }
    }
}

/// Everything that shapes query ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RankingConfig {
    pub field_weights: FieldWeights,
    pub bm25: Bm25Params,
    pub scope_bonus: ScopeBonus,
    pub pin_bonus: f32,
    pub recency: RecencyConfig,
    pub phrase: PhraseConfig,
    pub hybrid: HybridConfig,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for RankingConfig {
    fn default() -> Self {
        RankingConfig {
            field_weights: FieldWeights::default(),
            bm25: Bm25Params::default(),
            scope_bonus: ScopeBonus::default(),
            pin_bonus: 2.0,
            recency: RecencyConfig::default(),
            phrase: PhraseConfig::default(),
            hybrid: HybridConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Confidence
// ============================================================================

/// Weights of the five confidence components; must sum to 1.0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfidenceWeights {
    pub feedback: f32,
    pub usage: f32,
    pub recency: f32,
    pub context: f32,
    pub base: f32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        ConfidenceWeights {
            feedback: 0.35,
            usage: 0.25,
            recency: 0.20,
            context: 0.15,
            base: 0.05,
        }
    }
}

impl ConfidenceWeights {
    pub fn sum(&self) -> f32 {
        self.feedback + self.usage + self.recency + self.context + self.base
    }
}

/// Confidence scoring parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfidenceConfig {
    pub weights: ConfidenceWeights,
    /// Beta prior alpha for helpful feedback
    pub prior_alpha: f32,
    /// Beta prior beta for unhelpful feedback
    pub prior_beta: f32,
    /// Saturation constant K in `1 - exp(-usage / K)`
    pub usage_saturation_k: f32,
    pub usage_half_life_days: f32,
    pub recency_half_life_days: f32,
    pub base_prior: f32,
    pub pin_floor: f32,
    pub pin_multiplier: f32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        ConfidenceConfig {
            weights: ConfidenceWeights::default(),
            prior_alpha: 1.0,
            prior_beta: 1.0,
            usage_saturation_k: 5.0,
            usage_half_life_days: 14.0,
            recency_half_life_days: 7.0,
            base_prior: 0.5,
            pin_floor: 0.8,
            pin_multiplier: 1.05,
            extra: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Which storage adapter a scope uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Prefer video when a transcoder is available, else file
    #[default]
    Auto,
    File,
    Video,
}

/// Video codec selection for the consolidated segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecKind {
    #[default]
    H264,
    H265,
}

impl VideoCodecKind {
    /// Encoder name passed to the transcoder
    pub fn encoder_name(&self) -> &'static str {
        match self {
            VideoCodecKind::H264 => "libx264",
            VideoCodecKind::H265 => "libx265",
        }
    }
}

/// Encoder speed preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoPreset {
    Fast,
    #[default]
    Medium,
    Slow,
}

impl VideoPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoPreset::Fast => "fast",
            VideoPreset::Medium => "medium",
            VideoPreset::Slow => "slow",
        }
    }
}

/// QR error-correction level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EccLevel {
    /// ~7% recovery
    L,
    /// ~15% recovery
    #[default]
    M,
    /// ~25% recovery
    Q,
    /// ~30% recovery
    H,
}

/// Transcoder and QR parameters for the video backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoOptions {
    pub codec: VideoCodecKind,
    /// Constant rate factor; valid range 18..=28
    pub crf: u8,
    pub preset: VideoPreset,
    pub fps: u32,
    pub error_correction: EccLevel,
}

impl Default for VideoOptions {
    fn default() -> Self {
        VideoOptions {
            codec: VideoCodecKind::H264,
            crf: 26,
            preset: VideoPreset::Medium,
            fps: 30,
            error_correction: EccLevel::M,
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub video_options: VideoOptions,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ============================================================================
// Maintenance
// ============================================================================

/// Index flush debounce thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexFlushConfig {
    /// Flush after this many buffered operations
    pub max_ops: u32,
    /// ... or after this many milliseconds since the last flush
    pub max_ms: u64,
}

impl Default for IndexFlushConfig {
    fn default() -> Self {
        IndexFlushConfig {
            max_ops: 100,
            max_ms: 5000,
        }
    }
}

/// Compaction and snapshot cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaintenanceConfig {
    /// Compact after this many journal appends
    pub compact_every: u64,
    pub compact_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub index_flush: IndexFlushConfig,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            compact_every: 500,
            compact_interval_ms: 24 * 60 * 60 * 1000,
            snapshot_interval_ms: 6 * 60 * 60 * 1000,
            index_flush: IndexFlushConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

// ============================================================================
// StoreConfig
// ============================================================================

/// The whole `config.json`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub version: u32,
    pub ranking: RankingConfig,
    pub confidence: ConfidenceConfig,
    pub storage: StorageConfig,
    pub maintenance: MaintenanceConfig,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl StoreConfig {
    /// Parse and validate a `config.json` document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StoreConfig =
            serde_json::from_str(json).map_err(|e| Error::InvalidInput(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        let sum = self.confidence.weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::InvalidInput(format!(
                "confidence weights must sum to 1.0, got {sum}"
            )));
        }
        if !(18..=28).contains(&self.storage.video_options.crf) {
            return Err(Error::InvalidInput(format!(
                "video crf must be in 18..=28, got {}",
                self.storage.video_options.crf
            )));
        }
        if self.storage.video_options.fps == 0 {
            return Err(Error::InvalidInput("video fps must be positive".into()));
        }
        let hybrid = &self.ranking.hybrid;
        if hybrid.enabled && (hybrid.w_bm25 < 0.0 || hybrid.w_vec < 0.0) {
            return Err(Error::InvalidInput(
                "hybrid blend weights must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Environment overrides
// ============================================================================

/// Process-environment knobs (see `config.json` for persistent settings)
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    /// Base directory; defaults to `~/.llm-memory`
    pub home_dir: Option<PathBuf>,
    /// Defer journal replay at startup
    pub skip_startup_replay: bool,
    /// Delay before the deferred replay runs
    pub startup_replay_ms: Option<u64>,
    /// Force a backend regardless of auto-detection
    pub force_backend: Option<BackendKind>,
    pub migration_batch_size: Option<usize>,
    pub migration_max_time_ms: Option<u64>,
}

impl EnvOverrides {
    /// Read the `ENGRAM_*` environment variables
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        EnvOverrides {
            home_dir: var("ENGRAM_HOME").map(PathBuf::from),
            skip_startup_replay: var("ENGRAM_SKIP_STARTUP_REPLAY")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(false),
            startup_replay_ms: var("ENGRAM_STARTUP_REPLAY_MS").and_then(|v| v.parse().ok()),
            force_backend: var("ENGRAM_FORCE_BACKEND").and_then(|v| {
                match v.to_ascii_lowercase().as_str() {
                    "file" => Some(BackendKind::File),
                    "video" => Some(BackendKind::Video),
                    _ => None,
                }
            }),
            migration_batch_size: var("ENGRAM_MIGRATION_BATCH_SIZE").and_then(|v| v.parse().ok()),
            migration_max_time_ms: var("ENGRAM_MIGRATION_MAX_TIME_MS")
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Resolve the base directory, falling back to `~/.llm-memory`
    pub fn resolve_home(&self) -> PathBuf {
        if let Some(dir) = &self.home_dir {
            return dir.clone();
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".llm-memory")
    }
}

// ============================================================================
// Tests
// ============================================================================
