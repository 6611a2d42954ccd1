//! Configuration structures for the memory layer.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MemoryError, MemoryResult};
use crate::types::{Pos, SEQ_MAX};

/// Element type of a cache buffer.
///
/// Only the storage layout matters here: the row size in bytes for a given
/// number of elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit floating point.
    #[default]
    F16,
    /// Brain floating point 16.
    Bf16,
    /// 8-bit blocks of 32 values with one f16 scale.
    #[serde(rename = "q8_0")]
    Q8_0,
}

impl DType {
    /// Number of elements in one block.
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::Bf16 => 1,
            Self::Q8_0 => 32,
        }
    }

    /// Bytes per block.
    pub fn type_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::Bf16 => 2,
            Self::Q8_0 => 34,
        }
    }

    /// Bytes needed for a row of `n` elements.
    pub fn row_size(self, n: usize) -> usize {
        n.div_ceil(self.block_size()) * self.type_size()
    }

    /// Canonical lowercase name, as written into state streams.
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::Q8_0 => "q8_0",
        }
    }

    /// Parse a canonical name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "f32" => Some(Self::F32),
            "f16" => Some(Self::F16),
            "bf16" => Some(Self::Bf16),
            "q8_0" => Some(Self::Q8_0),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Sliding-window attention masking rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwaType {
    /// No window.
    #[default]
    None,
    /// Attend to the last `n_swa` positions.
    Standard,
    /// Attend within the current chunk of `n_swa` positions.
    Chunked,
    /// Attend to `n_swa / 2` positions on each side.
    Symmetric,
}

impl SwaType {
    /// Whether key position `p0` is outside the window of query position `p1`.
    pub fn is_masked(self, n_swa: u32, p0: Pos, p1: Pos) -> bool {
        if n_swa == 0 {
            return false;
        }
        let n_swa = n_swa as i64;
        let (p0, p1) = (p0 as i64, p1 as i64);
        match self {
            Self::None => false,
            Self::Standard => p1 - p0 >= n_swa,
            Self::Chunked => p0 < (p1 / n_swa) * n_swa,
            Self::Symmetric => {
                let half = n_swa / 2;
                let diff = p1 - p0;
                diff < -half || diff > half
            }
        }
    }
}

/// Model description consumed once at cache construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of layers.
    pub n_layer: u32,
    /// Key row width per cell (heads * head dim).
    pub n_embd_k_gqa: u32,
    /// Value row width per cell.
    pub n_embd_v_gqa: u32,
    /// Rolling (convolution) state width per recurrent slot.
    #[serde(default)]
    pub n_embd_r: u32,
    /// Recurrent state width per recurrent slot.
    #[serde(default)]
    pub n_embd_s: u32,
    /// Sliding window size.
    #[serde(default)]
    pub n_swa: u32,
    /// Sliding window masking rule.
    #[serde(default)]
    pub swa_type: SwaType,
    /// Per-layer sliding window flag (empty = none).
    #[serde(default)]
    pub swa_layers: Vec<bool>,
    /// Per-layer recurrent flag (empty = none).
    #[serde(default)]
    pub recurrent_layers: Vec<bool>,
}

impl ModelConfig {
    /// Plain attention model.
    pub fn attention(n_layer: u32, n_embd_k_gqa: u32, n_embd_v_gqa: u32) -> Self {
        Self {
            n_layer,
            n_embd_k_gqa,
            n_embd_v_gqa,
            n_embd_r: 0,
            n_embd_s: 0,
            n_swa: 0,
            swa_type: SwaType::None,
            swa_layers: Vec::new(),
            recurrent_layers: Vec::new(),
        }
    }

    /// Pure recurrent model: every layer is recurrent.
    pub fn recurrent(n_layer: u32, n_embd_r: u32, n_embd_s: u32) -> Self {
        Self {
            n_embd_r,
            n_embd_s,
            recurrent_layers: vec![true; n_layer as usize],
            ..Self::attention(n_layer, 0, 0)
        }
    }

    /// Small model for tests and examples.
    pub fn tiny() -> Self {
        Self::attention(2, 8, 8)
    }

    /// Enable a sliding window on layers selected by `n_pattern`.
    ///
    /// With `n_pattern == 0` every layer uses the window; otherwise the last
    /// layer of every group of `n_pattern` layers is a full-attention layer.
    pub fn with_swa(mut self, n_swa: u32, swa_type: SwaType, n_pattern: u32) -> Self {
        self.n_swa = n_swa;
        self.swa_type = swa_type;
        self.set_swa_pattern(n_pattern);
        self
    }

    /// Mark the layers selected by `pred` as recurrent.
    pub fn with_recurrent_layers(
        mut self,
        n_embd_r: u32,
        n_embd_s: u32,
        pred: impl Fn(u32) -> bool,
    ) -> Self {
        self.n_embd_r = n_embd_r;
        self.n_embd_s = n_embd_s;
        self.recurrent_layers = (0..self.n_layer).map(pred).collect();
        self
    }

    /// Fill `swa_layers` from a repeating pattern.
    pub fn set_swa_pattern(&mut self, n_pattern: u32) {
        self.swa_layers = (0..self.n_layer)
            .map(|il| n_pattern == 0 || il % n_pattern < n_pattern - 1)
            .collect();
    }

    /// Whether layer `il` uses the sliding window.
    pub fn is_swa(&self, il: u32) -> bool {
        self.swa_layers.get(il as usize).copied().unwrap_or(false)
    }

    /// Whether layer `il` is recurrent.
    pub fn is_recurrent(&self, il: u32) -> bool {
        self.recurrent_layers
            .get(il as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Whether any layer uses the sliding window.
    pub fn has_swa(&self) -> bool {
        self.swa_type != SwaType::None && self.swa_layers.iter().any(|&b| b)
    }

    /// Whether any layer is recurrent.
    pub fn has_recurrent(&self) -> bool {
        self.recurrent_layers.iter().any(|&b| b)
    }

    /// Whether any layer is not recurrent.
    pub fn has_attention(&self) -> bool {
        (0..self.n_layer).any(|il| !self.is_recurrent(il))
    }

    /// Sliding window test using this model's window settings.
    pub fn is_masked_swa(&self, p0: Pos, p1: Pos) -> bool {
        self.swa_type.is_masked(self.n_swa, p0, p1)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.n_layer == 0 {
            return Err(MemoryError::config("n_layer must be positive"));
        }
        let n_layer = self.n_layer as usize;
        if !self.swa_layers.is_empty() && self.swa_layers.len() != n_layer {
            return Err(MemoryError::config(format!(
                "swa_layers has {} entries, expected {n_layer}",
                self.swa_layers.len()
            )));
        }
        if !self.recurrent_layers.is_empty() && self.recurrent_layers.len() != n_layer {
            return Err(MemoryError::config(format!(
                "recurrent_layers has {} entries, expected {n_layer}",
                self.recurrent_layers.len()
            )));
        }
        if self.has_attention() && (self.n_embd_k_gqa == 0 || self.n_embd_v_gqa == 0) {
            return Err(MemoryError::config(
                "attention layers need non-zero n_embd_k_gqa and n_embd_v_gqa",
            ));
        }
        if self.has_recurrent() && (self.n_embd_r == 0 || self.n_embd_s == 0) {
            return Err(MemoryError::config(
                "recurrent layers need non-zero n_embd_r and n_embd_s",
            ));
        }
        if self.swa_type != SwaType::None && self.n_swa == 0 {
            return Err(MemoryError::config("sliding window type set but n_swa is 0"));
        }
        Ok(())
    }
}

/// Cache variant to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Single attention cache for all layers.
    #[default]
    Unified,
    /// Recurrent state cache for all layers.
    Recurrent,
    /// Full-context cache plus sliding-window cache.
    Iswa,
    /// Attention cache plus recurrent cache.
    Hybrid,
}

/// Cache construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache variant.
    #[serde(default)]
    pub kind: CacheKind,
    /// Attention cells.
    #[serde(default = "default_kv_size")]
    pub kv_size: u32,
    /// Recurrent slots (0 = `n_seq_max`).
    #[serde(default)]
    pub rs_size: u32,
    /// Maximum concurrently live sequences.
    #[serde(default = "default_n_seq_max")]
    pub n_seq_max: u32,
    /// Padding granularity for the attended cell range.
    #[serde(default = "default_n_pad")]
    pub n_pad: u32,
    /// Micro-batch size.
    #[serde(default = "default_n_ubatch")]
    pub n_ubatch: u32,
    /// Key element type.
    #[serde(default)]
    pub type_k: DType,
    /// Value element type.
    #[serde(default)]
    pub type_v: DType,
    /// Rolling state element type.
    #[serde(default = "default_state_type")]
    pub type_r: DType,
    /// Recurrent state element type.
    #[serde(default = "default_state_type")]
    pub type_s: DType,
    /// Placement hint for the graph builder.
    #[serde(default = "default_offload")]
    pub offload: bool,
    /// Give the sliding-window cache the full size.
    #[serde(default)]
    pub swa_full: bool,
    /// Fragmentation threshold that triggers defragmentation (< 0 disables).
    #[serde(default = "default_defrag_thold")]
    pub defrag_thold: f32,
}

fn default_kv_size() -> u32 {
    4096
}

fn default_n_seq_max() -> u32 {
    1
}

fn default_n_pad() -> u32 {
    32
}

fn default_n_ubatch() -> u32 {
    512
}

fn default_state_type() -> DType {
    DType::F32
}

fn default_offload() -> bool {
    true
}

fn default_defrag_thold() -> f32 {
    -1.0
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::default(),
            kv_size: default_kv_size(),
            rs_size: 0,
            n_seq_max: default_n_seq_max(),
            n_pad: default_n_pad(),
            n_ubatch: default_n_ubatch(),
            type_k: DType::default(),
            type_v: DType::default(),
            type_r: default_state_type(),
            type_s: default_state_type(),
            offload: default_offload(),
            swa_full: false,
            defrag_thold: default_defrag_thold(),
        }
    }
}

impl CacheConfig {
    /// Number of recurrent slots to allocate.
    pub fn effective_rs_size(&self) -> u32 {
        if self.rs_size == 0 {
            self.n_seq_max.max(1)
        } else {
            self.rs_size
        }
    }

    /// Check the parameters.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.kv_size == 0 && self.kind != CacheKind::Recurrent {
            return Err(MemoryError::config("kv_size must be positive"));
        }
        if self.n_seq_max == 0 || self.n_seq_max as usize > SEQ_MAX {
            return Err(MemoryError::config(format!(
                "n_seq_max must be in 1..={SEQ_MAX}, got {}",
                self.n_seq_max
            )));
        }
        if self.n_pad == 0 {
            return Err(MemoryError::config("n_pad must be positive"));
        }
        if self.n_ubatch == 0 {
            return Err(MemoryError::config("n_ubatch must be positive"));
        }
        Ok(())
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json or text).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,
    /// Prometheus exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// Everything needed to build and drive one memory instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqcacheConfig {
    /// Model description.
    pub model: ModelConfig,
    /// Cache parameters.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl SeqcacheConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> MemoryResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.model.validate()?;
        config.cache.validate()?;
        Ok(config)
    }

    /// Load a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| MemoryError::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Pretty-printed JSON.
    pub fn to_json_pretty(&self) -> MemoryResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_row_size() {
        assert_eq!(DType::F32.row_size(8), 32);
        assert_eq!(DType::F16.row_size(8), 16);
        assert_eq!(DType::Bf16.row_size(3), 6);
        assert_eq!(DType::Q8_0.row_size(64), 68);
        assert_eq!(DType::Q8_0.row_size(8), 34);
    }

    #[test]
    fn test_dtype_names() {
        for dtype in [DType::F32, DType::F16, DType::Bf16, DType::Q8_0] {
            assert_eq!(DType::from_name(dtype.name()), Some(dtype));
        }
        assert_eq!(DType::from_name("q4_k"), None);
    }

    #[test]
    fn test_swa_masking() {
        assert!(!SwaType::None.is_masked(4, 0, 100));
        assert!(SwaType::Standard.is_masked(4, 0, 4));
        assert!(!SwaType::Standard.is_masked(4, 1, 4));
        assert!(SwaType::Chunked.is_masked(4, 3, 4));
        assert!(!SwaType::Chunked.is_masked(4, 4, 7));
        assert!(SwaType::Symmetric.is_masked(4, 0, 3));
        assert!(!SwaType::Symmetric.is_masked(4, 5, 3));
    }

    #[test]
    fn test_swa_pattern() {
        let model = ModelConfig::attention(6, 8, 8).with_swa(4, SwaType::Standard, 3);
        let flags: Vec<bool> = (0..6).map(|il| model.is_swa(il)).collect();
        assert_eq!(flags, vec![true, true, false, true, true, false]);
        assert!(model.has_swa());

        let all = ModelConfig::attention(3, 8, 8).with_swa(4, SwaType::Standard, 0);
        assert!((0..3).all(|il| all.is_swa(il)));
    }

    #[test]
    fn test_model_validation() {
        assert!(ModelConfig::tiny().validate().is_ok());
        assert!(ModelConfig::attention(0, 8, 8).validate().is_err());
        assert!(ModelConfig::recurrent(2, 0, 4).validate().is_err());

        let mut bad = ModelConfig::tiny();
        bad.swa_layers = vec![true];
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.kind, CacheKind::Unified);
        assert_eq!(config.kv_size, 4096);
        assert_eq!(config.type_k, DType::F16);
        assert_eq!(config.type_r, DType::F32);
        assert_eq!(config.effective_rs_size(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_rejects_bad_seq_max() {
        let config = CacheConfig {
            n_seq_max: 65,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let json = r#"{
            "model": { "n_layer": 4, "n_embd_k_gqa": 16, "n_embd_v_gqa": 16 },
            "cache": { "kind": "iswa", "kv_size": 128, "type_k": "q8_0" }
        }"#;
        let config = SeqcacheConfig::from_json_str(json).unwrap();
        assert_eq!(config.cache.kind, CacheKind::Iswa);
        assert_eq!(config.cache.type_k, DType::Q8_0);
        assert_eq!(config.cache.type_v, DType::F16);
        assert_eq!(config.cache.n_pad, 32);
        assert_eq!(config.runtime.logging.level, "info");

        let text = config.to_json_pretty().unwrap();
        let back = SeqcacheConfig::from_json_str(&text).unwrap();
        assert_eq!(back.model, config.model);
    }

    #[test]
    fn test_missing_config_file() {
        let err = SeqcacheConfig::from_json_file("/nonexistent/seqcache.json").unwrap_err();
        assert!(matches!(err, MemoryError::ConfigLoad { .. }));
    }
}
