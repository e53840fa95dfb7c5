//! Model configuration.
//!
//! [`ModelParameter`] is a flat, serde-deserialisable record. Every field has a default, so a
//! JSON file only needs the values it changes:
//!
//! ```rust
//! use vidtext::config::{MemoryReductionStrategy, ModelParameter};
//!
//! let params = ModelParameter::from_json_str(r#"{
//!     "use_language": false,
//!     "memory_reduction_strategy": "revnet",
//!     "optimizer": ["adam", "learning_rate"]
//! }"#).unwrap();
//! assert_eq!(params.memory_reduction_strategy, MemoryReductionStrategy::Revnet);
//! assert_eq!(params.heads_dim().size, params.n_head);
//! ```
//!
//! Dimensions are not stored. They are derived on demand from the sizes, so changing `n_head`
//! changes every shape that mentions heads.

use crate::tensor::Dimension;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const BATCH: &str = "batch";
pub const SEQUENCE: &str = "sequence";
pub const SEQUENCE_PER_HEAD: &str = "sequence_per_head";
pub const HEADS: &str = "heads";
pub const FEATURES_PER_HEAD: &str = "features_per_head";
pub const INTERMEDIATE: &str = "intermediate";
pub const VOCAB: &str = "vocab";
pub const TOKEN_PATCH: &str = "language_token_patch";
pub const COLOR_CHANNELS: &str = "color_channels";
pub const DISCRETE_COLOR: &str = "discrete_color";

/// How the body trades compute for memory. Fixed per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryReductionStrategy {
    /// Plain sequential blocks.
    #[default]
    None,
    /// Every block is recomputed during the backward pass.
    Checkpoint,
    /// Reversible residual coupling.
    Revnet,
    /// Momentum residual coupling.
    Momentum,
}

impl MemoryReductionStrategy {
    /// Whether blocks add their input back to their output.
    pub fn uses_skip_connections(self) -> bool {
        matches!(self, Self::None | Self::Checkpoint)
    }
}

impl FromStr for MemoryReductionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "checkpoint" => Ok(Self::Checkpoint),
            "revnet" => Ok(Self::Revnet),
            "momentum" => Ok(Self::Momentum),
            other => Err(Error::Config(format!(
                "unknown memory reduction strategy `{other}`"
            ))),
        }
    }
}

impl fmt::Display for MemoryReductionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Checkpoint => "checkpoint",
            Self::Revnet => "revnet",
            Self::Momentum => "momentum",
        };
        f.write_str(name)
    }
}

/// One block: a list of `name[-extra]*` layer strings and an optional skip connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub layer: Vec<String>,
    pub skip: bool,
}

impl BlockConfig {
    pub fn new<S: Into<String>>(layer: impl IntoIterator<Item = S>, skip: bool) -> Self {
        Self {
            layer: layer.into_iter().map(Into::into).collect(),
            skip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParameter {
    /// Name of the outermost build scope.
    pub model_mode: String,
    pub train: bool,
    pub seed: u64,

    pub use_video: bool,
    pub use_language: bool,
    pub use_discrete_video_loss: bool,
    pub use_bit_fold_input_pipeline: bool,
    pub use_empty_frame_embedding: bool,
    pub use_initial_position_embedding: bool,
    pub split_vocab: bool,
    pub calc_accuracy: bool,

    pub n_head: usize,
    pub n_embd: usize,
    pub intermediate_feed_forward_multiplier: usize,
    pub vocab_size: usize,
    pub color_channels: usize,
    pub color_quantization_value: usize,
    pub bit_fold_value: u32,
    pub fold_count: usize,
    pub token_patch_size: usize,
    /// Positions on the spatial context axis that belong to text.
    pub language_token_patch: usize,
    pub vocab_weight_factorization: f64,
    pub input_dropout: f32,
    pub embedding_stddev: f32,
    pub momentumnet_alpha: f32,

    pub memory_reduction_strategy: MemoryReductionStrategy,
    pub n_blocks: usize,
    pub block_config: Vec<BlockConfig>,
    pub input_block_config: Vec<BlockConfig>,
    pub output_block_config: Vec<BlockConfig>,

    /// Gradient transforms applied in order, each `name[:arg]`.
    pub optimizer: Vec<String>,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub warmup_steps: usize,
    /// Steps over which the learning rate decays linearly after warmup; 0 disables decay.
    pub learning_rate_decay_steps: usize,
    pub minimum_learning_rate: f32,
}

impl Default for ModelParameter {
    fn default() -> Self {
        Self {
            model_mode: "jannet".to_string(),
            train: true,
            seed: 0,
            use_video: true,
            use_language: true,
            use_discrete_video_loss: false,
            use_bit_fold_input_pipeline: false,
            use_empty_frame_embedding: false,
            use_initial_position_embedding: false,
            split_vocab: false,
            calc_accuracy: false,
            n_head: 4,
            n_embd: 32,
            intermediate_feed_forward_multiplier: 2,
            vocab_size: 256,
            color_channels: 3,
            color_quantization_value: 256,
            bit_fold_value: 4,
            fold_count: 2,
            token_patch_size: 1,
            language_token_patch: 1,
            vocab_weight_factorization: 1.0,
            input_dropout: 0.0,
            embedding_stddev: 0.04,
            momentumnet_alpha: 0.99,
            memory_reduction_strategy: MemoryReductionStrategy::None,
            n_blocks: 2,
            block_config: vec![
                BlockConfig::new(["norm-shift-scale", "attention"], true),
                BlockConfig::new(["norm-shift-scale", "feed_forward-gelu"], true),
            ],
            input_block_config: Vec::new(),
            output_block_config: Vec::new(),
            optimizer: vec!["adam".to_string(), "learning_rate".to_string()],
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            warmup_steps: 0,
            learning_rate_decay_steps: 0,
            minimum_learning_rate: 0.0,
        }
    }
}

impl ModelParameter {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Rejects settings no model can be built from.
    pub fn validate(&self) -> Result<()> {
        if !self.use_video && !self.use_language {
            return Err(Error::Config(
                "at least one of use_video and use_language must be set".to_string(),
            ));
        }
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(Error::Config(format!(
                "n_embd ({}) must be a positive multiple of n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.use_discrete_video_loss && self.color_quantization_value < 2 {
            return Err(Error::Config(
                "color_quantization_value must be at least 2 for the discrete video loss"
                    .to_string(),
            ));
        }
        if self.use_bit_fold_input_pipeline && (self.fold_count == 0 || self.bit_fold_value == 0) {
            return Err(Error::Config(
                "bit folding needs fold_count and bit_fold_value above 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.input_dropout) {
            return Err(Error::Config(format!(
                "input_dropout {} outside [0, 1)",
                self.input_dropout
            )));
        }
        if !(0.0..=1.0).contains(&self.momentumnet_alpha) {
            return Err(Error::Config(format!(
                "momentumnet_alpha {} outside [0, 1]",
                self.momentumnet_alpha
            )));
        }
        if self.memory_reduction_strategy == MemoryReductionStrategy::Momentum
            && self.momentumnet_alpha == 0.0
        {
            return Err(Error::Config(
                "the momentum coupling needs momentumnet_alpha above 0".to_string(),
            ));
        }
        if self.vocab_weight_factorization <= 0.0 {
            return Err(Error::Config(
                "vocab_weight_factorization must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heads_dim(&self) -> Dimension {
        Dimension::new(HEADS, self.n_head)
    }

    pub fn key_dim(&self) -> Dimension {
        Dimension::new(FEATURES_PER_HEAD, self.n_embd / self.n_head.max(1))
    }

    /// `[heads, features_per_head]`, the trailing axes of every hidden activation.
    pub fn feature_dims(&self) -> Vec<Dimension> {
        vec![self.heads_dim(), self.key_dim()]
    }

    /// `[heads, intermediate]`, the hidden axes of feed-forward layers.
    pub fn intermediate_dims(&self) -> Vec<Dimension> {
        vec![
            self.heads_dim(),
            Dimension::new(
                INTERMEDIATE,
                self.key_dim().size * self.intermediate_feed_forward_multiplier,
            ),
        ]
    }

    /// Width of the token embedding table, scaled by `vocab_weight_factorization`.
    pub fn token_embedding_dim(&self) -> Dimension {
        let base = self.key_dim().size * self.intermediate_feed_forward_multiplier;
        let size = ((base as f64) * self.vocab_weight_factorization).round() as usize;
        Dimension::new(INTERMEDIATE, size.max(1))
    }

    pub fn vocab_dim(&self) -> Dimension {
        Dimension::new(VOCAB, self.vocab_size)
    }

    pub fn token_patch_dim(&self) -> Dimension {
        Dimension::new(TOKEN_PATCH, self.token_patch_size)
    }

    pub fn color_channel_dim(&self) -> Dimension {
        Dimension::new(COLOR_CHANNELS, self.color_channels)
    }

    pub fn discrete_color_dim(&self) -> Dimension {
        Dimension::new(DISCRETE_COLOR, self.color_quantization_value)
    }

    /// `sequence / heads`, the per-head time axis of the discrete video loss.
    pub fn sequence_per_head_dim(&self, sequence: usize) -> Result<Dimension> {
        if sequence % self.n_head != 0 {
            return Err(Error::Config(format!(
                "sequence length {sequence} is not divisible by n_head {}",
                self.n_head
            )));
        }
        Ok(Dimension::new(SEQUENCE_PER_HEAD, sequence / self.n_head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let params = ModelParameter::default();
        params.validate().unwrap();
        assert_eq!(params.key_dim().size, 8);
        assert_eq!(params.intermediate_dims()[1].size, 16);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let params = ModelParameter::from_json_str(
            r#"{"n_head": 2, "block_config": [{"layer": ["feed_forward-relu"]}]}"#,
        )
        .unwrap();
        assert_eq!(params.n_head, 2);
        assert_eq!(params.key_dim().size, 16);
        assert_eq!(params.block_config.len(), 1);
        assert!(!params.block_config[0].skip);
        assert_eq!(params.optimizer, vec!["adam", "learning_rate"]);
    }

    #[test]
    fn test_validation_errors() {
        let err = ModelParameter::from_json_str(r#"{"use_video": false, "use_language": false}"#);
        assert!(matches!(err, Err(Error::Config(_))));

        let err = ModelParameter::from_json_str(r#"{"n_embd": 30, "n_head": 4}"#);
        assert!(matches!(err, Err(Error::Config(_))));

        let err = ModelParameter::from_json_str(
            r#"{"memory_reduction_strategy": "momentum", "momentumnet_alpha": 0.0}"#,
        );
        assert!(matches!(err, Err(Error::Config(_))));
        assert!(ModelParameter::from_json_str(
            r#"{"memory_reduction_strategy": "revnet", "momentumnet_alpha": 0.0}"#
        )
        .is_ok());

        let err = ModelParameter::from_json_str(r#"{"memory_reduction_strategy": "fancy"}"#);
        assert!(matches!(err, Err(Error::Json(_))));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "momentum".parse::<MemoryReductionStrategy>().unwrap(),
            MemoryReductionStrategy::Momentum
        );
        assert!("other".parse::<MemoryReductionStrategy>().is_err());
        assert!(MemoryReductionStrategy::Checkpoint.uses_skip_connections());
        assert!(!MemoryReductionStrategy::Revnet.uses_skip_connections());
        assert_eq!(MemoryReductionStrategy::Revnet.to_string(), "revnet");
    }

    #[test]
    fn test_token_embedding_dim_factorization() {
        let params = ModelParameter {
            vocab_weight_factorization: 0.5,
            ..ModelParameter::default()
        };
        assert_eq!(params.token_embedding_dim().size, 8);
    }

    #[test]
    fn test_sequence_per_head() {
        let params = ModelParameter::default();
        assert_eq!(params.sequence_per_head_dim(8).unwrap().size, 2);
        assert!(params.sequence_per_head_dim(6).is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, r#"{"seed": 7}"#).unwrap();
        assert_eq!(ModelParameter::from_json_file(&path).unwrap().seed, 7);
        assert!(matches!(
            ModelParameter::from_json_file(dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }
}
