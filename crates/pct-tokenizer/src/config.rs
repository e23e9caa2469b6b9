//! Model configuration.

use serde::{Deserialize, Serialize};

/// Training stage the model is constructed for.
///
/// The stage is fixed at construction time; together with the per-call
/// `train` flag it selects one of four forward behaviors (see
/// [`crate::model::ForwardMode`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Jointly learn encoder, decoder, and codebook.
    Tokenizer,
    /// Consume externally predicted token-class probabilities; only the
    /// decoder and codebook are exercised at inference.
    Classifier,
}

/// Complete tokenizer model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Training stage
    pub stage: Stage,
    /// Number of annotated joints per pose
    pub num_joints: usize,
    /// Coordinate dimensionality (2 for planar keypoints)
    pub coord_dim: usize,
    /// Fraction of the encoder hidden width filled from image guidance
    /// features; 0 disables guidance entirely
    pub guide_ratio: f64,
    /// Channel width of the per-joint guidance features
    pub guide_channels: usize,

    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    pub codebook: CodebookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Number of mixer blocks
    pub num_blocks: usize,
    /// Hidden channel width
    pub hidden_dim: usize,
    /// Inter dim of the joint-mixing MLP
    pub token_inter_dim: usize,
    /// Inter dim of the channel-mixing MLP
    pub hidden_inter_dim: usize,
    /// Mixer MLP dropout
    pub dropout: f64,
    /// Probability of dropping a visible joint during tokenizer training
    /// (stochastic occlusion augmentation)
    pub drop_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Number of mixer blocks
    pub num_blocks: usize,
    /// Hidden channel width
    pub hidden_dim: usize,
    /// Inter dim of the joint-mixing MLP
    pub token_inter_dim: usize,
    /// Inter dim of the channel-mixing MLP
    pub hidden_inter_dim: usize,
    /// Mixer MLP dropout
    pub dropout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodebookConfig {
    /// Number of token slots per pose
    pub token_num: usize,
    /// Codebook vocabulary size
    pub token_class_num: usize,
    /// Codebook embedding width
    pub token_dim: usize,
    /// EMA decay; close to 1 gives slow, stable codebook updates
    pub ema_decay: f64,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            stage: Stage::Tokenizer,
            num_joints: 17,
            coord_dim: 2,
            guide_ratio: 0.0,
            guide_channels: 0,
            encoder: EncoderConfig {
                num_blocks: 4,
                hidden_dim: 512,
                token_inter_dim: 64,
                hidden_inter_dim: 512,
                dropout: 0.0,
                drop_rate: 0.2,
            },
            decoder: DecoderConfig {
                num_blocks: 1,
                hidden_dim: 32,
                token_inter_dim: 64,
                hidden_inter_dim: 64,
                dropout: 0.0,
            },
            codebook: CodebookConfig {
                token_num: 34,
                token_class_num: 2048,
                token_dim: 512,
                ema_decay: 0.9,
            },
        }
    }
}

impl TokenizerConfig {
    /// Channel width of the coordinate embedding. Guidance features, when
    /// enabled, fill the remaining encoder hidden channels.
    pub fn coord_embed_dim(&self) -> usize {
        self.encoder.hidden_dim - self.guide_embed_dim()
    }

    /// Channel width of the guidance embedding.
    pub fn guide_embed_dim(&self) -> usize {
        (self.encoder.hidden_dim as f64 * self.guide_ratio).round() as usize
    }

    /// Load configuration from file, with `PCT_*` environment overrides
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PCT"))
            .build()?;

        settings.try_deserialize()
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("PCT"))
            .build()?;

        settings.try_deserialize()
    }
}
