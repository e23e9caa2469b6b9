//! Complete pose compositional token model and its stage/mode state machine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{bail, DType, Device, Result, Tensor};
use candle_nn::{loss, VarBuilder, VarMap};

use crate::collective::{Collective, SingleProcess};
use crate::config::{Stage, TokenizerConfig};
use crate::decoder::PoseDecoder;
use crate::encoder::PoseEncoder;
use crate::init::trunc_normal;
use crate::quantizer::VectorQuantizer;

/// Key prefix used when the tokenizer is persisted as a nested submodule of
/// a full pose-estimation head; stripped on load.
pub const NESTED_HEAD_PREFIX: &str = "keypoint_head.tokenizer.";

/// The four forward behaviors, selected by `(stage, train)`.
///
/// Branch participation in the EMA barrier is derived from this enum alone:
/// every data-parallel worker resolves the same mode on a step, so either
/// all of them enter the collective reduction or none do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    TokenizerTrain,
    TokenizerEval,
    ClassifierTrain,
    ClassifierEval,
}

impl ForwardMode {
    pub fn resolve(stage: Stage, train: bool) -> Self {
        match (stage, train) {
            (Stage::Tokenizer, true) => ForwardMode::TokenizerTrain,
            (Stage::Tokenizer, false) => ForwardMode::TokenizerEval,
            (Stage::Classifier, true) => ForwardMode::ClassifierTrain,
            (Stage::Classifier, false) => ForwardMode::ClassifierEval,
        }
    }
}

/// Output of one forward pass.
#[derive(Debug)]
pub struct TokenizerOutput {
    /// Reconstructed joint coordinates `[batch, num_joints, coord_dim]`
    pub recovered_joints: Tensor,
    /// Discrete token-class assignment per slot `[batch * token_num]`;
    /// `None` in classifier-eval mode where no assignment is computed
    pub encoding_indices: Option<Tensor>,
    /// Scalar quantization loss; present only in tokenizer training
    pub quantization_loss: Option<Tensor>,
    /// Detached quantized token features `[batch, token_num, token_dim]`,
    /// e.g. for feeding a downstream classifier
    pub token_features: Tensor,
}

/// Pose compositional token model: encoder, vector quantizer, decoder.
pub struct PoseTokenizer {
    encoder: PoseEncoder,
    quantizer: VectorQuantizer,
    decoder: PoseDecoder,
    collective: Arc<dyn Collective>,
    stage: Stage,
    token_num: usize,
    token_dim: usize,
    config: TokenizerConfig,
}

impl PoseTokenizer {
    pub fn new(config: TokenizerConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = PoseEncoder::new(&config, vb.pp("encoder"))?;
        let quantizer = VectorQuantizer::new(&config.codebook, vb.pp("quantizer"))?;
        let decoder = PoseDecoder::new(&config, vb.pp("decoder"))?;

        Ok(Self {
            encoder,
            quantizer,
            decoder,
            collective: Arc::new(SingleProcess),
            stage: config.stage,
            token_num: config.codebook.token_num,
            token_dim: config.codebook.token_dim,
            config,
        })
    }

    /// Create a randomly initialized model together with its trainable
    /// variables.
    pub fn new_random(config: TokenizerConfig, device: &Device) -> Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(config, vb)?;

        // The invisible token sits in a narrow band around zero; re-seed it
        // with a matching truncated normal.
        {
            let data = varmap.data().lock().unwrap();
            if let Some(var) = data.get("encoder.invisible_token") {
                let seeded = trunc_normal(var.dims(), 0.0, 0.02, -0.02, 0.02, device)?;
                var.set(&seeded)?;
            }
        }

        Ok((model, varmap))
    }

    /// Build the model from pretrained tokenizer weights.
    ///
    /// Only the classifier stage loads a pretrained tokenizer; invoking this
    /// with an existing checkpoint in tokenizer stage is a configuration
    /// error and aborts. When no usable path is given, the model falls back
    /// to random initialization — with an operator warning in classifier
    /// mode, where a trained tokenizer is expected.
    pub fn from_pretrained(
        config: TokenizerConfig,
        pretrained: Option<&Path>,
        device: &Device,
    ) -> pct_core::Result<Self> {
        match pretrained {
            Some(path) if path.is_file() => {
                assert!(
                    config.stage == Stage::Classifier,
                    "the tokenizer stage learns its weights from scratch and must not \
                     load a pretrained tokenizer"
                );

                let tensors = candle_core::safetensors::load(path, device)?;
                let tensors: HashMap<String, Tensor> = tensors
                    .into_iter()
                    .map(|(name, tensor)| {
                        let name = name
                            .strip_prefix(NESTED_HEAD_PREFIX)
                            .map(str::to_string)
                            .unwrap_or(name);
                        (name, tensor)
                    })
                    .collect();

                let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
                Ok(Self::new(config, vb)?)
            }
            _ => {
                if config.stage == Stage::Classifier {
                    tracing::warn!(
                        "no pretrained tokenizer weights were given; the classifier \
                         stage expects a trained tokenizer and will run from random \
                         initialization"
                    );
                }
                let (model, _varmap) = Self::new_random(config, device)?;
                Ok(model)
            }
        }
    }

    /// Replace the collective used for the EMA reduction. Defaults to
    /// [`SingleProcess`], where the reduction is the identity.
    pub fn with_collective(mut self, collective: Arc<dyn Collective>) -> Self {
        self.collective = collective;
        self
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `joints` - `[batch, num_joints, coord_dim + 1]` coordinates packed
    ///   with a visibility flag; unused in classifier-eval mode
    /// * `guidance` - optional `[batch, num_joints, guide_channels]` features
    /// * `cls_logits` - `[batch * token_num, token_class_num]` externally
    ///   predicted class probabilities; required in classifier mode
    /// * `train` - training-mode flag
    pub fn forward(
        &self,
        joints: &Tensor,
        guidance: Option<&Tensor>,
        cls_logits: Option<&Tensor>,
        train: bool,
    ) -> Result<TokenizerOutput> {
        let mode = ForwardMode::resolve(self.stage, train);

        let (token_feat, indices, quantization_loss, bs) = match mode {
            ForwardMode::TokenizerTrain => {
                let bs = joints.dim(0)?;
                let continuous = self.encoder.forward(joints, guidance, true, true)?;
                let (indices, encodings) = self.quantizer.nearest(&continuous)?;
                let quantized = self.quantizer.lookup(&encodings)?;

                // The codebook update and loss use the pre-update lookup.
                self.quantizer
                    .ema_update(&encodings, &continuous, self.collective.as_ref())?;
                let quantization_loss = loss::mse(&quantized.detach(), &continuous)?;

                // Straight-through: the decoder sees the quantized value,
                // the encoder receives gradient as if quantization were the
                // identity.
                let st = (&continuous + (quantized - &continuous)?.detach())?;
                (st, Some(indices), Some(quantization_loss), bs)
            }
            ForwardMode::TokenizerEval => {
                let bs = joints.dim(0)?;
                let continuous = self.encoder.forward(joints, guidance, false, false)?;
                let (indices, encodings) = self.quantizer.nearest(&continuous)?;
                let quantized = self.quantizer.lookup(&encodings)?;
                (quantized, Some(indices), None, bs)
            }
            ForwardMode::ClassifierTrain => {
                let logits = require_logits(cls_logits)?;
                let bs = joints.dim(0)?;

                // The encoder still runs here: its discrete assignments are
                // the ground-truth class labels for classifier training. The
                // decoder consumes the classifier's soft lookup instead.
                let continuous = self.encoder.forward(joints, guidance, true, false)?;
                let (indices, _) = self.quantizer.nearest(&continuous)?;
                let quantized = self.quantizer.lookup(logits)?;
                (quantized, Some(indices), None, bs)
            }
            ForwardMode::ClassifierEval => {
                let logits = require_logits(cls_logits)?;
                let bs = logits.dim(0)? / self.token_num;
                let quantized = self.quantizer.lookup(logits)?;
                (quantized, None, None, bs)
            }
        };

        let token_feat = token_feat.reshape((bs, self.token_num, self.token_dim))?;
        let token_features = token_feat.detach();

        let recovered_joints = self.decoder.forward(&token_feat, train)?;

        Ok(TokenizerOutput {
            recovered_joints,
            encoding_indices: indices,
            quantization_loss,
            token_features,
        })
    }

    /// Live quantizer buffers under their persisted key names.
    pub fn quantizer_state(&self) -> Vec<(String, Tensor)> {
        self.quantizer
            .export_state()
            .into_iter()
            .map(|(name, tensor)| (format!("quantizer.{name}"), tensor))
            .collect()
    }

    pub fn quantizer(&self) -> &VectorQuantizer {
        &self.quantizer
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }
}

fn require_logits(cls_logits: Option<&Tensor>) -> Result<&Tensor> {
    match cls_logits {
        Some(logits) => Ok(logits),
        None => bail!("classifier mode requires externally predicted token-class logits"),
    }
}
