//! Pose decoder: quantized token features back to joint coordinates.
//!
//! Mirror of the encoder: a dense token-to-joint projection, a channel
//! projection into the decoder hidden space, mixer blocks, and a final
//! regression to 2D coordinates. The decoder is agnostic to which joints
//! were originally invisible.

use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};

use crate::config::TokenizerConfig;
use crate::mixer::MixerLayer;

pub struct PoseDecoder {
    token_proj: Linear,
    start_embed: Linear,
    mixers: Vec<MixerLayer>,
    norm: LayerNorm,
    recover_embed: Linear,
}

impl PoseDecoder {
    pub fn new(config: &TokenizerConfig, vb: VarBuilder) -> Result<Self> {
        let dec = &config.decoder;

        let token_proj = linear(
            config.codebook.token_num,
            config.num_joints,
            vb.pp("token_proj"),
        )?;
        let start_embed = linear(
            config.codebook.token_dim,
            dec.hidden_dim,
            vb.pp("start_embed"),
        )?;

        let mut mixers = Vec::with_capacity(dec.num_blocks);
        for i in 0..dec.num_blocks {
            mixers.push(MixerLayer::new(
                dec.hidden_dim,
                dec.hidden_inter_dim,
                config.num_joints,
                dec.token_inter_dim,
                dec.dropout,
                vb.pp(format!("mixer_{i}")),
            )?);
        }
        let norm = layer_norm(dec.hidden_dim, 1e-5, vb.pp("norm"))?;

        let recover_embed = linear(dec.hidden_dim, config.coord_dim, vb.pp("recover_embed"))?;

        Ok(Self {
            token_proj,
            start_embed,
            mixers,
            norm,
            recover_embed,
        })
    }

    /// Decode `[batch, token_num, token_dim]` features into
    /// `[batch, num_joints, coord_dim]` joint coordinates.
    pub fn forward(&self, token_features: &Tensor, train: bool) -> Result<Tensor> {
        // Expand token slots back across joints.
        let feat = token_features.transpose(1, 2)?;
        let feat = self.token_proj.forward(&feat)?;
        let feat = feat.transpose(1, 2)?;

        let mut feat = self.start_embed.forward(&feat)?;
        for mixer in &self.mixers {
            feat = mixer.forward(&feat, train)?;
        }
        let feat = self.norm.forward(&feat)?;

        self.recover_embed.forward(&feat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodebookConfig, DecoderConfig, TokenizerConfig};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_decoder_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = TokenizerConfig {
            num_joints: 14,
            decoder: DecoderConfig {
                num_blocks: 2,
                hidden_dim: 16,
                token_inter_dim: 8,
                hidden_inter_dim: 32,
                dropout: 0.0,
            },
            codebook: CodebookConfig {
                token_num: 6,
                token_class_num: 32,
                token_dim: 8,
                ema_decay: 0.9,
            },
            ..Default::default()
        };
        let decoder = PoseDecoder::new(&config, vb)?;

        let features = Tensor::randn(0f32, 1.0, (3, 6, 8), &device)?;
        let joints = decoder.forward(&features, false)?;

        assert_eq!(joints.dims(), &[3, 14, 2]);
        Ok(())
    }
}
