//! Pose encoder: joint coordinates to continuous token features.
//!
//! Coordinates are embedded into the hidden space (optionally fused with
//! image-derived guidance features along the channel axis), invisible joints
//! are replaced by a shared learned token, the sequence runs through a stack
//! of mixer blocks, and a dense joint-to-token projection materializes the
//! token slots.

use candle_core::{bail, Result, Tensor};
use candle_nn::{layer_norm, linear, Init, LayerNorm, Linear, Module, VarBuilder};

use crate::config::TokenizerConfig;
use crate::mixer::MixerLayer;

pub struct PoseEncoder {
    start_embed: Linear,
    guide_embed: Option<Linear>,
    invisible_token: Tensor,
    mixers: Vec<MixerLayer>,
    norm: LayerNorm,
    token_proj: Linear,
    feature_embed: Linear,
    coord_dim: usize,
    hidden_dim: usize,
    drop_rate: f64,
}

impl PoseEncoder {
    pub fn new(config: &TokenizerConfig, vb: VarBuilder) -> Result<Self> {
        let enc = &config.encoder;

        let start_embed = linear(config.coord_dim, config.coord_embed_dim(), vb.pp("start_embed"))?;
        let guide_embed = if config.guide_ratio > 0.0 {
            Some(linear(
                config.guide_channels,
                config.guide_embed_dim(),
                vb.pp("guide_embed"),
            )?)
        } else {
            None
        };

        // Shared learned feature substituted for every invisible joint.
        // `new_random` re-seeds this with a truncated normal.
        let invisible_token = vb.get_with_hints(
            (1, 1, enc.hidden_dim),
            "invisible_token",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;

        let mut mixers = Vec::with_capacity(enc.num_blocks);
        for i in 0..enc.num_blocks {
            mixers.push(MixerLayer::new(
                enc.hidden_dim,
                enc.hidden_inter_dim,
                config.num_joints,
                enc.token_inter_dim,
                enc.dropout,
                vb.pp(format!("mixer_{i}")),
            )?);
        }
        let norm = layer_norm(enc.hidden_dim, 1e-5, vb.pp("norm"))?;

        // Dense joint-to-token remapping: every token slot is a learned
        // combination of all joints, not a subset selection.
        let token_proj = linear(
            config.num_joints,
            config.codebook.token_num,
            vb.pp("token_proj"),
        )?;
        let feature_embed = linear(
            enc.hidden_dim,
            config.codebook.token_dim,
            vb.pp("feature_embed"),
        )?;

        Ok(Self {
            start_embed,
            guide_embed,
            invisible_token,
            mixers,
            norm,
            token_proj,
            feature_embed,
            coord_dim: config.coord_dim,
            hidden_dim: enc.hidden_dim,
            drop_rate: enc.drop_rate,
        })
    }

    /// Encode a batch of joints into continuous token features.
    ///
    /// # Arguments
    /// * `joints` - `[batch, num_joints, coord_dim + 1]`, coordinates packed
    ///   with a trailing 0/1 visibility flag
    /// * `guidance` - optional `[batch, num_joints, guide_channels]` features
    /// * `train` - enables the mixer MLP dropout
    /// * `occlusion_dropout` - additionally drops a `drop_rate` fraction of
    ///   visible joints, resampled fresh per call (tokenizer training only)
    ///
    /// # Returns
    /// Continuous features flattened to `[batch * token_num, token_dim]`.
    pub fn forward(
        &self,
        joints: &Tensor,
        guidance: Option<&Tensor>,
        train: bool,
        occlusion_dropout: bool,
    ) -> Result<Tensor> {
        let (bs, num_joints, _) = joints.dims3()?;
        let coords = joints.narrow(2, 0, self.coord_dim)?;
        let mut visible = joints.narrow(2, self.coord_dim, 1)?;

        let mut feat = self.start_embed.forward(&coords)?;
        if let Some(guide_embed) = &self.guide_embed {
            let Some(guidance) = guidance else {
                bail!("guidance features are required when guide_ratio > 0");
            };
            let guide_feat = guide_embed.forward(guidance)?;
            feat = Tensor::cat(&[feat, guide_feat], 2)?;
        }

        if occlusion_dropout {
            // Fresh Bernoulli keep-mask, independent of the input visibility.
            let keep = Tensor::rand(0f32, 1f32, visible.shape(), visible.device())?
                .gt(self.drop_rate as f32)?
                .to_dtype(visible.dtype())?;
            visible = (visible * keep)?;
        }

        // Masked blend: visible joints keep their embedding, invisible ones
        // all share the learned token.
        let mask_tokens = self
            .invisible_token
            .broadcast_as((bs, num_joints, self.hidden_dim))?;
        let invisible = visible.affine(-1.0, 1.0)?;
        feat = (feat.broadcast_mul(&visible)? + mask_tokens.broadcast_mul(&invisible)?)?;

        for mixer in &self.mixers {
            feat = mixer.forward(&feat, train)?;
        }
        let feat = self.norm.forward(&feat)?;

        // Project joints onto token slots, then channels onto the codebook
        // embedding width.
        let feat = feat.transpose(1, 2)?;
        let feat = self.token_proj.forward(&feat)?;
        let feat = feat.transpose(1, 2)?;
        let feat = self.feature_embed.forward(&feat)?;

        feat.flatten(0, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodebookConfig, EncoderConfig, Stage};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn test_config() -> TokenizerConfig {
        TokenizerConfig {
            stage: Stage::Tokenizer,
            num_joints: 5,
            encoder: EncoderConfig {
                num_blocks: 2,
                hidden_dim: 16,
                token_inter_dim: 8,
                hidden_inter_dim: 32,
                dropout: 0.0,
                drop_rate: 0.2,
            },
            codebook: CodebookConfig {
                token_num: 3,
                token_class_num: 32,
                token_dim: 8,
                ema_decay: 0.9,
            },
            ..Default::default()
        }
    }

    fn joints_tensor(rows: &[[f32; 3]], device: &Device) -> Result<Tensor> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (1, rows.len(), 3), device)
    }

    #[test]
    fn test_output_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = test_config();
        let encoder = PoseEncoder::new(&config, vb)?;

        let joints = Tensor::rand(0f32, 1f32, (4, 5, 3), &device)?;
        let out = encoder.forward(&joints, None, false, false)?;

        assert_eq!(out.dims(), &[4 * 3, 8]);
        Ok(())
    }

    #[test]
    fn test_invisible_joints_ignore_coordinates() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let encoder = PoseEncoder::new(&test_config(), vb)?;

        // Same pose twice; the one invisible joint carries arbitrary
        // coordinates that must not leak into the encoding.
        let a = joints_tensor(
            &[
                [0.1, 0.2, 1.0],
                [0.3, 0.4, 1.0],
                [7.0, -3.0, 0.0],
                [0.5, 0.6, 1.0],
                [0.7, 0.8, 1.0],
            ],
            &device,
        )?;
        let b = joints_tensor(
            &[
                [0.1, 0.2, 1.0],
                [0.3, 0.4, 1.0],
                [-42.0, 99.0, 0.0],
                [0.5, 0.6, 1.0],
                [0.7, 0.8, 1.0],
            ],
            &device,
        )?;

        let out_a: Vec<f32> = encoder.forward(&a, None, false, false)?.flatten_all()?.to_vec1()?;
        let out_b: Vec<f32> = encoder.forward(&b, None, false, false)?.flatten_all()?.to_vec1()?;

        for (x, y) in out_a.iter().zip(out_b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_full_occlusion_dropout_masks_every_coordinate() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mut config = test_config();
        config.encoder.drop_rate = 1.0;
        let encoder = PoseEncoder::new(&config, vb)?;

        // drop_rate 1.0 zeroes every keep flag: the encoder sees only the
        // shared invisible token, so the coordinates cannot matter.
        let a = Tensor::rand(0f32, 1f32, (2, 5, 3), &device)?;
        let b = Tensor::rand(0f32, 1f32, (2, 5, 3), &device)?;
        let out_a: Vec<f32> = encoder.forward(&a, None, true, true)?.flatten_all()?.to_vec1()?;
        let out_b: Vec<f32> = encoder.forward(&b, None, true, true)?.flatten_all()?.to_vec1()?;

        assert_eq!(out_a, out_b);
        Ok(())
    }

    #[test]
    fn test_eval_forward_applies_no_occlusion_dropout() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mut config = test_config();
        config.encoder.drop_rate = 1.0;
        let encoder = PoseEncoder::new(&config, vb)?;

        // Even at full drop rate the augmentation is off outside training,
        // so different visible coordinates produce different encodings.
        let a = joints_tensor(
            &[
                [0.1, 0.2, 1.0],
                [0.3, 0.4, 1.0],
                [0.5, 0.6, 1.0],
                [0.7, 0.8, 1.0],
                [0.9, 1.0, 1.0],
            ],
            &device,
        )?;
        let b = joints_tensor(
            &[
                [0.9, 0.8, 1.0],
                [0.7, 0.6, 1.0],
                [0.5, 0.4, 1.0],
                [0.3, 0.2, 1.0],
                [0.1, 0.0, 1.0],
            ],
            &device,
        )?;
        let out_a: Vec<f32> = encoder.forward(&a, None, false, false)?.flatten_all()?.to_vec1()?;
        let out_b: Vec<f32> = encoder.forward(&b, None, false, false)?.flatten_all()?.to_vec1()?;

        assert_ne!(out_a, out_b);
        Ok(())
    }

    #[test]
    fn test_guidance_required_when_enabled() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = TokenizerConfig {
            guide_ratio: 0.5,
            guide_channels: 4,
            ..test_config()
        };
        let encoder = PoseEncoder::new(&config, vb)?;

        let joints = Tensor::rand(0f32, 1f32, (2, 5, 3), &device)?;
        assert!(encoder.forward(&joints, None, false, false).is_err());

        let guidance = Tensor::rand(0f32, 1f32, (2, 5, 4), &device)?;
        let out = encoder.forward(&joints, Some(&guidance), false, false)?;
        assert_eq!(out.dims(), &[2 * 3, 8]);
        Ok(())
    }
}
