//! Attention-free sequence mixer blocks.
//!
//! Each block is a shape-preserving `[batch, seq, channels]` transform that
//! mixes information along both axes: a token-mixing MLP applied across the
//! sequence positions (joints or token slots) and a channel-mixing MLP
//! applied across the feature channels, combined through residuals.

use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, linear, Dropout, LayerNorm, Linear, Module, VarBuilder};

/// Two-layer MLP with GELU and dropout.
struct MlpBlock {
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
}

impl MlpBlock {
    fn new(dim: usize, inter_dim: usize, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(dim, inter_dim, vb.pp("fc1"))?;
        let fc2 = linear(inter_dim, dim, vb.pp("fc2"))?;

        Ok(Self {
            fc1,
            fc2,
            dropout: Dropout::new(dropout as f32),
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.fc1.forward(x)?;
        let x = x.gelu()?;
        let x = self.fc2.forward(&x)?;
        self.dropout.forward(&x, train)
    }
}

/// One mixer block.
///
/// `seq_len` is the size of the mixed sequence axis and must match the input
/// at dimension 1; the channel axis carries `hidden_dim` features.
pub struct MixerLayer {
    norm1: LayerNorm,
    token_mix: MlpBlock,
    norm2: LayerNorm,
    channel_mix: MlpBlock,
}

impl MixerLayer {
    pub fn new(
        hidden_dim: usize,
        hidden_inter_dim: usize,
        seq_len: usize,
        seq_inter_dim: usize,
        dropout: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm1 = layer_norm(hidden_dim, 1e-5, vb.pp("norm1"))?;
        let token_mix = MlpBlock::new(seq_len, seq_inter_dim, dropout, vb.pp("token_mix"))?;
        let norm2 = layer_norm(hidden_dim, 1e-5, vb.pp("norm2"))?;
        let channel_mix =
            MlpBlock::new(hidden_dim, hidden_inter_dim, dropout, vb.pp("channel_mix"))?;

        Ok(Self {
            norm1,
            token_mix,
            norm2,
            channel_mix,
        })
    }

    /// Forward pass over `[batch, seq_len, hidden_dim]`, same-shaped output.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        // Mix across the sequence axis.
        let y = self.norm1.forward(x)?;
        let y = y.transpose(1, 2)?;
        let y = self.token_mix.forward(&y, train)?;
        let y = y.transpose(1, 2)?;

        // Mix across the channel axis.
        let z = self.norm2.forward(&(x + &y)?)?;
        let z = self.channel_mix.forward(&z, train)?;

        (x + y)? + z
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_mixer_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mixer = MixerLayer::new(32, 64, 14, 8, 0.0, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 14, 32), &device)?;
        let y = mixer.forward(&x, false)?;

        assert_eq!(y.dims(), &[2, 14, 32]);
        Ok(())
    }

    #[test]
    fn test_eval_forward_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        // Non-zero dropout must be inert outside of training.
        let mixer = MixerLayer::new(16, 32, 6, 12, 0.5, vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 6, 16), &device)?;

        let a: Vec<f32> = mixer.forward(&x, false)?.flatten_all()?.to_vec1()?;
        let b: Vec<f32> = mixer.forward(&x, false)?.flatten_all()?.to_vec1()?;
        assert_eq!(a, b);
        Ok(())
    }
}
