//! Vector quantizer with a distributed EMA-clustered codebook.
//!
//! Continuous token features are assigned to their nearest codebook entry.
//! During tokenizer training the codebook is not learned by gradient descent:
//! it tracks exponential-moving-average cluster statistics that are summed
//! across all training workers before each update, so every worker observes
//! an identical codebook afterwards.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};
use parking_lot::RwLock;

use crate::collective::Collective;
use crate::config::CodebookConfig;

/// Laplace smoothing applied to cluster occupancy so starved classes never
/// reach zero and divide the codebook away.
const LAPLACE_EPS: f64 = 1e-5;

/// Codebook and its EMA statistics. The three tensors are updated atomically
/// together under one lock; `codebook = ema_w / ema_cluster_size` holds after
/// every update.
struct CodebookState {
    codebook: Tensor,
    ema_cluster_size: Tensor,
    ema_w: Tensor,
}

pub struct VectorQuantizer {
    state: RwLock<CodebookState>,
    token_class_num: usize,
    decay: f64,
}

impl VectorQuantizer {
    pub fn new(config: &CodebookConfig, vb: VarBuilder) -> Result<Self> {
        let normal = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        let codebook = vb.get_with_hints(
            (config.token_class_num, config.token_dim),
            "codebook",
            normal,
        )?;
        let ema_cluster_size =
            vb.get_with_hints(config.token_class_num, "ema_cluster_size", Init::Const(0.0))?;
        let ema_w = vb.get_with_hints(
            (config.token_class_num, config.token_dim),
            "ema_w",
            normal,
        )?;

        Ok(Self {
            state: RwLock::new(CodebookState {
                codebook,
                ema_cluster_size,
                ema_w,
            }),
            token_class_num: config.token_class_num,
            decay: config.ema_decay,
        })
    }

    /// Nearest-neighbor assignment of `[N, token_dim]` features.
    ///
    /// Distances use the expansion `|x|^2 + |c|^2 - 2*x.c^T` so the full
    /// `[N, K, token_dim]` difference tensor is never materialized. Ties go
    /// to the lowest class index.
    ///
    /// # Returns
    /// `(encoding_indices [N], one-hot assignments [N, K])`
    pub fn nearest(&self, features: &Tensor) -> Result<(Tensor, Tensor)> {
        let state = self.state.read();

        let x2 = features.sqr()?.sum_keepdim(1)?;
        let c2 = state.codebook.sqr()?.sum(1)?;
        let dots = features.matmul(&state.codebook.t()?)?;
        let distances = x2
            .broadcast_add(&c2.unsqueeze(0)?)?
            .sub(&dots.affine(2.0, 0.0)?)?;

        let indices = distances.argmin(D::Minus1)?;
        let encodings = one_hot_assignments(&indices, self.token_class_num)?;
        Ok((indices, encodings))
    }

    /// Resolve assignment weights to token features: `weights . codebook`.
    ///
    /// With one-hot rows this is the hard codebook lookup; with probability
    /// rows (classifier mode) it is the codebook-weighted expectation.
    pub fn lookup(&self, weights: &Tensor) -> Result<Tensor> {
        let state = self.state.read();
        weights.matmul(&state.codebook)
    }

    /// One EMA codebook update from this step's assignments.
    ///
    /// The one-hot assignments and the per-class feature sums are summed
    /// across all workers as a single concatenated payload; the call blocks
    /// until every worker has contributed, after which all replicas hold
    /// bit-identical statistics.
    pub fn ema_update(
        &self,
        encodings: &Tensor,
        features: &Tensor,
        collective: &dyn Collective,
    ) -> Result<()> {
        // Gradient-free per-class sum of assigned features.
        let dw = encodings.t()?.matmul(&features.detach())?;

        let combined = Tensor::cat(&[encodings.flatten_all()?, dw.flatten_all()?], 0)?;
        let combined = collective.all_reduce_sum(&combined)?;
        let n_enc = encodings.elem_count();
        let sync_encodings = combined.narrow(0, 0, n_enc)?.reshape(encodings.shape())?;
        let sync_dw = combined
            .narrow(0, n_enc, dw.elem_count())?
            .reshape(dw.shape())?;

        let mut state = self.state.write();

        let cluster_size = ((&state.ema_cluster_size * self.decay)?
            + (sync_encodings.sum(0)? * (1.0 - self.decay))?)?;

        // Laplace-smooth and renormalize, preserving the total mass n.
        let n = cluster_size.sum_all()?.to_scalar::<f32>()? as f64;
        let scale = n / (n + self.token_class_num as f64 * LAPLACE_EPS);
        let cluster_size = cluster_size.affine(scale, LAPLACE_EPS * scale)?;

        let ema_w = ((&state.ema_w * self.decay)? + (sync_dw * (1.0 - self.decay))?)?;
        let codebook = ema_w.broadcast_div(&cluster_size.unsqueeze(1)?)?;

        tracing::debug!(total_mass = n, "codebook EMA update applied");

        state.ema_cluster_size = cluster_size;
        state.ema_w = ema_w;
        state.codebook = codebook;
        Ok(())
    }

    /// Snapshot of the codebook entries.
    pub fn codebook(&self) -> Tensor {
        self.state.read().codebook.clone()
    }

    /// Snapshot of the EMA occupancy counts.
    pub fn ema_cluster_size(&self) -> Tensor {
        self.state.read().ema_cluster_size.clone()
    }

    /// Snapshot of the EMA per-class feature sums.
    pub fn ema_w(&self) -> Tensor {
        self.state.read().ema_w.clone()
    }

    /// Current buffers under their persisted names, for checkpointing.
    pub fn export_state(&self) -> Vec<(&'static str, Tensor)> {
        let state = self.state.read();
        vec![
            ("codebook", state.codebook.clone()),
            ("ema_cluster_size", state.ema_cluster_size.clone()),
            ("ema_w", state.ema_w.clone()),
        ]
    }
}

/// One-hot encode `[N]` class indices into `[N, n_classes]`.
fn one_hot_assignments(indices: &Tensor, n_classes: usize) -> Result<Tensor> {
    let n = indices.dim(0)?;
    let idx: Vec<u32> = indices.to_vec1()?;

    let mut data = vec![0.0f32; n * n_classes];
    for (row, &class) in idx.iter().enumerate() {
        data[row * n_classes + class as usize] = 1.0;
    }

    Tensor::from_vec(data, (n, n_classes), indices.device())
}
