//! Collective reduction across data-parallel training workers.
//!
//! Codebook EMA statistics must be summed over every worker before being
//! applied, so all replicas stay bit-identical. The reduction is a barrier:
//! a call blocks until every member of the group has contributed, which is
//! why the orchestrator derives branch participation from `(stage, train)`
//! alone — a worker that skipped the update branch would deadlock the rest.

use candle_core::{Result, Tensor};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};

/// Element-wise sum reduction shared by all workers of a training group.
pub trait Collective: Send + Sync {
    /// Sum `payload` over all workers; every caller receives the identical
    /// aggregated tensor. Blocks until the whole group has contributed.
    fn all_reduce_sum(&self, payload: &Tensor) -> Result<Tensor>;

    /// Number of participating workers.
    fn world_size(&self) -> usize;
}

/// Single-process training: the reduction degenerates to the identity.
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn all_reduce_sum(&self, payload: &Tensor) -> Result<Tensor> {
        Ok(payload.clone())
    }

    fn world_size(&self) -> usize {
        1
    }
}

struct GroupShared {
    world_size: usize,
    accum: Mutex<Vec<f32>>,
    barrier: Barrier,
}

/// Barrier-synchronized sum across a fixed-size group of worker threads.
///
/// All members must call [`Collective::all_reduce_sum`] the same number of
/// times with same-shaped payloads; rounds are separated by the internal
/// barrier so a group handle can be reused across training steps.
pub struct ThreadGroup {
    shared: Arc<GroupShared>,
}

impl ThreadGroup {
    /// Create one handle per worker of a `world_size`-member group.
    pub fn group(world_size: usize) -> Vec<ThreadGroup> {
        let shared = Arc::new(GroupShared {
            world_size,
            accum: Mutex::new(Vec::new()),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|_| ThreadGroup {
                shared: shared.clone(),
            })
            .collect()
    }
}

impl Collective for ThreadGroup {
    fn all_reduce_sum(&self, payload: &Tensor) -> Result<Tensor> {
        let local: Vec<f32> = payload.flatten_all()?.to_vec1()?;

        {
            let mut accum = self.shared.accum.lock();
            if accum.is_empty() {
                *accum = local;
            } else {
                for (acc, v) in accum.iter_mut().zip(local.iter()) {
                    *acc += v;
                }
            }
        }

        // All contributions are in; read the sum.
        self.shared.barrier.wait();
        let summed = self.shared.accum.lock().clone();

        // Reset for the next round once every member has read.
        let round_done = self.shared.barrier.wait();
        if round_done.is_leader() {
            self.shared.accum.lock().clear();
        }
        self.shared.barrier.wait();

        Tensor::from_vec(summed, payload.shape(), payload.device())
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }
}
