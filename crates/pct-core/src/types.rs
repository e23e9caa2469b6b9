//! Fundamental types for pose compositional token learning.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single annotated body joint: 2D coordinates plus a hard visibility flag.
///
/// Coordinates are expected to be normalized by the caller (the tokenizer is
/// agnostic to the coordinate frame); visibility is a per-joint mask,
/// independent across joints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Joint {
    pub x: f32,
    pub y: f32,
    pub visible: bool,
}

impl Joint {
    pub fn new(x: f32, y: f32, visible: bool) -> Self {
        Self { x, y, visible }
    }

    /// A visible joint at the given coordinates.
    pub fn visible(x: f32, y: f32) -> Self {
        Self::new(x, y, true)
    }

    /// An occluded joint. Its coordinates are ignored by the encoder.
    pub fn occluded() -> Self {
        Self::new(0.0, 0.0, false)
    }
}

/// An ordered set of joints describing one pose instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointSet {
    joints: Vec<Joint>,
}

impl JointSet {
    pub fn new(joints: Vec<Joint>) -> Self {
        Self { joints }
    }

    /// A fully visible pose from `(x, y)` pairs.
    pub fn from_coords(coords: &[(f32, f32)]) -> Self {
        Self {
            joints: coords.iter().map(|&(x, y)| Joint::visible(x, y)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn visible_count(&self) -> usize {
        self.joints.iter().filter(|j| j.visible).count()
    }

    /// Flatten into `[x, y, visible]` triplets, the layout the encoder
    /// consumes.
    pub fn flatten(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.joints.len() * 3);
        for j in &self.joints {
            out.push(j.x);
            out.push(j.y);
            out.push(if j.visible { 1.0 } else { 0.0 });
        }
        out
    }

    /// Flatten a batch of poses, checking that every pose carries the
    /// expected joint count.
    pub fn flatten_batch(batch: &[JointSet], num_joints: usize) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(batch.len() * num_joints * 3);
        for set in batch {
            if set.len() != num_joints {
                return Err(Error::JointCountMismatch {
                    expected: num_joints,
                    actual: set.len(),
                });
            }
            out.extend(set.flatten());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_layout() {
        let set = JointSet::new(vec![Joint::visible(0.1, 0.2), Joint::occluded()]);
        assert_eq!(set.flatten(), vec![0.1, 0.2, 1.0, 0.0, 0.0, 0.0]);
        assert_eq!(set.visible_count(), 1);
    }

    #[test]
    fn test_flatten_batch_checks_joint_count() {
        let ok = JointSet::from_coords(&[(0.0, 0.0), (1.0, 1.0)]);
        let bad = JointSet::from_coords(&[(0.0, 0.0)]);

        assert!(JointSet::flatten_batch(&[ok.clone(), ok.clone()], 2).is_ok());
        let err = JointSet::flatten_batch(&[ok, bad], 2).unwrap_err();
        assert!(matches!(
            err,
            Error::JointCountMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }
}
