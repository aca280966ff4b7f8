//! Dense 3D volumes and the per-item transforms applied to them.

use serde::{Deserialize, Serialize};

use crate::utils::error::{CoTrainError, Result};
use crate::utils::min_max_normalize;

/// A single-channel volume stored depth-major (`[d][h][w]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub data: Vec<f32>,
    /// `[depth, height, width]`
    pub shape: [usize; 3],
}

impl Volume {
    /// Wrap a buffer, checking it matches `shape`
    pub fn new(data: Vec<f32>, shape: [usize; 3]) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(CoTrainError::shape_mismatch(
                "volume buffer",
                &[expected],
                &[data.len()],
            ));
        }
        Ok(Self { data, shape })
    }

    pub fn zeros(shape: [usize; 3]) -> Self {
        Self {
            data: vec![0.0; shape.iter().product()],
            shape,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    fn index(&self, d: usize, h: usize, w: usize) -> usize {
        (d * self.shape[1] + h) * self.shape[2] + w
    }

    pub fn get(&self, d: usize, h: usize, w: usize) -> f32 {
        self.data[self.index(d, h, w)]
    }

    /// Rescale intensities into [0, 1]
    pub fn normalized(mut self) -> Self {
        min_max_normalize(&mut self.data);
        self
    }

    /// Map voxels `>= threshold` to 1 and the rest to 0
    pub fn binarized(mut self, threshold: f32) -> Self {
        self.data
            .iter_mut()
            .for_each(|v| *v = if *v >= threshold { 1.0 } else { 0.0 });
        self
    }

    /// Centre-crop or zero-pad every axis independently to `target`
    pub fn crop_or_pad(&self, target: [usize; 3]) -> Self {
        if self.shape == target {
            return self.clone();
        }

        // Source start (when cropping) and destination start (when padding) per axis.
        let offsets: Vec<(usize, usize, usize)> = (0..3)
            .map(|axis| {
                let (src, dst) = (self.shape[axis], target[axis]);
                if src >= dst {
                    ((src - dst) / 2, 0, dst)
                } else {
                    (0, (dst - src) / 2, src)
                }
            })
            .collect();

        let mut out = Volume::zeros(target);
        let (sd, dd, nd) = offsets[0];
        let (sh, dh, nh) = offsets[1];
        let (sw, dw, nw) = offsets[2];

        for d in 0..nd {
            for h in 0..nh {
                let src_row = self.index(sd + d, sh + h, sw);
                let dst_row = out.index(dd + d, dh + h, dw);
                out.data[dst_row..dst_row + nw].copy_from_slice(&self.data[src_row..src_row + nw]);
            }
        }
        out
    }

    /// One `[height, width]` slice
    pub fn slice(&self, depth: usize) -> &[f32] {
        let plane = self.shape[1] * self.shape[2];
        &self.data[depth * plane..(depth + 1) * plane]
    }

    /// First slice holding any foreground voxel, if any
    pub fn first_foreground_slice(&self) -> Option<usize> {
        (0..self.shape[0]).find(|&d| self.slice(d).iter().any(|&v| v > 0.0))
    }
}
