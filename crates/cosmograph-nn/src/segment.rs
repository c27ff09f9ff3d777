//! Segment pooling primitives.
//!
//! A [`SegmentIndex`] assigns each row of a feature tensor to one of
//! `num_segments` groups. Pooling is a segment mean (index-add into zeros,
//! then scale by the reciprocal member count); broadcasting gathers the
//! pooled row of each member back out.

use crate::error::Result;
use candle_core::{Device, Tensor};
use cosmograph_core::Error as GraphError;

/// Segment ids of a set of rows, resident on the compute device.
#[derive(Debug, Clone)]
pub struct SegmentIndex {
    ids: Tensor,
    inv_counts: Tensor,
    len: usize,
    num_segments: usize,
}

impl SegmentIndex {
    /// Upload `ids`, checking that every segment in `0..num_segments` has at
    /// least one member.
    pub fn new(name: &'static str, ids: &[u32], num_segments: usize, device: &Device) -> Result<Self> {
        let mut counts = vec![0u32; num_segments];
        for &id in ids {
            let slot = counts
                .get_mut(id as usize)
                .ok_or(GraphError::IndexOutOfRange { index: id as usize, bound: num_segments })?;
            *slot += 1;
        }
        if let Some(segment) = counts.iter().position(|&c| c == 0) {
            return Err(GraphError::EmptySegment { name, segment }.into());
        }
        let inv: Vec<f32> = counts.iter().map(|&c| 1.0 / c as f32).collect();
        Ok(Self {
            ids: Tensor::from_slice(ids, ids.len(), device)?,
            inv_counts: Tensor::from_vec(inv, (num_segments, 1), device)?,
            len: ids.len(),
            num_segments,
        })
    }

    /// Ids as a `u32` tensor of shape `(len,)`.
    pub fn ids(&self) -> &Tensor {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// Segment mean of `h` (`(len, k)` -> `(num_segments, k)`).
    pub fn pool(&self, h: &Tensor) -> Result<Tensor> {
        let k = h.dim(1)?;
        let sums = Tensor::zeros((self.num_segments, k), h.dtype(), h.device())?.index_add(&self.ids, h, 0)?;
        Ok(sums.broadcast_mul(&self.inv_counts.to_dtype(h.dtype())?)?)
    }

    /// Gather pooled rows back to members (`(num_segments, k)` -> `(len, k)`).
    pub fn broadcast(&self, pooled: &Tensor) -> Result<Tensor> {
        Ok(pooled.index_select(&self.ids, 0)?)
    }
}

/// Scatter rows of `h` to positions `ids` of a zero tensor with `rows` rows.
pub fn scatter_rows(h: &Tensor, ids: &Tensor, rows: usize) -> Result<Tensor> {
    let k = h.dim(1)?;
    Ok(Tensor::zeros((rows, k), h.dtype(), h.device())?.index_add(ids, h, 0)?)
}

/// Upload a `u32` index array.
pub fn index_tensor(ids: &[u32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(ids, ids.len(), device)?)
}

/// `h` with one zero row appended, so that index `h.dim(0)` gathers zeros.
pub fn with_zero_row(h: &Tensor) -> Result<Tensor> {
    let zero = Tensor::zeros((1, h.dim(1)?), h.dtype(), h.device())?;
    Ok(Tensor::cat(&[h, &zero], 0)?)
}
