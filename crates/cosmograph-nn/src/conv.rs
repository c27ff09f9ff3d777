//! Permutation-equivariant graph layers.
//!
//! All layers are linear combinations of pool/broadcast operators over a
//! static index bundle, each operator followed by its own `(k_in, k_out)`
//! weight. Pooling is always a segment mean.
//!
//! - [`VanillaConv`]: 4 operators over edges (no pool, pool rows, pool
//!   columns, pool all) and one bias.
//! - [`ShiftInvConv`]: the complete 15-operator basis over edges, with a
//!   diagonal bias and a global bias.
//! - [`RotInvConv`]: no pool plus 7 poolings over triplets, 6 weights after
//!   tying the operators that are symmetric under exchanging column and
//!   depth.
//!
//! Naming follows the edge matrix view: "pool rows" averages the entries of
//! a column (segment ids = `col`), "pool columns" averages the entries of a
//! row (segment ids = `row`).
//!
//! # Reference
//!
//! Maron et al., "Invariant and Equivariant Graph Networks", ICLR 2019.

use crate::error::Result;
use crate::graph::{EdgeTensors, TripletTensors};
use crate::params::LayerParams;
use crate::segment::{scatter_rows, with_zero_row};
use candle_core::Tensor;
use cosmograph_core::TripletSegment;

/// Collapse per-edge output to one row per particle: `(S, k) -> (b, N, k)`.
fn pool_to_particles(h: &Tensor, graph: &EdgeTensors) -> Result<Tensor> {
    let k = h.dim(1)?;
    Ok(graph.rows.pool(h)?.reshape((graph.batch_size, graph.num_particles, k))?)
}

/// Four-operator edge layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VanillaConv {
    pub k_in: usize,
    pub k_out: usize,
}

impl VanillaConv {
    pub const NUM_WEIGHTS: usize = 4;
    pub const NUM_BIASES: usize = 1;

    pub fn new(k_in: usize, k_out: usize) -> Self {
        Self { k_in, k_out }
    }

    /// `(S, k_in) -> (S, k_out)`, or `(b, N, k_out)` when `is_last`.
    pub fn forward(&self, h: &Tensor, graph: &EdgeTensors, params: &LayerParams, is_last: bool) -> Result<Tensor> {
        let w = |slot| params.weight(slot);

        let mut out = h.matmul(w(0)?)?;
        out = (out + graph.cols.broadcast(&graph.cols.pool(h)?.matmul(w(1)?)?)?)?;
        out = (out + graph.rows.broadcast(&graph.rows.pool(h)?.matmul(w(2)?)?)?)?;
        out = (out + graph.cube.broadcast(&graph.cube.pool(h)?.matmul(w(3)?)?)?)?;
        let out = out.broadcast_add(params.bias(0)?)?;

        if is_last {
            pool_to_particles(&out, graph)
        } else {
            Ok(out)
        }
    }
}

/// Fifteen-operator shift-invariant edge layer.
///
/// Weight slots, with `H` the input, `Hd` its diagonal (one row per
/// particle), `Hr`/`Hc` pooled over rows/columns, `Ha` pooled over the
/// sample and `Hp` the diagonal pooled over the sample:
///
/// | slot | operator                         |
/// |------|----------------------------------|
/// | 0    | `H`                              |
/// | 1    | transpose of `H`                 |
/// | 2    | `Hd` onto the diagonal           |
/// | 3-5  | `Hr` to columns, rows, diagonal  |
/// | 6-8  | `Hc` to rows, columns, diagonal  |
/// | 9-10 | `Ha` to all, diagonal            |
/// | 11-12| `Hp` to all, diagonal            |
/// | 13-14| `Hd` to columns, rows            |
///
/// Bias slot 0 is added on the diagonal only, slot 1 everywhere. Edges
/// without a transpose receive a zero transpose term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftInvConv {
    pub k_in: usize,
    pub k_out: usize,
}

impl ShiftInvConv {
    pub const NUM_WEIGHTS: usize = 15;
    pub const NUM_BIASES: usize = 2;

    pub fn new(k_in: usize, k_out: usize) -> Self {
        Self { k_in, k_out }
    }

    /// `(S, k_in) -> (S, k_out)`, or `(b, N, k_out)` when `is_last`.
    ///
    /// Requires a complete diagonal (one self-loop per particle).
    pub fn forward(&self, h: &Tensor, graph: &EdgeTensors, params: &LayerParams, is_last: bool) -> Result<Tensor> {
        let w = |slot| params.weight(slot);
        let diag = graph.diagonal()?;
        let s = graph.num_edges;

        let hd = h.index_select(&diag.edges, 0)?;
        let hr = graph.cols.pool(h)?;
        let hc = graph.rows.pool(h)?;
        let ha = graph.cube.pool(h)?;
        let hp = diag.samples.pool(&hd)?;

        // terms landing on every edge
        let mut out = h.matmul(w(0)?)?;
        out = (out + with_zero_row(h)?.index_select(&graph.transpose, 0)?.matmul(w(1)?)?)?;
        out = (out + graph.cols.broadcast(&hr.matmul(w(3)?)?)?)?;
        out = (out + graph.rows.broadcast(&hr.matmul(w(4)?)?)?)?;
        out = (out + graph.rows.broadcast(&hc.matmul(w(6)?)?)?)?;
        out = (out + graph.cols.broadcast(&hc.matmul(w(7)?)?)?)?;
        out = (out + graph.cube.broadcast(&ha.matmul(w(9)?)?)?)?;
        out = (out + graph.cube.broadcast(&hp.matmul(w(11)?)?)?)?;
        out = (out + graph.cols.broadcast(&hd.matmul(w(13)?)?)?)?;
        out = (out + graph.rows.broadcast(&hd.matmul(w(14)?)?)?)?;

        // terms landing on the diagonal, one row per particle
        let per_sample = (ha.matmul(w(10)?)? + hp.matmul(w(12)?)?)?;
        let mut on_diag = hd.matmul(w(2)?)?;
        on_diag = (on_diag + hr.matmul(w(5)?)?)?;
        on_diag = (on_diag + hc.matmul(w(8)?)?)?;
        on_diag = (on_diag + diag.samples.broadcast(&per_sample)?)?;
        let on_diag = on_diag.broadcast_add(params.bias(0)?)?;

        let out = (out + scatter_rows(&on_diag, &diag.edges, s)?)?;
        let out = out.broadcast_add(params.bias(1)?)?;

        if is_last {
            pool_to_particles(&out, graph)
        } else {
            Ok(out)
        }
    }
}

/// Rotation-invariant triplet layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotInvConv {
    pub k_in: usize,
    pub k_out: usize,
}

impl RotInvConv {
    pub const NUM_WEIGHTS: usize = 6;
    pub const NUM_BIASES: usize = 1;
    /// Weight slot of the no-pool term.
    pub const NO_POOL_SLOT: usize = 0;

    pub fn new(k_in: usize, k_out: usize) -> Self {
        Self { k_in, k_out }
    }

    /// Weight slot used by a pooling operator.
    ///
    /// `RowDepth`/`RowCol` and `Depth`/`Col` share slots because the
    /// triplet tensor is symmetric in its last two axes.
    pub fn slot(segment: TripletSegment) -> usize {
        match segment {
            TripletSegment::ColDepth => 1,
            TripletSegment::RowDepth | TripletSegment::RowCol => 2,
            TripletSegment::Depth | TripletSegment::Col => 3,
            TripletSegment::Row => 4,
            TripletSegment::All => 5,
        }
    }

    /// The weight applied after pooling over `segment`.
    pub fn operator_weight(params: &LayerParams, segment: TripletSegment) -> Result<&Tensor> {
        params.weight(Self::slot(segment))
    }

    /// `(e, k_in) -> (e, k_out)`, or `(P, k_out)` pooled over depth when
    /// `is_last`, with `P` the number of `(particle, neighbor)` pairs.
    pub fn forward(&self, h: &Tensor, graph: &TripletTensors, params: &LayerParams, is_last: bool) -> Result<Tensor> {
        let mut out = h.matmul(params.weight(Self::NO_POOL_SLOT)?)?;
        for segment in TripletSegment::ALL {
            let seg = graph.segment(segment);
            let pooled = seg.pool(h)?.matmul(Self::operator_weight(params, segment)?)?;
            out = (out + seg.broadcast(&pooled)?)?;
        }
        let out = out.broadcast_add(params.bias(0)?)?;

        if is_last {
            graph.segment(TripletSegment::Depth).pool(&out)
        } else {
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeTensors, TripletTensors};
    use candle_core::{DType, Device};
    use cosmograph_core::{assemble, build_triplets, BatchGraph, GraphBuilder, GraphConfig, SparseAdjacency, TripletGraph};
    use ndarray::Array3;

    type Mat = Vec<Vec<f32>>;

    fn adj(rows: Vec<Vec<usize>>) -> SparseAdjacency {
        SparseAdjacency::from_rows(rows).unwrap()
    }

    fn input(rows: usize, k: usize) -> (Tensor, Mat) {
        let host: Mat = (0..rows)
            .map(|e| (0..k).map(|c| ((e * 13 + c * 5) % 17) as f32 / 17.0 - 0.4).collect())
            .collect();
        (Tensor::new(host.clone(), &Device::Cpu).unwrap(), host)
    }

    /// Distinct weights per slot and distinct biases, so a swapped slot shows.
    fn params(num_weights: usize, num_biases: usize, k_in: usize, k_out: usize) -> (LayerParams, Vec<Mat>, Mat) {
        let w: Vec<Mat> = (0..num_weights)
            .map(|slot| {
                (0..k_in)
                    .map(|i| (0..k_out).map(|o| ((slot + 1) as f32 * 0.37 + i as f32 * 0.11 - o as f32 * 0.23).sin()).collect())
                    .collect()
            })
            .collect();
        let b: Mat = (0..num_biases).map(|slot| (0..k_out).map(|o| 0.1 * (slot + 1) as f32 + 0.01 * o as f32).collect()).collect();
        let weights = w.iter().map(|m| Tensor::new(m.clone(), &Device::Cpu).unwrap()).collect();
        let biases = b.iter().map(|v| Tensor::new(v.as_slice(), &Device::Cpu).unwrap()).collect();
        (LayerParams::from_tensors(weights, biases).unwrap(), w, b)
    }

    /// `acc += h · w`.
    fn affine(h: &[f32], w: &Mat, acc: &mut [f32]) {
        for (i, &x) in h.iter().enumerate() {
            for (o, a) in acc.iter_mut().enumerate() {
                *a += x * w[i][o];
            }
        }
    }

    fn mean<'a>(rows: impl Iterator<Item = &'a Vec<f32>>) -> Vec<f32> {
        let mut sum: Vec<f32> = Vec::new();
        let mut count = 0.0;
        for row in rows {
            if sum.is_empty() {
                sum = vec![0.0; row.len()];
            }
            sum.iter_mut().zip(row).for_each(|(s, x)| *s += x);
            count += 1.0;
        }
        sum.into_iter().map(|s| s / count).collect()
    }

    fn assert_close(got: &Mat, want: &Mat) {
        assert_eq!(got.len(), want.len());
        for (e, (g, w)) in got.iter().zip(want).enumerate() {
            for (a, b) in g.iter().zip(w) {
                assert!((a - b).abs() < 1e-4, "row {e}: got {g:?}, want {w:?}");
            }
        }
    }

    /// Mean of edge rows per particle, `(b*N, k)`.
    fn per_particle(out: &Mat, g: &BatchGraph) -> Mat {
        (0..g.num_nodes()).map(|j| mean((0..g.num_edges()).filter(|&e| g.row[e] as usize == j).map(|e| &out[e]))).collect()
    }

    fn vanilla_reference(h: &Mat, g: &BatchGraph, w: &[Mat], b: &Mat) -> Mat {
        let s = g.num_edges();
        let over_col = |j: usize| mean((0..s).filter(|&e| g.col[e] as usize == j).map(|e| &h[e]));
        let over_row = |j: usize| mean((0..s).filter(|&e| g.row[e] as usize == j).map(|e| &h[e]));
        let over_cube = |i: usize| mean((0..s).filter(|&e| g.cube[e] as usize == i).map(|e| &h[e]));
        (0..s)
            .map(|e| {
                let (r, c, i) = (g.row[e] as usize, g.col[e] as usize, g.cube[e] as usize);
                let mut acc = b[0].clone();
                affine(&h[e], &w[0], &mut acc);
                affine(&over_col(c), &w[1], &mut acc);
                affine(&over_row(r), &w[2], &mut acc);
                affine(&over_cube(i), &w[3], &mut acc);
                acc
            })
            .collect()
    }

    /// Dense per-edge evaluation of the fifteen operators.
    fn shift_inv_reference(h: &Mat, g: &BatchGraph, w: &[Mat], b: &Mat) -> Mat {
        let s = g.num_edges();
        let n = g.num_particles;
        let edge = |e: usize| (g.row[e] as usize, g.col[e] as usize);
        let hr: Mat = (0..g.num_nodes()).map(|j| mean((0..s).filter(|&e| edge(e).1 == j).map(|e| &h[e]))).collect();
        let hc: Mat = (0..g.num_nodes()).map(|j| mean((0..s).filter(|&e| edge(e).0 == j).map(|e| &h[e]))).collect();
        let ha: Mat = (0..g.batch_size).map(|i| mean((0..s).filter(|&e| g.cube[e] as usize == i).map(|e| &h[e]))).collect();
        let hd: Mat = (0..g.num_nodes())
            .map(|j| {
                let e = (0..s).find(|&e| edge(e) == (j, j)).unwrap();
                h[e].clone()
            })
            .collect();
        let hp: Mat = (0..g.batch_size).map(|i| mean(hd[i * n..(i + 1) * n].iter())).collect();

        (0..s)
            .map(|e| {
                let (r, c) = edge(e);
                let i = g.cube[e] as usize;
                let mut acc = b[1].clone();
                affine(&h[e], &w[0], &mut acc);
                if let Some(t) = (0..s).find(|&t| edge(t) == (c, r)) {
                    affine(&h[t], &w[1], &mut acc);
                }
                affine(&hr[c], &w[3], &mut acc);
                affine(&hr[r], &w[4], &mut acc);
                affine(&hc[r], &w[6], &mut acc);
                affine(&hc[c], &w[7], &mut acc);
                affine(&ha[i], &w[9], &mut acc);
                affine(&hp[i], &w[11], &mut acc);
                affine(&hd[c], &w[13], &mut acc);
                affine(&hd[r], &w[14], &mut acc);
                if r == c {
                    affine(&hd[r], &w[2], &mut acc);
                    affine(&hr[r], &w[5], &mut acc);
                    affine(&hc[r], &w[8], &mut acc);
                    affine(&ha[i], &w[10], &mut acc);
                    affine(&hp[i], &w[12], &mut acc);
                    acc.iter_mut().zip(&b[0]).for_each(|(a, x)| *a += x);
                }
                acc
            })
            .collect()
    }

    /// Two samples of four particles with one self-loop each and several
    /// one-way edges.
    fn asymmetric_batch() -> BatchGraph {
        let a0 = adj(vec![vec![0, 1], vec![1, 2, 0], vec![2, 3], vec![3, 0, 2]]);
        let a1 = adj(vec![vec![0, 3], vec![1, 0], vec![2, 1, 3], vec![3, 2]]);
        let g = assemble(&[a0, a1]).unwrap();
        assert!(g.missing_transposes > 0);
        g
    }

    #[test]
    fn vanilla_matches_dense_reference() {
        let g = asymmetric_batch();
        let edges = EdgeTensors::from_graph(&g, &Device::Cpu).unwrap();
        let (h, host) = input(g.num_edges(), 3);
        let (params, w, b) = params(4, 1, 3, 2);
        let layer = VanillaConv::new(3, 2);

        let want = vanilla_reference(&host, &g, &w, &b);
        let out = layer.forward(&h, &edges, &params, false).unwrap();
        assert_close(&out.to_vec2::<f32>().unwrap(), &want);

        let pooled = layer.forward(&h, &edges, &params, true).unwrap();
        assert_eq!(pooled.dims(), &[2, 4, 2]);
        assert_close(&pooled.reshape((8, 2)).unwrap().to_vec2::<f32>().unwrap(), &per_particle(&want, &g));
    }

    #[test]
    fn shift_invariant_matches_dense_reference() {
        let g = asymmetric_batch();
        let edges = EdgeTensors::from_graph(&g, &Device::Cpu).unwrap();
        let (h, host) = input(g.num_edges(), 3);
        let (params, w, b) = params(15, 2, 3, 2);
        let layer = ShiftInvConv::new(3, 2);

        let want = shift_inv_reference(&host, &g, &w, &b);
        let out = layer.forward(&h, &edges, &params, false).unwrap();
        assert_close(&out.to_vec2::<f32>().unwrap(), &want);

        let pooled = layer.forward(&h, &edges, &params, true).unwrap();
        assert_eq!(pooled.dims(), &[2, 4, 2]);
        assert_close(&pooled.reshape((8, 2)).unwrap().to_vec2::<f32>().unwrap(), &per_particle(&want, &g));
    }

    /// Four particles on a line: 2 picks 1 and 3 picks 2, neither reciprocated.
    fn one_way_knn() -> BatchGraph {
        let xs = [0.30f32, 0.32, 0.40, 0.60];
        let batch = Array3::from_shape_fn((1, 4, 6), |(_, p, c)| match c {
            0 => xs[p],
            1 | 2 => 0.5,
            _ => 0.0,
        });
        let config = GraphConfig::default().with_k(2).with_boundary_threshold(0.1);
        let g = GraphBuilder::new(config).unwrap().batch_graph(batch.view()).unwrap();
        assert_eq!(g.row, vec![0, 0, 1, 1, 2, 2, 3, 3]);
        assert_eq!(g.col, vec![0, 1, 1, 0, 2, 1, 3, 2]);
        g
    }

    #[test]
    fn missing_transpose_contributes_zero() {
        let g = one_way_knn();
        let sentinel = g.missing_transpose();
        assert_eq!(g.missing_transposes, 2);
        assert_eq!(g.tra[5], sentinel);
        assert_eq!(g.tra[7], sentinel);

        let edges = EdgeTensors::from_graph(&g, &Device::Cpu).unwrap();
        let (h, host) = input(g.num_edges(), 3);

        // only the transpose operator, as the identity
        let zero = Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap();
        let mut weights = vec![zero; ShiftInvConv::NUM_WEIGHTS];
        weights[1] = Tensor::eye(3, DType::F32, &Device::Cpu).unwrap();
        let biases = vec![Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(); ShiftInvConv::NUM_BIASES];
        let transpose_only = LayerParams::from_tensors(weights, biases).unwrap();

        let out = ShiftInvConv::new(3, 3).forward(&h, &edges, &transpose_only, false).unwrap();
        let out = out.to_vec2::<f32>().unwrap();
        for e in 0..g.num_edges() {
            let want = match g.tra[e] {
                t if t == sentinel => vec![0.0; 3],
                t => host[t as usize].clone(),
            };
            assert_eq!(out[e], want, "edge {e}");
        }

        let (params, w, b) = params(15, 2, 3, 2);
        let full = ShiftInvConv::new(3, 2).forward(&h, &edges, &params, false).unwrap();
        assert_close(&full.to_vec2::<f32>().unwrap(), &shift_inv_reference(&host, &g, &w, &b));
    }

    #[test]
    fn shift_invariant_needs_a_diagonal() {
        let g = assemble(&[adj(vec![vec![0, 1], vec![1, 1, 0]])]).unwrap();
        let edges = EdgeTensors::from_graph(&g, &Device::Cpu).unwrap();
        let (h, _) = input(g.num_edges(), 3);
        let (params, _, _) = params(15, 2, 3, 2);
        let err = ShiftInvConv::new(3, 2).forward(&h, &edges, &params, false).unwrap_err();
        assert!(err.to_string().contains("sample 0, row 1"), "{err}");
    }

    fn rot_inv_reference(h: &Mat, g: &TripletGraph, w: &[Mat], b: &Mat) -> Mat {
        let t = g.num_triplets();
        let key = |i: usize| (g.rows[i], g.cols[i], g.depths[i]);
        let sample = |i: usize| g.rows[i] as usize / g.num_particles;
        (0..t)
            .map(|i| {
                let (r, c, d) = key(i);
                let pool = |same: &dyn Fn(usize) -> bool| mean((0..t).filter(|&j| same(j)).map(|j| &h[j]));
                let mut acc = b[0].clone();
                affine(&h[i], &w[0], &mut acc);
                affine(&pool(&|j| key(j).0 == r), &w[1], &mut acc);
                affine(&pool(&|j| key(j).1 == c), &w[2], &mut acc);
                affine(&pool(&|j| key(j).2 == d), &w[2], &mut acc);
                affine(&pool(&|j| (key(j).0, key(j).1) == (r, c)), &w[3], &mut acc);
                affine(&pool(&|j| (key(j).0, key(j).2) == (r, d)), &w[3], &mut acc);
                affine(&pool(&|j| (key(j).1, key(j).2) == (c, d)), &w[4], &mut acc);
                affine(&pool(&|j| sample(j) == sample(i)), &w[5], &mut acc);
                acc
            })
            .collect()
    }

    #[test]
    fn rotation_invariant_matches_dense_reference() {
        let a0 = adj(vec![vec![0, 1, 2], vec![1, 2, 3, 0], vec![2, 0, 3], vec![3, 1, 2]]);
        let a1 = adj(vec![vec![0, 3, 1], vec![1, 0, 2], vec![2, 3, 1], vec![3, 0, 1]]);
        let g = build_triplets(&[a0, a1]).unwrap();
        let triplets = TripletTensors::from_graph(&g, &Device::Cpu).unwrap();
        let (h, host) = input(g.num_triplets(), 3);
        let (params, w, b) = params(6, 1, 3, 2);
        let layer = RotInvConv::new(3, 2);

        let want = rot_inv_reference(&host, &g, &w, &b);
        let out = layer.forward(&h, &triplets, &params, false).unwrap();
        assert_close(&out.to_vec2::<f32>().unwrap(), &want);

        // readout: one row per (particle, neighbor) pair, in pair-list order
        let pooled = layer.forward(&h, &triplets, &params, true).unwrap();
        let pairs: Mat = (0..g.num_pairs())
            .map(|p| {
                let pair = (g.pair_rows[p], g.pair_cols[p]);
                mean((0..g.num_triplets()).filter(|&i| (g.rows[i], g.cols[i]) == pair).map(|i| &want[i]))
            })
            .collect();
        assert_close(&pooled.to_vec2::<f32>().unwrap(), &pairs);
    }
}
