//! Input features and the triplet readout.
//!
//! Relative positions use the minimum image convention, `d - round(d)`, so
//! features depend only on separations inside the periodic cube.
//!
//! Two edge inputs exist. Particle input is `(b, N, 6)` positions and
//! velocities. Zel'dovich input is `(b, N, 6)` initial grid positions `q`
//! and Zel'dovich displacements `psi`: edges carry `q` differences, and the
//! displacement of particle `j` is added on its self-loop only, the one edge
//! where the difference is zero.

use crate::error::{Error, Result};
use crate::graph::{EdgeTensors, TripletTensors};
use crate::segment::scatter_rows;
use candle_core::Tensor;

const EPS: f64 = 1e-12;

/// Edge feature width: relative position, row velocity, column velocity.
pub const EDGE_FEATURES: usize = 9;
/// Triplet feature width: one angle plus three per pair surface.
pub const TRIPLET_FEATURES: usize = 10;
/// Zel'dovich edge feature width.
pub const ZA_EDGE_FEATURES: usize = 3;

/// Split `(b, N, 6)` into contiguous `(b*N, 3)` positions and velocities.
fn split(particles: &Tensor) -> Result<(Tensor, Tensor)> {
    let (b, n, c) = particles.dims3()?;
    let flat = particles.reshape((b * n, c))?;
    Ok((flat.narrow(1, 0, 3)?.contiguous()?, flat.narrow(1, 3, 3)?.contiguous()?))
}

fn min_image(d: &Tensor) -> Result<Tensor> {
    Ok((d - d.round()?)?)
}

fn dot(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok((a * b)?.sum_keepdim(1)?)
}

fn norm(a: &Tensor) -> Result<Tensor> {
    Ok(a.sqr()?.sum_keepdim(1)?.sqrt()?)
}

/// `(S, 9)` features `[x_col - x_row, v_row, v_col]`.
pub fn edge_features(particles: &Tensor, edges: &EdgeTensors) -> Result<Tensor> {
    let (x, v) = split(particles)?;
    let dx = (x.index_select(&edges.col_ids, 0)? - x.index_select(&edges.row_ids, 0)?)?;
    let features = Tensor::cat(
        &[
            min_image(&dx)?,
            v.index_select(&edges.row_ids, 0)?,
            v.index_select(&edges.col_ids, 0)?,
        ],
        1,
    )?;
    Ok(features)
}

/// `(S, 3)` features of a Zel'dovich input: `q_col - q_row` on every edge
/// plus `psi_row` on the diagonal.
///
/// Requires one self-loop per particle.
pub fn za_edge_features(particles: &Tensor, edges: &EdgeTensors) -> Result<Tensor> {
    let (q, psi) = split(particles)?;
    let diag = edges.diagonal()?;
    let dq = (q.index_select(&edges.col_ids, 0)? - q.index_select(&edges.row_ids, 0)?)?;
    Ok((min_image(&dq)? + scatter_rows(&psi, &diag.edges, edges.num_edges)?)?)
}

/// Append a constant redshift column, `(rows, k) -> (rows, k + 1)`.
pub fn with_redshift(features: &Tensor, redshift: f32) -> Result<Tensor> {
    let rows = features.dim(0)?;
    let column = Tensor::full(redshift, (rows, 1), features.device())?.to_dtype(features.dtype())?;
    Ok(Tensor::cat(&[features, &column], 1)?)
}

/// `(T, 10)` rotation-invariant features of each `(row, col, depth)`.
///
/// Column 0 is the cosine of the angle at `row` between `col` and `depth`.
/// Then, for the pairs (row, col), (row, depth) and (col, depth) in turn:
/// the pair distance, the first particle's velocity projected on the pair
/// vector, and the second's projected on the reversed pair vector.
pub fn triplet_features(particles: &Tensor, triplets: &TripletTensors) -> Result<Tensor> {
    let (x, v) = split(particles)?;
    let (xr, vr) = (x.index_select(&triplets.rows, 0)?, v.index_select(&triplets.rows, 0)?);
    let (xc, vc) = (x.index_select(&triplets.cols, 0)?, v.index_select(&triplets.cols, 0)?);
    let (xd, vd) = (x.index_select(&triplets.depths, 0)?, v.index_select(&triplets.depths, 0)?);

    let rc = min_image(&(&xc - &xr)?)?;
    let rd = min_image(&(&xd - &xr)?)?;
    let cd = min_image(&(&xd - &xc)?)?;

    let cosine = (dot(&rc, &rd)? / (norm(&rc)? * norm(&rd)?)?.maximum(EPS)?)?;
    let mut columns = vec![cosine];
    for (pair, first, second) in [(&rc, &vr, &vc), (&rd, &vr, &vd), (&cd, &vc, &vd)] {
        let length = norm(pair)?.maximum(EPS)?;
        let along = (dot(first, pair)? / &length)?;
        let against = (dot(second, &pair.neg()?)? / &length)?;
        columns.extend([length, along, against]);
    }
    Ok(Tensor::cat(&columns, 1)?)
}

/// Move each particle by the weighted sum of minimum-image offsets to its
/// neighbors: `(b, N, 6)` and `(P, 1)` pair weights to `(b, N, 3)`.
pub fn displace(particles: &Tensor, weights: &Tensor, triplets: &TripletTensors) -> Result<Tensor> {
    let (b, n, _) = particles.dims3()?;
    let (rows, width) = weights.dims2()?;
    if rows != triplets.num_pairs {
        return Err(Error::DimensionMismatch { expected: triplets.num_pairs, got: rows });
    }
    if width != 1 {
        return Err(Error::DimensionMismatch { expected: 1, got: width });
    }
    let (x, _) = split(particles)?;
    let offsets = (x.index_select(&triplets.pair_cols, 0)? - x.index_select(&triplets.pair_rows, 0)?)?;
    let moves = scatter_rows(&min_image(&offsets)?.broadcast_mul(weights)?, &triplets.pair_rows, b * n)?;
    Ok((x + moves)?.reshape((b, n, 3))?)
}
