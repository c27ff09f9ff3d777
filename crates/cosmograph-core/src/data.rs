//! Particle datasets.
//!
//! A [`Dataset`] holds an array of shape `(num_redshifts, num_samples, N, 6)`
//! where the last axis is `[x, y, z, vx, vy, vz]`. Positions live in the
//! periodic unit cube after [`Dataset::normalize`]; velocities are
//! standardized per channel.
//!
//! Simulation files are raw little-endian `f32` streams of `N * 6` values.

use crate::error::{Error, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayView3, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rand_xorshift::XorShiftRng;
use std::fs;
use std::path::Path;
use tracing::info;

/// Channels per particle.
pub const CHANNELS: usize = 6;

/// Read one raw simulation file of `n_p^3` particles.
pub fn read_sim(path: impl AsRef<Path>, n_p: usize) -> Result<Array2<f32>> {
    let path = path.as_ref();
    let n = n_p.pow(3);
    let bytes = fs::read(path)?;
    let expected = n * CHANNELS * 4;
    if bytes.len() != expected {
        return Err(Error::InvalidData(format!(
            "{}: expected {expected} bytes for {n} particles, found {}",
            path.display(),
            bytes.len()
        )));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array2::from_shape_vec((n, CHANNELS), values).map_err(|e| Error::InvalidData(e.to_string()))
}

/// Write particles in the raw simulation layout.
pub fn write_sim(path: impl AsRef<Path>, particles: &Array2<f32>) -> Result<()> {
    if particles.ncols() != CHANNELS {
        return Err(Error::DimensionMismatch { expected: CHANNELS, got: particles.ncols() });
    }
    let bytes: Vec<u8> = particles.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(path, bytes)?;
    Ok(())
}

/// Positions of one sample as `[x, y, z]` rows.
pub fn positions(sample: ndarray::ArrayView2<f32>) -> Vec<[f32; 3]> {
    sample.outer_iter().map(|p| [p[0], p[1], p[2]]).collect()
}

/// Random symmetry augmentation of a `(num_redshifts, b, N, 6)` batch.
///
/// Applies the same transform to every redshift: optional swaps of axis
/// pairs, optional reflections `x -> 1 - x` (with `v -> -v`), then one
/// random periodic shift per sample.
pub fn augment<R: Rng>(batch: &mut Array4<f32>, rng: &mut R) {
    const SWAPS: [[usize; 6]; 3] = [[1, 0, 2, 4, 3, 5], [0, 2, 1, 3, 5, 4], [2, 1, 0, 5, 4, 3]];
    let coins: [bool; 6] = std::array::from_fn(|_| rng.gen::<f32>() < 0.5);
    let b = batch.shape()[1];
    let shifts: Vec<[f32; 3]> = (0..b).map(|_| [rng.gen(), rng.gen(), rng.gen()]).collect();

    for (swap, _) in SWAPS.iter().zip(&coins[..3]).filter(|&(_, &c)| c) {
        for mut particle in batch.lanes_mut(Axis(3)) {
            let old = [particle[0], particle[1], particle[2], particle[3], particle[4], particle[5]];
            for (dst, &src) in swap.iter().enumerate() {
                particle[dst] = old[src];
            }
        }
    }
    for axis in (0..3).filter(|&a| coins[3 + a]) {
        for mut particle in batch.lanes_mut(Axis(3)) {
            particle[axis] = 1.0 - particle[axis];
            particle[axis + 3] = -particle[axis + 3];
        }
    }
    for mut redshift in batch.axis_iter_mut(Axis(0)) {
        for (mut sample, shift) in redshift.axis_iter_mut(Axis(0)).zip(&shifts) {
            for mut particle in sample.outer_iter_mut() {
                for axis in 0..3 {
                    let x = particle[axis] + shift[axis];
                    particle[axis] = if x > 1.0 { x - 1.0 } else { x };
                }
            }
        }
    }
}

/// Simulation snapshots stacked by redshift.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    data: Array4<f32>,
}

impl Dataset {
    pub fn new(data: Array4<f32>) -> Result<Self> {
        let shape = data.shape();
        if shape[3] != CHANNELS {
            return Err(Error::DimensionMismatch { expected: CHANNELS, got: shape[3] });
        }
        if shape[0] == 0 || shape[1] == 0 || shape[2] == 0 {
            return Err(Error::InvalidData(format!("empty dataset of shape {shape:?}")));
        }
        Ok(Self { data })
    }

    /// Stack `(num_samples, N, 6)` arrays, one per redshift.
    pub fn from_redshifts(redshifts: Vec<Array3<f32>>) -> Result<Self> {
        let views: Vec<_> = redshifts.iter().map(|a| a.view()).collect();
        let data = ndarray::stack(Axis(0), &views).map_err(|e| Error::InvalidData(e.to_string()))?;
        Self::new(data)
    }

    /// Load one file per (redshift, sample).
    pub fn from_sim_files<P: AsRef<Path>>(files: &[Vec<P>], n_p: usize) -> Result<Self> {
        let mut redshifts = Vec::with_capacity(files.len());
        for samples in files {
            let arrays = samples.iter().map(|f| read_sim(f, n_p)).collect::<Result<Vec<_>>>()?;
            let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
            redshifts.push(ndarray::stack(Axis(0), &views).map_err(|e| Error::InvalidData(e.to_string()))?);
        }
        Self::from_redshifts(redshifts)
    }

    /// Perturbed lattice of `n_p^3` particles with Gaussian velocities,
    /// advanced ballistically by `dt` for each later redshift.
    pub fn synthetic(n_p: usize, num_samples: usize, num_redshifts: usize, dt: f32, seed: u64) -> Result<Self> {
        let n = n_p.pow(3);
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let mut data = Array4::<f32>::zeros((num_redshifts, num_samples, n, CHANNELS));
        let spacing = 1.0 / n_p as f32;
        for sample in 0..num_samples {
            for (p, cell) in (0..n).map(|p| (p, [p / (n_p * n_p), (p / n_p) % n_p, p % n_p])) {
                let mut x = [0f32; 3];
                let mut v = [0f32; 3];
                for axis in 0..3 {
                    let jitter: f32 = rng.gen_range(-0.25..0.25);
                    x[axis] = ((cell[axis] as f32 + 0.5 + jitter) * spacing).rem_euclid(1.0);
                    v[axis] = StandardNormal.sample(&mut rng);
                }
                for z in 0..num_redshifts {
                    for axis in 0..3 {
                        data[[z, sample, p, axis]] = (x[axis] + z as f32 * dt * v[axis]).rem_euclid(1.0);
                        data[[z, sample, p, axis + 3]] = v[axis];
                    }
                }
            }
        }
        Self::new(data)
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn num_redshifts(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn num_samples(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn num_particles(&self) -> usize {
        self.data.shape()[2]
    }

    /// Samples `(num_samples, N, 6)` of one redshift.
    pub fn redshift(&self, z: usize) -> ArrayView3<'_, f32> {
        self.data.index_axis(Axis(0), z)
    }

    /// Rescale positions to `[0, 1]` and standardize velocities.
    ///
    /// Statistics are per channel over every redshift, sample and particle.
    pub fn normalize(&mut self) -> Result<()> {
        for axis in 0..3 {
            let column = self.data.slice(s![.., .., .., axis]);
            let lo = column.fold(f32::INFINITY, |a, &b| a.min(b));
            let hi = column.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let range = hi - lo;
            if !(range > 0.0 && range.is_finite()) {
                return Err(Error::InvalidData(format!("position axis {axis} has zero extent")));
            }
            self.data.slice_mut(s![.., .., .., axis]).mapv_inplace(|x| (x - lo) / range);
        }
        for axis in 3..CHANNELS {
            let column = self.data.slice(s![.., .., .., axis]);
            let count = column.len() as f64;
            let mean = column.iter().map(|&v| f64::from(v)).sum::<f64>() / count;
            let var = column.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / count;
            let std = var.sqrt();
            if !(std > 0.0 && std.is_finite()) {
                return Err(Error::InvalidData(format!("velocity channel {} has zero variance", axis - 3)));
            }
            let (mean, std) = (mean as f32, std as f32);
            self.data.slice_mut(s![.., .., .., axis]).mapv_inplace(|v| (v - mean) / std);
        }
        Ok(())
    }

    /// Seeded split into `(train, validation)` along the sample axis.
    pub fn split_validation(&self, num_validation: usize, seed: u64) -> Result<(Dataset, Dataset)> {
        let total = self.num_samples();
        if num_validation == 0 || num_validation >= total {
            return Err(Error::InvalidConfig(format!(
                "validation size {num_validation} must be in 1..{total}"
            )));
        }
        let mut order: Vec<usize> = (0..total).collect();
        order.shuffle(&mut XorShiftRng::seed_from_u64(seed));
        let (train, val) = order.split_at(total - num_validation);
        info!(train = train.len(), validation = val.len(), seed, "split dataset");
        Ok((
            Dataset::new(self.data.select(Axis(1), train))?,
            Dataset::new(self.data.select(Axis(1), val))?,
        ))
    }

    /// Random minibatch of shape `(num_redshifts, batch_size, N, 6)`,
    /// sampled with replacement.
    pub fn minibatch<R: Rng>(&self, batch_size: usize, augmentation: bool, rng: &mut R) -> Array4<f32> {
        let picks: Vec<usize> = (0..batch_size).map(|_| rng.gen_range(0..self.num_samples())).collect();
        let mut batch = self.data.select(Axis(1), &picks);
        if augmentation {
            augment(&mut batch, rng);
        }
        batch
    }

    /// Consecutive samples `start..start + len` without augmentation.
    pub fn window(&self, start: usize, len: usize) -> Array4<f32> {
        self.data.slice(s![.., start..start + len, .., ..]).to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_file_roundtrip_preserves_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.bin");
        let particles = Array2::from_shape_fn((8, 6), |(i, j)| (i * 6 + j) as f32);
        write_sim(&path, &particles).unwrap();
        let back = read_sim(&path, 2).unwrap();
        assert_eq!(back, particles);
        assert!(read_sim(&path, 3).is_err());
    }

    #[test]
    fn synthetic_positions_stay_in_unit_cube() {
        let ds = Dataset::synthetic(3, 2, 2, 0.01, 7).unwrap();
        assert_eq!(ds.data().shape(), &[2, 2, 27, 6]);
        for z in 0..2 {
            for &x in ds.data().slice(s![z, .., .., 0..3]).iter() {
                assert!((0.0..1.0).contains(&x));
            }
        }
    }

    #[test]
    fn normalize_standardizes_velocities() {
        let mut ds = Dataset::synthetic(3, 4, 1, 0.0, 1).unwrap();
        ds.data.mapv_inplace(|v| v * 3.0 + 2.0);
        ds.normalize().unwrap();
        let vx = ds.data().slice(s![.., .., .., 3]);
        let mean = vx.mean().unwrap();
        let var = vx.mapv(|v| (v - mean).powi(2)).mean().unwrap();
        assert!(mean.abs() < 1e-4);
        assert!((var - 1.0).abs() < 1e-3);
        let x = ds.data().slice(s![.., .., .., 0]);
        assert!(x.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn normalize_rejects_constant_velocity() {
        let mut ds = Dataset::synthetic(2, 2, 1, 0.0, 1).unwrap();
        ds.data.slice_mut(s![.., .., .., 4]).fill(1.0);
        assert!(matches!(ds.normalize(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let ds = Dataset::synthetic(2, 10, 1, 0.0, 3).unwrap();
        let (a1, v1) = ds.split_validation(3, 99).unwrap();
        let (a2, v2) = ds.split_validation(3, 99).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(v1, v2);
        assert_eq!(a1.num_samples(), 7);
        assert_eq!(v1.num_samples(), 3);
        assert!(ds.split_validation(10, 1).is_err());
    }

    #[test]
    fn augmentation_keeps_positions_periodic_and_shape() {
        let ds = Dataset::synthetic(3, 4, 2, 0.01, 5).unwrap();
        let mut rng = XorShiftRng::seed_from_u64(11);
        for _ in 0..8 {
            let batch = ds.minibatch(2, true, &mut rng);
            assert_eq!(batch.shape(), &[2, 2, 27, 6]);
            for &x in batch.slice(s![.., .., .., 0..3]).iter() {
                assert!((0.0..=1.0).contains(&x), "{x}");
            }
        }
    }
}
