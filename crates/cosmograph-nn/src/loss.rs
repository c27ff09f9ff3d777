//! Periodic readout and losses.
//!
//! Predictions are `(b, N, 3)` tensors; targets may carry all six particle
//! channels, in which case positions are `target[.., .., 0..3]` and
//! velocities `target[.., .., 3..6]`.

use crate::error::{Error, Result};
use candle_core::{DType, Tensor};

/// Fold positions into `[0, 1)` by one period: values `>= 1` lose 1, values
/// `< 0` gain 1.
///
/// The shift is a constant mask added to the input, so gradients pass
/// through unchanged.
pub fn wrap_positions(x: &Tensor) -> Result<Tensor> {
    let above = x.ge(1f64)?.to_dtype(x.dtype())?;
    let below = x.lt(0f64)?.to_dtype(x.dtype())?;
    Ok(((x - above)? + below)?)
}

/// `(b, N)` mask of particles strictly inside `(boundary, 1 - boundary)` on
/// every axis, with the number selected.
pub fn interior_mask(truth: &Tensor, boundary: f32) -> Result<(Tensor, f32)> {
    let x = truth.narrow(2, 0, 3)?;
    let inside = (x.gt(boundary as f64)?.to_dtype(DType::F32)? * x.lt(1.0 - boundary as f64)?.to_dtype(DType::F32)?)?;
    let mask = inside.min(2)?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Err(Error::Training(format!("no particle lies inside the boundary {boundary}")));
    }
    Ok((mask, count))
}

fn masked_mean(sq: &Tensor, mask: &Tensor, count: f32) -> Result<Tensor> {
    let per_particle = sq.sum(2)?;
    let total = (per_particle * mask.to_dtype(sq.dtype())?)?.sum_all()?;
    Ok((total / count as f64)?)
}

fn check_shapes(pred: &Tensor, truth: &Tensor) -> Result<()> {
    let (b, n, c) = pred.dims3()?;
    let (tb, tn, tc) = truth.dims3()?;
    if c != 3 {
        return Err(Error::DimensionMismatch { expected: 3, got: c });
    }
    if (b, n) != (tb, tn) {
        return Err(Error::DimensionMismatch { expected: b * n, got: tb * tn });
    }
    if tc < 3 {
        return Err(Error::DimensionMismatch { expected: 3, got: tc });
    }
    Ok(())
}

/// Mean over interior particles of the summed squared position error.
pub fn bounded_mse(pred: &Tensor, truth: &Tensor, boundary: f32) -> Result<Tensor> {
    check_shapes(pred, truth)?;
    let (mask, count) = interior_mask(truth, boundary)?;
    let sq = (pred - truth.narrow(2, 0, 3)?)?.sqr()?;
    masked_mean(&sq, &mask, count)
}

/// Position and velocity errors over the same interior particles.
#[derive(Debug, Clone)]
pub struct BoundedLoss {
    pub location: Tensor,
    pub velocity: Tensor,
}

impl BoundedLoss {
    /// Training objective: the product of both errors.
    pub fn combined(&self) -> Result<Tensor> {
        Ok((&self.location * &self.velocity)?)
    }
}

/// [`bounded_mse`] for positions and velocities. `truth` needs all six
/// channels.
pub fn bounded_mse_with_velocity(location: &Tensor, velocity: &Tensor, truth: &Tensor, boundary: f32) -> Result<BoundedLoss> {
    check_shapes(location, truth)?;
    check_shapes(velocity, truth)?;
    let channels = truth.dim(2)?;
    if channels < 6 {
        return Err(Error::DimensionMismatch { expected: 6, got: channels });
    }
    let (mask, count) = interior_mask(truth, boundary)?;
    let loc_sq = (location - truth.narrow(2, 0, 3)?)?.sqr()?;
    let vel_sq = (velocity - truth.narrow(2, 3, 3)?)?.sqr()?;
    Ok(BoundedLoss {
        location: masked_mean(&loc_sq, &mask, count)?,
        velocity: masked_mean(&vel_sq, &mask, count)?,
    })
}

/// Squared error under the nearest of the shifts `0`, `+1`, `-1` per
/// channel, summed over channels and averaged over particles.
///
/// Suited to unwrapped predictions.
pub fn min_image_mse(pred: &Tensor, truth: &Tensor) -> Result<Tensor> {
    check_shapes(pred, truth)?;
    let d = (pred - truth.narrow(2, 0, 3)?)?;
    let nearest = d.sqr()?.minimum(&(&d - 1.0)?.sqr()?)?.minimum(&(&d + 1.0)?.sqr()?)?;
    Ok(nearest.sum(2)?.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn wrap_folds_one_period() {
        let x = Tensor::new(&[1.3f32, -0.2, 0.0, 0.5, 0.999], &Device::Cpu).unwrap();
        let w = wrap_positions(&x).unwrap().to_vec1::<f32>().unwrap();
        let want = [0.3f32, 0.8, 0.0, 0.5, 0.999];
        assert!(w.iter().zip(want).all(|(a, b)| (a - b).abs() < 1e-6), "{w:?}");
    }

    #[test]
    fn wrap_is_idempotent_inside_the_cube() {
        let x = Tensor::new(&[0.0f32, 0.25, 0.75], &Device::Cpu).unwrap();
        let once = wrap_positions(&x).unwrap();
        let twice = wrap_positions(&once).unwrap();
        assert_eq!(once.to_vec1::<f32>().unwrap(), x.to_vec1::<f32>().unwrap());
        assert_eq!(twice.to_vec1::<f32>().unwrap(), x.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn bounded_mse_skips_boundary_particles() {
        let device = Device::Cpu;
        let truth = Tensor::new(&[[[0.5f32, 0.5, 0.5], [0.02, 0.5, 0.5]]], &device).unwrap();
        let pred = Tensor::new(&[[[0.6f32, 0.5, 0.3], [0.9, 0.9, 0.9]]], &device).unwrap();
        let loss = scalar(&bounded_mse(&pred, &truth, 0.1).unwrap());
        assert!((loss - 0.05).abs() < 1e-6, "{loss}");
    }

    #[test]
    fn bounded_mse_needs_an_interior_particle() {
        let device = Device::Cpu;
        let truth = Tensor::new(&[[[0.01f32, 0.5, 0.5]]], &device).unwrap();
        assert!(bounded_mse(&truth, &truth, 0.1).is_err());
    }

    #[test]
    fn velocity_loss_shares_the_mask() {
        let device = Device::Cpu;
        let truth = Tensor::new(&[[[0.5f32, 0.5, 0.5, 1., 0., 0.], [0.99, 0.5, 0.5, 5., 5., 5.]]], &device).unwrap();
        let loc = Tensor::new(&[[[0.5f32, 0.5, 0.7], [0.0, 0.0, 0.0]]], &device).unwrap();
        let vel = Tensor::new(&[[[3f32, 0., 0.], [0., 0., 0.]]], &device).unwrap();
        let loss = bounded_mse_with_velocity(&loc, &vel, &truth, 0.05).unwrap();
        assert!((scalar(&loss.location) - 0.04).abs() < 1e-6);
        assert!((scalar(&loss.velocity) - 4.0).abs() < 1e-5);
        assert!((scalar(&loss.combined().unwrap()) - 0.16).abs() < 1e-5);
    }

    #[test]
    fn min_image_mse_takes_the_short_way_round() {
        let device = Device::Cpu;
        let truth = Tensor::new(&[[[0.05f32, 0.5, 0.5]]], &device).unwrap();
        let pred = Tensor::new(&[[[0.95f32, 0.5, 0.5]]], &device).unwrap();
        let loss = scalar(&min_image_mse(&pred, &truth).unwrap());
        assert!((loss - 0.01).abs() < 1e-5, "{loss}");
    }

    #[test]
    fn shapes_are_checked() {
        let device = Device::Cpu;
        let a = Tensor::zeros((1, 2, 3), DType::F32, &device).unwrap();
        let b = Tensor::zeros((1, 3, 3), DType::F32, &device).unwrap();
        assert!(min_image_mse(&a, &b).is_err());
    }
}
