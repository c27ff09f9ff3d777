//! Periodic boundary padding.
//!
//! Particles close to a face of the unit cube are copied to the periodic
//! image just outside the opposite face, so that a plain Euclidean neighbor
//! search over the padded cloud sees complete neighborhoods across the
//! boundary.
//!
//! ```text
//!  flags per axis:  +1  if x <= t         (image lands above 1)
//!                   -1  if x >= 1 - t     (image lands below 0)
//!
//!  face   (1 flag)  -> 1 image
//!  edge   (2 flags) -> 3 images: the edge, then each adjoining face
//!  corner (3 flags) -> 7 images: corner, 3 edges, 3 faces
//! ```

use tracing::debug;

/// Masks applied to the flag vector of a corner particle, in emission order.
const CORNER_MASKS: [[i8; 3]; 7] = [
    [1, 1, 1],
    [1, 1, 0],
    [1, 0, 1],
    [1, 0, 0],
    [0, 1, 1],
    [0, 1, 0],
    [0, 0, 1],
];

/// Classification of a particle by how many faces it is near.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryCase {
    Interior,
    Face,
    Edge,
    Corner,
}

impl BoundaryCase {
    /// Number of periodic images emitted for this case.
    pub fn image_count(&self) -> usize {
        match self {
            Self::Interior => 0,
            Self::Face => 1,
            Self::Edge => 3,
            Self::Corner => 7,
        }
    }
}

/// Per-axis boundary flags of a single position.
pub fn boundary_flags(position: &[f32; 3], threshold: f32) -> [i8; 3] {
    let upper = 1.0 - threshold;
    let mut flags = [0i8; 3];
    for (flag, &x) in flags.iter_mut().zip(position) {
        *flag = if x >= upper {
            -1
        } else if x <= threshold {
            1
        } else {
            0
        };
    }
    flags
}

/// Case implied by a flag vector.
pub fn classify(flags: &[i8; 3]) -> BoundaryCase {
    match flags.iter().filter(|&&f| f != 0).count() {
        0 => BoundaryCase::Interior,
        1 => BoundaryCase::Face,
        2 => BoundaryCase::Edge,
        _ => BoundaryCase::Corner,
    }
}

/// A sample's positions followed by the periodic images of its boundary
/// particles.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedCube {
    /// Original positions (first `num_original` rows), then images.
    pub positions: Vec<[f32; 3]>,
    /// For each image row `num_original + j`, the particle it copies.
    pub index_map: Vec<usize>,
    /// Number of particles before padding.
    pub num_original: usize,
}

impl PaddedCube {
    /// Number of image rows.
    pub fn num_images(&self) -> usize {
        self.index_map.len()
    }

    /// Map a row of the padded cloud back to the particle it represents.
    #[inline]
    pub fn original_index(&self, row: usize) -> usize {
        if row < self.num_original {
            row
        } else {
            self.index_map[row - self.num_original]
        }
    }
}

fn push_masked(out: &mut Vec<[f32; 3]>, position: &[f32; 3], flags: &[i8; 3], mask: &[i8; 3]) {
    let mut image = *position;
    for axis in 0..3 {
        image[axis] += f32::from(mask[axis] * flags[axis]);
    }
    out.push(image);
}

/// Append the periodic images of one particle to `out`.
///
/// Returns the number of images written.
pub fn images_of(position: &[f32; 3], flags: &[i8; 3], out: &mut Vec<[f32; 3]>) -> usize {
    match classify(flags) {
        BoundaryCase::Interior => 0,
        BoundaryCase::Face => {
            push_masked(out, position, flags, &[1, 1, 1]);
            1
        }
        BoundaryCase::Edge => {
            // The free axis `z`; the two faces are the axes after it, in order.
            let z = flags.iter().position(|&f| f == 0).unwrap_or(0);
            let mut first = [0i8; 3];
            first[(z + 1) % 3] = 1;
            let mut second = [0i8; 3];
            second[(z + 2) % 3] = 1;
            push_masked(out, position, flags, &[1, 1, 1]);
            push_masked(out, position, flags, &first);
            push_masked(out, position, flags, &second);
            3
        }
        BoundaryCase::Corner => {
            for mask in &CORNER_MASKS {
                push_masked(out, position, flags, mask);
            }
            7
        }
    }
}

/// Pad a sample with the periodic images of particles within `threshold`
/// of a face.
///
/// The caller is responsible for `0 < threshold < 0.5`
/// (see [`GraphConfig::validate`](crate::config::GraphConfig::validate)).
pub fn pad(positions: &[[f32; 3]], threshold: f32) -> PaddedCube {
    let n = positions.len();
    let flags: Vec<[i8; 3]> = positions.iter().map(|p| boundary_flags(p, threshold)).collect();
    let num_images: usize = flags.iter().map(|f| classify(f).image_count()).sum();

    let mut padded = Vec::with_capacity(n + num_images);
    padded.extend_from_slice(positions);
    let mut index_map = Vec::with_capacity(num_images);

    for (idx, (position, flag)) in positions.iter().zip(&flags).enumerate() {
        let written = images_of(position, flag, &mut padded);
        index_map.extend(std::iter::repeat(idx).take(written));
    }

    debug!(particles = n, images = num_images, threshold, "padded cube boundaries");
    PaddedCube { positions: padded, index_map, num_original: n }
}
