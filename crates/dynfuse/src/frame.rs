use ndarray::{Array2, Array3};

use crate::Mask;

/// Pinhole camera intrinsics. Image coordinates are `x` right, `y` down,
/// depth along `+z`.
#[derive(Debug, Clone, Copy)]
pub struct Intrinsics {
    /// Focal length in x (pixels).
    pub fx: f32,
    /// Focal length in y (pixels).
    pub fy: f32,
    /// Principal point x (pixels).
    pub cx: f32,
    /// Principal point y (pixels).
    pub cy: f32,
    /// Image width in pixels.
    pub width: usize,
    /// Image height in pixels.
    pub height: usize,
}

impl Intrinsics {
    /// Returns new Intrinsics.
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: usize, height: usize) -> Intrinsics {
        Intrinsics {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }
}

/// One input frame after depth pre-filtering.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Filtered depth in meters; invalid pixels are `0.0`.
    pub depth: Array2<f32>,
    /// Validity of each depth pixel.
    pub validity: Mask,
    /// RGB image, `(height, width, 3)`.
    pub rgb: Array3<u8>,
    /// Zero-based frame index.
    pub index: usize,
}

/// Depth pre-filter collaborator: raw depth to filtered depth plus validity.
///
/// Implementations must be pure per frame. The shipped [`RangeFilter`] gates
/// on a depth range; smoothing filters (e.g. bilateral) live outside this
/// crate.
pub trait DepthFilter {
    /// Filters a raw depth image. Invalid output pixels must be `0.0` and
    /// cleared in the returned validity mask.
    fn filter(&self, raw: &Array2<f32>) -> (Array2<f32>, Mask);
}

/// Depth range gate: keeps finite depths within `[min, max]`, zeroes the rest.
#[derive(Debug, Clone, Copy)]
pub struct RangeFilter {
    min: f32,
    max: f32,
}

impl RangeFilter {
    /// Returns a new RangeFilter for the given depth bounds in meters.
    pub fn new(min: f32, max: f32) -> RangeFilter {
        RangeFilter { min, max }
    }
}

impl DepthFilter for RangeFilter {
    fn filter(&self, raw: &Array2<f32>) -> (Array2<f32>, Mask) {
        let (height, width) = raw.dim();
        let mut depth = raw.clone();
        let mut validity = Mask::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let z = depth[[y, x]];
                if z.is_finite() && z >= self.min && z <= self.max {
                    validity.set(x, y, true);
                } else {
                    depth[[y, x]] = 0.0;
                }
            }
        }
        (depth, validity)
    }
}

/// Back-projects a depth image into a per-pixel point cloud in the camera
/// frame, shaped `(height, width, 3)`. Invalid pixels map to the origin.
pub fn backproject(depth: &Array2<f32>, intrinsics: &Intrinsics) -> Array3<f32> {
    let (height, width) = depth.dim();
    let mut points = Array3::<f32>::zeros((height, width, 3));
    for y in 0..height {
        for x in 0..width {
            let z = depth[[y, x]];
            if z > 0.0 {
                points[[y, x, 0]] = (x as f32 - intrinsics.cx) / intrinsics.fx * z;
                points[[y, x, 1]] = (y as f32 - intrinsics.cy) / intrinsics.fy * z;
                points[[y, x, 2]] = z;
            }
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn range_filter_gates_and_flags() {
        let mut raw = Array2::<f32>::zeros((4, 4));
        raw[[0, 0]] = 1.0;
        raw[[1, 1]] = 0.05; // below min
        raw[[2, 2]] = 10.0; // above max
        raw[[3, 3]] = f32::NAN;

        let (depth, validity) = RangeFilter::new(0.1, 6.0).filter(&raw);
        assert_approx_eq!(depth[[0, 0]], 1.0);
        assert!(validity.contains(0, 0));
        assert_approx_eq!(depth[[1, 1]], 0.0);
        assert!(!validity.contains(1, 1));
        assert_approx_eq!(depth[[2, 2]], 0.0);
        assert!(!validity.contains(2, 2));
        assert_approx_eq!(depth[[3, 3]], 0.0);
        assert!(!validity.contains(3, 3));
        assert_eq!(validity.count(), 1);
    }

    #[test]
    fn backproject_principal_point() {
        let intrinsics = Intrinsics::new(50.0, 50.0, 2.0, 2.0, 4, 4);
        let mut depth = Array2::<f32>::zeros((4, 4));
        depth[[2, 2]] = 1.5;

        let points = backproject(&depth, &intrinsics);
        // The principal point projects onto the optical axis.
        assert_approx_eq!(points[[2, 2, 0]], 0.0);
        assert_approx_eq!(points[[2, 2, 1]], 0.0);
        assert_approx_eq!(points[[2, 2, 2]], 1.5);
        // Invalid pixels stay at the origin.
        assert_approx_eq!(points[[0, 0, 2]], 0.0);
    }

    #[test]
    fn backproject_off_axis() {
        let intrinsics = Intrinsics::new(50.0, 50.0, 2.0, 2.0, 8, 8);
        let mut depth = Array2::<f32>::zeros((8, 8));
        depth[[2, 4]] = 2.0;

        let points = backproject(&depth, &intrinsics);
        assert_approx_eq!(points[[2, 4, 0]], (4.0 - 2.0) / 50.0 * 2.0);
        assert_approx_eq!(points[[2, 4, 1]], 0.0);
        assert_approx_eq!(points[[2, 4, 2]], 2.0);
    }
}
