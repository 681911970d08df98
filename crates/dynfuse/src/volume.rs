use anyhow::Result;
use nalgebra::{Isometry3, Point3, Vector3};
use ndarray::{Array2, Array3};

use crate::{FusionParams, Intrinsics, Mask};

/// Axis-aligned spatial extent (a 3D box) in some model-local or world frame.
#[derive(Debug, Clone, Copy)]
pub struct Extent {
    /// Minimum corner.
    pub min: Point3<f32>,
    /// Maximum corner.
    pub max: Point3<f32>,
}

impl Extent {
    /// Returns a new Extent. `min` must be componentwise `<= max`.
    pub fn new(min: Point3<f32>, max: Point3<f32>) -> Extent {
        Extent { min, max }
    }

    /// Robust extent of a point set using low/high percentiles per axis,
    /// resisting outlier points. Returns `None` for an empty set.
    ///
    /// `lo` and `hi` are fractions in `[0, 1]`, e.g. `0.1` and `0.9`.
    pub fn from_percentiles(points: &[Point3<f32>], lo: f32, hi: f32) -> Option<Extent> {
        if points.is_empty() {
            return None;
        }
        let mut min = Point3::origin();
        let mut max = Point3::origin();
        let mut coords: Vec<f32> = Vec::with_capacity(points.len());
        for axis in 0..3 {
            coords.clear();
            coords.extend(points.iter().map(|p| p[axis]));
            coords.sort_by(|a, b| a.total_cmp(b));
            let last = coords.len() - 1;
            min[axis] = coords[(last as f32 * lo).round() as usize];
            max[axis] = coords[(last as f32 * hi).round() as usize];
        }
        Some(Extent::new(min, max))
    }

    /// Returns the center of the extent.
    pub fn center(&self) -> Point3<f32> {
        nalgebra::center(&self.min, &self.max)
    }

    /// Returns the edge lengths of the extent.
    pub fn size(&self) -> Vector3<f32> {
        self.max - self.min
    }

    /// Returns the volume of the extent in cubic meters.
    pub fn volume(&self) -> f32 {
        let s = self.size();
        s.x.max(0.0) * s.y.max(0.0) * s.z.max(0.0)
    }

    /// Returns the eight corners of the extent.
    pub fn corners(&self) -> [Point3<f32>; 8] {
        let (a, b) = (self.min, self.max);
        [
            Point3::new(a.x, a.y, a.z),
            Point3::new(b.x, a.y, a.z),
            Point3::new(a.x, b.y, a.z),
            Point3::new(b.x, b.y, a.z),
            Point3::new(a.x, a.y, b.z),
            Point3::new(b.x, a.y, b.z),
            Point3::new(a.x, b.y, b.z),
            Point3::new(b.x, b.y, b.z),
        ]
    }

    /// Returns the axis-aligned bounding box of this extent after a rigid
    /// transform.
    pub fn transformed(&self, pose: &Isometry3<f32>) -> Extent {
        let mut min = Point3::new(f32::MAX, f32::MAX, f32::MAX);
        let mut max = Point3::new(f32::MIN, f32::MIN, f32::MIN);
        for corner in self.corners() {
            let p = pose * corner;
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        Extent::new(min, max)
    }

    /// Returns the volume of the intersection with another extent.
    pub fn intersection_volume(&self, other: &Extent) -> f32 {
        let mut v = 1.0;
        for axis in 0..3 {
            let lo = self.min[axis].max(other.min[axis]);
            let hi = self.max[axis].min(other.max[axis]);
            if hi <= lo {
                return 0.0;
            }
            v *= hi - lo;
        }
        v
    }

    /// Returns true if the extent has (near) zero volume.
    pub fn is_degenerate(&self) -> bool {
        let s = self.size();
        s.x <= f32::EPSILON || s.y <= f32::EPSILON || s.z <= f32::EPSILON
    }
}

/// Output of raycasting a model from a camera view: predicted depth, surface
/// normals in the camera frame `(height, width, 3)` and the model silhouette.
/// Pixels the model does not cover have depth `0.0`.
#[derive(Debug, Clone)]
pub struct ModelRender {
    pub depth: Array2<f32>,
    pub normals: Array3<f32>,
    pub silhouette: Mask,
}

impl ModelRender {
    /// Returns an empty render covering no pixel.
    pub fn empty(width: usize, height: usize) -> ModelRender {
        ModelRender {
            depth: Array2::zeros((height, width)),
            normals: Array3::zeros((height, width, 3)),
            silhouette: Mask::new(width, height),
        }
    }
}

/// Static volume metadata.
#[derive(Debug, Clone, Copy)]
pub struct VolumeMeta {
    /// Voxels per grid edge.
    pub resolution: u32,
    /// Voxel edge length in meters.
    pub voxel_size: f32,
}

/// Volumetric model collaborator (e.g. a truncated signed-distance grid).
///
/// `view` arguments are the transform from the volume's local frame into the
/// camera frame. `Send` so per-model jobs can run on independent execution
/// contexts.
pub trait Volume: Send {
    /// Integrates one frame of measurements. `points` is the per-pixel point
    /// cloud in the camera frame, `weights` the model's association weight
    /// map gating the running average, and `fg_weights` an optional
    /// foreground-probability channel from a matched detection mask.
    fn integrate(
        &mut self,
        view: &Isometry3<f32>,
        points: &Array3<f32>,
        weights: &Array2<f32>,
        fg_weights: Option<&Array2<f32>>,
    );

    /// Renders predicted depth, normals and silhouette from the given view.
    fn raycast(&self, view: &Isometry3<f32>, intrinsics: &Intrinsics) -> ModelRender;

    /// Grows the volume if the surface approaches the grid boundary. Returns
    /// the local-frame shift of the volume's reference center when a
    /// reallocation happened, for the engine to fold into reported poses.
    fn resize(&mut self) -> Option<Vector3<f32>>;

    /// Returns the bounding extent of the contained surface in the local
    /// frame.
    fn extent(&self) -> Extent;

    /// Returns true if the volume no longer contains a usable surface.
    fn is_degenerate(&self) -> bool;

    /// Returns static volume metadata.
    fn meta(&self) -> VolumeMeta;
}

/// Allocator for volume collaborators. Allocation failure is the only fatal
/// error in the pipeline and is surfaced, not retried.
pub trait VolumeFactory {
    /// Allocates the background volume.
    fn background(&self, params: &FusionParams) -> Result<Box<dyn Volume>>;

    /// Allocates an object volume sized for the given world-space extent.
    fn object(&self, extent: &Extent, params: &FusionParams) -> Result<Box<dyn Volume>>;
}
