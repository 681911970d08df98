//! Analytic test scene: a static wall and floor plus one rigid box sliding
//! through the camera's view.

use anyhow::Result;
use dynfuse::{Detection, Detector, Frame, Intrinsics, Mask};
use nalgebra::{Point3, Vector3};
use ndarray::Array2;

/// Scene geometry, all in the world frame with the camera at the origin
/// looking along `+z`.
#[derive(Debug, Clone)]
pub struct Scene {
    /// Fronto-parallel wall depth.
    pub wall_z: f32,
    /// Floor height below the camera (`y` points down).
    pub floor_y: f32,
    /// Half extents of the moving box.
    pub box_half: Vector3<f32>,
    /// Box center at frame zero.
    pub box_start: Point3<f32>,
    /// Box center displacement per frame.
    pub box_velocity: Vector3<f32>,
}

impl Default for Scene {
    fn default() -> Scene {
        Scene {
            wall_z: 2.0,
            floor_y: 0.5,
            box_half: Vector3::new(0.12, 0.12, 0.12),
            box_start: Point3::new(-0.3, 0.2, 1.2),
            box_velocity: Vector3::new(0.004, 0.0, 0.0),
        }
    }
}

impl Scene {
    /// Ground-truth box center at a frame.
    pub fn box_center(&self, frame: usize) -> Point3<f32> {
        self.box_start + self.box_velocity * frame as f32
    }

    /// Renders the scene depth for a frame, together with the mask of pixels
    /// where the box is the nearest surface.
    pub fn render(&self, intrinsics: &Intrinsics, frame: usize) -> (Array2<f32>, Mask) {
        let center = self.box_center(frame);
        let mut depth = Array2::<f32>::zeros((intrinsics.height, intrinsics.width));
        let mut box_mask = Mask::new(intrinsics.width, intrinsics.height);

        for y in 0..intrinsics.height {
            for x in 0..intrinsics.width {
                let dir = Vector3::new(
                    (x as f32 - intrinsics.cx) / intrinsics.fx,
                    (y as f32 - intrinsics.cy) / intrinsics.fy,
                    1.0,
                );

                // The ray is parameterized so that t equals camera depth.
                let mut t_hit = self.wall_z;
                let mut is_box = false;
                if dir.y > 0.0 {
                    let t_floor = self.floor_y / dir.y;
                    if t_floor < t_hit {
                        t_hit = t_floor;
                    }
                }
                if let Some(t_box) = ray_box(&dir, &center, &self.box_half) {
                    if t_box < t_hit {
                        t_hit = t_box;
                        is_box = true;
                    }
                }

                depth[[y, x]] = t_hit;
                if is_box {
                    box_mask.set(x, y, true);
                }
            }
        }
        (depth, box_mask)
    }
}

/// Nearest positive intersection of a ray from the origin with an axis-aligned
/// box, in the ray's parameterization.
fn ray_box(dir: &Vector3<f32>, center: &Point3<f32>, half: &Vector3<f32>) -> Option<f32> {
    let mut t_min = 0.0f32;
    let mut t_max = f32::INFINITY;
    for axis in 0..3 {
        let lo = center[axis] - half[axis];
        let hi = center[axis] + half[axis];
        if dir[axis].abs() < 1e-9 {
            if 0.0 < lo || 0.0 > hi {
                return None;
            }
            continue;
        }
        let a = lo / dir[axis];
        let b = hi / dir[axis];
        t_min = t_min.max(a.min(b));
        t_max = t_max.min(a.max(b));
    }
    (t_max >= t_min && t_min > 0.0).then_some(t_min)
}

/// Detector producing the scene's exact box silhouette each frame.
pub struct SceneDetector {
    scene: Scene,
    intrinsics: Intrinsics,
}

impl SceneDetector {
    pub fn new(scene: Scene, intrinsics: Intrinsics) -> SceneDetector {
        SceneDetector { scene, intrinsics }
    }
}

impl Detector for SceneDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (_, mask) = self.scene.render(&self.intrinsics, frame.index);
        if mask.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![Detection::new(mask, vec![1.0])])
    }
}
