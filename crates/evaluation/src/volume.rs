//! A projective truncated signed distance grid backing the fusion engine.

use anyhow::Result;
use dynfuse::{Extent, FusionParams, Intrinsics, ModelRender, Volume, VolumeFactory, VolumeMeta};
use nalgebra::{Isometry3, Point3, Vector3};
use ndarray::{Array2, Array3};
use rayon::prelude::*;

/// Truncation band width in voxels.
const TRUNC_VOXELS: f32 = 10.0;
/// Saturation bound for the per-voxel integration weight.
const MAX_WEIGHT: f32 = 64.0;
/// Voxels with less accumulated weight are treated as unobserved.
const MIN_OBSERVED: f32 = 0.01;
/// Distance from the grid border, in voxels, at which an expandable grid
/// grows.
const BORDER_MARGIN: usize = 2;
/// Hard cap on per-axis grid resolution; growth beyond it marks the volume
/// degenerate.
const MAX_DIM: usize = 256;
/// Objects larger than this side length (meters) are segmentation failures.
const MAX_OBJECT_SIZE: f32 = 3.0;

/// Dense TSDF grid with per-voxel integration weights and, for object
/// volumes, foreground evidence counters.
///
/// The grid lives in the model's local frame; `origin` is the position of the
/// voxel `(0, 0, 0)` corner in that frame. Expandable grids grow toward
/// whichever border the observed surface crowds and report the resulting
/// shift of the grid center through [`Volume::resize`].
pub struct GridVolume {
    sdf: Array3<f32>,
    weight: Array3<f32>,
    /// Foreground evidence and observation counts, object volumes only.
    fg: Option<(Array3<f32>, Array3<f32>)>,
    origin: Point3<f32>,
    voxel_size: f32,
    truncation: f32,
    /// Intrinsics of the depth stream being integrated; needed to look up
    /// the measured depth a voxel projects onto.
    intrinsics: Intrinsics,
    expandable: bool,
    degenerate: bool,
}

impl GridVolume {
    /// Allocates a grid covering `extent` at the given voxel size. Object
    /// volumes are expandable and carry foreground counters.
    pub fn new(
        extent: &Extent,
        voxel_size: f32,
        intrinsics: Intrinsics,
        expandable: bool,
    ) -> GridVolume {
        let size = extent.size();
        let dims = [
            (size.x / voxel_size).ceil().max(1.0) as usize,
            (size.y / voxel_size).ceil().max(1.0) as usize,
            (size.z / voxel_size).ceil().max(1.0) as usize,
        ];
        let degenerate =
            dims.iter().any(|&d| d > MAX_DIM) || (expandable && size.max() > MAX_OBJECT_SIZE);
        let shape = (dims[0].min(MAX_DIM), dims[1].min(MAX_DIM), dims[2].min(MAX_DIM));
        GridVolume {
            sdf: Array3::from_elem(shape, 1.0),
            weight: Array3::zeros(shape),
            fg: expandable.then(|| (Array3::zeros(shape), Array3::zeros(shape))),
            origin: extent.min,
            voxel_size,
            truncation: TRUNC_VOXELS * voxel_size,
            intrinsics,
            expandable,
            degenerate,
        }
    }

    /// Pixel a camera-frame point projects onto, `None` when outside the
    /// image.
    fn project(&self, p: &Point3<f32>) -> Option<(usize, usize)> {
        let u = (self.intrinsics.fx * p.x / p.z + self.intrinsics.cx).round();
        let v = (self.intrinsics.fy * p.y / p.z + self.intrinsics.cy).round();
        if u < 0.0 || v < 0.0 || u >= self.intrinsics.width as f32 || v >= self.intrinsics.height as f32
        {
            return None;
        }
        Some((u as usize, v as usize))
    }

    fn dims(&self) -> (usize, usize, usize) {
        self.sdf.dim()
    }

    fn size(&self) -> Vector3<f32> {
        let (nx, ny, nz) = self.dims();
        Vector3::new(nx as f32, ny as f32, nz as f32) * self.voxel_size
    }

    fn voxel_center(&self, ix: usize, iy: usize, iz: usize) -> Point3<f32> {
        self.origin
            + Vector3::new(ix as f32 + 0.5, iy as f32 + 0.5, iz as f32 + 0.5) * self.voxel_size
    }

    /// SDF sample at a voxel, `None` when unobserved or out of bounds.
    fn sample(&self, ix: i32, iy: i32, iz: i32) -> Option<f32> {
        let (nx, ny, nz) = self.dims();
        if ix < 0 || iy < 0 || iz < 0 || ix as usize >= nx || iy as usize >= ny || iz as usize >= nz
        {
            return None;
        }
        let idx = [ix as usize, iy as usize, iz as usize];
        (self.weight[idx] > MIN_OBSERVED).then(|| self.sdf[idx])
    }

    /// Voxel index containing a local-frame point.
    fn voxel_of(&self, p: &Point3<f32>) -> (i32, i32, i32) {
        let rel = (p - self.origin) / self.voxel_size;
        (
            rel.x.floor() as i32,
            rel.y.floor() as i32,
            rel.z.floor() as i32,
        )
    }

    /// SDF gradient by central differences, in the local frame.
    fn gradient(&self, ix: i32, iy: i32, iz: i32) -> Option<Vector3<f32>> {
        let dx = self.sample(ix + 1, iy, iz)? - self.sample(ix - 1, iy, iz)?;
        let dy = self.sample(ix, iy + 1, iz)? - self.sample(ix, iy - 1, iz)?;
        let dz = self.sample(ix, iy, iz + 1)? - self.sample(ix, iy, iz - 1)?;
        let g = Vector3::new(dx, dy, dz);
        (g.norm_squared() > 1e-12).then(|| g.normalize())
    }

    /// Foreground probability at a voxel; unobserved voxels count as
    /// foreground so young volumes render.
    fn fg_ratio(&self, ix: usize, iy: usize, iz: usize) -> f32 {
        match &self.fg {
            Some((hits, obs)) if obs[[ix, iy, iz]] > 0.0 => {
                hits[[ix, iy, iz]] / obs[[ix, iy, iz]]
            }
            _ => 1.0,
        }
    }

    /// Index bounds of observed near-surface voxels, if any.
    fn surface_bounds(&self) -> Option<([usize; 3], [usize; 3])> {
        let mut lo = [usize::MAX; 3];
        let mut hi = [0usize; 3];
        let mut any = false;
        for ((ix, iy, iz), &w) in self.weight.indexed_iter() {
            if w > MIN_OBSERVED && self.sdf[[ix, iy, iz]].abs() < 0.99 {
                any = true;
                for (b, i) in lo.iter_mut().zip([ix, iy, iz]) {
                    *b = (*b).min(i);
                }
                for (b, i) in hi.iter_mut().zip([ix, iy, iz]) {
                    *b = (*b).max(i);
                }
            }
        }
        any.then_some((lo, hi))
    }
}

impl Volume for GridVolume {
    fn integrate(
        &mut self,
        view: &Isometry3<f32>,
        points: &Array3<f32>,
        weights: &Array2<f32>,
        fg_weights: Option<&Array2<f32>>,
    ) {
        if self.degenerate {
            return;
        }
        let (nx, ny, nz) = self.dims();
        for ix in 0..nx {
            for iy in 0..ny {
                for iz in 0..nz {
                    let p_cam = view * self.voxel_center(ix, iy, iz);
                    if p_cam.z <= 0.0 {
                        continue;
                    }
                    let Some((u, v)) = self.project(&p_cam) else {
                        continue;
                    };
                    let d = points[[v, u, 2]];
                    if d <= 0.0 {
                        continue;
                    }
                    let w = weights[[v, u]];
                    let eta = d - p_cam.z;
                    if eta < -self.truncation {
                        continue;
                    }
                    if w > 1e-4 {
                        let tsdf = (eta / self.truncation).min(1.0);
                        let idx = [ix, iy, iz];
                        let wt = self.weight[idx];
                        self.sdf[idx] = (self.sdf[idx] * wt + tsdf * w) / (wt + w);
                        self.weight[idx] = (wt + w).min(MAX_WEIGHT);
                    }
                    if let (Some((hits, obs)), Some(fg)) = (&mut self.fg, fg_weights) {
                        if eta.abs() <= self.truncation {
                            hits[[ix, iy, iz]] += fg[[v, u]];
                            obs[[ix, iy, iz]] += 1.0;
                        }
                    }
                }
            }
        }
    }

    fn raycast(&self, view: &Isometry3<f32>, intrinsics: &Intrinsics) -> ModelRender {
        let mut render = ModelRender::empty(intrinsics.width, intrinsics.height);
        if self.degenerate {
            return render;
        }
        let local_from_camera = view.inverse();
        let eye = local_from_camera * Point3::origin();
        let step = 0.5 * self.voxel_size;

        let hits: Vec<Option<(f32, Vector3<f32>)>> = (0..intrinsics.width * intrinsics.height)
            .into_par_iter()
            .map(|i| {
                let (x, y) = (i % intrinsics.width, i / intrinsics.width);
                let dir_cam = Vector3::new(
                    (x as f32 - intrinsics.cx) / intrinsics.fx,
                    (y as f32 - intrinsics.cy) / intrinsics.fy,
                    1.0,
                );
                let dir = local_from_camera.rotation * dir_cam;
                self.march(&eye, &dir, step, view)
            })
            .collect();

        for (i, hit) in hits.into_iter().enumerate() {
            if let Some((depth, normal)) = hit {
                let (x, y) = (i % intrinsics.width, i / intrinsics.width);
                render.depth[[y, x]] = depth;
                render.normals[[y, x, 0]] = normal.x;
                render.normals[[y, x, 1]] = normal.y;
                render.normals[[y, x, 2]] = normal.z;
                render.silhouette.set(x, y, true);
            }
        }
        render
    }

    fn resize(&mut self) -> Option<Vector3<f32>> {
        if !self.expandable || self.degenerate {
            return None;
        }
        let (lo, hi) = self.surface_bounds()?;
        let (nx, ny, nz) = self.dims();
        let dims = [nx, ny, nz];

        let mut pad_lo = [0usize; 3];
        let mut pad_hi = [0usize; 3];
        let mut grow = false;
        for axis in 0..3 {
            let pad = (dims[axis] / 4).max(4);
            if lo[axis] < BORDER_MARGIN {
                pad_lo[axis] = pad;
                grow = true;
            }
            if hi[axis] + BORDER_MARGIN >= dims[axis] {
                pad_hi[axis] = pad;
                grow = true;
            }
        }
        if !grow {
            return None;
        }

        let new_dims = [
            dims[0] + pad_lo[0] + pad_hi[0],
            dims[1] + pad_lo[1] + pad_hi[1],
            dims[2] + pad_lo[2] + pad_hi[2],
        ];
        if new_dims.iter().any(|&d| d > MAX_DIM) {
            self.degenerate = true;
            return None;
        }

        let shape = (new_dims[0], new_dims[1], new_dims[2]);
        let mut sdf = Array3::from_elem(shape, 1.0);
        let mut weight = Array3::zeros(shape);
        let mut fg = self
            .fg
            .as_ref()
            .map(|_| (Array3::zeros(shape), Array3::zeros(shape)));
        for ((ix, iy, iz), &v) in self.sdf.indexed_iter() {
            let dst = [ix + pad_lo[0], iy + pad_lo[1], iz + pad_lo[2]];
            sdf[dst] = v;
            weight[dst] = self.weight[[ix, iy, iz]];
            if let (Some((hits, obs)), Some((old_hits, old_obs))) = (&mut fg, &self.fg) {
                hits[dst] = old_hits[[ix, iy, iz]];
                obs[dst] = old_obs[[ix, iy, iz]];
            }
        }

        let old_center = self.origin + self.size() / 2.0;
        self.origin -= Vector3::new(
            pad_lo[0] as f32,
            pad_lo[1] as f32,
            pad_lo[2] as f32,
        ) * self.voxel_size;
        self.sdf = sdf;
        self.weight = weight;
        self.fg = fg;
        let new_center = self.origin + self.size() / 2.0;
        Some(new_center - old_center)
    }

    fn extent(&self) -> Extent {
        Extent::new(self.origin, self.origin + self.size())
    }

    fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    fn meta(&self) -> VolumeMeta {
        let (nx, ny, nz) = self.dims();
        VolumeMeta {
            resolution: nx.max(ny).max(nz) as u32,
            voxel_size: self.voxel_size,
        }
    }
}

impl GridVolume {
    /// Marches one ray through the grid, returning camera-frame depth and
    /// normal of the first zero crossing.
    fn march(
        &self,
        eye: &Point3<f32>,
        dir: &Vector3<f32>,
        step: f32,
        view: &Isometry3<f32>,
    ) -> Option<(f32, Vector3<f32>)> {
        let (t_enter, t_exit) = self.clip_ray(eye, dir)?;
        let dt = step / dir.norm().max(1e-6);

        let mut prev: Option<(f32, f32)> = None;
        let mut t = t_enter.max(0.0);
        while t <= t_exit {
            let p = eye + dir * t;
            let (ix, iy, iz) = self.voxel_of(&p);
            match self.sample(ix, iy, iz) {
                Some(s) => {
                    if let Some((t_prev, s_prev)) = prev {
                        if s_prev > 0.0 && s <= 0.0 {
                            let frac = s_prev / (s_prev - s);
                            let t_hit = t_prev + (t - t_prev) * frac;
                            let hit = eye + dir * t_hit;
                            let (hx, hy, hz) = self.voxel_of(&hit);
                            if self.fg_ratio(
                                hx.clamp(0, self.dims().0 as i32 - 1) as usize,
                                hy.clamp(0, self.dims().1 as i32 - 1) as usize,
                                hz.clamp(0, self.dims().2 as i32 - 1) as usize,
                            ) < 0.5
                            {
                                prev = Some((t, s));
                                t += dt;
                                continue;
                            }
                            let grad = self.gradient(hx, hy, hz)?;
                            let mut normal = view.rotation * grad;
                            if normal.z > 0.0 {
                                normal = -normal;
                            }
                            // Depth is the camera-frame z of the hit point;
                            // the ray is parameterized with unit z in the
                            // camera frame so t is exactly that depth.
                            return Some((t_hit, normal));
                        }
                    }
                    prev = Some((t, s));
                }
                None => prev = None,
            }
            t += dt;
        }
        None
    }

    /// Entry and exit ray parameters against the grid's bounding box.
    fn clip_ray(&self, eye: &Point3<f32>, dir: &Vector3<f32>) -> Option<(f32, f32)> {
        let min = self.origin;
        let max = self.origin + self.size();
        let mut t0 = f32::NEG_INFINITY;
        let mut t1 = f32::INFINITY;
        for axis in 0..3 {
            if dir[axis].abs() < 1e-9 {
                if eye[axis] < min[axis] || eye[axis] > max[axis] {
                    return None;
                }
                continue;
            }
            let a = (min[axis] - eye[axis]) / dir[axis];
            let b = (max[axis] - eye[axis]) / dir[axis];
            t0 = t0.max(a.min(b));
            t1 = t1.min(a.max(b));
        }
        (t1 >= t0 && t1 > 0.0).then_some((t0, t1))
    }
}

/// Volume factory wiring [`GridVolume`] into the engine.
pub struct GridFactory {
    /// World-frame extent of the background grid.
    pub background_extent: Extent,
    /// Background voxel edge length in meters.
    pub background_voxel: f32,
    /// Camera intrinsics shared with the engine.
    pub intrinsics: Intrinsics,
}

impl VolumeFactory for GridFactory {
    fn background(&self, _params: &FusionParams) -> Result<Box<dyn Volume>> {
        Ok(Box::new(GridVolume::new(
            &self.background_extent,
            self.background_voxel,
            self.intrinsics,
            false,
        )))
    }

    fn object(&self, extent: &Extent, params: &FusionParams) -> Result<Box<dyn Volume>> {
        // Object grids are sized relative to the object: a fixed per-axis
        // resolution determines the voxel size, clamped below so paper-thin
        // detections do not explode the grid.
        let voxel = (extent.size().max() / params.voxel_resolution as f32).max(params.voxel_size);
        let center = extent.center();
        let local = Extent::new(
            Point3::from(extent.min - center),
            Point3::from(extent.max - center),
        );
        Ok(Box::new(GridVolume::new(&local, voxel, self.intrinsics, true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use dynfuse::backproject;
    use nalgebra::Translation3;
    use ndarray::Array2;

    const W: usize = 64;
    const H: usize = 48;

    fn intrinsics() -> Intrinsics {
        Intrinsics::new(50.0, 50.0, 32.0, 24.0, W, H)
    }

    fn flat_cloud(depth: f32) -> Array3<f32> {
        backproject(&Array2::from_elem((H, W), depth), &intrinsics())
    }

    #[test]
    fn integrated_plane_raycasts_at_measured_depth() {
        let extent = Extent::new(Point3::new(-1.0, -1.0, 0.0), Point3::new(1.0, 1.0, 2.0));
        let mut volume = GridVolume::new(&extent, 0.05, intrinsics(), false);
        let weights = Array2::from_elem((H, W), 1.0);

        volume.integrate(&Isometry3::identity(), &flat_cloud(1.0), &weights, None);
        let render = volume.raycast(&Isometry3::identity(), &intrinsics());

        assert!(render.silhouette.contains(32, 24));
        assert_approx_eq!(render.depth[[24, 32]], 1.0, 0.05);
        assert!(render.normals[[24, 32, 2]] < -0.9);
    }

    #[test]
    fn empty_grid_renders_nothing() {
        let extent = Extent::new(Point3::new(-1.0, -1.0, 0.0), Point3::new(1.0, 1.0, 2.0));
        let volume = GridVolume::new(&extent, 0.05, intrinsics(), false);
        let render = volume.raycast(&Isometry3::identity(), &intrinsics());
        assert!(render.silhouette.is_empty());
    }

    #[test]
    fn resize_grows_toward_crowded_border() {
        // Local grid of 20 voxels per axis; the integrated surface lands at
        // local z ~ 0.095, two voxels from the +z border.
        let extent = Extent::new(Point3::new(-0.1, -0.1, -0.1), Point3::new(0.1, 0.1, 0.1));
        let mut volume = GridVolume::new(&extent, 0.01, intrinsics(), true);
        let view = Isometry3::from_parts(Translation3::new(0.0, 0.0, 0.905), Default::default());
        let weights = Array2::from_elem((H, W), 1.0);
        let fg = Array2::from_elem((H, W), 1.0);

        volume.integrate(&view, &flat_cloud(1.0), &weights, Some(&fg));

        let offset = volume.resize().unwrap();
        // Growth toward +z shifts the grid center; x and y grow on both
        // sides symmetrically.
        assert_approx_eq!(offset.x, 0.0, 1e-6);
        assert_approx_eq!(offset.y, 0.0, 1e-6);
        assert_approx_eq!(offset.z, 0.025, 1e-6);
        assert!(volume.extent().size().z > 0.2);

        // The surface is no longer near a border, so a second pass is a
        // no-op.
        assert!(volume.resize().is_none());
    }

    #[test]
    fn oversized_object_extent_is_degenerate() {
        let factory = GridFactory {
            background_extent: Extent::new(
                Point3::new(-2.0, -2.0, -0.5),
                Point3::new(2.0, 2.0, 3.5),
            ),
            background_voxel: 0.05,
            intrinsics: intrinsics(),
        };
        let huge = Extent::new(Point3::new(-2.5, -2.5, -2.5), Point3::new(2.5, 2.5, 2.5));
        let volume = factory.object(&huge, &FusionParams::default()).unwrap();
        assert!(volume.is_degenerate());

        let small = Extent::new(Point3::new(-0.1, -0.1, -0.1), Point3::new(0.1, 0.1, 0.1));
        let volume = factory.object(&small, &FusionParams::default()).unwrap();
        assert!(!volume.is_degenerate());
    }

    #[test]
    fn foreground_evidence_gates_object_rendering() {
        let extent = Extent::new(Point3::new(-0.5, -0.5, -0.5), Point3::new(0.5, 0.5, 0.5));
        let view = Isometry3::from_parts(Translation3::new(0.0, 0.0, 1.0), Default::default());
        let weights = Array2::from_elem((H, W), 1.0);

        // All evidence says background: the crossing is suppressed.
        let mut volume = GridVolume::new(&extent, 0.02, intrinsics(), true);
        let bg_evidence = Array2::zeros((H, W));
        volume.integrate(&view, &flat_cloud(1.0), &weights, Some(&bg_evidence));
        let render = volume.raycast(&view, &intrinsics());
        assert!(!render.silhouette.contains(32, 24));

        // All evidence says foreground: the surface renders.
        let mut volume = GridVolume::new(&extent, 0.02, intrinsics(), true);
        let fg_evidence = Array2::from_elem((H, W), 1.0);
        volume.integrate(&view, &flat_cloud(1.0), &weights, Some(&fg_evidence));
        let render = volume.raycast(&view, &intrinsics());
        assert!(render.silhouette.contains(32, 24));
        assert_approx_eq!(render.depth[[24, 32]], 1.0, 0.02);
    }
}
