//! Shared collaborator doubles and fixtures for unit tests.

use anyhow::Result;
use nalgebra::{Isometry3, Point3, Vector3};
use ndarray::{Array2, Array3};

use crate::model::Background;
use crate::{
    Detection, Detector, Extent, Frame, FusionParams, Intrinsics, Mask, ModelRender, ObjectModel,
    Volume, VolumeFactory, VolumeMeta,
};

/// Detector double replaying a scripted list of detections per frame index;
/// frames beyond the script yield no detections.
pub(crate) struct ScriptedDetector {
    pub frames: Vec<Vec<Detection>>,
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self.frames.get(frame.index).cloned().unwrap_or_default())
    }
}

/// Returns a rectangular mask for tests.
pub(crate) fn rect_mask(width: usize, height: usize, x0: usize, y0: usize, w: usize, h: usize) -> Mask {
    Mask::from_fn(width, height, |x, y| {
        x >= x0 && x < x0 + w && y >= y0 && y < y0 + h
    })
}

/// Returns a frame of constant valid depth and black RGB.
pub(crate) fn flat_frame(width: usize, height: usize, depth: f32, index: usize) -> Frame {
    Frame {
        depth: Array2::from_elem((height, width), depth),
        validity: Mask::from_fn(width, height, |_, _| true),
        rgb: Array3::zeros((height, width, 3)),
        index,
    }
}

/// Returns a full-frame fronto-parallel plane render at the given depth with
/// normals facing the camera.
pub(crate) fn plane_render(depth: f32, width: usize, height: usize) -> ModelRender {
    let mut render = ModelRender::empty(width, height);
    if depth > 0.0 {
        render.depth.fill(depth);
        render.silhouette = Mask::from_fn(width, height, |_, _| true);
        for y in 0..height {
            for x in 0..width {
                render.normals[[y, x, 2]] = -1.0;
            }
        }
    }
    render
}

enum FakeMode {
    /// Always renders a full-frame plane at the given depth (0 renders
    /// nothing).
    Plane(f32),
    /// Renders whatever depth the last integrations wrote.
    Learned,
}

/// Volume double: either a fixed plane or a per-pixel depth buffer learned
/// from integration, with scriptable resize and degeneracy behavior.
pub(crate) struct FakeVolume {
    mode: FakeMode,
    learned_depth: Array2<f32>,
    pub extent: Extent,
    pub degenerate: bool,
    pub resize_offset: Option<Vector3<f32>>,
    pub integrations: usize,
}

impl FakeVolume {
    pub fn plane(depth: f32, width: usize, height: usize) -> FakeVolume {
        FakeVolume {
            mode: FakeMode::Plane(depth),
            learned_depth: Array2::zeros((height, width)),
            extent: Extent::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0)),
            degenerate: false,
            resize_offset: None,
            integrations: 0,
        }
    }

    pub fn learned(width: usize, height: usize, extent: Extent) -> FakeVolume {
        FakeVolume {
            mode: FakeMode::Learned,
            learned_depth: Array2::zeros((height, width)),
            extent,
            degenerate: false,
            resize_offset: None,
            integrations: 0,
        }
    }

    /// Pre-seeds the learned buffer with a rectangular region at constant
    /// depth, as if it had been integrated before.
    pub fn with_region(mut self, depth: f32, x0: usize, y0: usize, w: usize, h: usize) -> FakeVolume {
        for y in y0..(y0 + h).min(self.learned_depth.nrows()) {
            for x in x0..(x0 + w).min(self.learned_depth.ncols()) {
                self.learned_depth[[y, x]] = depth;
            }
        }
        self
    }
}

impl Volume for FakeVolume {
    fn integrate(
        &mut self,
        _view: &Isometry3<f32>,
        points: &Array3<f32>,
        weights: &Array2<f32>,
        _fg_weights: Option<&Array2<f32>>,
    ) {
        self.integrations += 1;
        if matches!(self.mode, FakeMode::Learned) {
            for ((y, x), &w) in weights.indexed_iter() {
                let z = points[[y, x, 2]];
                if w > 0.5 && z > 0.0 {
                    self.learned_depth[[y, x]] = z;
                }
            }
        }
    }

    fn raycast(&self, _view: &Isometry3<f32>, intrinsics: &Intrinsics) -> ModelRender {
        match self.mode {
            FakeMode::Plane(depth) => plane_render(depth, intrinsics.width, intrinsics.height),
            FakeMode::Learned => {
                let mut render = ModelRender::empty(intrinsics.width, intrinsics.height);
                for ((y, x), &z) in self.learned_depth.indexed_iter() {
                    if z > 0.0 {
                        render.depth[[y, x]] = z;
                        render.silhouette.set(x, y, true);
                        render.normals[[y, x, 2]] = -1.0;
                    }
                }
                render
            }
        }
    }

    fn resize(&mut self) -> Option<Vector3<f32>> {
        self.resize_offset.take()
    }

    fn extent(&self) -> Extent {
        self.extent
    }

    fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    fn meta(&self) -> VolumeMeta {
        VolumeMeta {
            resolution: 64,
            voxel_size: 0.008,
        }
    }
}

/// Factory double: a plane background and learned object volumes, with
/// scriptable resize offsets and degeneracy for created objects. The
/// degeneracy flag is one-shot: only the next created volume is degenerate.
pub(crate) struct FakeFactory {
    pub width: usize,
    pub height: usize,
    pub background_depth: f32,
    pub background_resize_offset: Option<Vector3<f32>>,
    pub object_resize_offset: Option<Vector3<f32>>,
    pub object_degenerate: std::cell::Cell<bool>,
}

impl FakeFactory {
    pub fn new(width: usize, height: usize) -> FakeFactory {
        FakeFactory {
            width,
            height,
            background_depth: 1.0,
            background_resize_offset: None,
            object_resize_offset: None,
            object_degenerate: std::cell::Cell::new(false),
        }
    }
}

impl VolumeFactory for FakeFactory {
    fn background(&self, _params: &FusionParams) -> Result<Box<dyn Volume>> {
        let mut volume = FakeVolume::plane(self.background_depth, self.width, self.height);
        volume.resize_offset = self.background_resize_offset;
        Ok(Box::new(volume))
    }

    fn object(&self, extent: &Extent, _params: &FusionParams) -> Result<Box<dyn Volume>> {
        // Store the extent relative to the object's local origin at its
        // center, the same convention the creation step uses for the pose.
        let center = extent.center();
        let local = Extent::new(
            Point3::from(extent.min - center),
            Point3::from(extent.max - center),
        );
        let mut volume = FakeVolume::learned(self.width, self.height, local);
        volume.resize_offset = self.object_resize_offset;
        volume.degenerate = self.object_degenerate.take();
        Ok(Box::new(volume))
    }
}

/// Returns a background whose volume renders a full-frame plane (depth 0
/// renders nothing).
pub(crate) fn plane_background(depth: f32, width: usize, height: usize) -> Background {
    let volume = FakeVolume::plane(depth, width, height);
    let mut background = Background::new(Box::new(volume), width, height);
    background.frame.render = plane_render(depth, width, height);
    background
}

/// Returns an object whose current render covers a rectangular region at
/// constant depth (zero sizes give an empty render).
pub(crate) fn object_with_region(
    id: u64,
    depth: f32,
    width: usize,
    height: usize,
    x0: usize,
    y0: usize,
    w: usize,
    h: usize,
) -> ObjectModel {
    let volume = FakeVolume::learned(
        width,
        height,
        Extent::new(Point3::new(-0.1, -0.1, -0.1), Point3::new(0.1, 0.1, 0.1)),
    )
    .with_region(depth, x0, y0, w, h);
    let intrinsics = Intrinsics::new(50.0, 50.0, width as f32 / 2.0, height as f32 / 2.0, width, height);
    let render = volume.raycast(&Isometry3::identity(), &intrinsics);
    let mut object = ObjectModel::new(
        id,
        Box::new(volume),
        Isometry3::identity(),
        vec![],
        0,
        width,
        height,
    );
    object.frame.render = render;
    object
}

/// Returns an object whose last rendered silhouette is a rectangle, for
/// matcher tests.
pub(crate) fn object_with_silhouette(
    id: u64,
    width: usize,
    height: usize,
    x0: usize,
    y0: usize,
    w: usize,
    h: usize,
) -> ObjectModel {
    object_with_region(id, 1.0, width, height, x0, y0, w, h)
}
