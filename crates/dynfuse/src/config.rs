use serde::Deserialize;

/// Algorithm parameters for the fusion pipeline.
///
/// All fields have defaults tuned for indoor RGB-D sequences at 640x480 and
/// can be overridden individually when deserializing from a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    /// Minimum silhouette IOU for matching a detection to an existing model.
    pub match_min_iou: f32,
    /// Minimum number of valid masked points required to create a new object.
    pub new_obj_min_points: usize,
    /// Maximum volumetric IOU against any existing model above which a
    /// candidate object is treated as a re-detection and rejected.
    pub new_obj_max_overlap_iou: f32,
    /// Minimum number of weighted correspondences required to run pose
    /// refinement. Below this the previous pose is retained.
    pub track_min_correspondences: usize,
    /// Maximum number of iteratively reweighted least-squares iterations per
    /// model per frame.
    pub track_iterations: usize,
    /// Number of consecutive unmatched frames after which a model is deleted.
    pub stale_frames_patience: usize,
    /// Upper bound on simultaneously active objects. Detections arriving at
    /// the cap are ignored.
    pub max_active_objects: usize,
    /// Huber kernel width (meters) for depth residuals, shared by the
    /// association engine and the pose tracker.
    pub huber_delta: f32,
    /// Softmax temperature for normalizing association likelihoods.
    pub association_temperature: f32,
    /// Voxel grid resolution hint passed to the volume factory.
    pub voxel_resolution: u32,
    /// Voxel edge length hint (meters) passed to the volume factory.
    pub voxel_size: f32,
    /// Lower depth bound (meters) for the built-in range pre-filter.
    pub depth_min: f32,
    /// Upper depth bound (meters) for the built-in range pre-filter.
    pub depth_max: f32,
}

impl Default for FusionParams {
    fn default() -> Self {
        FusionParams {
            match_min_iou: 0.2,
            new_obj_min_points: 400,
            new_obj_max_overlap_iou: 0.5,
            track_min_correspondences: 100,
            track_iterations: 10,
            stale_frames_patience: 5,
            max_active_objects: 8,
            huber_delta: 0.02,
            association_temperature: 1e-4,
            voxel_resolution: 64,
            voxel_size: 0.008,
            depth_min: 0.1,
            depth_max: 6.0,
        }
    }
}
