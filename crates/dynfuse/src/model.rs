use nalgebra::{Isometry3, Vector3};
use ndarray::Array2;

use crate::{Mask, ModelRender, Volume};

/// Per-frame working state owned by one roster entry.
///
/// Holding render, weight map and match together in the entry keeps the many
/// per-model maps in sync by construction; nothing here survives past the
/// frame's cleanup step except the render, which the next frame's matching
/// and association consume before integration replaces it.
#[derive(Debug)]
pub(crate) struct FrameData {
    /// Raycast of the model at its refined pose, produced at the end of the
    /// previous frame's integration phase. The matcher, the association
    /// engine and the tracker all consume it before it is replaced.
    pub render: ModelRender,
    /// Normalized association weight map for this frame.
    pub weights: Array2<f32>,
    /// Mask of the detection matched to this model this frame, if any.
    pub matched_mask: Option<Mask>,
    /// Total association weight mass over valid pixels this frame.
    pub weight_mass: f32,
    /// Pose refinement was skipped this frame (too few correspondences).
    pub track_skipped: bool,
}

impl FrameData {
    pub(crate) fn new(width: usize, height: usize) -> FrameData {
        FrameData {
            render: ModelRender::empty(width, height),
            weights: Array2::zeros((height, width)),
            matched_mask: None,
            weight_mass: 0.0,
            track_skipped: false,
        }
    }

    /// Resets the per-frame fields at the start of a frame; the render stays
    /// until the next integration phase replaces it.
    pub(crate) fn begin_frame(&mut self) {
        self.matched_mask = None;
        self.weight_mass = 0.0;
        self.track_skipped = false;
    }
}

/// One tracked rigid object: a volumetric model, its pose and its life-cycle
/// state.
pub struct ObjectModel {
    /// Unique, monotonically increasing identifier; never reused.
    id: u64,
    /// Volumetric representation collaborator.
    pub(crate) volume: Box<dyn Volume>,
    /// Pose of the object's local frame in the world frame.
    pub(crate) pose: Isometry3<f32>,
    /// Accumulated per-class scores over all matched detections.
    class_scores: Vec<f32>,
    /// Consecutive frames this object has gone unmatched.
    staleness: usize,
    /// Frame index at which the object was created.
    created_frame: usize,
    /// Cumulative local-origin translation from volume resizes; folded into
    /// externally reported poses.
    pub(crate) pose_offset: Vector3<f32>,
    /// Per-frame working state.
    pub(crate) frame: FrameData,
}

impl std::fmt::Debug for ObjectModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectModel")
            .field("id", &self.id)
            .field("pose", &self.pose)
            .field("staleness", &self.staleness)
            .field("created_frame", &self.created_frame)
            .finish()
    }
}

impl ObjectModel {
    pub(crate) fn new(
        id: u64,
        volume: Box<dyn Volume>,
        pose: Isometry3<f32>,
        class_scores: Vec<f32>,
        created_frame: usize,
        width: usize,
        height: usize,
    ) -> ObjectModel {
        ObjectModel {
            id,
            volume,
            pose,
            class_scores,
            staleness: 0,
            created_frame,
            pose_offset: Vector3::zeros(),
            frame: FrameData::new(width, height),
        }
    }

    /// Returns the unique id of the object.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current pose of the object in the world frame.
    pub fn pose(&self) -> &Isometry3<f32> {
        &self.pose
    }

    /// Returns the cumulative local-origin offset from volume resizes.
    pub fn pose_offset(&self) -> &Vector3<f32> {
        &self.pose_offset
    }

    /// Returns the accumulated class score vector.
    pub fn class_scores(&self) -> &[f32] {
        &self.class_scores
    }

    /// Returns the class with the highest accumulated score, if any.
    pub fn dominant_class(&self) -> Option<usize> {
        self.class_scores
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
    }

    /// Returns the number of consecutive frames this object went unmatched.
    pub fn staleness(&self) -> usize {
        self.staleness
    }

    /// Returns the frame index the object was created at.
    pub fn created_frame(&self) -> usize {
        self.created_frame
    }

    /// Returns true if the object was matched to a detection this frame.
    pub fn is_matched(&self) -> bool {
        self.frame.matched_mask.is_some()
    }

    /// Records a matched detection for this frame and accumulates its class
    /// scores.
    pub(crate) fn observe_match(&mut self, mask: Mask, scores: &[f32]) {
        if self.class_scores.len() < scores.len() {
            self.class_scores.resize(scores.len(), 0.0);
        }
        for (acc, s) in self.class_scores.iter_mut().zip(scores) {
            *acc += s;
        }
        self.frame.matched_mask = Some(mask);
    }

    /// Advances or resets the staleness counter at cleanup.
    pub(crate) fn advance_staleness(&mut self, stale: bool) {
        if stale {
            self.staleness += 1;
        } else {
            self.staleness = 0;
        }
    }
}

/// The background model: a singleton volume whose tracking defines the camera
/// pose. It has no id and never participates in matching or life-cycle
/// decisions.
pub(crate) struct Background {
    pub volume: Box<dyn Volume>,
    pub frame: FrameData,
}

impl Background {
    pub(crate) fn new(volume: Box<dyn Volume>, width: usize, height: usize) -> Background {
        Background {
            volume,
            frame: FrameData::new(width, height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeVolume;
    use assert_approx_eq::assert_approx_eq;

    fn object(id: u64) -> ObjectModel {
        ObjectModel::new(
            id,
            Box::new(FakeVolume::plane(1.0, 16, 16)),
            Isometry3::identity(),
            vec![],
            0,
            16,
            16,
        )
    }

    #[test]
    fn score_accumulation_and_dominant_class() {
        let mut obj = object(1);
        obj.observe_match(Mask::new(16, 16), &[0.1, 0.7, 0.2]);
        obj.observe_match(Mask::new(16, 16), &[0.2, 0.5, 0.3]);
        assert_approx_eq!(obj.class_scores()[1], 1.2);
        assert_eq!(obj.dominant_class(), Some(1));
        assert!(obj.is_matched());
    }

    #[test]
    fn staleness_advances_and_resets() {
        let mut obj = object(1);
        obj.advance_staleness(true);
        obj.advance_staleness(true);
        assert_eq!(obj.staleness(), 2);
        obj.advance_staleness(false);
        assert_eq!(obj.staleness(), 0);
    }

    #[test]
    fn begin_frame_keeps_render_clears_match() {
        let mut obj = object(1);
        obj.frame.render.silhouette.set(3, 3, true);
        obj.frame.matched_mask = Some(Mask::new(16, 16));
        obj.frame.track_skipped = true;
        obj.frame.begin_frame();
        assert!(obj.frame.render.silhouette.contains(3, 3));
        assert!(obj.frame.matched_mask.is_none());
        assert!(!obj.frame.track_skipped);
    }
}
