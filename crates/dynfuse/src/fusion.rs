use std::collections::BTreeMap;

use anyhow::Result;
use log::{debug, warn};
use nalgebra::{Isometry3, Vector3};
use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::model::Background;
use crate::{
    association, backproject, lifecycle, matching, tracking, DepthFilter, Detector, Frame,
    FrameSummary, FusionParams, Intrinsics, Mask, ObjectModel, ObjectSummary, ResultSink,
    VolumeFactory,
};

/// The per-frame orchestration engine.
///
/// `Fusion` owns the background model, the roster of active objects and the
/// collaborators, and sequences every frame: intake, detection matching,
/// object creation, association weighting, background-then-object pose
/// tracking, parallel volumetric integration and life-cycle cleanup. The
/// roster is an arena keyed by stable object id; it is mutated only in the
/// sequential pre/post phases, while the association, tracking and
/// integration phases run per-model parallel against shared read-only frame
/// data with a barrier between phases.
///
/// Failure in one model's processing never aborts the frame for the others;
/// only volume allocation failure propagates as an error.
pub struct Fusion {
    params: FusionParams,
    intrinsics: Intrinsics,
    /// Camera pose for the current frame (world from camera), updated once
    /// per frame by tracking the background.
    camera_pose: Isometry3<f32>,
    /// Cumulative origin shift from background volume resizes; folded into
    /// externally reported camera poses.
    camera_offset: Vector3<f32>,
    background: Background,
    /// Active objects keyed by their unique, never-reused id.
    objects: BTreeMap<u64, ObjectModel>,
    /// Next object id to allocate; monotonically increasing.
    next_id: u64,
    frame_count: usize,
    detector: Box<dyn Detector>,
    depth_filter: Box<dyn DepthFilter>,
    factory: Box<dyn VolumeFactory>,
}

impl Fusion {
    /// Returns a new Fusion engine with an allocated background volume.
    pub fn new(
        params: FusionParams,
        intrinsics: Intrinsics,
        detector: Box<dyn Detector>,
        depth_filter: Box<dyn DepthFilter>,
        factory: Box<dyn VolumeFactory>,
    ) -> Result<Fusion> {
        let volume = factory.background(&params)?;
        let background = Background::new(volume, intrinsics.width, intrinsics.height);
        Ok(Fusion {
            params,
            intrinsics,
            camera_pose: Isometry3::identity(),
            camera_offset: Vector3::zeros(),
            background,
            objects: BTreeMap::new(),
            next_id: 1,
            frame_count: 0,
            detector,
            depth_filter,
            factory,
        })
    }

    /// Resets all state to initial: fresh background volume, empty roster,
    /// identity camera pose.
    pub fn reset(&mut self) -> Result<()> {
        self.background = Background::new(
            self.factory.background(&self.params)?,
            self.intrinsics.width,
            self.intrinsics.height,
        );
        self.objects.clear();
        self.camera_pose = Isometry3::identity();
        self.camera_offset = Vector3::zeros();
        self.next_id = 1;
        self.frame_count = 0;
        Ok(())
    }

    /// Returns the camera pose after the most recent frame.
    pub fn camera_pose(&self) -> &Isometry3<f32> {
        &self.camera_pose
    }

    /// Returns the cumulative origin shift from background volume resizes.
    pub fn camera_offset(&self) -> &Vector3<f32> {
        &self.camera_offset
    }

    /// Returns the number of frames processed so far.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Returns the active objects in ascending id order.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectModel> {
        self.objects.values()
    }

    /// Returns the active object with the given id, if any.
    pub fn object(&self, id: u64) -> Option<&ObjectModel> {
        self.objects.get(&id)
    }

    /// Processes one frame: raw depth and RGB in, per-frame results out
    /// through the sink.
    pub fn process_frame(
        &mut self,
        raw_depth: &Array2<f32>,
        rgb: &Array3<u8>,
        sink: &mut dyn ResultSink,
    ) -> Result<()> {
        // Intake: pre-filter depth and back-project the measurement cloud.
        let (depth, validity) = self.depth_filter.filter(raw_depth);
        let frame = Frame {
            depth,
            validity,
            rgb: rgb.clone(),
            index: self.frame_count,
        };
        let points = backproject(&frame.depth, &self.intrinsics);

        self.background.frame.begin_frame();
        for obj in self.objects.values_mut() {
            obj.frame.begin_frame();
        }

        // Detect and match against the last rendered silhouettes.
        let detections = self.detector.detect(&frame)?;
        let match_set =
            matching::match_detections(&self.objects, &detections, self.params.match_min_iou);
        debug!(
            "frame {}: {} detections, {} matched, {} objects active",
            frame.index,
            detections.len(),
            match_set.matches.len(),
            self.objects.len()
        );
        for m in &match_set.matches {
            let detection = &detections[m.detection_idx];
            if let Some(obj) = self.objects.get_mut(&m.object_id) {
                obj.observe_match(detection.mask().clone(), detection.scores());
            }
        }

        // Create objects from unmatched detections.
        if !detections.is_empty() {
            lifecycle::create_objects(
                &match_set.unmatched_detections,
                &detections,
                &frame,
                &points,
                &self.camera_pose,
                &mut self.objects,
                &mut self.next_id,
                self.factory.as_ref(),
                &self.params,
            )?;
        }

        // Per-pixel association weights across background + all objects.
        association::compute_weights(
            &frame,
            &mut self.background,
            &mut self.objects,
            &self.params,
        );

        // Track the background first; its refinement fixes the camera pose
        // for the frame and object tracking never touches it.
        let camera_before = self.camera_pose;
        let outcome = tracking::track_model(
            &self.background.frame.render,
            &points,
            &frame.validity,
            &self.background.frame.weights,
            &self.intrinsics,
            &self.params,
        );
        if outcome.converged {
            self.camera_pose = camera_before * outcome.delta;
        } else {
            self.background.frame.track_skipped = true;
            debug!(
                "frame {}: camera tracking skipped ({} correspondences)",
                frame.index, outcome.correspondences
            );
        }
        let camera_after = self.camera_pose;

        // Track each object independently against its own render.
        {
            let intrinsics = self.intrinsics;
            let params = &self.params;
            self.objects.par_iter_mut().for_each(|(id, obj)| {
                let outcome = tracking::track_model(
                    &obj.frame.render,
                    &points,
                    &frame.validity,
                    &obj.frame.weights,
                    &intrinsics,
                    params,
                );
                if outcome.converged {
                    // The delta aligns this frame's measurement onto the
                    // render taken at the previous camera pose; re-anchor the
                    // object in the world through both camera poses.
                    obj.pose =
                        camera_after * outcome.delta.inverse() * camera_before.inverse() * obj.pose;
                } else {
                    obj.frame.track_skipped = true;
                    debug!(
                        "frame {}: tracking skipped for object {} ({} correspondences)",
                        frame.index, id, outcome.correspondences
                    );
                }
            });
        }

        // Integrate every model on its own job and re-render for the next
        // frame; voxel regions are disjoint and frame data is read-only, so
        // all jobs run concurrently up to the frame barrier.
        let camera_from_world = camera_after.inverse();
        let (background_offset, ()) = {
            let background = &mut self.background;
            let objects = &mut self.objects;
            let intrinsics = self.intrinsics;
            let points = &points;
            rayon::join(
                || {
                    background.volume.integrate(
                        &camera_from_world,
                        points,
                        &background.frame.weights,
                        None,
                    );
                    let offset = background.volume.resize();
                    background.frame.render =
                        background.volume.raycast(&camera_from_world, &intrinsics);
                    offset
                },
                || {
                    objects.par_iter_mut().for_each(|(_, obj)| {
                        let view = camera_from_world * obj.pose;
                        let fg = obj.frame.matched_mask.as_ref().map(mask_weights);
                        obj.volume
                            .integrate(&view, points, &obj.frame.weights, fg.as_ref());
                        if let Some(offset) = obj.volume.resize() {
                            obj.pose_offset += offset;
                        }
                        obj.frame.render = obj.volume.raycast(&view, &intrinsics);
                    });
                },
            )
        };
        if let Some(offset) = background_offset {
            self.camera_offset += offset;
            warn!(
                "background volume resized, cumulative camera offset {:?}",
                self.camera_offset
            );
        }

        // Life-cycle cleanup, then report the frame.
        let deleted = lifecycle::cleanup(&mut self.objects, &self.params, frame.index);
        if !deleted.is_empty() {
            debug!("frame {}: deleted objects {:?}", frame.index, deleted);
        }

        sink.consume(FrameSummary {
            frame: frame.index,
            camera_pose: self.camera_pose,
            camera_offset: self.camera_offset,
            objects: self
                .objects
                .values()
                .map(|obj| ObjectSummary {
                    id: obj.id(),
                    pose: *obj.pose(),
                    pose_offset: *obj.pose_offset(),
                    matched: obj.is_matched(),
                    weight_mass: obj.frame.weight_mass,
                    staleness: obj.staleness(),
                })
                .collect(),
        });

        self.frame_count += 1;
        Ok(())
    }
}

/// Expands a detection mask into a foreground weight image.
fn mask_weights(mask: &Mask) -> Array2<f32> {
    let mut weights = Array2::<f32>::zeros((mask.height(), mask.width()));
    for (x, y) in mask.pixels() {
        weights[[y, x]] = 1.0;
    }
    weights
}
