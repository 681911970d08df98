use std::collections::BTreeMap;

use anyhow::Result;
use log::{debug, warn};
use nalgebra::{Isometry3, Point3, Translation3, Vector3};
use ndarray::Array3;

use crate::association::MIN_WEIGHT_MASS;
use crate::{Detection, Extent, Frame, FusionParams, ObjectModel, VolumeFactory};

/// Percentiles bounding a new object's point cloud; the 10/90 band resists
/// segmentation bleed and depth outliers.
const EXTENT_LO: f32 = 0.1;
const EXTENT_HI: f32 = 0.9;

/// Volumetric intersection over union of two world-space extents, in
/// `[0.0, 1.0]`. Computed on axis-aligned boxes in the shared world frame, so
/// it is symmetric by construction.
pub(crate) fn volume_iou(a: &Extent, b: &Extent) -> f32 {
    let intersection = a.intersection_volume(b);
    let union = a.volume() + b.volume() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Creates new objects from this frame's unmatched detections.
///
/// A candidate is accepted when its masked point cloud is large enough and
/// its percentile-bounded world extent does not substantially overlap any
/// existing model (a failed re-detection). Accepted candidates get the next
/// unused id, a pose at the extent center, scores seeded from the detection
/// and staleness zero; they count as matched for the rest of the frame.
/// Hitting the active-object cap ignores the remaining detections. Only
/// volume allocation failure propagates.
#[allow(clippy::too_many_arguments)]
pub(crate) fn create_objects(
    unmatched: &[usize],
    detections: &[Detection],
    frame: &Frame,
    points: &Array3<f32>,
    camera_pose: &Isometry3<f32>,
    objects: &mut BTreeMap<u64, ObjectModel>,
    next_id: &mut u64,
    factory: &dyn VolumeFactory,
    params: &FusionParams,
) -> Result<Vec<u64>> {
    let mut created = Vec::new();

    for &idx in unmatched {
        if objects.len() >= params.max_active_objects {
            warn!(
                "active-object cap ({}) reached, ignoring detection {}",
                params.max_active_objects, idx
            );
            continue;
        }

        let detection = &detections[idx];
        let world_points: Vec<Point3<f32>> = detection
            .mask()
            .pixels()
            .filter(|&(x, y)| frame.validity.contains(x, y))
            .map(|(x, y)| {
                camera_pose * Point3::new(points[[y, x, 0]], points[[y, x, 1]], points[[y, x, 2]])
            })
            .collect();
        if world_points.len() < params.new_obj_min_points {
            debug!(
                "rejecting detection {}: {} points below minimum {}",
                idx,
                world_points.len(),
                params.new_obj_min_points
            );
            continue;
        }

        let Some(extent) = Extent::from_percentiles(&world_points, EXTENT_LO, EXTENT_HI) else {
            continue;
        };
        // The percentile box is tight and can be paper-thin for frontal
        // surfaces; pad it so the volume encloses the full object.
        let pad = (extent.size().max() * 0.1).max(params.voxel_size);
        let extent = Extent::new(
            extent.min - Vector3::repeat(pad),
            extent.max + Vector3::repeat(pad),
        );
        if extent.is_degenerate() {
            debug!("rejecting detection {}: degenerate extent", idx);
            continue;
        }

        let overlapping = objects.values().find(|obj| {
            let existing = obj.volume.extent().transformed(obj.pose());
            volume_iou(&extent, &existing) > params.new_obj_max_overlap_iou
        });
        if let Some(obj) = overlapping {
            debug!(
                "rejecting detection {}: volumetric overlap with object {}",
                idx,
                obj.id()
            );
            continue;
        }

        let volume = factory.object(&extent, params)?;
        let pose = Isometry3::from_parts(Translation3::from(extent.center()), Default::default());
        let id = *next_id;
        *next_id += 1;

        let mut object = ObjectModel::new(
            id,
            volume,
            pose,
            Vec::new(),
            frame.index,
            frame.validity.width(),
            frame.validity.height(),
        );
        object.observe_match(detection.mask().clone(), detection.scores());
        debug!(
            "created object {} from detection {} ({} points)",
            id,
            idx,
            world_points.len()
        );
        objects.insert(id, object);
        created.push(id);
    }

    Ok(created)
}

/// Advances staleness and deletes expired or degenerate models.
///
/// A model is stale this frame if it went unmatched, its association weight
/// mass was near zero, or its pose refinement was skipped; objects created
/// this frame are exempt and keep staleness zero. Deletion releases the model
/// and everything it owns; its id is never reused. Returns the deleted ids.
pub(crate) fn cleanup(
    objects: &mut BTreeMap<u64, ObjectModel>,
    params: &FusionParams,
    frame_index: usize,
) -> Vec<u64> {
    for obj in objects.values_mut() {
        if obj.created_frame() == frame_index {
            continue;
        }
        let stale = !obj.is_matched()
            || obj.frame.weight_mass < MIN_WEIGHT_MASS
            || obj.frame.track_skipped;
        obj.advance_staleness(stale);
    }

    let expired: Vec<u64> = objects
        .iter()
        .filter(|(_, obj)| {
            if obj.staleness() > params.stale_frames_patience {
                debug!(
                    "deleting object {}: stale for {} frames",
                    obj.id(),
                    obj.staleness()
                );
                return true;
            }
            if obj.volume.is_degenerate() {
                warn!("deleting object {}: degenerate volume", obj.id());
                return true;
            }
            false
        })
        .map(|(&id, _)| id)
        .collect();

    for id in &expired {
        objects.remove(id);
    }
    expired
}
