use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use nalgebra::{Isometry3, Translation3, Vector3};

/// Per-object results for one frame.
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    /// Object id.
    pub id: u64,
    /// Refined pose of the object's local frame in the world frame.
    pub pose: Isometry3<f32>,
    /// Cumulative local-origin translation from volume resizes. Must be
    /// folded into the pose before comparing against other frames.
    pub pose_offset: Vector3<f32>,
    /// Whether the object was matched to a detection this frame.
    pub matched: bool,
    /// Association weight mass over valid pixels this frame.
    pub weight_mass: f32,
    /// Consecutive unmatched frames after this frame's cleanup.
    pub staleness: usize,
}

/// Everything the engine reports for one processed frame. Consumption is
/// one-directional; nothing here feeds back into the pipeline.
#[derive(Debug, Clone)]
pub struct FrameSummary {
    /// Zero-based frame index.
    pub frame: usize,
    /// Camera pose for the frame (world from camera).
    pub camera_pose: Isometry3<f32>,
    /// Cumulative origin shift from background volume resizes. Must be
    /// folded into the camera pose before comparing against other frames.
    pub camera_offset: Vector3<f32>,
    /// Active objects after this frame's cleanup, ascending by id.
    pub objects: Vec<ObjectSummary>,
}

/// Consumer of per-frame results.
pub trait ResultSink {
    /// Consumes the summary of one processed frame.
    fn consume(&mut self, summary: FrameSummary);
}

/// A sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn consume(&mut self, _summary: FrameSummary) {}
}

/// Records camera and object trajectories with resize offsets folded in, for
/// evaluation against ground truth.
#[derive(Debug, Default)]
pub struct PoseLog {
    camera: Vec<(usize, Isometry3<f32>)>,
    objects: BTreeMap<u64, Vec<(usize, Isometry3<f32>)>>,
}

impl PoseLog {
    /// Returns a new empty PoseLog.
    pub fn new() -> PoseLog {
        PoseLog::default()
    }

    /// Returns the recorded camera trajectory.
    pub fn camera(&self) -> &[(usize, Isometry3<f32>)] {
        &self.camera
    }

    /// Returns the recorded trajectory of an object, with offsets applied.
    pub fn object(&self, id: u64) -> Option<&[(usize, Isometry3<f32>)]> {
        self.objects.get(&id).map(|v| v.as_slice())
    }

    /// Returns the ids of all objects that ever appeared.
    pub fn object_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.objects.keys().copied()
    }

    /// Writes all trajectories as CSV rows
    /// `model,frame,tx,ty,tz,qx,qy,qz,qw` where `model` is `camera` or the
    /// object id.
    pub fn write_csv<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "model,frame,tx,ty,tz,qx,qy,qz,qw")?;
        for (frame, pose) in &self.camera {
            write_row(out, "camera", *frame, pose)?;
        }
        for (id, trajectory) in &self.objects {
            for (frame, pose) in trajectory {
                write_row(out, &id.to_string(), *frame, pose)?;
            }
        }
        Ok(())
    }
}

fn write_row<W: Write>(out: &mut W, model: &str, frame: usize, pose: &Isometry3<f32>) -> Result<()> {
    let t = pose.translation;
    let q = pose.rotation;
    writeln!(
        out,
        "{},{},{},{},{},{},{},{},{}",
        model, frame, t.x, t.y, t.z, q.i, q.j, q.k, q.w
    )?;
    Ok(())
}

impl ResultSink for PoseLog {
    fn consume(&mut self, summary: FrameSummary) {
        // The camera's offset comes from background volume resizes and is
        // folded in the same way as the object offsets below.
        let camera = summary.camera_pose * Translation3::from(summary.camera_offset);
        self.camera.push((summary.frame, camera));
        for obj in &summary.objects {
            // Fold the resize offset into the reported pose: the offset marks
            // where the volume's local origin moved inside the world-anchored
            // pose.
            let corrected = obj.pose * Translation3::from(obj.pose_offset);
            self.objects
                .entry(obj.id)
                .or_default()
                .push((summary.frame, corrected));
        }
    }
}
