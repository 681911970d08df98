use std::collections::HashMap;

use anyhow::Result;
use uuid::Uuid;

use crate::{Frame, Mask};

/// Axis-aligned pixel rectangle in `(x, y, width, height)` format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge (min x).
    pub x: u32,
    /// Top edge (min y).
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Returns a new Rect.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Rect {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    /// Returns the tight bounding rectangle of the set pixels of a mask, or
    /// `None` for an empty mask.
    pub fn bounding(mask: &Mask) -> Option<Rect> {
        let mut min_x = usize::MAX;
        let mut min_y = usize::MAX;
        let mut max_x = 0usize;
        let mut max_y = 0usize;
        for (x, y) in mask.pixels() {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        if min_x == usize::MAX {
            return None;
        }
        Some(Rect::new(
            min_x as u32,
            min_y as u32,
            (max_x - min_x + 1) as u32,
            (max_y - min_y + 1) as u32,
        ))
    }

    /// Returns the area of the rectangle in pixels.
    pub fn area(&self) -> u32 {
        self.width * self.height
    }
}

/// A single instance detection in one frame.
///
/// Detections are produced once per frame by the [`Detector`] collaborator and
/// never persisted across frames.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Unique detection identifier.
    id: Uuid,
    /// Bounding box of the mask.
    bbox: Rect,
    /// Dense segmentation mask at full frame resolution.
    mask: Mask,
    /// Per-class score vector from the detector.
    scores: Vec<f32>,
}

impl Detection {
    /// Returns a new Detection. The bounding box is derived from the mask;
    /// empty masks get a zero-area box and are dropped by the matcher.
    pub fn new(mask: Mask, scores: Vec<f32>) -> Detection {
        let bbox = Rect::bounding(&mask).unwrap_or(Rect::new(0, 0, 0, 0));
        Detection {
            id: Uuid::new_v4(),
            bbox,
            mask,
            scores,
        }
    }

    /// Returns the unique id of the detection.
    pub fn id(&self) -> &Uuid {
        &self.id
    }

    /// Returns the bounding box of the detection.
    pub fn bbox(&self) -> &Rect {
        &self.bbox
    }

    /// Returns the segmentation mask of the detection.
    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    /// Returns the per-class score vector of the detection.
    pub fn scores(&self) -> &[f32] {
        &self.scores
    }
}

/// Instance segmentation collaborator.
///
/// Implementations wrap a segmentation network or a store of precomputed
/// masks. The engine calls [`Detector::detect`] exactly once per frame.
pub trait Detector {
    /// Returns the detections for the given frame, in detector order.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// A [`Detector`] backed by precomputed per-frame detections keyed by frame
/// index. Frames without an entry yield no detections.
///
/// The on-disk layout of precomputed masks is an external contract; callers
/// load them however they like and insert them here.
#[derive(Debug, Default)]
pub struct PrecomputedDetections {
    frames: HashMap<usize, Vec<Detection>>,
}

impl PrecomputedDetections {
    /// Returns a new empty store.
    pub fn new() -> PrecomputedDetections {
        PrecomputedDetections::default()
    }

    /// Inserts the detections for a frame index, replacing any previous entry.
    pub fn insert(&mut self, frame_index: usize, detections: Vec<Detection>) {
        self.frames.insert(frame_index, detections);
    }
}

impl Detector for PrecomputedDetections {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self.frames.get(&frame.index).cloned().unwrap_or_default())
    }
}
