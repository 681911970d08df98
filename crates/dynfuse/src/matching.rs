use std::collections::BTreeMap;

use log::debug;
use ndarray::Array2;

use crate::{Detection, ObjectModel};

/// One detection-to-object match for the current frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskMatch {
    /// Id of the matched object.
    pub object_id: u64,
    /// Index of the matched detection in this frame's detection list.
    pub detection_idx: usize,
    /// Silhouette IOU of the pairing.
    pub iou: f32,
}

/// Result of the per-frame detection matching step. The unmatched sets are
/// derived here and never stored across frames.
#[derive(Debug, Default)]
pub struct MatchSet {
    /// Accepted matches, at most one per object and one per detection.
    pub matches: Vec<MaskMatch>,
    /// Indices of detections left unmatched (candidates for object creation).
    pub unmatched_detections: Vec<usize>,
    /// Ids of active objects left unmatched (staleness candidates).
    pub unmatched_objects: Vec<u64>,
}

/// Matches detections against the rendered silhouettes of the active objects.
///
/// A pairing is accepted only if it is the mutually best one for both its
/// object and its detection and its IOU reaches `min_iou`. Ties are broken by
/// higher IOU, then lower object id, then lower detection index, making the
/// assignment deterministic for identical inputs. Detections with an empty
/// mask are malformed and dropped without becoming creation candidates.
pub fn match_detections(
    objects: &BTreeMap<u64, ObjectModel>,
    detections: &[Detection],
    min_iou: f32,
) -> MatchSet {
    let usable: Vec<usize> = (0..detections.len())
        .filter(|&d| {
            let empty = detections[d].mask().is_empty();
            if empty {
                debug!("dropping malformed detection {} (empty mask)", d);
            }
            !empty
        })
        .collect();
    let ids: Vec<u64> = objects.keys().copied().collect();

    // Pairwise IOU between every previous-frame silhouette and detection mask.
    let mut iou = Array2::<f32>::zeros((ids.len(), usable.len()));
    for (row, id) in ids.iter().enumerate() {
        let silhouette = &objects[id].frame.render.silhouette;
        for (col, &d) in usable.iter().enumerate() {
            iou[[row, col]] = silhouette.iou(detections[d].mask());
        }
    }

    let mut set = MatchSet::default();
    let mut detection_taken = vec![false; usable.len()];

    for (row, id) in ids.iter().enumerate() {
        // Row-best detection for this object; strict comparison keeps the
        // lowest detection index on an IOU tie.
        let mut best_col = None;
        let mut best_iou = min_iou;
        for col in 0..usable.len() {
            if iou[[row, col]] >= best_iou && (best_col.is_none() || iou[[row, col]] > best_iou) {
                best_iou = iou[[row, col]];
                best_col = Some(col);
            }
        }
        let Some(col) = best_col else {
            set.unmatched_objects.push(*id);
            continue;
        };

        // Mutual best: the detection must not fit another object better.
        // Ascending id order means an earlier (lower-id) equal claim wins.
        let column = iou.column(col);
        let better_object = column
            .iter()
            .enumerate()
            .any(|(r, &v)| r != row && (v > best_iou || (v == best_iou && r < row)));
        if better_object || detection_taken[col] {
            set.unmatched_objects.push(*id);
            continue;
        }

        detection_taken[col] = true;
        set.matches.push(MaskMatch {
            object_id: *id,
            detection_idx: usable[col],
            iou: best_iou,
        });
    }

    set.unmatched_detections = usable
        .iter()
        .enumerate()
        .filter(|(col, _)| !detection_taken[*col])
        .map(|(_, &d)| d)
        .collect();
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{object_with_silhouette, rect_mask};
    use crate::Mask;

    const W: usize = 64;
    const H: usize = 48;

    fn roster(regions: &[(u64, (usize, usize, usize, usize))]) -> BTreeMap<u64, ObjectModel> {
        regions
            .iter()
            .map(|&(id, (x, y, w, h))| (id, object_with_silhouette(id, W, H, x, y, w, h)))
            .collect()
    }

    #[test]
    fn one_to_one_assignment() {
        // Two objects, two detections, each pair overlapping exactly.
        let objects = roster(&[(1, (0, 0, 16, 16)), (2, (32, 16, 16, 16))]);
        let detections = vec![
            Detection::new(rect_mask(W, H, 32, 16, 16, 16), vec![1.0]),
            Detection::new(rect_mask(W, H, 0, 0, 16, 16), vec![1.0]),
        ];

        let set = match_detections(&objects, &detections, 0.2);
        assert_eq!(set.matches.len(), 2);
        assert!(set
            .matches
            .iter()
            .any(|m| m.object_id == 1 && m.detection_idx == 1));
        assert!(set
            .matches
            .iter()
            .any(|m| m.object_id == 2 && m.detection_idx == 0));
        assert!(set.unmatched_detections.is_empty());
        assert!(set.unmatched_objects.is_empty());
    }

    #[test]
    fn below_threshold_stays_unmatched() {
        let objects = roster(&[(1, (0, 0, 16, 16))]);
        // Barely touching: IOU well under 0.2.
        let detections = vec![Detection::new(rect_mask(W, H, 14, 14, 16, 16), vec![1.0])];

        let set = match_detections(&objects, &detections, 0.2);
        assert!(set.matches.is_empty());
        assert_eq!(set.unmatched_detections, vec![0]);
        assert_eq!(set.unmatched_objects, vec![1]);
    }

    #[test]
    fn empty_mask_dropped_not_created() {
        let objects = roster(&[(1, (0, 0, 16, 16))]);
        let detections = vec![Detection::new(Mask::new(W, H), vec![1.0])];

        let set = match_detections(&objects, &detections, 0.2);
        assert!(set.matches.is_empty());
        // Malformed detections are neither matched nor creation candidates.
        assert!(set.unmatched_detections.is_empty());
        assert_eq!(set.unmatched_objects, vec![1]);
    }

    #[test]
    fn contested_detection_goes_to_better_fit() {
        // Both objects overlap the detection; object 2 overlaps more.
        let objects = roster(&[(1, (0, 0, 8, 16)), (2, (0, 0, 16, 16))]);
        let detections = vec![Detection::new(rect_mask(W, H, 0, 0, 16, 16), vec![1.0])];

        let set = match_detections(&objects, &detections, 0.2);
        assert_eq!(set.matches.len(), 1);
        assert_eq!(set.matches[0].object_id, 2);
        assert_eq!(set.unmatched_objects, vec![1]);
        assert!(set.unmatched_detections.is_empty());
    }

    #[test]
    fn equal_iou_tie_goes_to_lower_id() {
        // Identical silhouettes; the tie must resolve to the lower object id.
        let objects = roster(&[(3, (0, 0, 16, 16)), (7, (0, 0, 16, 16))]);
        let detections = vec![Detection::new(rect_mask(W, H, 0, 0, 16, 16), vec![1.0])];

        let set = match_detections(&objects, &detections, 0.2);
        assert_eq!(set.matches.len(), 1);
        assert_eq!(set.matches[0].object_id, 3);
        assert_eq!(set.unmatched_objects, vec![7]);
    }

    #[test]
    fn deterministic_across_runs() {
        let objects = roster(&[(1, (0, 0, 16, 16)), (2, (8, 0, 16, 16)), (3, (40, 0, 16, 16))]);
        let detections = vec![
            Detection::new(rect_mask(W, H, 4, 0, 16, 16), vec![1.0]),
            Detection::new(rect_mask(W, H, 40, 0, 16, 16), vec![1.0]),
            Detection::new(rect_mask(W, H, 0, 32, 8, 8), vec![1.0]),
        ];

        let first = match_detections(&objects, &detections, 0.2);
        for _ in 0..10 {
            let again = match_detections(&objects, &detections, 0.2);
            assert_eq!(first.matches, again.matches);
            assert_eq!(first.unmatched_detections, again.unmatched_detections);
            assert_eq!(first.unmatched_objects, again.unmatched_objects);
        }
    }
}
