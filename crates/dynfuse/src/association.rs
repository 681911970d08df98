use std::collections::BTreeMap;

use ndarray::Array2;
use rayon::prelude::*;

use crate::model::{Background, FrameData};
use crate::{Frame, FusionParams, ObjectModel};

/// Likelihood multiplier for pixels inside the mask matched to the model this
/// frame.
const MATCHED_MASK_BOOST: f32 = 10.0;
/// Likelihood multiplier for pixels inside the model's previous-frame
/// rendered silhouette.
const SILHOUETTE_CONTINUITY: f32 = 2.0;
/// Unnormalized likelihood of the background hypothesis at pixels the
/// background volume does not predict. The background hypothesis doubles as
/// the no-assignment hypothesis, so every valid pixel has at least this mass.
const NO_PREDICTION_SCORE: f32 = 0.135;

/// Weight mass below which a model is treated as effectively unmatched this
/// frame even if nominally assigned a detection.
pub(crate) const MIN_WEIGHT_MASS: f32 = 1.0;

/// Huber loss of a residual: quadratic within `delta`, linear beyond.
pub(crate) fn huber_loss(residual: f32, delta: f32) -> f32 {
    let a = residual.abs();
    if a <= delta {
        0.5 * a * a
    } else {
        delta * (a - 0.5 * delta)
    }
}

/// Computes normalized association weight maps for the background and every
/// active object.
///
/// Each model's rendered prediction (raycast at its current pose) is scored
/// per valid pixel with a robust depth-residual likelihood, a boost inside
/// its matched detection mask and a continuity term inside its previous
/// rendered silhouette. Scores are normalized softmax-style across all
/// hypotheses so the weights at a valid pixel sum to one. Scoring is
/// per-model parallel; cost is O(pixels x active models). Weight maps live
/// only until the end of the frame.
pub(crate) fn compute_weights(
    frame: &Frame,
    background: &mut Background,
    objects: &mut BTreeMap<u64, ObjectModel>,
    params: &FusionParams,
) {
    rayon::join(
        || score_hypothesis(&mut background.frame, frame, params, true),
        || {
            objects
                .par_iter_mut()
                .for_each(|(_, obj)| score_hypothesis(&mut obj.frame, frame, params, false));
        },
    );

    // Normalize across background + objects so each valid pixel carries a
    // proper distribution.
    let mut norm = background.frame.weights.clone();
    for obj in objects.values() {
        norm += &obj.frame.weights;
    }

    normalize(&mut background.frame, &norm, frame, true);
    for obj in objects.values_mut() {
        normalize(&mut obj.frame, &norm, frame, false);
    }
}

/// Fills `data.weights` with unnormalized likelihoods from the model's
/// current render.
fn score_hypothesis(data: &mut FrameData, frame: &Frame, params: &FusionParams, is_background: bool) {
    let (height, width) = frame.depth.dim();
    let mut weights = Array2::<f32>::zeros((height, width));

    for y in 0..height {
        for x in 0..width {
            if !frame.validity.contains(x, y) {
                continue;
            }
            let z = frame.depth[[y, x]];
            let predicted = data.render.depth[[y, x]];
            let in_match = data
                .matched_mask
                .as_ref()
                .map(|m| m.contains(x, y))
                .unwrap_or(false);

            let mut score = if predicted > 0.0 {
                let energy = huber_loss(z - predicted, params.huber_delta);
                (-energy / params.association_temperature).exp()
            } else if in_match {
                // Freshly created objects have no surface yet; their matched
                // mask stands in for the missing prediction.
                1.0
            } else if is_background {
                NO_PREDICTION_SCORE
            } else {
                0.0
            };

            if in_match {
                score *= MATCHED_MASK_BOOST;
            }
            if data.render.silhouette.contains(x, y) {
                score *= SILHOUETTE_CONTINUITY;
            }
            weights[[y, x]] = score;
        }
    }

    data.weights = weights;
}

/// Divides a score map by the per-pixel normalizer and records the resulting
/// weight mass. Pixels where every hypothesis underflowed fall back to the
/// background (no-assignment) hypothesis.
fn normalize(data: &mut FrameData, norm: &Array2<f32>, frame: &Frame, is_background: bool) {
    let (height, width) = norm.dim();
    let mut mass = 0.0;
    for y in 0..height {
        for x in 0..width {
            let n = norm[[y, x]];
            let w = if n > f32::MIN_POSITIVE {
                data.weights[[y, x]] / n
            } else if is_background && frame.validity.contains(x, y) {
                1.0
            } else {
                0.0
            };
            data.weights[[y, x]] = w;
            mass += w;
        }
    }
    data.weight_mass = mass;
}
