use nalgebra::{
    Isometry3, Matrix6, Point3, Translation3, UnitQuaternion, Vector3, Vector6,
};
use ndarray::{Array2, Array3};

use crate::{FusionParams, Intrinsics, Mask, ModelRender};

/// Association weight below which a pixel is not used as a correspondence.
const WEIGHT_FLOOR: f32 = 1e-3;
/// Levenberg-style damping added to the normal equations; keeps the solve
/// well-posed when the observed surface under-constrains some motions.
const DAMPING: f32 = 1e-5;
/// Update norm below which the iteration has converged.
const CONVERGENCE_EPS: f32 = 1e-6;

/// Result of one per-model pose refinement.
#[derive(Debug, Clone)]
pub(crate) struct TrackOutcome {
    /// Rigid transform aligning measured points onto the rendered surface,
    /// both expressed in the render's camera frame. Identity when skipped.
    pub delta: Isometry3<f32>,
    /// False when refinement was skipped for lack of correspondences or the
    /// solver never produced an update.
    pub converged: bool,
    /// Number of weighted correspondences used.
    pub correspondences: usize,
}

impl TrackOutcome {
    fn skipped(correspondences: usize) -> TrackOutcome {
        TrackOutcome {
            delta: Isometry3::identity(),
            converged: false,
            correspondences,
        }
    }
}

struct Correspondence {
    point: Vector3<f32>,
    target: Vector3<f32>,
    normal: Vector3<f32>,
    weight: f32,
}

/// Refines the alignment between the measured point cloud and a model's
/// rendered surface with iteratively reweighted point-to-plane least squares.
///
/// Per-correspondence weight is the association weight times a Huber reweight
/// recomputed from the residual at every iteration. If fewer than
/// `track_min_correspondences` weighted correspondences exist, refinement is
/// skipped and the caller retains the previous pose.
pub(crate) fn track_model(
    render: &ModelRender,
    points: &Array3<f32>,
    validity: &Mask,
    weights: &Array2<f32>,
    intrinsics: &Intrinsics,
    params: &FusionParams,
) -> TrackOutcome {
    let correspondences = collect_correspondences(render, points, validity, weights, intrinsics);
    if correspondences.len() < params.track_min_correspondences {
        return TrackOutcome::skipped(correspondences.len());
    }

    let mut delta = Isometry3::identity();
    let mut updated = false;
    for _ in 0..params.track_iterations {
        let mut a = Matrix6::<f32>::zeros();
        let mut b = Vector6::<f32>::zeros();

        for c in &correspondences {
            let p = delta * Point3::from(c.point);
            let residual = c.normal.dot(&(p.coords - c.target));
            let weight = c.weight * huber_reweight(residual, params.huber_delta);

            // Point-to-plane Jacobian for the twist [v, w]: translation acts
            // through the normal, rotation through p x n.
            let mut jacobian = Vector6::<f32>::zeros();
            jacobian.fixed_rows_mut::<3>(0).copy_from(&c.normal);
            jacobian
                .fixed_rows_mut::<3>(3)
                .copy_from(&p.coords.cross(&c.normal));

            a += jacobian * jacobian.transpose() * weight;
            b += jacobian * (residual * weight);
        }

        a += Matrix6::identity() * DAMPING;
        let Some(solution) = a.cholesky().map(|chol| chol.solve(&(-b))) else {
            log::trace!("tracking normal equations not positive definite, stopping");
            break;
        };

        delta = se3_exp(&solution) * delta;
        updated = true;
        if solution.norm() < CONVERGENCE_EPS {
            break;
        }
    }

    TrackOutcome {
        delta,
        converged: updated,
        correspondences: correspondences.len(),
    }
}

fn collect_correspondences(
    render: &ModelRender,
    points: &Array3<f32>,
    validity: &Mask,
    weights: &Array2<f32>,
    intrinsics: &Intrinsics,
) -> Vec<Correspondence> {
    let (height, width) = weights.dim();
    let mut out = Vec::new();
    for y in 0..height {
        for x in 0..width {
            if !validity.contains(x, y) {
                continue;
            }
            let weight = weights[[y, x]];
            let predicted = render.depth[[y, x]];
            if weight < WEIGHT_FLOOR || predicted <= 0.0 {
                continue;
            }
            let normal = Vector3::new(
                render.normals[[y, x, 0]],
                render.normals[[y, x, 1]],
                render.normals[[y, x, 2]],
            );
            if normal.norm_squared() < 0.5 {
                continue;
            }
            // Projective association: the rendered surface point at the same
            // pixel is the target.
            let target = Vector3::new(
                (x as f32 - intrinsics.cx) / intrinsics.fx * predicted,
                (y as f32 - intrinsics.cy) / intrinsics.fy * predicted,
                predicted,
            );
            let point = Vector3::new(points[[y, x, 0]], points[[y, x, 1]], points[[y, x, 2]]);
            out.push(Correspondence {
                point,
                target,
                normal,
                weight,
            });
        }
    }
    out
}

/// Huber influence weight: unity inside the kernel, `delta / |r|` outside.
fn huber_reweight(residual: f32, delta: f32) -> f32 {
    let a = residual.abs();
    if a <= delta {
        1.0
    } else {
        delta / a
    }
}

/// Exponential map of a twist `[v, w]` onto SE(3); rotation exact, translation
/// first order, which is all the small per-iteration updates need.
fn se3_exp(xi: &Vector6<f32>) -> Isometry3<f32> {
    let v = Translation3::new(xi[0], xi[1], xi[2]);
    let w = UnitQuaternion::from_scaled_axis(Vector3::new(xi[3], xi[4], xi[5]));
    Isometry3::from_parts(v, w)
}
