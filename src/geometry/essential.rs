//! Essential matrix estimation from two-view correspondences.
//!
//! Implements the normalized eight-point algorithm on normalized image
//! coordinates, Sampson error scoring, and the standard four-way
//! decomposition into relative rotation and translation candidates.
//!
//! Conventions: for a correspondence (a, b) with `a` in the earlier frame
//! and `b` in the later frame, the recovered (R, t) satisfy
//!
//! ```text
//! X_b = R X_a + t        bᵀ E a = 0,  E = [t]× R
//! ```
//!
//! where X are camera-frame points and a, b are homogeneous normalized
//! image coordinates.

use nalgebra::{Matrix3, SMatrix, SVector, Vector2, Vector3};

use crate::error::TrackFailure;

/// Minimum correspondences for the eight-point algorithm.
pub const MIN_CORRESPONDENCES: usize = 8;

/// Estimates the essential matrix from ≥ 8 correspondences in normalized
/// image coordinates.
///
/// Both point sets are Hartley-normalized (zero centroid, mean distance √2)
/// before building the linear system; the conditioning transforms are folded
/// back into the result. The returned matrix has its rank-2 constraint
/// enforced with equalized leading singular values.
pub fn estimate_essential(
    points_a: &[Vector2<f64>],
    points_b: &[Vector2<f64>],
) -> Result<Matrix3<f64>, TrackFailure> {
    let n = points_a.len();
    if n < MIN_CORRESPONDENCES || points_b.len() != n {
        return Err(TrackFailure::InsufficientData);
    }

    let t_a = conditioning_transform(points_a)?;
    let t_b = conditioning_transform(points_b)?;

    // Each correspondence contributes one row of the 9-column system
    // A e = 0 with e the row-major flattening of E. Solving through the
    // 9x9 normal matrix AᵀA keeps the null-space vector available even in
    // the minimal eight-correspondence case, where the thin SVD of A
    // itself would omit it.
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (a, b) in points_a.iter().zip(points_b.iter()) {
        let na = apply_conditioning(&t_a, a);
        let nb = apply_conditioning(&t_b, b);
        let row = SVector::<f64, 9>::from_row_slice(&[
            nb.x * na.x,
            nb.x * na.y,
            nb.x,
            nb.y * na.x,
            nb.y * na.y,
            nb.y,
            na.x,
            na.y,
            1.0,
        ]);
        ata += row * row.transpose();
    }

    let svd = ata.svd(false, true);
    let v_t = svd.v_t.ok_or(TrackFailure::NumericInvalid)?;

    // Null-space direction: right singular vector of the smallest singular
    // value, i.e. the last row of Vᵀ (nalgebra sorts descending).
    let e_row = v_t.row(8);
    if e_row.iter().any(|v| !v.is_finite()) {
        return Err(TrackFailure::NumericInvalid);
    }
    let e_conditioned = Matrix3::from_row_slice(&[
        e_row[0], e_row[1], e_row[2], e_row[3], e_row[4], e_row[5], e_row[6], e_row[7], e_row[8],
    ]);

    // Undo the conditioning: bᵀ E a = (T_b b)ᵀ Ê (T_a a)  ⇒  E = T_bᵀ Ê T_a.
    let e = t_b.transpose() * e_conditioned * t_a;
    enforce_rank_two(&e)
}

/// Projects a matrix onto the essential manifold: rank 2 with equal leading
/// singular values.
fn enforce_rank_two(e: &Matrix3<f64>) -> Result<Matrix3<f64>, TrackFailure> {
    let svd = e.svd(true, true);
    let u = svd.u.ok_or(TrackFailure::NumericInvalid)?;
    let v_t = svd.v_t.ok_or(TrackFailure::NumericInvalid)?;

    let sigma = 0.5 * (svd.singular_values[0] + svd.singular_values[1]);
    if !(sigma.is_finite() && sigma > 1e-12) {
        // All singular values vanishing means no epipolar constraint was
        // recoverable (e.g. zero baseline).
        return Err(TrackFailure::GeometricDegeneracy);
    }

    let d = Matrix3::from_diagonal(&Vector3::new(sigma, sigma, 0.0));
    Ok(u * d * v_t)
}

/// Sampson (first-order geometric) error of one correspondence, in squared
/// normalized image units.
///
/// Scale-invariant in E; callers compare it against a squared threshold.
pub fn sampson_error(e: &Matrix3<f64>, a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    let xa = Vector3::new(a.x, a.y, 1.0);
    let xb = Vector3::new(b.x, b.y, 1.0);

    let e_xa = e * xa;
    let et_xb = e.transpose() * xb;
    let constraint = xb.dot(&e_xa);

    let denom = e_xa.x * e_xa.x + e_xa.y * e_xa.y + et_xb.x * et_xb.x + et_xb.y * et_xb.y;
    if denom < 1e-18 {
        return f64::INFINITY;
    }
    constraint * constraint / denom
}

/// Decomposes an essential matrix into the four (R, t) candidates.
///
/// Returns rotations with det = +1 and a unit-norm translation; the caller
/// disambiguates with a chirality check. `None` when the SVD fails or the
/// translation direction is undefined.
pub fn decompose_essential(e: &Matrix3<f64>) -> Option<[(Matrix3<f64>, Vector3<f64>); 4]> {
    let svd = e.svd(true, true);
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;

    // Proper rotations require det(U) = det(Vᵀ) = +1.
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;

    let t = u.column(2).into_owned();
    let norm = t.norm();
    if !(norm.is_finite() && norm > 1e-12) {
        return None;
    }
    let t = t / norm;

    Some([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Similarity transform mapping a point set to zero centroid and mean
/// distance √2 (Hartley conditioning).
fn conditioning_transform(points: &[Vector2<f64>]) -> Result<Matrix3<f64>, TrackFailure> {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector2<f64>>() / n;

    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if !(mean_dist.is_finite() && mean_dist > 1e-12) {
        // All points coincident: the epipolar geometry is unconstrained.
        return Err(TrackFailure::GeometricDegeneracy);
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    Ok(Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

fn apply_conditioning(t: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    Vector2::new(
        t[(0, 0)] * p.x + t[(0, 2)],
        t[(1, 1)] * p.y + t[(1, 2)],
    )
}
