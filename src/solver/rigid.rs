//! Best-fit rigid transform from a weighted covariance block.
//!
//! The transform solvers accumulate, per (frame, bone), the 4x4 weighted
//! cross-correlation `Q = sum_i w_i * [p_i; 1] * [q_i; 1]^T` between
//! animated positions `p` and rest positions `q`. [`fit_rigid`] turns
//! such a block into the closest proper rotation and translation
//! (Kabsch, via SVD).

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};

/// Fit a rigid transform to a weighted covariance block.
///
/// `Q[(3, 3)]` is the total weight. Returns `None` when it is zero: with
/// no contributing correspondences there is nothing to fit, and callers
/// leave the previous transform in place (silent no-op, not an error).
pub fn fit_rigid(q: &Matrix4<f64>) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let total = q[(3, 3)];
    if total == 0.0 {
        return None;
    }
    let q = q / total;

    // Cross-covariance minus the outer product of the two centroids.
    // Row 3 of the normalized block is the rest centroid (transposed),
    // column 3 the animated centroid.
    let cross: Matrix3<f64> = q.fixed_view::<3, 3>(0, 0)
        - q.fixed_view::<3, 1>(0, 3) * q.fixed_view::<1, 3>(3, 0);

    let svd = cross.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    // Fix a possible reflection by flipping the smallest singular
    // direction.
    let mut d = Matrix3::identity();
    d[(2, 2)] = (u * v_t).determinant();
    let rotation = u * d * v_t;

    let rest_centroid: Vector3<f64> = q.fixed_view::<1, 3>(3, 0).transpose();
    let animated_centroid: Vector3<f64> = q.fixed_view::<3, 1>(0, 3).into_owned();
    let translation = animated_centroid - rotation * rest_centroid;

    Some((rotation, translation))
}

/// Accumulate one weighted correspondence into a covariance block:
/// `q += w * [animated; 1] * [rest; 1]^T`.
#[inline]
pub fn accumulate(q: &mut Matrix4<f64>, w: f64, animated: &Vector3<f64>, rest: &Vector3<f64>) {
    let p = Vector4::new(animated.x, animated.y, animated.z, 1.0);
    let u = Vector4::new(rest.x, rest.y, rest.z, 1.0);
    *q += w * p * u.transpose();
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;

    fn cloud() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 2.0, 0.0),
            Vector3::new(0.0, 0.0, 3.0),
            Vector3::new(1.0, 1.0, 1.0),
        ]
    }

    fn covariance_for(
        rot: &Matrix3<f64>,
        trans: &Vector3<f64>,
        points: &[Vector3<f64>],
    ) -> Matrix4<f64> {
        let mut q = Matrix4::zeros();
        for p in points {
            let moved = rot * p + trans;
            accumulate(&mut q, 1.0, &moved, p);
        }
        q
    }

    #[test]
    fn test_recovers_known_rotation_translation() {
        let rot = Rotation3::from_euler_angles(0.3, -0.7, 1.1).into_inner();
        let trans = Vector3::new(0.5, -2.0, 3.0);
        let q = covariance_for(&rot, &trans, &cloud());

        let (r, t) = fit_rigid(&q).unwrap();
        assert!((r - rot).norm() < 1e-10);
        assert!((t - trans).norm() < 1e-10);
    }

    #[test]
    fn test_identity_fit() {
        let q = covariance_for(&Matrix3::identity(), &Vector3::zeros(), &cloud());
        let (r, t) = fit_rigid(&q).unwrap();
        assert!((r - Matrix3::identity()).norm() < 1e-10);
        assert!(t.norm() < 1e-10);
    }

    #[test]
    fn test_zero_weight_is_no_op() {
        assert!(fit_rigid(&Matrix4::zeros()).is_none());
    }

    #[test]
    fn test_result_is_proper_rotation() {
        // A scaled, noisy correspondence still yields det(R) = +1.
        let rot = Rotation3::from_euler_angles(0.1, 0.2, 0.3).into_inner();
        let trans = Vector3::new(1.0, 0.0, 0.0);
        let mut q = Matrix4::zeros();
        for (n, p) in cloud().iter().enumerate() {
            let moved = rot * (2.0 * p) + trans;
            accumulate(&mut q, 1.0 + n as f64 * 0.1, &moved, p);
        }

        let (r, _) = fit_rigid(&q).unwrap();
        assert!((r.determinant() - 1.0).abs() < 1e-10);
        assert!((r.transpose() * r - Matrix3::identity()).norm() < 1e-10);
    }

    #[test]
    fn test_weighted_fit_prefers_heavy_points() {
        // All weight on a rigidly moved subset still recovers that motion.
        let rot = Rotation3::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2).into_inner();
        let trans = Vector3::new(0.0, 1.0, 0.0);
        let points = cloud();
        let mut q = Matrix4::zeros();
        for p in &points {
            accumulate(&mut q, 1.0, &(rot * p + trans), p);
        }
        // Zero-weight garbage must not affect the fit.
        accumulate(&mut q, 0.0, &Vector3::new(100.0, -50.0, 7.0), &points[0]);

        let (r, t) = fit_rigid(&q).unwrap();
        assert!((r - rot).norm() < 1e-10);
        assert!((t - trans).norm() < 1e-10);
    }
}
