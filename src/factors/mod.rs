//! Residual functions for pose-graph relaxation.
//!
//! Three families, all pure functions over the current state:
//!
//! - **Relative pose**: `r = s · log(Z⁻¹ ∘ X_i⁻¹ ∘ X_j)`, weighted by the
//!   matrix square root of the constraint's information matrix. `s` is the
//!   switch variable for loop closures, implicitly 1 for odometry. Shrinking
//!   `s` toward 0 lets the optimizer discard a bad loop closure instead of
//!   fitting to it.
//! - **Switch prior**: `r = (1 − s)/σ`, pulling every switch variable back
//!   toward full trust unless outweighed by relative-pose evidence.
//! - **Pose priors**: a 6-dof anchor removing the global gauge freedom, and a
//!   1-dof height anchor for near-planar datasets.
//!
//! A Huber loss bounds the influence of a loop-closure residual that carries
//! no switch variable; it is applied as an IRLS row reweighting. Odometry and
//! switched residuals stay quadratic.

use nalgebra::{Matrix6, Vector6};

use crate::geometry::SE3;

/// Upper-triangular square root `Lᵀ` of the information matrix, such that
/// `‖Lᵀ r‖² = rᵀ Σ⁻¹ r`.
///
/// Returns `None` when the covariance cannot be inverted or its inverse is
/// not positive-definite.
pub fn sqrt_information(covariance: &Matrix6<f64>) -> Option<Matrix6<f64>> {
    let information = covariance.try_inverse()?;
    let cholesky = information.cholesky()?;
    Some(cholesky.l().transpose())
}

/// Relative-pose residual between poses `x_i` (reference) and `x_j` (live).
///
/// `r = sqrt_info · s · log(Z⁻¹ ∘ X_i⁻¹ ∘ X_j)`
pub fn relative_pose_residual(
    x_i: &SE3,
    x_j: &SE3,
    measurement: &SE3,
    switch: f64,
    sqrt_info: &Matrix6<f64>,
) -> Vector6<f64> {
    let predicted = x_i.between(x_j);
    let error = measurement.inverse().compose(&predicted).log();
    sqrt_info * (switch * error)
}

/// Prior pulling a switch variable back toward full trust.
#[inline]
pub fn switch_prior_residual(switch: f64, prior: f64, sigma: f64) -> f64 {
    (prior - switch) / sigma
}

/// 6-dof prior anchoring a pose to a fixed reference.
pub fn pose_prior_residual(pose: &SE3, prior: &SE3, sqrt_info: &Matrix6<f64>) -> Vector6<f64> {
    sqrt_info * prior.between(pose).log()
}

/// 1-dof prior anchoring a pose's height.
#[inline]
pub fn z_prior_residual(pose: &SE3, z_reference: f64, sigma: f64) -> f64 {
    (pose.translation.z - z_reference) / sigma
}

/// IRLS row weight for the Huber loss, given the squared norm of a weighted
/// residual block.
///
/// Quadratic region (‖r‖ ≤ δ) leaves the residual untouched; beyond it the
/// block is scaled by `sqrt(δ/‖r‖)` so its squared norm grows linearly.
pub fn huber_weight(squared_norm: f64, delta: f64) -> f64 {
    let norm = squared_norm.sqrt();
    if norm <= delta {
        1.0
    } else {
        (delta / norm).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn translation(x: f64, y: f64, z: f64) -> SE3 {
        SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(x, y, z))
    }

    #[test]
    fn test_sqrt_information_recovers_quadratic_form() {
        let covariance = Matrix6::from_diagonal(&Vector6::new(0.1, 0.2, 0.3, 0.4, 0.5, 0.6));
        let sqrt_info = sqrt_information(&covariance).unwrap();

        let r = Vector6::new(1.0, -1.0, 2.0, 0.5, -0.5, 1.5);
        let weighted = sqrt_info * r;

        let info = covariance.try_inverse().unwrap();
        let expected = (r.transpose() * info * r)[(0, 0)];

        assert_relative_eq!(weighted.norm_squared(), expected, epsilon = 1e-10);
    }

    #[test]
    fn test_sqrt_information_rejects_singular() {
        assert!(sqrt_information(&Matrix6::zeros()).is_none());
    }

    #[test]
    fn test_relative_pose_residual_zero_for_consistent_poses() {
        let x_i = translation(0.0, 0.0, 0.0);
        let x_j = translation(1.0, 0.0, 0.0);
        let measurement = translation(1.0, 0.0, 0.0);

        let r = relative_pose_residual(&x_i, &x_j, &measurement, 1.0, &Matrix6::identity());

        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_relative_pose_residual_scales_with_switch() {
        let x_i = translation(0.0, 0.0, 0.0);
        let x_j = translation(2.0, 0.0, 0.0);
        let measurement = translation(1.0, 0.0, 0.0);

        let full = relative_pose_residual(&x_i, &x_j, &measurement, 1.0, &Matrix6::identity());
        let half = relative_pose_residual(&x_i, &x_j, &measurement, 0.5, &Matrix6::identity());

        assert_relative_eq!(half.norm(), 0.5 * full.norm(), epsilon = 1e-12);
        assert_relative_eq!(full[3], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_switch_prior_residual() {
        assert_relative_eq!(switch_prior_residual(1.0, 1.0, 0.02), 0.0);
        assert_relative_eq!(switch_prior_residual(0.5, 1.0, 0.02), 25.0);
    }

    #[test]
    fn test_pose_prior_residual_zero_at_prior() {
        let pose = translation(1.0, 2.0, 3.0);
        let r = pose_prior_residual(&pose, &pose, &Matrix6::identity());

        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_z_prior_residual() {
        let pose = translation(0.0, 0.0, 0.4);
        assert_relative_eq!(z_prior_residual(&pose, 0.0, 0.1), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_huber_weight_regions() {
        // Inside the quadratic region the weight is 1
        assert_relative_eq!(huber_weight(0.25, 1.0), 1.0);

        // Outside, the reweighted squared norm grows linearly: (w·‖r‖)² = δ‖r‖
        let squared_norm = 16.0;
        let w = huber_weight(squared_norm, 1.0);
        assert_relative_eq!(w * w * squared_norm, 4.0, epsilon = 1e-12);
    }
}
