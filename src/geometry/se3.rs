//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Poses are stored as a unit quaternion plus a translation vector. For
//! optimization the pose is treated as a point on the SE(3) manifold: the
//! 6-vector tangent is laid out `[ω (rotation), v (translation)]` and local
//! updates are applied via the retraction `x ⊕ δ = x ∘ exp(δ)`, which keeps
//! the rotation on the unit-quaternion manifold regardless of step size.

use nalgebra::{Matrix4, UnitQuaternion, Vector3, Vector6};

use super::so3::{exp_so3, left_jacobian_so3, left_jacobian_so3_inv, log_so3};

/// 6-DOF rigid transformation: rotation + translation.
///
/// Transforms points as: p' = R * p + t
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation (no rotation, no translation).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from rotation and translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Convert to homogeneous 4x4 matrix of form [R | t; 0 0 0 1].
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = self.rotation.to_homogeneous();
        mat[(0, 3)] = self.translation.x;
        mat[(1, 3)] = self.translation.y;
        mat[(2, 3)] = self.translation.z;
        mat
    }

    /// Inverse transformation.
    ///
    /// For T = [R | t]: T⁻¹ = [R^T | -R^T*t]
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let t_inv = -(rot_inv * self.translation);
        Self {
            rotation: rot_inv,
            translation: t_inv,
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Relative transform taking `self` to `other`: self⁻¹ ∘ other.
    pub fn between(&self, other: &SE3) -> Self {
        self.inverse().compose(other)
    }

    /// Transform a single point: p' = R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Log map: convert to the 6-vector tangent [ω (3), v (3)].
    ///
    /// Uses the exact SE(3) logarithm: the translational part is decoupled
    /// from the raw translation through the inverse left Jacobian of SO(3).
    pub fn log(&self) -> Vector6<f64> {
        let omega = log_so3(&self.rotation);
        let v = left_jacobian_so3_inv(&omega) * self.translation;

        let mut tangent = Vector6::zeros();
        tangent.fixed_rows_mut::<3>(0).copy_from(&omega);
        tangent.fixed_rows_mut::<3>(3).copy_from(&v);
        tangent
    }

    /// Exponential map: construct from a 6-vector tangent [ω (3), v (3)].
    pub fn exp(tangent: &Vector6<f64>) -> Self {
        let omega = tangent.fixed_rows::<3>(0).into_owned();
        let v = tangent.fixed_rows::<3>(3).into_owned();

        Self {
            rotation: exp_so3(&omega),
            translation: left_jacobian_so3(&omega) * v,
        }
    }

    /// Apply a small update in the tangent space: self ∘ exp(δ).
    ///
    /// This is used during optimization to update the current estimate;
    /// `retract(0)` returns the pose unchanged.
    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        self.compose(&Self::exp(delta))
    }

    /// Geodesic rotation angle between the rotations of two poses, in radians.
    pub fn rotation_angle_to(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity() {
        let se3 = SE3::identity();
        let p = Vector3::new(1.0, 2.0, 3.0);

        assert_relative_eq!(se3.transform_point(&p), p, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse() {
        let se3 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                std::f64::consts::FRAC_PI_2,
            ),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };

        let composed = se3.compose(&se3.inverse());

        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(composed.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_compose() {
        let a = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                std::f64::consts::FRAC_PI_2,
            ),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let b = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };

        // Rotating 90° about z then translating (1,0,0) in the rotated frame
        let composed = a.compose(&b);
        assert_relative_eq!(
            composed.translation,
            Vector3::new(1.0, 1.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_between() {
        let a = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let b = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(2.0, 0.0, 0.0),
        };

        let relative = a.between(&b);
        assert_relative_eq!(
            relative.translation,
            Vector3::new(1.0, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let tangent = Vector6::new(0.1, -0.2, 0.3, 0.5, -1.0, 2.0);

        let se3 = SE3::exp(&tangent);
        let tangent_back = se3.log();

        assert_relative_eq!(tangent, tangent_back, epsilon = 1e-10);
    }

    #[test]
    fn test_exp_log_roundtrip_pose() {
        let se3 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(1.0, 1.0, 0.0)),
                0.7,
            ),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };

        let reconstructed = SE3::exp(&se3.log());

        assert_relative_eq!(
            reconstructed.translation,
            se3.translation,
            epsilon = 1e-10
        );
        assert_relative_eq!(
            reconstructed.rotation.coords,
            se3.rotation.coords,
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_retract_zero_is_identity() {
        let se3 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 1.0, 0.0)),
                0.3,
            ),
            translation: Vector3::new(-1.0, 0.5, 2.0),
        };

        let retracted = se3.retract(&Vector6::zeros());

        assert_relative_eq!(retracted.translation, se3.translation, epsilon = 1e-12);
        assert_relative_eq!(
            retracted.rotation.coords,
            se3.rotation.coords,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_rotation_angle() {
        let a = SE3::identity();
        let b = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                0.25,
            ),
            translation: Vector3::zeros(),
        };

        assert_relative_eq!(a.rotation_angle_to(&b), 0.25, epsilon = 1e-12);
    }
}
