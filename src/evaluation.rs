//! Trajectory error statistics against a ground-truth pose sequence.
//!
//! Poses are matched by id; translation error is the Euclidean distance
//! between estimated and true positions, rotation error the geodesic angle
//! between the rotations. Path length is accumulated over consecutive
//! ground-truth poses so errors can be reported as a percentage of distance
//! traveled.

use nalgebra::Vector3;
use thiserror::Error;

use crate::geometry::so3::log_so3;
use crate::graph::{AbsolutePose, Values};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// No pose id appears in both the estimate and the ground truth, so
    /// error is incomputable (distinct from zero error).
    #[error("no pose ids shared between estimate and ground truth")]
    NoOverlap,
}

/// Running error sums over all matched poses.
///
/// Averages and percentages are derived on demand, not stored.
#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    translation: Vector3<f64>,
    rotation: Vector3<f64>,
    max_translation_error: f64,
    max_rotation_error: f64,
    num_poses: usize,
    distance_traveled: f64,
    percent_translation_error: f64,
}

impl ErrorStats {
    /// Component-wise accumulated absolute translation error.
    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// Component-wise accumulated absolute rotation error (axis-angle).
    pub fn rotation(&self) -> &Vector3<f64> {
        &self.rotation
    }

    pub fn max_translation_error(&self) -> f64 {
        self.max_translation_error
    }

    pub fn max_rotation_error(&self) -> f64 {
        self.max_rotation_error
    }

    pub fn num_poses(&self) -> usize {
        self.num_poses
    }

    /// Total ground-truth path length over the evaluated sequence.
    pub fn distance_traveled(&self) -> f64 {
        self.distance_traveled
    }

    /// Average translation error, or -1 when no poses were matched.
    pub fn average_translation_error(&self) -> f64 {
        if self.num_poses > 0 {
            self.translation.norm() / self.num_poses as f64
        } else {
            -1.0
        }
    }

    /// Average rotation error, or -1 when no poses were matched.
    pub fn average_rotation_error(&self) -> f64 {
        if self.num_poses > 0 {
            self.rotation.norm() / self.num_poses as f64
        } else {
            -1.0
        }
    }

    /// Average translation error as a percentage of distance traveled, or -1
    /// when no poses were matched.
    pub fn percent_average_translation_error(&self) -> f64 {
        if self.num_poses > 0 {
            self.percent_translation_error / self.num_poses as f64
        } else {
            -1.0
        }
    }
}

/// Compare optimized values against a ground-truth sequence.
///
/// Ground-truth entries are walked in the given order; path length
/// accumulates over consecutive entries whether or not they are matched, so
/// percent errors are relative to the true trajectory length.
pub fn calculate_error(
    values: &Values,
    ground_truth: &[AbsolutePose],
) -> Result<ErrorStats, EvalError> {
    let mut stats = ErrorStats::default();
    let mut previous_position: Option<Vector3<f64>> = None;

    for truth in ground_truth {
        if let Some(previous) = previous_position {
            stats.distance_traveled += (truth.pose.translation - previous).norm();
        }
        previous_position = Some(truth.pose.translation);

        let Some(estimate) = values.get(&truth.id) else {
            continue;
        };

        let translation_error = estimate.translation - truth.pose.translation;
        stats.translation += translation_error.abs();
        stats.max_translation_error = stats.max_translation_error.max(translation_error.norm());

        let rotation_error = log_so3(&(truth.pose.rotation.inverse() * estimate.rotation));
        stats.rotation += rotation_error.abs();
        stats.max_rotation_error = stats.max_rotation_error.max(rotation_error.norm());

        if stats.distance_traveled > 0.0 {
            stats.percent_translation_error +=
                100.0 * translation_error.norm() / stats.distance_traveled;
        }

        stats.num_poses += 1;
    }

    if stats.num_poses == 0 {
        return Err(EvalError::NoOverlap);
    }

    Ok(stats)
}
