//! Tuning knobs for graph ingestion, robustification, and the solver.

use serde::{Deserialize, Serialize};

/// Configuration for pose-graph relaxation.
///
/// Every field has a default that works on typical indoor/outdoor trajectory
/// datasets; the covariance knobs are the ones most worth revisiting per
/// sensor setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Anchor the lowest-id pose to its initial value with a soft 6-dof prior.
    pub enable_prior_at_origin: bool,

    /// Diagonal covariance of the origin prior.
    pub origin_prior_cov: f64,

    /// Hold the lowest-id pose constant during optimization (gauge fixing).
    pub fix_first_pose: bool,

    /// Pull every pose's height toward zero with a soft 1-dof prior.
    pub enable_z_prior: bool,

    /// Covariance of the z prior.
    pub cov_z_prior: f64,

    /// Jointly estimate a trust weight per loop-closure constraint.
    pub enable_switchable_constraints: bool,

    /// Covariance of the prior pulling each switch variable back toward 1.0.
    pub switch_variable_prior_cov: f64,

    /// Clamp switch variables to [0, 1] after each accepted step.
    ///
    /// Off by default: the soft prior is normally enough to keep switches in
    /// range, and leaving them unconstrained matches the usual switchable
    /// constraints formulation.
    pub clamp_switch_variables: bool,

    /// Scale applied to the covariance of sequential (non loop closure)
    /// constraints at ingestion.
    pub rel_covariance_mult: f64,

    /// Constraints whose covariance determinant falls below this threshold
    /// are rejected (or identity-weighted, see `use_identity_covariance`).
    pub cov_det_thresh: f64,

    /// Replace near-singular covariances with identity instead of rejecting
    /// the constraint.
    pub use_identity_covariance: bool,

    /// Huber loss delta for relative-pose residuals.
    pub huber_loss_delta: f64,

    /// Maximum number of solver iterations.
    pub num_iterations: usize,

    /// Stop when the relative cost decrease falls below this.
    pub function_tolerance: f64,

    /// Stop when the gradient norm falls below this.
    pub gradient_tolerance: f64,

    /// Stop when the update step norm falls below this.
    pub parameter_tolerance: f64,

    /// Stop when the total cost falls below this (0 disables the check).
    pub absolute_error_tol: f64,

    /// Log per-iteration progress at info level instead of debug.
    pub print_minimizer_progress: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_prior_at_origin: true,
            origin_prior_cov: 1e-4,
            fix_first_pose: true,
            enable_z_prior: false,
            cov_z_prior: 1e-3,
            enable_switchable_constraints: true,
            switch_variable_prior_cov: 4e-4,
            clamp_switch_variables: false,
            rel_covariance_mult: 0.16,
            cov_det_thresh: 5e-39,
            use_identity_covariance: false,
            huber_loss_delta: 1.0,
            num_iterations: 200,
            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
            absolute_error_tol: 0.0,
            print_minimizer_progress: false,
        }
    }
}
