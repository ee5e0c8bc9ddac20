//! Levenberg–Marquardt relaxation of a pose graph.
//!
//! Minimizes the total weighted squared residual over all relative-pose
//! constraints, switch priors, and anchor priors:
//!
//! ```text
//! F(x, s) = Σ ‖W_ij · s_ij · log(Z_ij⁻¹ X_i⁻¹ X_j)‖²
//!         + Σ ((1 − s_ij)/σ_s)²  + anchor terms
//! ```
//!
//! Loop-closure residuals without a switch variable get a Huber loss
//! instead. Odometry and switched residuals stay quadratic: downweighting
//! the switch evidence would let a bad closure stay trusted, and
//! downweighting odometry would let a single bad closure outvote the whole
//! chain.
//!
//! Each iteration linearizes every residual at the current state, solves the
//! damped normal equations `(JᵀJ + λD) δ = −Jᵀr` through a pluggable
//! [`LinearSolver`], and applies `δ` to poses via the manifold retraction
//! `x ∘ exp(δ)` and to switch variables by ordinary addition.
//!
//! Pose Jacobian blocks are computed by central finite differences through
//! the retraction; switch columns are analytic.

pub mod linear;

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix6, Vector6};
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::factors::{
    huber_weight, pose_prior_residual, relative_pose_residual, sqrt_information,
    switch_prior_residual, z_prior_residual,
};
use crate::geometry::SE3;
use crate::graph::{GraphAndValues, PoseId, Values};

pub use linear::{ConjugateGradientSolver, DenseCholeskySolver, LinearSolver};

/// Perturbation used for finite-difference pose Jacobians.
const JACOBIAN_EPS: f64 = 1e-6;

/// Levenberg-Marquardt damping schedule.
const LAMBDA_INITIAL: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const LAMBDA_MIN: f64 = 1e-10;
const LAMBDA_MAX: f64 = 1e10;

/// Reason for optimization termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Relative cost decrease below the function tolerance.
    FunctionTolerance,

    /// Gradient norm below the gradient tolerance.
    GradientTolerance,

    /// Update step norm below the parameter tolerance.
    ParameterTolerance,

    /// Total cost below the absolute error tolerance.
    AbsoluteErrorTolerance,

    /// Maximum iterations reached.
    MaxIterations,

    /// Cost became non-finite or damping ran out while diverging.
    Diverged,

    /// Linear system solve failed even at maximum damping.
    SolveFailed,

    /// Nothing to optimize.
    NoConstraints,
}

/// Result of a relaxation run.
///
/// Failure is encoded here rather than as an error: the caller always gets
/// the best state reached, plus an inspectable reason when the solve stopped
/// short of convergence.
#[derive(Debug, Clone)]
pub struct SolveSummary {
    /// Number of iterations performed.
    pub iterations: usize,

    /// Cost at the initial state.
    pub initial_cost: f64,

    /// Cost at the final (best) state.
    pub final_cost: f64,

    /// Whether a convergence criterion was met.
    pub converged: bool,

    /// Why the solver stopped.
    pub termination: TerminationReason,

    /// Constraints skipped at assembly (unknown pose ids or covariance the
    /// decomposition rejected).
    pub num_skipped: usize,
}

/// A constraint accepted into the optimization problem, with its cached
/// square-root information matrix and parameter bookkeeping.
struct ActiveConstraint {
    /// Index into the graph's constraint list, for switch write-back.
    graph_index: usize,
    reference: PoseId,
    live: PoseId,
    measurement: SE3,
    sqrt_info: Matrix6<f64>,
    is_loop_closure: bool,
    /// Column of this constraint's switch variable, when robustified.
    switch_column: Option<usize>,
}

/// Static problem structure: parameter layout and residual layout.
struct Problem {
    constraints: Vec<ActiveConstraint>,
    /// Pose ids in ascending order.
    pose_ids: Vec<PoseId>,
    /// Column offset of each pose's 6-dof tangent block; None when fixed.
    pose_columns: HashMap<PoseId, Option<usize>>,
    num_params: usize,
    num_residuals: usize,
    /// Origin anchor: (pose id, reference pose, sqrt information).
    anchor: Option<(PoseId, SE3, Matrix6<f64>)>,
    /// Poses with a height prior row.
    z_anchored: Vec<PoseId>,
    num_skipped: usize,
}

/// Optimization state: pose estimates plus one switch scalar per active
/// constraint (held at 1.0 for non-robustified constraints).
#[derive(Clone)]
struct State {
    values: Values,
    switches: Vec<f64>,
}

/// Relax the pose graph in place with the default dense Cholesky backend.
///
/// Poses in `problem.values` and switch variables in `problem.graph` are
/// updated to the best state found.
pub fn relax(problem: &mut GraphAndValues, options: &Options) -> SolveSummary {
    relax_with_solver(problem, options, &DenseCholeskySolver)
}

/// Relax the pose graph in place using the given linear solver backend.
pub fn relax_with_solver(
    problem: &mut GraphAndValues,
    options: &Options,
    linear_solver: &dyn LinearSolver,
) -> SolveSummary {
    let structure = build_problem(problem, options);

    if structure.constraints.is_empty() || structure.num_params == 0 {
        return SolveSummary {
            iterations: 0,
            initial_cost: 0.0,
            final_cost: 0.0,
            converged: true,
            termination: TerminationReason::NoConstraints,
            num_skipped: structure.num_skipped,
        };
    }

    let mut state = State {
        values: problem.values.clone(),
        switches: structure
            .constraints
            .iter()
            .map(|c| problem.graph.constraints()[c.graph_index].switch_variable)
            .collect(),
    };

    debug!(
        "relaxing pose graph: {} poses, {} constraints, {} parameters",
        structure.pose_ids.len(),
        structure.constraints.len(),
        structure.num_params
    );

    let initial_cost = compute_residuals(&structure, &state, options).norm_squared();
    let mut cost = initial_cost;
    let mut lambda = LAMBDA_INITIAL;
    let mut iterations = 0;
    let mut converged = false;
    let mut termination = TerminationReason::MaxIterations;

    if !cost.is_finite() {
        termination = TerminationReason::Diverged;
    } else {
        for iter in 0..options.num_iterations {
            iterations = iter + 1;

            let (residuals, jacobian) = linearize(&structure, &state, options);
            let gradient = jacobian.transpose() * &residuals;

            if gradient.norm() < options.gradient_tolerance {
                converged = true;
                termination = TerminationReason::GradientTolerance;
                break;
            }

            let jtj = jacobian.transpose() * &jacobian;
            let mut damped = jtj.clone();
            for i in 0..structure.num_params {
                damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
            }

            let delta = match linear_solver.solve(&damped, &(-&gradient)) {
                Some(delta) => delta,
                None => {
                    lambda *= LAMBDA_UP;
                    if lambda > LAMBDA_MAX {
                        warn!("linear solve failed at maximum damping");
                        termination = TerminationReason::SolveFailed;
                        break;
                    }
                    continue;
                }
            };

            if delta.norm() < options.parameter_tolerance {
                converged = true;
                termination = TerminationReason::ParameterTolerance;
                break;
            }

            let trial = apply_step(&structure, &state, &delta, options);
            let trial_cost = compute_residuals(&structure, &trial, options).norm_squared();

            if trial_cost.is_finite() && trial_cost < cost {
                let relative_decrease = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
                state = trial;
                cost = trial_cost;
                lambda = (lambda * LAMBDA_DOWN).max(LAMBDA_MIN);

                if options.print_minimizer_progress {
                    info!(
                        "iteration {}: cost {:.6e}, step {:.3e}, lambda {:.1e}",
                        iterations,
                        cost,
                        delta.norm(),
                        lambda
                    );
                } else {
                    debug!(
                        "iteration {}: cost {:.6e}, step {:.3e}, lambda {:.1e}",
                        iterations,
                        cost,
                        delta.norm(),
                        lambda
                    );
                }

                if relative_decrease < options.function_tolerance {
                    converged = true;
                    termination = TerminationReason::FunctionTolerance;
                    break;
                }
                if options.absolute_error_tol > 0.0 && cost < options.absolute_error_tol {
                    converged = true;
                    termination = TerminationReason::AbsoluteErrorTolerance;
                    break;
                }
            } else {
                lambda *= LAMBDA_UP;
                if !trial_cost.is_finite() || lambda > LAMBDA_MAX {
                    termination = TerminationReason::Diverged;
                    break;
                }
            }
        }
    }

    // Write the best state back into the jointly-owned graph and values
    problem.values = state.values;
    for (constraint, switch) in structure.constraints.iter().zip(&state.switches) {
        problem.graph.constraints_mut()[constraint.graph_index].switch_variable = *switch;
    }

    info!(
        "pose graph relaxation: {} iterations, cost {:.6e} -> {:.6e}, {:?}",
        iterations, initial_cost, cost, termination
    );

    SolveSummary {
        iterations,
        initial_cost,
        final_cost: cost,
        converged,
        termination,
        num_skipped: structure.num_skipped,
    }
}

/// Assemble the parameter and residual layout from the graph and values.
///
/// Constraints referencing ids missing from the values, or whose covariance
/// the decomposition rejects, are skipped with a warning and counted.
fn build_problem(problem: &GraphAndValues, options: &Options) -> Problem {
    let mut constraints = Vec::new();
    let mut num_skipped = 0;
    let mut num_switchable = 0;

    for (graph_index, constraint) in problem.graph.constraints().iter().enumerate() {
        if !problem.values.contains_key(&constraint.reference)
            || !problem.values.contains_key(&constraint.live)
        {
            warn!(
                "skipping constraint {} -> {}: unknown pose id",
                constraint.reference, constraint.live
            );
            num_skipped += 1;
            continue;
        }

        let Some(sqrt_info) = sqrt_information(&constraint.covariance) else {
            warn!(
                "skipping constraint {} -> {}: covariance not invertible to a \
                 positive-definite information matrix",
                constraint.reference, constraint.live
            );
            num_skipped += 1;
            continue;
        };

        let switchable = constraint.is_loop_closure && options.enable_switchable_constraints;
        if switchable {
            num_switchable += 1;
        }

        constraints.push(ActiveConstraint {
            graph_index,
            reference: constraint.reference,
            live: constraint.live,
            measurement: constraint.measurement.clone(),
            sqrt_info,
            is_loop_closure: constraint.is_loop_closure,
            switch_column: if switchable { Some(0) } else { None }, // assigned below
        });
    }

    // Poses referenced by at least one active constraint, ascending
    let mut pose_ids: Vec<PoseId> = constraints
        .iter()
        .flat_map(|c| [c.reference, c.live])
        .collect();
    pose_ids.sort_unstable();
    pose_ids.dedup();

    // The lowest id is the gauge anchor when fix_first_pose is set
    let fixed_id = if options.fix_first_pose {
        pose_ids.first().copied()
    } else {
        None
    };

    let mut pose_columns = HashMap::new();
    let mut column = 0;
    for &id in &pose_ids {
        if Some(id) == fixed_id {
            pose_columns.insert(id, None);
        } else {
            pose_columns.insert(id, Some(column));
            column += 6;
        }
    }

    // Switch variables follow the pose blocks
    for constraint in &mut constraints {
        if constraint.switch_column.is_some() {
            constraint.switch_column = Some(column);
            column += 1;
        }
    }
    let num_params = column;

    let anchor = if options.enable_prior_at_origin {
        pose_ids.first().map(|&id| {
            let reference = problem.values[&id].clone();
            let sqrt_info = Matrix6::identity() / options.origin_prior_cov.sqrt();
            (id, reference, sqrt_info)
        })
    } else {
        None
    };

    let z_anchored = if options.enable_z_prior {
        pose_ids.clone()
    } else {
        Vec::new()
    };

    let num_residuals = 6 * constraints.len()
        + num_switchable
        + if anchor.is_some() { 6 } else { 0 }
        + z_anchored.len();

    Problem {
        constraints,
        pose_ids,
        pose_columns,
        num_params,
        num_residuals,
        anchor,
        z_anchored,
        num_skipped,
    }
}

/// Stack every residual at the given state into one vector.
fn compute_residuals(problem: &Problem, state: &State, options: &Options) -> DVector<f64> {
    let mut residuals = DVector::zeros(problem.num_residuals);
    let sigma_switch = options.switch_variable_prior_cov.sqrt();
    let mut row = 0;

    for (constraint, &switch) in problem.constraints.iter().zip(&state.switches) {
        let x_i = &state.values[&constraint.reference];
        let x_j = &state.values[&constraint.live];

        let block = relative_pose_residual(
            x_i,
            x_j,
            &constraint.measurement,
            switch,
            &constraint.sqrt_info,
        );
        // Huber covers loop closures with no switch; odometry and switched
        // residuals stay quadratic
        let weight = if constraint.is_loop_closure && constraint.switch_column.is_none() {
            huber_weight(block.norm_squared(), options.huber_loss_delta)
        } else {
            1.0
        };
        residuals.rows_mut(row, 6).copy_from(&(weight * block));
        row += 6;

        if constraint.switch_column.is_some() {
            residuals[row] = switch_prior_residual(switch, 1.0, sigma_switch);
            row += 1;
        }
    }

    if let Some((id, reference, sqrt_info)) = &problem.anchor {
        let block = pose_prior_residual(&state.values[id], reference, sqrt_info);
        residuals.rows_mut(row, 6).copy_from(&block);
        row += 6;
    }

    let sigma_z = options.cov_z_prior.sqrt();
    for id in &problem.z_anchored {
        residuals[row] = z_prior_residual(&state.values[id], 0.0, sigma_z);
        row += 1;
    }

    residuals
}

/// Compute the stacked residual vector and its Jacobian.
///
/// Pose blocks use central differences through the retraction; switch
/// columns are analytic. Huber weights are held fixed per linearization.
fn linearize(problem: &Problem, state: &State, options: &Options) -> (DVector<f64>, DMatrix<f64>) {
    let mut residuals = DVector::zeros(problem.num_residuals);
    let mut jacobian = DMatrix::zeros(problem.num_residuals, problem.num_params);
    let sigma_switch = options.switch_variable_prior_cov.sqrt();
    let mut row = 0;

    for (constraint, &switch) in problem.constraints.iter().zip(&state.switches) {
        let x_i = &state.values[&constraint.reference];
        let x_j = &state.values[&constraint.live];

        let unit_block =
            relative_pose_residual(x_i, x_j, &constraint.measurement, 1.0, &constraint.sqrt_info);
        let block = unit_block.scale(switch);
        let weight = if constraint.is_loop_closure && constraint.switch_column.is_none() {
            huber_weight(block.norm_squared(), options.huber_loss_delta)
        } else {
            1.0
        };
        residuals.rows_mut(row, 6).copy_from(&(weight * block));

        // d r / d x_i
        if let Some(col) = problem.pose_columns[&constraint.reference] {
            for p in 0..6 {
                let mut delta = Vector6::zeros();
                delta[p] = JACOBIAN_EPS;
                let plus = relative_pose_residual(
                    &x_i.retract(&delta),
                    x_j,
                    &constraint.measurement,
                    switch,
                    &constraint.sqrt_info,
                );
                delta[p] = -JACOBIAN_EPS;
                let minus = relative_pose_residual(
                    &x_i.retract(&delta),
                    x_j,
                    &constraint.measurement,
                    switch,
                    &constraint.sqrt_info,
                );
                let column = weight * (plus - minus) / (2.0 * JACOBIAN_EPS);
                for r in 0..6 {
                    jacobian[(row + r, col + p)] = column[r];
                }
            }
        }

        // d r / d x_j
        if let Some(col) = problem.pose_columns[&constraint.live] {
            for p in 0..6 {
                let mut delta = Vector6::zeros();
                delta[p] = JACOBIAN_EPS;
                let plus = relative_pose_residual(
                    x_i,
                    &x_j.retract(&delta),
                    &constraint.measurement,
                    switch,
                    &constraint.sqrt_info,
                );
                delta[p] = -JACOBIAN_EPS;
                let minus = relative_pose_residual(
                    x_i,
                    &x_j.retract(&delta),
                    &constraint.measurement,
                    switch,
                    &constraint.sqrt_info,
                );
                let column = weight * (plus - minus) / (2.0 * JACOBIAN_EPS);
                for r in 0..6 {
                    jacobian[(row + r, col + p)] = column[r];
                }
            }
        }

        // d r / d s is linear: the residual is s times the unit block
        if let Some(col) = constraint.switch_column {
            let column = weight * unit_block;
            for r in 0..6 {
                jacobian[(row + r, col)] = column[r];
            }
        }
        row += 6;

        if let Some(col) = constraint.switch_column {
            residuals[row] = switch_prior_residual(switch, 1.0, sigma_switch);
            jacobian[(row, col)] = -1.0 / sigma_switch;
            row += 1;
        }
    }

    if let Some((id, reference, sqrt_info)) = &problem.anchor {
        let pose = &state.values[id];
        let block = pose_prior_residual(pose, reference, sqrt_info);
        residuals.rows_mut(row, 6).copy_from(&block);

        if let Some(col) = problem.pose_columns[id] {
            for p in 0..6 {
                let mut delta = Vector6::zeros();
                delta[p] = JACOBIAN_EPS;
                let plus = pose_prior_residual(&pose.retract(&delta), reference, sqrt_info);
                delta[p] = -JACOBIAN_EPS;
                let minus = pose_prior_residual(&pose.retract(&delta), reference, sqrt_info);
                let column = (plus - minus) / (2.0 * JACOBIAN_EPS);
                for r in 0..6 {
                    jacobian[(row + r, col + p)] = column[r];
                }
            }
        }
        row += 6;
    }

    let sigma_z = options.cov_z_prior.sqrt();
    for id in &problem.z_anchored {
        let pose = &state.values[id];
        residuals[row] = z_prior_residual(pose, 0.0, sigma_z);

        if let Some(col) = problem.pose_columns[id] {
            for p in 0..6 {
                let mut delta = Vector6::zeros();
                delta[p] = JACOBIAN_EPS;
                let plus = z_prior_residual(&pose.retract(&delta), 0.0, sigma_z);
                delta[p] = -JACOBIAN_EPS;
                let minus = z_prior_residual(&pose.retract(&delta), 0.0, sigma_z);
                jacobian[(row, col + p)] = (plus - minus) / (2.0 * JACOBIAN_EPS);
            }
        }
        row += 1;
    }

    (residuals, jacobian)
}

/// Apply a solved update: retraction for poses, addition for switches.
fn apply_step(problem: &Problem, state: &State, delta: &DVector<f64>, options: &Options) -> State {
    let mut next = state.clone();

    for &id in &problem.pose_ids {
        if let Some(col) = problem.pose_columns[&id] {
            let step = Vector6::from_iterator((0..6).map(|p| delta[col + p]));
            let pose = next.values.get_mut(&id).expect("pose id in values");
            *pose = pose.retract(&step);
        }
    }

    for (constraint, switch) in problem.constraints.iter().zip(&mut next.switches) {
        if let Some(col) = constraint.switch_column {
            *switch += delta[col];
            if options.clamp_switch_variables {
                *switch = switch.clamp(0.0, 1.0);
            }
        }
    }

    next
}
