//! Pose graph data model: relative/absolute constraints, the graph itself,
//! and the id → pose estimate map mutated during relaxation.
//!
//! Ingestion is tolerant: constraints with near-singular covariance or
//! duplicate loop closures are rejected (and counted) rather than aborting,
//! so one bad measurement never poisons a whole dataset.

use std::collections::{BTreeSet, HashMap, HashSet};

use nalgebra::Matrix6;
use thiserror::Error;
use tracing::warn;

use crate::config::Options;
use crate::geometry::SE3;

/// Identifier of a pose in the graph. Positive integers from the loader.
pub type PoseId = u64;

/// Current pose estimate per id. No implied ordering.
pub type Values = HashMap<PoseId, SE3>;

/// A relative 6-DOF measurement between two poses.
///
/// Only loop-closure constraints participate in switchable-constraint
/// robustification; their `switch_variable` starts at full trust (1.0) and is
/// free to move toward 0 (rejected) during optimization.
#[derive(Debug, Clone)]
pub struct RelativeConstraint {
    /// Id of the reference pose (the measurement's source frame).
    pub reference: PoseId,

    /// Id of the live pose (the measurement's target frame).
    pub live: PoseId,

    /// Measured relative transform from reference to live.
    pub measurement: SE3,

    /// 6x6 measurement covariance; inverted to an information matrix when
    /// the residual is weighted.
    pub covariance: Matrix6<f64>,

    /// Whether this constraint closes a loop (non-sequential poses).
    pub is_loop_closure: bool,

    /// Continuous trust weight, meaningful only for loop closures.
    pub switch_variable: f64,
}

impl RelativeConstraint {
    /// Sequential (odometry) constraint between consecutive poses.
    pub fn odometry(
        reference: PoseId,
        live: PoseId,
        measurement: SE3,
        covariance: Matrix6<f64>,
    ) -> Self {
        Self {
            reference,
            live,
            measurement,
            covariance,
            is_loop_closure: false,
            switch_variable: 1.0,
        }
    }

    /// Loop-closure constraint, initially fully trusted.
    pub fn loop_closure(
        reference: PoseId,
        live: PoseId,
        measurement: SE3,
        covariance: Matrix6<f64>,
    ) -> Self {
        Self {
            reference,
            live,
            measurement,
            covariance,
            is_loop_closure: true,
            switch_variable: 1.0,
        }
    }
}

/// An absolute pose with covariance, used both as an optimization prior and
/// as ground truth for error evaluation.
#[derive(Debug, Clone)]
pub struct AbsolutePose {
    pub id: PoseId,
    pub pose: SE3,
    pub covariance: Matrix6<f64>,
}

impl AbsolutePose {
    pub fn new(id: PoseId, pose: SE3, covariance: Matrix6<f64>) -> Self {
        Self {
            id,
            pose,
            covariance,
        }
    }
}

/// Why a constraint was rejected at ingestion.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("covariance determinant {det:.3e} below threshold {threshold:.3e}")]
    SingularCovariance { det: f64, threshold: f64 },

    #[error("duplicate loop closure between poses {reference} and {live}")]
    DuplicateLoopClosure { reference: PoseId, live: PoseId },
}

/// Ordered collection of relative constraints plus the pose ids they
/// reference.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    constraints: Vec<RelativeConstraint>,
    pose_ids: BTreeSet<PoseId>,
    closure_keys: HashSet<(PoseId, PoseId)>,
    num_rejected: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constraint, applying the ingestion policy from `options`:
    ///
    /// - sequential covariances are scaled by `rel_covariance_mult`;
    /// - near-singular covariances are rejected, or replaced by identity when
    ///   `use_identity_covariance` is set;
    /// - loop closures are deduplicated by their (reference, live) pair.
    pub fn try_add(
        &mut self,
        mut constraint: RelativeConstraint,
        options: &Options,
    ) -> Result<(), RejectReason> {
        if constraint.is_loop_closure {
            let key = (constraint.reference, constraint.live);
            if self.closure_keys.contains(&key) {
                self.num_rejected += 1;
                let reason = RejectReason::DuplicateLoopClosure {
                    reference: constraint.reference,
                    live: constraint.live,
                };
                warn!("rejecting constraint: {}", reason);
                return Err(reason);
            }
        } else {
            constraint.covariance *= options.rel_covariance_mult;
        }

        let det = constraint.covariance.determinant();
        if det.abs() < options.cov_det_thresh || !det.is_finite() {
            if options.use_identity_covariance {
                constraint.covariance = Matrix6::identity();
            } else {
                self.num_rejected += 1;
                let reason = RejectReason::SingularCovariance {
                    det,
                    threshold: options.cov_det_thresh,
                };
                warn!(
                    "rejecting constraint {} -> {}: {}",
                    constraint.reference, constraint.live, reason
                );
                return Err(reason);
            }
        }

        if constraint.is_loop_closure {
            self.closure_keys
                .insert((constraint.reference, constraint.live));
        }
        self.pose_ids.insert(constraint.reference);
        self.pose_ids.insert(constraint.live);
        self.constraints.push(constraint);
        Ok(())
    }

    /// Constraints in insertion order.
    pub fn constraints(&self) -> &[RelativeConstraint] {
        &self.constraints
    }

    pub fn constraints_mut(&mut self) -> &mut [RelativeConstraint] {
        &mut self.constraints
    }

    /// All pose ids referenced by accepted constraints, ascending.
    pub fn pose_ids(&self) -> impl Iterator<Item = PoseId> + '_ {
        self.pose_ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn num_loop_closures(&self) -> usize {
        self.constraints
            .iter()
            .filter(|c| c.is_loop_closure)
            .count()
    }

    /// How many constraints were rejected at ingestion.
    pub fn num_rejected(&self) -> usize {
        self.num_rejected
    }
}

/// A graph paired with its current pose estimates, jointly owned and mutated
/// together by the solver.
#[derive(Debug, Clone)]
pub struct GraphAndValues {
    pub graph: Graph,
    pub values: Values,
}

impl GraphAndValues {
    pub fn new(graph: Graph, values: Values) -> Self {
        Self { graph, values }
    }

    /// Build the initial guess by integrating the sequential constraints
    /// from `origin`, starting at the graph's lowest pose id.
    pub fn from_odometry(graph: Graph, origin: SE3) -> Self {
        let values = integrate_odometry(&graph, origin);
        Self { graph, values }
    }
}

/// Chain the sequential (non loop closure) constraints into absolute pose
/// estimates, starting at the lowest referenced pose id.
pub fn integrate_odometry(graph: &Graph, origin: SE3) -> Values {
    let mut values = Values::new();

    let Some(first_id) = graph.pose_ids().next() else {
        return values;
    };
    values.insert(first_id, origin);

    for constraint in graph.constraints() {
        if constraint.is_loop_closure {
            continue;
        }
        if let Some(reference_pose) = values.get(&constraint.reference) {
            let live_pose = reference_pose.compose(&constraint.measurement);
            values.insert(constraint.live, live_pose);
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn small_cov() -> Matrix6<f64> {
        Matrix6::identity() * 1e-4
    }

    fn translation(x: f64, y: f64, z: f64) -> SE3 {
        SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(x, y, z))
    }

    #[test]
    fn test_add_odometry_scales_covariance() {
        let options = Options {
            rel_covariance_mult: 0.5,
            ..Options::default()
        };
        let mut graph = Graph::new();

        graph
            .try_add(
                RelativeConstraint::odometry(0, 1, translation(1.0, 0.0, 0.0), small_cov()),
                &options,
            )
            .unwrap();

        assert_relative_eq!(
            graph.constraints()[0].covariance[(0, 0)],
            0.5e-4,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_singular_covariance_rejected_and_counted() {
        let options = Options::default();
        let mut graph = Graph::new();

        let result = graph.try_add(
            RelativeConstraint::loop_closure(
                0,
                5,
                translation(0.0, 0.0, 0.0),
                Matrix6::zeros(),
            ),
            &options,
        );

        assert!(matches!(
            result,
            Err(RejectReason::SingularCovariance { .. })
        ));
        assert_eq!(graph.num_rejected(), 1);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_singular_covariance_identity_fallback() {
        let options = Options {
            use_identity_covariance: true,
            ..Options::default()
        };
        let mut graph = Graph::new();

        graph
            .try_add(
                RelativeConstraint::loop_closure(
                    0,
                    5,
                    translation(0.0, 0.0, 0.0),
                    Matrix6::zeros(),
                ),
                &options,
            )
            .unwrap();

        assert_eq!(graph.num_rejected(), 0);
        assert_eq!(graph.constraints()[0].covariance, Matrix6::identity());
    }

    #[test]
    fn test_duplicate_loop_closure_rejected() {
        let options = Options::default();
        let mut graph = Graph::new();

        graph
            .try_add(
                RelativeConstraint::loop_closure(0, 5, translation(1.0, 0.0, 0.0), small_cov()),
                &options,
            )
            .unwrap();
        let result = graph.try_add(
            RelativeConstraint::loop_closure(0, 5, translation(1.1, 0.0, 0.0), small_cov()),
            &options,
        );

        assert!(matches!(
            result,
            Err(RejectReason::DuplicateLoopClosure { .. })
        ));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.num_rejected(), 1);
    }

    #[test]
    fn test_integrate_odometry_chain() {
        let options = Options {
            rel_covariance_mult: 1.0,
            ..Options::default()
        };
        let mut graph = Graph::new();
        for i in 0..3 {
            graph
                .try_add(
                    RelativeConstraint::odometry(
                        i,
                        i + 1,
                        translation(1.0, 0.0, 0.0),
                        small_cov(),
                    ),
                    &options,
                )
                .unwrap();
        }

        let values = integrate_odometry(&graph, SE3::identity());

        assert_eq!(values.len(), 4);
        assert_relative_eq!(
            values[&3].translation,
            Vector3::new(3.0, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_loop_closures_skipped_in_integration() {
        let options = Options::default();
        let mut graph = Graph::new();
        graph
            .try_add(
                RelativeConstraint::odometry(0, 1, translation(1.0, 0.0, 0.0), small_cov()),
                &options,
            )
            .unwrap();
        graph
            .try_add(
                RelativeConstraint::loop_closure(1, 0, translation(9.0, 0.0, 0.0), small_cov()),
                &options,
            )
            .unwrap();

        let values = integrate_odometry(&graph, SE3::identity());

        assert_relative_eq!(
            values[&0].translation,
            Vector3::zeros(),
            epsilon = 1e-12
        );
    }
}
