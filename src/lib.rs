//! Robust pose-graph relaxation for trajectory estimation.
//!
//! Given 6-DOF poses connected by noisy relative-transform measurements,
//! including suspect loop closures, this crate computes a maximum-likelihood
//! pose assignment that is robust to incorrect loop closures: each
//! loop-closure constraint carries a continuous switch variable, estimated
//! jointly with the poses, that the optimizer can drive toward zero to
//! discard a bad measurement instead of fitting to it.
//!
//! The expected pipeline: an external loader builds a [`graph::Graph`] and
//! initial [`graph::Values`], [`solver::relax`] mutates them in place, and
//! [`evaluation::calculate_error`] scores the result against ground truth.

pub mod config;
pub mod evaluation;
pub mod factors;
pub mod geometry;
pub mod graph;
pub mod solver;

pub use config::Options;
pub use evaluation::{calculate_error, ErrorStats};
pub use geometry::SE3;
pub use graph::{AbsolutePose, Graph, GraphAndValues, RelativeConstraint, Values};
pub use solver::{relax, relax_with_solver, SolveSummary, TerminationReason};
