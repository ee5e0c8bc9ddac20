//! Pluggable linear solvers for the damped normal equations `H δ = g`.
//!
//! The dense Cholesky backend is the default and the right choice for small
//! to medium graphs. The conjugate-gradient backend avoids the O(n³)
//! factorization and is the one to reach for on large graphs, where H is
//! sparse in structure even though it is stored densely here.

use nalgebra::{DMatrix, DVector};

/// Solves the symmetric positive-definite system `H x = b`.
///
/// Returns `None` when the system is singular or indefinite; the caller
/// treats that as a recoverable solve failure.
pub trait LinearSolver {
    fn solve(&self, h: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>>;
}

/// Dense Cholesky factorization. Fails visibly on non-positive-definite
/// input, which is exactly what we want for a damped Gauss-Newton Hessian.
#[derive(Debug, Clone, Default)]
pub struct DenseCholeskySolver;

impl LinearSolver for DenseCholeskySolver {
    fn solve(&self, h: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
        let cholesky = h.clone().cholesky()?;
        Some(cholesky.solve(b))
    }
}

/// Jacobi-preconditioned conjugate gradient.
#[derive(Debug, Clone)]
pub struct ConjugateGradientSolver {
    /// Iteration cap; 0 means the system dimension.
    pub max_iterations: usize,

    /// Relative residual tolerance.
    pub tolerance: f64,
}

impl Default for ConjugateGradientSolver {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            tolerance: 1e-10,
        }
    }
}

impl LinearSolver for ConjugateGradientSolver {
    fn solve(&self, h: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
        let n = b.len();
        if h.nrows() != n || h.ncols() != n {
            return None;
        }

        // Jacobi preconditioner M⁻¹ = 1/diag(H)
        let mut precond = DVector::zeros(n);
        for i in 0..n {
            let d = h[(i, i)];
            if d <= 0.0 || !d.is_finite() {
                return None;
            }
            precond[i] = 1.0 / d;
        }

        let max_iterations = if self.max_iterations == 0 {
            // CG converges in at most n steps in exact arithmetic; allow some
            // slack for floating-point drift
            2 * n
        } else {
            self.max_iterations
        };

        let b_norm = b.norm();
        if b_norm == 0.0 {
            return Some(DVector::zeros(n));
        }

        let mut x = DVector::zeros(n);
        let mut r = b.clone();
        let mut z = precond.component_mul(&r);
        let mut p = z.clone();
        let mut rz = r.dot(&z);

        for _ in 0..max_iterations {
            if r.norm() <= self.tolerance * b_norm {
                break;
            }

            let hp = h * &p;
            let php = p.dot(&hp);
            if php <= 0.0 || !php.is_finite() {
                // Indefinite or broken system
                return None;
            }

            let alpha = rz / php;
            x += alpha * &p;
            r -= alpha * &hp;

            z = precond.component_mul(&r);
            let rz_next = r.dot(&z);
            let beta = rz_next / rz;
            rz = rz_next;

            p = &z + beta * &p;
        }

        if x.iter().all(|v| v.is_finite()) {
            Some(x)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spd_system() -> (DMatrix<f64>, DVector<f64>) {
        // H = AᵀA + I is SPD for any A
        let a = DMatrix::from_row_slice(
            4,
            4,
            &[
                2.0, 1.0, 0.0, 0.5, //
                1.0, 3.0, 0.2, 0.0, //
                0.0, 0.2, 1.5, 0.3, //
                0.5, 0.0, 0.3, 2.5,
            ],
        );
        let h = &a.transpose() * &a + DMatrix::identity(4, 4);
        let b = DVector::from_row_slice(&[1.0, -2.0, 0.5, 3.0]);
        (h, b)
    }

    #[test]
    fn test_dense_cholesky_solves_spd() {
        let (h, b) = spd_system();
        let x = DenseCholeskySolver.solve(&h, &b).unwrap();

        assert_relative_eq!(&h * &x, b, epsilon = 1e-10);
    }

    #[test]
    fn test_dense_cholesky_rejects_indefinite() {
        let h = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        let b = DVector::from_row_slice(&[1.0, 1.0]);

        assert!(DenseCholeskySolver.solve(&h, &b).is_none());
    }

    #[test]
    fn test_conjugate_gradient_matches_cholesky() {
        let (h, b) = spd_system();

        let dense = DenseCholeskySolver.solve(&h, &b).unwrap();
        let cg = ConjugateGradientSolver::default().solve(&h, &b).unwrap();

        assert_relative_eq!(dense, cg, epsilon = 1e-6);
    }

    #[test]
    fn test_conjugate_gradient_rejects_nonpositive_diagonal() {
        let h = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 0.0, 1.0]);
        let b = DVector::from_row_slice(&[1.0, 1.0]);

        assert!(ConjugateGradientSolver::default().solve(&h, &b).is_none());
    }
}
