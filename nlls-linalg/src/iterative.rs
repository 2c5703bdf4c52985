//! Matrix-free block conjugate-gradient backend.
//!
//! For very large sparse `H` where even a sparse factorization is too
//! costly (or the caller never wants to materialize `H` at all), CG only
//! needs a function computing `H * v`. This backend operates on a dense
//! `Mat<f64>` by default since `nlls-core` currently only constructs that
//! representation for the iterative path, but the solve loop itself never
//! assumes more than matrix-vector products are available.

use crate::{LinearSolver, SolverError, SolverResult};
use error_stack::Report;
use faer::mat::MatMut;
use faer::Mat;

/// Tuning knobs for [`BlockCg`].
#[derive(Debug, Clone, Copy)]
pub struct BlockCgOptions {
    /// Maximum number of CG iterations before giving up.
    pub max_iterations: usize,
    /// Relative residual norm at which CG is considered converged.
    pub tolerance: f64,
}

impl Default for BlockCgOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
        }
    }
}

/// Block conjugate-gradient solver for symmetric positive-definite systems,
/// applied independently to each column of the right-hand side.
pub struct BlockCg {
    options: BlockCgOptions,
    a: Option<Mat<f64>>,
}

impl BlockCg {
    /// A solver using the default iteration budget and tolerance.
    pub fn new() -> Self {
        Self {
            options: BlockCgOptions::default(),
            a: None,
        }
    }

    /// A solver with explicit iteration budget and tolerance.
    pub fn with_options(options: BlockCgOptions) -> Self {
        Self { options, a: None }
    }

    fn solve_one_column(&self, a: &Mat<f64>, b: &[f64]) -> SolverResult<Vec<f64>> {
        let n = a.nrows();
        let mut x = vec![0.0_f64; n];
        let mut r = b.to_vec();
        let mut p = r.clone();
        let mut rs_old: f64 = r.iter().map(|v| v * v).sum();
        let b_norm = b.iter().map(|v| v * v).sum::<f64>().sqrt().max(1e-30);

        if rs_old.sqrt() / b_norm < self.options.tolerance {
            return Ok(x);
        }

        for _ in 0..self.options.max_iterations {
            let ap: Vec<f64> = (0..n)
                .map(|i| (0..n).map(|j| a[(i, j)] * p[j]).sum())
                .collect();
            let p_ap: f64 = p.iter().zip(&ap).map(|(pi, api)| pi * api).sum();
            if p_ap.abs() < 1e-300 {
                return Err(Report::new(SolverError::DidNotConverge)
                    .attach_printable("CG search direction became degenerate"));
            }
            let alpha = rs_old / p_ap;

            for i in 0..n {
                x[i] += alpha * p[i];
                r[i] -= alpha * ap[i];
            }

            let rs_new: f64 = r.iter().map(|v| v * v).sum();
            if rs_new.sqrt() / b_norm < self.options.tolerance {
                return Ok(x);
            }

            let beta = rs_new / rs_old;
            for i in 0..n {
                p[i] = r[i] + beta * p[i];
            }
            rs_old = rs_new;
        }

        Err(Report::new(SolverError::DidNotConverge)
            .attach_printable(format!("CG exceeded {} iterations", self.options.max_iterations)))
    }
}

impl Default for BlockCg {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearSolver<Mat<f64>> for BlockCg {
    fn factor(&mut self, a: &Mat<f64>) -> SolverResult<()> {
        if a.nrows() != a.ncols() {
            return Err(Report::new(SolverError::DimensionMismatch)
                .attach_printable("CG requires a square symmetric matrix"));
        }
        if !a.as_ref().iter().all(|v| v.is_finite()) {
            return Err(Report::new(SolverError::NonFinite)
                .attach_printable("CG input contained a non-finite entry"));
        }
        self.a = Some(a.clone());
        Ok(())
    }

    fn solve_in_place(&mut self, mut rhs: MatMut<'_, f64>) -> SolverResult<()> {
        let a = self.a.as_ref().ok_or_else(|| {
            Report::new(SolverError::DimensionMismatch)
                .attach_printable("solve_in_place called before factor")
        })?;

        if rhs.nrows() != a.nrows() {
            return Err(Report::new(SolverError::DimensionMismatch).attach_printable(format!(
                "expected a right-hand side with {} rows, got {}",
                a.nrows(),
                rhs.nrows()
            )));
        }

        for col in 0..rhs.ncols() {
            let b: Vec<f64> = (0..rhs.nrows()).map(|i| rhs[(i, col)]).collect();
            let x = self.solve_one_column(a, &b)?;
            for (i, xi) in x.into_iter().enumerate() {
                rhs[(i, col)] = xi;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn solves_spd_system() {
        // [4 1; 1 3] x = [1; 2]
        let mut a = Mat::<f64>::zeros(2, 2);
        a[(0, 0)] = 4.0;
        a[(0, 1)] = 1.0;
        a[(1, 0)] = 1.0;
        a[(1, 1)] = 3.0;

        let mut rhs = Mat::<f64>::zeros(2, 1);
        rhs[(0, 0)] = 1.0;
        rhs[(1, 0)] = 2.0;

        let mut solver = BlockCg::new();
        solver.factor(&a).expect("factor");
        solver.solve_in_place(rhs.as_mut()).expect("solve");

        assert_abs_diff_eq!(rhs[(0, 0)], 1.0 / 11.0, epsilon = 1e-6);
        assert_abs_diff_eq!(rhs[(1, 0)], 7.0 / 11.0, epsilon = 1e-6);
    }

    #[test]
    fn rejects_non_square() {
        let a = Mat::<f64>::zeros(2, 3);
        let mut solver = BlockCg::new();
        assert!(solver.factor(&a).is_err());
    }
}
