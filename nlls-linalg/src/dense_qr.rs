//! Dense QR backend with diagonal-conditioner augmentation.
//!
//! Used for small-to-medium dense normal-equation or Jacobian systems where
//! forming an explicit QR factorization is cheaper than tracking sparsity.
//! Augmentation follows the classic trick of stacking `sqrt(D)` rows below
//! the system before factoring, rather than forming `H + D` explicitly —
//! this keeps the conditioning benefit without squaring the condition
//! number the way an explicit normal-equation add would.

use crate::{DiagonalConditioner, LinearSolver, SolverError, SolverResult};
use error_stack::Report;
use faer::linalg::solvers::{Qr, Solve};
use faer::mat::MatMut;
use faer::Mat;

/// Dense QR solver over an `m x n` matrix, with an optional diagonal
/// conditioner stacked below the system rows before factoring.
pub struct DenseQr {
    conditioner: DiagonalConditioner,
    qr: Option<Qr<f64>>,
    /// Number of rows the factored system has, including augmentation rows.
    augmented_rows: usize,
    ncols: usize,
}

impl DenseQr {
    /// A solver with no diagonal augmentation.
    pub fn new() -> Self {
        Self {
            conditioner: DiagonalConditioner::Off,
            qr: None,
            augmented_rows: 0,
            ncols: 0,
        }
    }

    /// A solver that augments the system with `conditioner` before
    /// factoring.
    pub fn with_conditioner(conditioner: DiagonalConditioner) -> Self {
        Self {
            conditioner,
            qr: None,
            augmented_rows: 0,
            ncols: 0,
        }
    }

    /// Number of rows the most recent `factor` call produced, including
    /// any conditioner augmentation rows. Callers pad a right-hand side to
    /// this many rows before calling [`LinearSolver::solve_in_place`].
    pub fn augmented_rows(&self) -> usize {
        self.augmented_rows
    }

    fn column_norms(a: &Mat<f64>) -> Vec<f64> {
        (0..a.ncols())
            .map(|j| {
                (0..a.nrows())
                    .map(|i| a[(i, j)].powi(2))
                    .sum::<f64>()
                    .sqrt()
            })
            .collect()
    }
}

impl Default for DenseQr {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearSolver<Mat<f64>> for DenseQr {
    fn factor(&mut self, a: &Mat<f64>) -> SolverResult<()> {
        let diag = self.conditioner.resolve(&Self::column_norms(a));

        let factored = match diag {
            None => a.clone(),
            Some(d) => {
                let (m, n) = (a.nrows(), a.ncols());
                let mut augmented = Mat::<f64>::zeros(m + n, n);
                augmented.as_mut().submatrix_mut(0, 0, m, n).copy_from(a);
                for (j, &dj) in d.iter().enumerate().take(n) {
                    augmented[(m + j, j)] = dj;
                }
                augmented
            }
        };

        if !factored.as_ref().iter().all(|v| v.is_finite()) {
            return Err(Report::new(SolverError::NonFinite)
                .attach_printable("dense QR input contained a non-finite entry"));
        }

        self.augmented_rows = factored.nrows();
        self.ncols = factored.ncols();
        self.qr = Some(factored.qr());
        Ok(())
    }

    fn solve_in_place(&mut self, rhs: MatMut<'_, f64>) -> SolverResult<()> {
        let qr = self.qr.as_ref().ok_or_else(|| {
            Report::new(SolverError::DimensionMismatch)
                .attach_printable("solve_in_place called before factor")
        })?;

        if rhs.nrows() != self.augmented_rows {
            return Err(Report::new(SolverError::DimensionMismatch).attach_printable(format!(
                "expected a right-hand side with {} rows (including conditioner rows), got {}",
                self.augmented_rows,
                rhs.nrows()
            )));
        }

        qr.solve_in_place(rhs);

        Ok(())
    }
}
