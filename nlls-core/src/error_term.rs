//! User-facing residuals: a weighted, optionally robustified squared
//! error term, and a scalar non-squared variant.

use crate::expr::{DvSet, ScalarExpr, VectorExpr};
use crate::jacobian::JacobianContainer;
use crate::mestimator::{MEstimator, Trivial};
use nalgebra::{DMatrix, DVector, SMatrix};
use std::fmt;

/// The result of evaluating one error term at the current design-variable
/// state: its scalar cost contribution, its weighted residual (the rows it
/// contributes to the assembled system), and the local Jacobian blocks
/// (already scaled by `√w · R`) ready to be placed into the assembler's
/// global `J`/`H` at this term's `row_base`.
pub struct ErrorTermEvaluation {
    /// This term's contribution to the total objective.
    pub cost: f64,
    /// The weighted residual rows, length [`ErrorTerm::dim`].
    pub weighted_residual: DVector<f64>,
    /// Per-design-variable Jacobian blocks, already scaled by the
    /// M-estimator weight and square-root information matrix.
    pub weighted_jacobians: JacobianContainer,
}

/// A user-supplied residual term contributing rows to the assembled
/// linear system.
pub trait ErrorTerm: fmt::Debug {
    /// Output dimension: the number of rows this term contributes.
    fn dim(&self) -> usize;

    /// Starting row in the assembled system. Assigned by the problem
    /// registry during layout.
    fn row_base(&self) -> usize;

    /// Assigned by the problem registry during layout.
    fn set_row_base(&mut self, base: usize);

    /// Populate `out` with every active design variable this term's
    /// residual transitively depends on.
    fn collect_design_variables(&self, out: &mut DvSet);

    /// Evaluate cost, weighted residual, and weighted Jacobian blocks at
    /// the current design-variable state.
    fn evaluate(&self, use_m_estimator: bool) -> ErrorTermEvaluation;
}

/// A squared error term of output dimension `K`:
/// `cost = ½ · w · (R·e)ᵀ(R·e)`, where `e` is the raw residual, `R` the
/// square-root inverse covariance, and `w = ρ'(‖R·e‖²)` the M-estimator
/// weight.
pub struct SquaredErrorTerm<const K: usize> {
    residual: VectorExpr<K>,
    sqrt_information: SMatrix<f64, K, K>,
    mestimator: Box<dyn MEstimator>,
    row_base: usize,
}

impl<const K: usize> fmt::Debug for SquaredErrorTerm<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SquaredErrorTerm")
            .field("dim", &K)
            .field("row_base", &self.row_base)
            .finish()
    }
}

impl<const K: usize> SquaredErrorTerm<K> {
    /// A squared error term with identity square-root information and no
    /// robustification.
    pub fn new(residual: VectorExpr<K>) -> Self {
        Self {
            residual,
            sqrt_information: SMatrix::<f64, K, K>::identity(),
            mestimator: Box::new(Trivial::new()),
            row_base: 0,
        }
    }

    /// Override the square-root inverse covariance weighting.
    pub fn with_sqrt_information(mut self, sqrt_information: SMatrix<f64, K, K>) -> Self {
        self.sqrt_information = sqrt_information;
        self
    }

    /// Install an M-estimator.
    pub fn with_mestimator(mut self, mestimator: Box<dyn MEstimator>) -> Self {
        self.mestimator = mestimator;
        self
    }
}

fn dmatrix_from_smatrix<const K: usize>(m: &SMatrix<f64, K, K>) -> DMatrix<f64> {
    DMatrix::from_fn(K, K, |i, j| m[(i, j)])
}

impl<const K: usize> ErrorTerm for SquaredErrorTerm<K> {
    fn dim(&self) -> usize {
        K
    }

    fn row_base(&self) -> usize {
        self.row_base
    }

    fn set_row_base(&mut self, base: usize) {
        self.row_base = base;
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.residual.collect_design_variables(out);
    }

    fn evaluate(&self, use_m_estimator: bool) -> ErrorTermEvaluation {
        let e = self.residual.evaluate();
        let weighted = self.sqrt_information * e;
        let squared_norm = weighted.dot(&weighted);
        let w = if use_m_estimator {
            self.mestimator.update_weight(squared_norm)
        } else {
            1.0
        };
        let cost = 0.5 * w * squared_norm;

        let mut jacobians = self.residual.jacobians();
        let scale = dmatrix_from_smatrix(&self.sqrt_information) * w.sqrt();
        jacobians.scale_blocks(&scale);

        ErrorTermEvaluation {
            cost,
            weighted_residual: DVector::from_iterator(K, (weighted * w.sqrt()).iter().copied()),
            weighted_jacobians: jacobians,
        }
    }
}

/// A scalar non-squared error term: the raw residual `s` contributes
/// `w · |s|` to the objective rather than `½ · w · s²`. To fit the same
/// `H = JᵀJ`, `g = Jᵀe` assembly as squared terms, its single contributed
/// row carries `r = sign(s) · √(2·w·|s|)`, so that `½ · r² = w · |s|`
/// matches the required cost exactly; its Jacobian is `dr/ds · ds/d(dv)`
/// via the chain rule through that mapping.
pub struct ScalarNonSquaredErrorTerm {
    residual: ScalarExpr,
    mestimator: Box<dyn MEstimator>,
    row_base: usize,
}

impl fmt::Debug for ScalarNonSquaredErrorTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarNonSquaredErrorTerm")
            .field("row_base", &self.row_base)
            .finish()
    }
}

impl ScalarNonSquaredErrorTerm {
    /// A scalar non-squared error term with no robustification.
    pub fn new(residual: ScalarExpr) -> Self {
        Self {
            residual,
            mestimator: Box::new(Trivial::new()),
            row_base: 0,
        }
    }

    /// Install an M-estimator.
    pub fn with_mestimator(mut self, mestimator: Box<dyn MEstimator>) -> Self {
        self.mestimator = mestimator;
        self
    }
}

impl ErrorTerm for ScalarNonSquaredErrorTerm {
    fn dim(&self) -> usize {
        1
    }

    fn row_base(&self) -> usize {
        self.row_base
    }

    fn set_row_base(&mut self, base: usize) {
        self.row_base = base;
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.residual.collect_design_variables(out);
    }

    fn evaluate(&self, use_m_estimator: bool) -> ErrorTermEvaluation {
        let s = self.residual.evaluate();
        let squared = s * s;
        let w = if use_m_estimator {
            self.mestimator.update_weight(squared)
        } else {
            1.0
        };
        let cost = w * s.abs();

        // r = sign(s) * sqrt(2 * w * |s|), so that 0.5 * r^2 == cost exactly.
        // dr/ds = sqrt(2 * w) / (2 * sqrt(|s|)) for s != 0, with no sign
        // factor: r's sign already tracks s through sign(s), and the
        // magnitude of r increases with |s| regardless of which side of
        // zero s sits on, so the derivative of that magnitude is positive
        // for both signs of s. At s == 0 both r and the Jacobian are zero.
        let sign = if s >= 0.0 { 1.0 } else { -1.0 };
        let r = sign * (2.0 * w * s.abs()).sqrt();
        let dr_ds = if s.abs() > 1e-300 {
            (2.0 * w).sqrt() / (2.0 * s.abs().sqrt())
        } else {
            0.0
        };

        let mut jacobians = self.residual.jacobians();
        jacobians.scale_blocks(&DMatrix::from_element(1, 1, dr_ds));

        ErrorTermEvaluation {
            cost,
            weighted_residual: DVector::from_element(1, r),
            weighted_jacobians: jacobians,
        }
    }
}
