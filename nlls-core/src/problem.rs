//! The registry tying design variables and error terms together: assigns
//! `column_base`/`row_base` layout and runs the setup diagnostic.

use crate::error::{OptimizerError, OptimizerResult};
use crate::error_term::ErrorTerm;
use crate::expr::DvSet;
use crate::jacobian::DvHandle;
use std::cell::RefCell;
use std::rc::Rc;

/// A single mismatch reported by [`OptimizationProblem::check_setup`].
#[derive(Debug, Clone)]
pub struct SetupIssue {
    /// Index of the error term in registration order.
    pub error_term_index: usize,
    /// What went wrong.
    pub detail: String,
}

impl std::fmt::Display for SetupIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error term {}: {}", self.error_term_index, self.detail)
    }
}

/// Registry of active design variables and error terms. Assigns
/// `column_base` (by ascending `block_index`) and `row_base` (by
/// registration order) so a [`crate::linear_system::LinearSystemSolver`]
/// can assemble a concrete `J`/`H`/`g`.
pub struct OptimizationProblem {
    design_variables: Vec<DvHandle>,
    error_terms: Vec<Box<dyn ErrorTerm>>,
    total_columns: usize,
    total_rows: usize,
}

impl Default for OptimizationProblem {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationProblem {
    /// An empty problem.
    pub fn new() -> Self {
        Self {
            design_variables: Vec::new(),
            error_terms: Vec::new(),
            total_columns: 0,
            total_rows: 0,
        }
    }

    /// Register a design variable. Its activation flag is respected as-is;
    /// inactive variables are tracked but receive no columns.
    pub fn add_design_variable(&mut self, dv: DvHandle) {
        self.design_variables.push(dv);
    }

    /// Register an error term.
    pub fn add_error_term(&mut self, term: Box<dyn ErrorTerm>) {
        self.error_terms.push(term);
    }

    /// Number of currently active design variables.
    pub fn num_active_dv(&self) -> usize {
        self.design_variables
            .iter()
            .filter(|dv| dv.borrow().is_active())
            .count()
    }

    /// Number of registered error terms.
    pub fn num_error_terms(&self) -> usize {
        self.error_terms.len()
    }

    /// Total columns assigned to active design variables after the most
    /// recent [`Self::init_layout`].
    pub fn total_columns(&self) -> usize {
        self.total_columns
    }

    /// Total rows assigned to error terms after the most recent
    /// [`Self::init_layout`].
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// All registered design variables, in registration order.
    pub fn design_variables(&self) -> &[DvHandle] {
        &self.design_variables
    }

    /// All registered error terms, in registration order.
    pub fn error_terms(&self) -> &[Box<dyn ErrorTerm>] {
        &self.error_terms
    }

    /// Total cost at the current design-variable state, without assembling
    /// a Jacobian. Used by the trust-region outer loop to evaluate a
    /// candidate step without re-running a full `build_system`.
    pub fn evaluate_cost(&self, use_m_estimator: bool) -> f64 {
        self.error_terms
            .iter()
            .map(|term| term.evaluate(use_m_estimator).cost)
            .sum()
    }

    /// Assign `column_base` to every active design variable in ascending
    /// `block_index` order, and `row_base` to every error term in
    /// registration order. Must be called before assembly, and again
    /// whenever activation flags change.
    pub fn init_layout(&mut self) {
        let mut active_indices: Vec<usize> = (0..self.design_variables.len())
            .filter(|&i| self.design_variables[i].borrow().is_active())
            .collect();
        active_indices.sort_by_key(|&i| self.design_variables[i].borrow().block_index());

        let mut column = 0;
        for i in active_indices {
            let mut dv = self.design_variables[i].borrow_mut();
            dv.set_column_base(column);
            column += dv.minimal_dim();
        }
        self.total_columns = column;

        let mut row = 0;
        for term in &mut self.error_terms {
            term.set_row_base(row);
            row += term.dim();
        }
        self.total_rows = row;
    }

    /// Every active design variable transitively referenced by at least
    /// one error term.
    fn referenced_active_dvs(&self) -> DvSet {
        let mut set = DvSet::new();
        for term in &self.error_terms {
            term.collect_design_variables(&mut set);
        }
        set
    }

    /// Verify every error term references at least one active design
    /// variable, and that each term's analytic Jacobian matches a
    /// central-finite-difference estimate to `1e-6` relative tolerance.
    /// Returns the list of issues found; an empty list means the problem
    /// is ready to optimize.
    pub fn check_setup(&self) -> OptimizerResult<Vec<SetupIssue>> {
        if self.error_terms.is_empty() {
            return Err(OptimizerError::SetupCheckFailed(
                "problem has no error terms".to_string(),
            ));
        }

        let mut issues = Vec::new();
        let referenced = self.referenced_active_dvs();

        for (index, term) in self.error_terms.iter().enumerate() {
            let mut dvs = DvSet::new();
            term.collect_design_variables(&mut dvs);
            if dvs.is_empty() {
                issues.push(SetupIssue {
                    error_term_index: index,
                    detail: "references no design variables".to_string(),
                });
                continue;
            }
            if !dvs.values().any(|dv| dv.borrow().is_active()) {
                issues.push(SetupIssue {
                    error_term_index: index,
                    detail: "references no *active* design variable".to_string(),
                });
                continue;
            }

            if let Some(detail) = check_jacobian_by_finite_difference(term.as_ref(), &dvs) {
                issues.push(SetupIssue {
                    error_term_index: index,
                    detail,
                });
            }
        }

        if referenced.is_empty() {
            issues.push(SetupIssue {
                error_term_index: usize::MAX,
                detail: "no error term references any active design variable".to_string(),
            });
        }

        Ok(issues)
    }
}

const FINITE_DIFFERENCE_STEP: f64 = 1e-6;
const FINITE_DIFFERENCE_RELATIVE_TOLERANCE: f64 = 1e-6;

fn check_jacobian_by_finite_difference(
    term: &dyn ErrorTerm,
    dvs: &DvSet,
) -> Option<String> {
    let baseline = term.evaluate(false);
    let analytic = &baseline.weighted_jacobians;

    for dv in dvs.values() {
        if !dv.borrow().is_active() {
            continue;
        }
        let dim = dv.borrow().minimal_dim();
        let Some(analytic_block) = analytic.block(dv) else {
            continue;
        };

        for col in 0..dim {
            let mut delta = vec![0.0; dim];
            delta[col] = FINITE_DIFFERENCE_STEP;
            dv.borrow_mut().boxplus(&delta).ok()?;
            let plus = term.evaluate(false).weighted_residual;
            dv.borrow_mut().revert();

            delta[col] = -FINITE_DIFFERENCE_STEP;
            dv.borrow_mut().boxplus(&delta).ok()?;
            let minus = term.evaluate(false).weighted_residual;
            dv.borrow_mut().revert();

            let numeric = (plus - minus) / (2.0 * FINITE_DIFFERENCE_STEP);
            for row in 0..term.dim() {
                let a = analytic_block[(row, col)];
                let n = numeric[row];
                let scale = a.abs().max(n.abs()).max(1.0);
                if (a - n).abs() / scale > FINITE_DIFFERENCE_RELATIVE_TOLERANCE {
                    return Some(format!(
                        "analytic/numeric Jacobian mismatch at row {row}, col {col}: {a} vs {n}"
                    ));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design_variable::{DesignVariable, EuclideanPoint};
    use crate::error_term::SquaredErrorTerm;
    use crate::expr::VectorExpr;
    use nalgebra::Vector3;

    fn active_point(v: Vector3<f64>, block_index: i64) -> (DvHandle, VectorExpr<3>) {
        let mut dv = EuclideanPoint::<3>::new(v);
        dv.set_active(true);
        dv.set_block_index(block_index);
        let cell = Rc::new(RefCell::new(dv));
        let expr = VectorExpr::from_dv(cell.clone());
        (cell, expr)
    }

    #[test]
    fn layout_assigns_column_bases_in_block_index_order() {
        let (dv_a, a) = active_point(Vector3::zeros(), 1);
        let (dv_b, _b) = active_point(Vector3::zeros(), 0);
        let target = VectorExpr::<3>::constant(Vector3::new(1.0, 2.0, 3.0));

        let mut problem = OptimizationProblem::new();
        problem.add_design_variable(dv_a.clone());
        problem.add_design_variable(dv_b.clone());
        problem.add_error_term(Box::new(SquaredErrorTerm::new(a - target)));
        problem.init_layout();

        assert_eq!(dv_b.borrow().column_base(), 0);
        assert_eq!(dv_a.borrow().column_base(), 3);
        assert_eq!(problem.total_columns(), 6);
        assert_eq!(problem.total_rows(), 3);
    }

    #[test]
    fn check_setup_accepts_a_well_posed_point_fit() {
        let (dv, p) = active_point(Vector3::zeros(), 0);
        let target = VectorExpr::<3>::constant(Vector3::new(1.0, 2.0, 3.0));

        let mut problem = OptimizationProblem::new();
        problem.add_design_variable(dv);
        problem.add_error_term(Box::new(SquaredErrorTerm::new(p - target)));
        problem.init_layout();

        let issues = problem.check_setup().unwrap();
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn check_setup_flags_an_error_term_with_no_active_dv() {
        let dv = EuclideanPoint::<3>::new(Vector3::zeros());
        let cell = Rc::new(RefCell::new(dv));
        let p = VectorExpr::from_dv(cell.clone());
        let target = VectorExpr::<3>::constant(Vector3::new(1.0, 2.0, 3.0));
        let handle: DvHandle = cell;

        let mut problem = OptimizationProblem::new();
        problem.add_design_variable(handle);
        problem.add_error_term(Box::new(SquaredErrorTerm::new(p - target)));
        problem.init_layout();

        let issues = problem.check_setup().unwrap();
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn empty_problem_is_rejected() {
        let problem = OptimizationProblem::new();
        assert!(problem.check_setup().is_err());
    }
}
