//! Normal-equation assembly and solve: builds `H = JᵀJ`, `g = Jᵀe` from a
//! problem's error terms without ever materializing a global `J`, then
//! solves `(H + λ·diag(H))·dx = −g` against a pluggable backend.
//!
//! Per-error-term Jacobian evaluation only touches the columns of the
//! design variables that term references, so assembly accumulates `H`
//! blockwise: for every pair of design variables `(a, b)` a term
//! references, `Jaᵀ·Jb` is added at `H[a.column_base.., b.column_base..]`.
//! Actual OS-thread parallelism during assembly would require design
//! variable handles to be `Send`/`Sync`; this core uses `Rc<RefCell<_>>`
//! handles (see [`crate::jacobian::DvHandle`]), and thread pool primitives
//! are an out-of-scope collaborator, so assembly here is single-threaded.
//! `n_threads` is still honored by forwarding to
//! [`nlls_linalg::init_global_parallelism`], which governs the backend
//! factorization's internal parallelism.

use crate::error::{OptimizerError, OptimizerResult};
use crate::problem::OptimizationProblem;
use nalgebra::{DMatrix, DVector};
use nlls_linalg::{BlockCg, DenseQr, DiagonalConditioner, LinearSolver, SparseCholesky};

/// The assembled normal-equation system a [`TrustRegionPolicy`](crate::trust_region::TrustRegionPolicy)
/// reads from and a [`LinearSystemSolver`] writes into.
pub trait LinearSystemSolver {
    /// Assign `column_base`/`row_base` via `problem.init_layout()` and
    /// size the internal system for the resulting dimensions.
    fn init_matrix_structure(&mut self, problem: &mut OptimizationProblem);

    /// Evaluate every error term's Jacobian at the current design-variable
    /// state and accumulate `H`, `g`, and the total cost.
    fn build_system(
        &mut self,
        problem: &OptimizationProblem,
        n_threads: usize,
        use_m_estimator: bool,
    ) -> OptimizerResult<()>;

    /// Solve `(H + λ·diag(H))·dx = −g`, writing the result into `dx`.
    /// Returns `Ok(false)` (rather than an error) only when the backend
    /// reports a numeric failure that the caller should treat as a normal
    /// rejected/failed step rather than a hard fault.
    fn solve_system(&mut self, lambda: f64, dx: &mut DVector<f64>) -> OptimizerResult<bool>;

    /// Diagonal of `H⁻¹`: the marginal variance of each column, a cheap
    /// approximation to the full covariance.
    fn compute_covariances(&self) -> OptimizerResult<DVector<f64>>;

    /// Current total cost (sum of every error term's weighted cost).
    fn cost(&self) -> f64;

    /// Current gradient `g = Jᵀe`.
    fn gradient(&self) -> &DVector<f64>;

    /// Current Gauss-Newton Hessian approximation `H = JᵀJ`.
    fn hessian(&self) -> &DMatrix<f64>;
}

/// Which backend [`NormalEquationsSolver`] delegates `(H + λ·diag(H))·dx = −g`
/// solves to.
pub enum SolverBackend {
    /// Dense QR over the square damped system.
    DenseQr(DenseQr),
    /// Sparse Cholesky, reusing the symbolic factorization across calls
    /// with an unchanged sparsity pattern.
    SparseCholesky(SparseCholesky),
    /// Matrix-free block conjugate gradient.
    BlockCg(BlockCg),
}

fn dmatrix_to_mat(m: &DMatrix<f64>) -> faer::Mat<f64> {
    faer::Mat::from_fn(m.nrows(), m.ncols(), |i, j| m[(i, j)])
}

fn dvector_to_mat(v: &DVector<f64>) -> faer::Mat<f64> {
    faer::Mat::from_fn(v.len(), 1, |i, _| v[i])
}

fn mat_column_to_dvector(m: &faer::Mat<f64>, nrows: usize) -> DVector<f64> {
    DVector::from_fn(nrows, |i, _| m[(i, 0)])
}

fn dense_to_sparse(m: &DMatrix<f64>) -> faer::sparse::SparseColMat<usize, f64> {
    let mut triplets = Vec::new();
    for j in 0..m.ncols() {
        for i in 0..m.nrows() {
            let v = m[(i, j)];
            if v != 0.0 {
                triplets.push((i, j, v));
            }
        }
    }
    faer::sparse::SparseColMat::try_new_from_triplets(m.nrows(), m.ncols(), &triplets)
        .expect("dense-derived triplets are always well-formed")
}

impl SolverBackend {
    fn solve(&mut self, a: &DMatrix<f64>, b: &DVector<f64>) -> OptimizerResult<DVector<f64>> {
        let n = b.len();
        match self {
            SolverBackend::DenseQr(solver) => {
                let mat_a = dmatrix_to_mat(a);
                solver.factor(&mat_a)?;
                // Pad the RHS with zero rows if the backend's own
                // diagonal-conditioner augmentation stacked extra rows
                // below the system during `factor`.
                let mut rhs = faer::Mat::<f64>::zeros(solver.augmented_rows(), 1);
                rhs.as_mut().submatrix_mut(0, 0, n, 1).copy_from(dvector_to_mat(b).as_ref());
                solver.solve_in_place(rhs.as_mut())?;
                Ok(mat_column_to_dvector(&rhs, n))
            }
            SolverBackend::SparseCholesky(solver) => {
                let sparse_a = dense_to_sparse(a);
                let mut rhs = dvector_to_mat(b);
                solver.factor(&sparse_a)?;
                solver.solve_in_place(rhs.as_mut())?;
                Ok(mat_column_to_dvector(&rhs, n))
            }
            SolverBackend::BlockCg(solver) => {
                let mat_a = dmatrix_to_mat(a);
                let mut rhs = dvector_to_mat(b);
                solver.factor(&mat_a)?;
                solver.solve_in_place(rhs.as_mut())?;
                Ok(mat_column_to_dvector(&rhs, n))
            }
        }
    }
}

/// Dense-normal-equation assembler: accumulates `H`/`g` as plain
/// [`nalgebra`] matrices, suitable for small-to-medium problems or as the
/// reference implementation the sparse path is checked against.
pub struct NormalEquationsSolver {
    backend: SolverBackend,
    h: DMatrix<f64>,
    g: DVector<f64>,
    cost: f64,
}

impl NormalEquationsSolver {
    /// An assembler delegating damped solves to `backend`.
    pub fn new(backend: SolverBackend) -> Self {
        Self {
            backend,
            h: DMatrix::zeros(0, 0),
            g: DVector::zeros(0),
            cost: 0.0,
        }
    }
}

impl LinearSystemSolver for NormalEquationsSolver {
    fn init_matrix_structure(&mut self, problem: &mut OptimizationProblem) {
        problem.init_layout();
        let n = problem.total_columns();
        self.h = DMatrix::zeros(n, n);
        self.g = DVector::zeros(n);
        self.cost = 0.0;
    }

    fn build_system(
        &mut self,
        problem: &OptimizationProblem,
        n_threads: usize,
        use_m_estimator: bool,
    ) -> OptimizerResult<()> {
        nlls_linalg::init_global_parallelism(n_threads);

        let n = self.h.nrows();
        let mut h = DMatrix::zeros(n, n);
        let mut g = DVector::zeros(n);
        let mut cost = 0.0;

        for term in problem.error_terms() {
            let eval = term.evaluate(use_m_estimator);
            cost += eval.cost;

            let blocks: Vec<_> = eval.weighted_jacobians.blocks().collect();
            for &(dv_a, block_a) in &blocks {
                if !dv_a.borrow().is_active() {
                    continue;
                }
                let base_a = dv_a.borrow().column_base();
                let width_a = block_a.ncols();
                let contribution_g = block_a.transpose() * &eval.weighted_residual;
                let mut g_view = g.rows_mut(base_a, width_a);
                g_view += &contribution_g;

                for &(dv_b, block_b) in &blocks {
                    if !dv_b.borrow().is_active() {
                        continue;
                    }
                    let base_b = dv_b.borrow().column_base();
                    let width_b = block_b.ncols();
                    let contribution_h = block_a.transpose() * block_b;
                    let mut view = h.view_mut((base_a, base_b), (width_a, width_b));
                    view += &contribution_h;
                }
            }
        }

        self.h = h;
        self.g = g;
        self.cost = cost;
        Ok(())
    }

    fn solve_system(&mut self, lambda: f64, dx: &mut DVector<f64>) -> OptimizerResult<bool> {
        let n = self.h.nrows();
        let mut damped = self.h.clone();
        for i in 0..n {
            damped[(i, i)] += lambda * self.h[(i, i)].abs();
        }
        let neg_g = -&self.g;

        match self.backend.solve(&damped, &neg_g) {
            Ok(solution) => {
                *dx = solution;
                Ok(dx.iter().all(|v| v.is_finite()))
            }
            Err(OptimizerError::LinearSolverFailed(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }

    fn compute_covariances(&self) -> OptimizerResult<DVector<f64>> {
        let inverse = self.h.clone().try_inverse().ok_or_else(|| {
            OptimizerError::NumericFailure {
                stage: "compute_covariances",
                detail: "Hessian is not invertible".to_string(),
            }
        })?;
        Ok(DVector::from_fn(inverse.nrows(), |i, _| inverse[(i, i)]))
    }

    fn cost(&self) -> f64 {
        self.cost
    }

    fn gradient(&self) -> &DVector<f64> {
        &self.g
    }

    fn hessian(&self) -> &DMatrix<f64> {
        &self.h
    }
}

/// Convenience constructor: dense QR backend with a column-norm diagonal
/// conditioner, matching `linear_solver: DenseQR{use_diagonal_conditioner:
/// true}` from the programmatic options surface.
pub fn dense_qr_solver(use_diagonal_conditioner: bool) -> NormalEquationsSolver {
    let backend = if use_diagonal_conditioner {
        DenseQr::with_conditioner(DiagonalConditioner::ColumnNorms)
    } else {
        DenseQr::new()
    };
    NormalEquationsSolver::new(SolverBackend::DenseQr(backend))
}

/// Convenience constructor: sparse Cholesky backend.
pub fn sparse_cholesky_solver() -> NormalEquationsSolver {
    NormalEquationsSolver::new(SolverBackend::SparseCholesky(SparseCholesky::new()))
}

/// Convenience constructor: block conjugate-gradient backend.
pub fn block_cg_solver(options: nlls_linalg::BlockCgOptions) -> NormalEquationsSolver {
    NormalEquationsSolver::new(SolverBackend::BlockCg(BlockCg::with_options(options)))
}
