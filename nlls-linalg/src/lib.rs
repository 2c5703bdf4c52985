//! Linear solver backends implementing [`LinearSolver`], the narrow contract
//! the optimizer core needs from a concrete dense, sparse, or iterative
//! factorization. A solver backend is handed an assembled system matrix and
//! right-hand side each outer iteration; it is free to cache symbolic
//! factorization state across calls with the same sparsity pattern.
//!
//! What happens inside a backend — pivoting strategy, fill-reducing
//! ordering, iterative stopping rule — is deliberately not specified beyond
//! this trait.
#![cfg_attr(docsrs, feature(doc_cfg))]

mod dense_qr;
mod iterative;
mod sparse_cholesky;

pub use dense_qr::DenseQr;
pub use iterative::{BlockCg, BlockCgOptions};
pub use sparse_cholesky::SparseCholesky;

use core::fmt::{self, Display, Formatter};
use faer::Mat;
use faer::mat::MatMut;
use std::num::NonZeroUsize;
use std::sync::OnceLock;

/// How a normal-equation system is augmented before factoring, to keep
/// a rank-deficient or ill-conditioned `H` solvable. The `ColumnNorms`
/// variant derives the conditioner from `H`'s own diagonal; `Provided`
/// lets the caller supply one (e.g. carried over from a previous
/// iteration so the conditioner doesn't chase the current step).
#[derive(Debug, Clone)]
pub enum DiagonalConditioner {
    /// Derive the diagonal from `sqrt(diag(H))`, clamped away from zero.
    ColumnNorms,
    /// Use exactly these diagonal entries (length must match `H`'s order).
    Provided(Vec<f64>),
    /// Don't augment the system at all.
    Off,
}

impl Default for DiagonalConditioner {
    fn default() -> Self {
        Self::ColumnNorms
    }
}

impl DiagonalConditioner {
    /// Resolve a diagonal of length `n`, reading `fallback_diag` (the
    /// system's own diagonal) when `self` is `ColumnNorms`.
    pub fn resolve(&self, fallback_diag: &[f64]) -> Option<Vec<f64>> {
        match self {
            Self::Off => None,
            Self::Provided(d) => Some(d.clone()),
            Self::ColumnNorms => Some(
                fallback_diag
                    .iter()
                    .map(|&d| d.abs().sqrt().max(1e-12))
                    .collect(),
            ),
        }
    }
}

/// A solver backend able to factor a system matrix once and then solve
/// (possibly several) right-hand sides against it in place.
///
/// `M` is the matrix representation a given backend expects (dense
/// `Mat<f64>`, a sparse `faer` type, or an opaque matrix-free operator);
/// letting it vary by implementor avoids forcing every backend onto one
/// in-memory format.
pub trait LinearSolver<M> {
    /// Factor (or otherwise prepare) the system matrix for solving.
    fn factor(&mut self, a: &M) -> SolverResult<()>;

    /// Solve the factored system against `rhs`, writing the solution back
    /// into `rhs` in place. For a least-squares (overdetermined) system
    /// the solution occupies the leading `ncols` rows of `rhs`.
    fn solve_in_place(&mut self, rhs: MatMut<'_, f64>) -> SolverResult<()>;
}

/// Convenience helper: factor and solve a dense right-hand side in one call.
pub fn solve_once<M>(solver: &mut impl LinearSolver<M>, a: &M, rhs: &mut Mat<f64>) -> SolverResult<()> {
    solver.factor(a)?;
    solver.solve_in_place(rhs.as_mut())
}

/// Backend-reported failure: rank deficiency, a non-finite pivot, or an
/// iterative method that exhausted its iteration budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverError {
    /// The matrix was numerically singular, or within tolerance of it.
    RankDeficient,
    /// A factorization or solve produced a non-finite value.
    NonFinite,
    /// An iterative solver exhausted its iteration budget without converging.
    DidNotConverge,
    /// The right-hand side or matrix dimensions didn't match what the
    /// backend was factored against.
    DimensionMismatch,
}

impl Display for SolverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankDeficient => f.write_str("linear system is rank-deficient"),
            Self::NonFinite => f.write_str("factorization produced a non-finite value"),
            Self::DidNotConverge => f.write_str("iterative solver did not converge"),
            Self::DimensionMismatch => f.write_str("matrix/right-hand-side dimensions disagree"),
        }
    }
}

impl std::error::Error for SolverError {}

/// Result type returned by every [`LinearSolver`] method.
pub type SolverResult<T> = Result<T, error_stack::Report<SolverError>>;

static RAYON_INIT: OnceLock<usize> = OnceLock::new();

/// Initialize the global rayon thread pool used by parallel system
/// assembly and block-sparse solves. Idempotent: later calls are ignored
/// and return the thread count chosen by the first call. `threads == 0`
/// picks `std::thread::available_parallelism()`.
pub fn init_global_parallelism(threads: usize) -> usize {
    if let Some(n) = RAYON_INIT.get().copied() {
        return n;
    }
    let target = if threads == 0 {
        std::thread::available_parallelism()
            .unwrap_or(unsafe { NonZeroUsize::new_unchecked(1) })
            .get()
    } else {
        threads
    };

    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(target)
        .build_global();

    let actual = rayon::current_num_threads();
    let _ = RAYON_INIT.set(actual);
    actual
}

/// The thread count chosen by [`init_global_parallelism`], or rayon's
/// current pool size if that was never called.
#[inline]
pub fn current_parallelism() -> usize {
    RAYON_INIT
        .get()
        .copied()
        .unwrap_or_else(rayon::current_num_threads)
}
