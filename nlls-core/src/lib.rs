//! A sparse nonlinear least-squares optimizer over a DAG of differentiable
//! expressions and manifold-valued design variables.
//!
//! A caller builds an [`OptimizationProblem`] out of [`ErrorTerm`]s whose
//! residuals are [`expr`] expression trees reading from [`DesignVariable`]s
//! (points, quaternions, directions, or plain scalars — each with its own
//! `boxplus` retraction), hands it to an [`Optimizer`] along with a
//! [`LinearSystemSolver`] backend and a [`TrustRegionPolicy`], and calls
//! [`Optimizer::optimize`].
//!
//! ```
//! use nlls_core::design_variable::{DesignVariable, EuclideanPoint};
//! use nlls_core::error_term::SquaredErrorTerm;
//! use nlls_core::expr::VectorExpr;
//! use nlls_core::linear_system::dense_qr_solver;
//! use nlls_core::optimizer::{Options, Optimizer};
//! use nlls_core::problem::OptimizationProblem;
//! use nlls_core::trust_region::GaussNewton;
//! use nalgebra::Vector3;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let mut point = EuclideanPoint::<3>::new(Vector3::zeros());
//! point.set_active(true);
//! let cell = Rc::new(RefCell::new(point));
//!
//! let p = VectorExpr::from_dv(cell.clone());
//! let target = VectorExpr::<3>::constant(Vector3::new(1.0, 2.0, 3.0));
//!
//! let mut problem = OptimizationProblem::new();
//! problem.add_design_variable(cell.clone());
//! problem.add_error_term(Box::new(SquaredErrorTerm::new(p - target)));
//!
//! let mut optimizer = Optimizer::new(
//!     problem,
//!     Box::new(dense_qr_solver(false)),
//!     Box::new(GaussNewton::default()),
//!     Options::default(),
//! );
//! let status = optimizer.optimize().unwrap();
//! assert!(status.final_cost < 1e-10);
//! ```

/// Observer events emitted by the optimizer loop.
pub mod callback;
/// Manifold-valued design variables: points, rotations, directions, scalars.
pub mod design_variable;
mod error;
/// Residuals read through [`ErrorTerm`](error_term::ErrorTerm), weighted by
/// a square-root information matrix or an M-estimator.
pub mod error_term;
/// The differentiable expression DAG: scalar, vector, rotation, and
/// transformation nodes.
pub mod expr;
/// Reverse-mode Jacobian accumulation against design-variable columns.
pub mod jacobian;
/// Robust loss functions (M-estimators) applied to squared residuals.
pub mod mestimator;
/// Normal-equation assembly (`H = JᵀJ`, `g = Jᵀe`) and pluggable linear
/// solver backends.
pub mod linear_system;
/// The outer Gauss-Newton/LM/Dogleg iteration loop.
pub mod optimizer;
/// The design-variable/error-term registry and setup diagnostics.
pub mod problem;
/// Trust-region step policies.
pub mod trust_region;

pub use crate::callback::{Event, Registry};
pub use crate::design_variable::DesignVariable;
pub use crate::error::{OptimizerError, OptimizerResult};
pub use crate::error_term::{ErrorTerm, ErrorTermEvaluation};
pub use crate::jacobian::{DvHandle, JacobianContainer};
pub use crate::linear_system::LinearSystemSolver;
pub use crate::mestimator::MEstimator;
pub use crate::optimizer::{Options, Optimizer, Status, StopReason};
pub use crate::problem::{OptimizationProblem, SetupIssue};
pub use crate::trust_region::{StepOutcome, TrustRegionPolicy};

#[cfg(test)]
mod tests;
