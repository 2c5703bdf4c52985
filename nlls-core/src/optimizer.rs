//! The outer optimization loop: wires a problem, an assembled linear
//! system, and a trust-region step policy together and drives iterations
//! until convergence, an iteration budget, or a hard failure.

use crate::callback::{Event, Registry};
use crate::error::{OptimizerError, OptimizerResult};
use crate::linear_system::LinearSystemSolver;
use crate::problem::OptimizationProblem;
use crate::trust_region::TrustRegionPolicy;

/// Why [`Optimizer::optimize`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The trust-region policy's convergence test was satisfied.
    Converged,
    /// `max_iterations` was reached without converging.
    MaxIterationsReached,
}

/// Tunables for [`Optimizer::optimize`].
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Maximum number of iterations before giving up.
    pub max_iterations: usize,
    /// Whether error terms weight their residual by their M-estimator.
    pub use_m_estimator: bool,
    /// Threads to pass to the linear system's backend factorization.
    pub n_threads: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            use_m_estimator: true,
            n_threads: 1,
        }
    }
}

impl Options {
    /// Override `max_iterations`.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Override `use_m_estimator`.
    pub fn with_m_estimator(mut self, use_m_estimator: bool) -> Self {
        self.use_m_estimator = use_m_estimator;
        self
    }

    /// Override `n_threads`.
    pub fn with_n_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }
}

/// The outcome of a completed [`Optimizer::optimize`] call.
#[derive(Debug, Clone)]
pub struct Status {
    /// Number of iterations actually run.
    pub iterations: usize,
    /// Cost before the first iteration.
    pub initial_cost: f64,
    /// Cost at the point the loop stopped.
    pub final_cost: f64,
    /// Why the loop stopped.
    pub reason: StopReason,
}

/// Drives `problem` to a local minimum using `system` to assemble and
/// solve the normal equations and `policy` to propose and judge steps.
pub struct Optimizer {
    problem: OptimizationProblem,
    system: Box<dyn LinearSystemSolver>,
    policy: Box<dyn TrustRegionPolicy>,
    callbacks: Registry,
    options: Options,
}

impl Optimizer {
    /// An optimizer over `problem`, using `system` for assembly/solve and
    /// `policy` to propose steps.
    pub fn new(
        problem: OptimizationProblem,
        system: Box<dyn LinearSystemSolver>,
        policy: Box<dyn TrustRegionPolicy>,
        options: Options,
    ) -> Self {
        Self {
            problem,
            system,
            policy,
            callbacks: Registry::new(),
            options,
        }
    }

    /// Register an observer notified at each stage of the loop.
    pub fn on_event(&mut self, observer: impl FnMut(&Event<'_>) + 'static) {
        self.callbacks.register(observer);
    }

    /// The underlying problem, e.g. to inspect design-variable state after
    /// a run.
    pub fn problem(&self) -> &OptimizationProblem {
        &self.problem
    }

    /// Run [`OptimizationProblem::check_setup`] and fail with
    /// [`OptimizerError::SetupCheckFailed`] if it reports any issue.
    pub fn check_problem_setup(&self) -> OptimizerResult<()> {
        let issues = self.problem.check_setup()?;
        if issues.is_empty() {
            return Ok(());
        }
        let detail = issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(OptimizerError::SetupCheckFailed(detail))
    }

    /// Run the outer loop until convergence, the iteration budget is
    /// exhausted, or an unrecoverable error occurs.
    #[tracing::instrument(skip(self), fields(max_iterations = self.options.max_iterations))]
    pub fn optimize(&mut self) -> OptimizerResult<Status> {
        self.check_problem_setup()?;

        self.system.init_matrix_structure(&mut self.problem);
        let initial_cost = self.problem.evaluate_cost(self.options.use_m_estimator);
        tracing::debug!(initial_cost, "optimization initialized");
        self.callbacks
            .notify(Event::OptimizationInitialized { initial_cost });

        let mut previous_cost = initial_cost;
        let mut final_cost = initial_cost;
        let mut reason = StopReason::MaxIterationsReached;
        let mut iterations_run = 0;

        for iteration in 0..self.options.max_iterations {
            self.callbacks.notify(Event::IterationStart { iteration });

            let result = self.system.build_system(
                &self.problem,
                self.options.n_threads,
                self.options.use_m_estimator,
            );
            if let Err(err) = result {
                tracing::error!(iteration, %err, "linear system assembly failed");
                self.callbacks.notify(Event::OptimizationFailed {
                    detail: &err.to_string(),
                });
                return Err(err);
            }

            let gradient_inf_norm = self
                .system
                .gradient()
                .iter()
                .fold(0.0_f64, |acc, &v| acc.max(v.abs()));
            self.callbacks.notify(Event::LinearSystemSolved {
                iteration,
                gradient_inf_norm,
            });

            let outcome = match self.policy.step(
                self.system.as_mut(),
                &self.problem,
                self.options.use_m_estimator,
            ) {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(iteration, %err, "trust-region step failed");
                    self.callbacks.notify(Event::OptimizationFailed {
                        detail: &err.to_string(),
                    });
                    return Err(err);
                }
            };
            tracing::debug!(
                iteration,
                cost = outcome.cost,
                gain_ratio = outcome.gain_ratio,
                accepted = outcome.accepted,
                "step evaluated"
            );

            self.callbacks.notify(Event::CostUpdated {
                iteration,
                previous_cost,
                new_cost: outcome.cost,
            });
            if outcome.accepted {
                self.callbacks.notify(Event::StepAccepted {
                    iteration,
                    gain_ratio: outcome.gain_ratio,
                });
            } else {
                self.callbacks.notify(Event::StepRejected {
                    iteration,
                    gain_ratio: outcome.gain_ratio,
                });
            }

            previous_cost = outcome.cost;
            final_cost = outcome.cost;
            iterations_run = iteration + 1;

            if self
                .policy
                .is_converged(&outcome.dx, self.system.gradient())
            {
                reason = StopReason::Converged;
                break;
            }
        }

        if reason == StopReason::MaxIterationsReached {
            tracing::warn!(iterations = iterations_run, final_cost, "max iterations reached without converging");
        } else {
            tracing::info!(iterations = iterations_run, final_cost, "optimization converged");
        }
        self.callbacks.notify(Event::OptimizationComplete {
            iterations: iterations_run,
            final_cost,
            reason: &reason,
        });

        Ok(Status {
            iterations: iterations_run,
            initial_cost,
            final_cost,
            reason,
        })
    }
}
