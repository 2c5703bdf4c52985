//! Observer hooks into the optimization loop. Callbacks are plain
//! `FnMut(&Event)` closures registered on a [`Registry`]; there is no
//! async or cross-thread delivery, matching the single-threaded
//! [`crate::optimizer::Optimizer`] loop that drives them.

/// A point in the optimization loop a [`Registry`] can notify about.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// `optimize` has validated the problem and is about to run the first
    /// iteration.
    OptimizationInitialized {
        /// Initial cost before any steps are taken.
        initial_cost: f64,
    },
    /// A new iteration has begun.
    IterationStart {
        /// Iteration index, starting at zero.
        iteration: usize,
    },
    /// The cost changed, whether or not the step that caused it was kept.
    CostUpdated {
        /// Iteration index the cost belongs to.
        iteration: usize,
        /// Cost before this iteration's step.
        previous_cost: f64,
        /// Cost after this iteration's step.
        new_cost: f64,
    },
    /// `H`/`g` were assembled for this iteration and the linear system was
    /// solved.
    LinearSystemSolved {
        /// Iteration index.
        iteration: usize,
        /// `‖g‖_∞` at the point the system was assembled.
        gradient_inf_norm: f64,
    },
    /// A candidate step was accepted.
    StepAccepted {
        /// Iteration index.
        iteration: usize,
        /// Gain ratio that triggered acceptance.
        gain_ratio: f64,
    },
    /// A candidate step was rejected and design variables were reverted.
    StepRejected {
        /// Iteration index.
        iteration: usize,
        /// Gain ratio that triggered rejection.
        gain_ratio: f64,
    },
    /// The optimization loop stopped having converged or exhausted its
    /// iteration budget.
    OptimizationComplete {
        /// Total iterations run.
        iterations: usize,
        /// Final cost.
        final_cost: f64,
        /// Why the loop stopped.
        reason: &'a crate::optimizer::StopReason,
    },
    /// The optimization loop stopped due to an unrecoverable error.
    OptimizationFailed {
        /// A description of what went wrong.
        detail: &'a str,
    },
}

/// A collection of observers notified, in registration order, at each
/// [`Event`] the optimizer loop emits.
#[derive(Default)]
pub struct Registry {
    observers: Vec<Box<dyn FnMut(&Event<'_>)>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Register an observer. Observers are notified in registration order.
    pub fn register(&mut self, observer: impl FnMut(&Event<'_>) + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Whether any observer is registered.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Notify every registered observer of `event`.
    pub fn notify(&mut self, event: Event<'_>) {
        for observer in &mut self.observers {
            observer(&event);
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}
