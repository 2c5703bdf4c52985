//! Robustifying weight functions (M-estimators).
//!
//! An M-estimator maps a squared residual norm to a downweighting factor
//! `w ∈ (0, 1]`. [`ErrorTerm`](crate::error_term) scales its weighted
//! Jacobian and residual by `√w`, so a residual with `w → 0` contributes
//! vanishingly little to the linear system despite a large raw magnitude.

use std::cell::Cell;

/// A robustifying weight policy. `weight` is a pure function of the
/// squared residual norm; `current_weight` caches the most recently
/// computed value so callers (logging, diagnostics) can read it back
/// without recomputing.
pub trait MEstimator: std::fmt::Debug {
    /// Compute the weight for a given squared residual norm.
    fn weight(&self, squared_residual: f64) -> f64;

    /// The weight computed by the most recent call to
    /// [`Self::update_weight`], or `1.0` if none has been made yet.
    fn current_weight(&self) -> f64;

    /// Compute and cache the weight for `squared_residual`.
    fn update_weight(&self, squared_residual: f64) -> f64;
}

#[derive(Debug, Default)]
struct WeightCache(Cell<f64>);

impl WeightCache {
    fn new() -> Self {
        Self(Cell::new(1.0))
    }
}

/// No robustification: every residual is weighted `1.0`.
#[derive(Debug, Default)]
pub struct Trivial {
    cache: WeightCache,
}

impl Trivial {
    /// A new trivial (non-robustifying) M-estimator.
    pub fn new() -> Self {
        Self {
            cache: WeightCache::new(),
        }
    }
}

impl MEstimator for Trivial {
    fn weight(&self, _squared_residual: f64) -> f64 {
        1.0
    }

    fn current_weight(&self) -> f64 {
        self.cache.0.get()
    }

    fn update_weight(&self, squared_residual: f64) -> f64 {
        let w = self.weight(squared_residual);
        self.cache.0.set(w);
        w
    }
}

/// Huber loss: quadratic for `|r| ≤ k`, linear beyond. `k = 1.345` gives
/// 95% efficiency under a Gaussian noise model and is the conventional
/// default.
#[derive(Debug)]
pub struct Huber {
    /// Threshold on `|r|` below which the residual is treated as an inlier.
    pub threshold: f64,
    cache: WeightCache,
}

impl Huber {
    /// The conventional default threshold, `1.345`.
    pub const DEFAULT_THRESHOLD: f64 = 1.345;

    /// A Huber M-estimator with the given threshold.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            cache: WeightCache::new(),
        }
    }
}

impl Default for Huber {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl MEstimator for Huber {
    fn weight(&self, squared_residual: f64) -> f64 {
        let r = squared_residual.sqrt();
        if r <= self.threshold {
            1.0
        } else {
            self.threshold / r
        }
    }

    fn current_weight(&self) -> f64 {
        self.cache.0.get()
    }

    fn update_weight(&self, squared_residual: f64) -> f64 {
        let w = self.weight(squared_residual);
        self.cache.0.set(w);
        w
    }
}

/// Cauchy loss: `w(r²) = 1 / (1 + r²/c²)`. Downweights outliers more
/// aggressively than Huber, with unbounded influence reduction.
#[derive(Debug)]
pub struct Cauchy {
    /// Scale parameter `c`.
    pub c: f64,
    cache: WeightCache,
}

impl Cauchy {
    /// A Cauchy M-estimator with scale `c`.
    pub fn new(c: f64) -> Self {
        Self {
            c,
            cache: WeightCache::new(),
        }
    }
}

impl MEstimator for Cauchy {
    fn weight(&self, squared_residual: f64) -> f64 {
        1.0 / (1.0 + squared_residual / (self.c * self.c))
    }

    fn current_weight(&self) -> f64 {
        self.cache.0.get()
    }

    fn update_weight(&self, squared_residual: f64) -> f64 {
        let w = self.weight(squared_residual);
        self.cache.0.set(w);
        w
    }
}

/// Fair loss: `w(r²) = 1 / (1 + |r|/c)`.
#[derive(Debug)]
pub struct Fair {
    /// Scale parameter `c`.
    pub c: f64,
    cache: WeightCache,
}

impl Fair {
    /// A Fair M-estimator with scale `c`.
    pub fn new(c: f64) -> Self {
        Self {
            c,
            cache: WeightCache::new(),
        }
    }
}

impl MEstimator for Fair {
    fn weight(&self, squared_residual: f64) -> f64 {
        1.0 / (1.0 + squared_residual.sqrt() / self.c)
    }

    fn current_weight(&self) -> f64 {
        self.cache.0.get()
    }

    fn update_weight(&self, squared_residual: f64) -> f64 {
        let w = self.weight(squared_residual);
        self.cache.0.set(w);
        w
    }
}

/// Blake-Zisserman loss: `w(r²) = exp(-r²/c²)`. Weight decays smoothly and
/// quickly to zero, suited to problems with a high expected outlier rate.
#[derive(Debug)]
pub struct BlakeZisserman {
    /// Scale parameter `c`.
    pub c: f64,
    cache: WeightCache,
}

impl BlakeZisserman {
    /// A Blake-Zisserman M-estimator with scale `c`.
    pub fn new(c: f64) -> Self {
        Self {
            c,
            cache: WeightCache::new(),
        }
    }
}

impl MEstimator for BlakeZisserman {
    fn weight(&self, squared_residual: f64) -> f64 {
        (-squared_residual / (self.c * self.c)).exp()
    }

    fn current_weight(&self) -> f64 {
        self.cache.0.get()
    }

    fn update_weight(&self, squared_residual: f64) -> f64 {
        let w = self.weight(squared_residual);
        self.cache.0.set(w);
        w
    }
}
