//! Jacobian accumulation for reverse-mode differentiation of the
//! expression DAG.
//!
//! The container is handed to [`crate::expr`] nodes during a traversal of
//! one error term's expression tree. Composite nodes push their local
//! Jacobian onto the [`ChainRuleStack`] before recursing into children;
//! leaf nodes call [`JacobianContainer::add`] to deposit the composed block
//! for the design variable they wrap. The stack is a concrete data
//! structure rather than hidden call-stack state, so its balance (every
//! push matched by a pop) is a checkable invariant, not just a convention.

use crate::design_variable::DesignVariable;
use nalgebra::DMatrix;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

/// Shared handle to a design variable, as stored by expression leaf nodes
/// and the problem registry.
pub type DvHandle = Rc<RefCell<dyn DesignVariable>>;

pub(crate) fn dv_key(dv: &DvHandle) -> usize {
    Rc::as_ptr(dv) as *const () as usize
}

/// Default number of pre-allocated chain-rule frames, matching the
/// original C++ container's default capacity.
const DEFAULT_STACK_CAPACITY: usize = 100;

/// The explicit chain-rule stack threaded through a DAG traversal.
///
/// `push` composes the new factor with the current top (or takes it as the
/// new top if the stack was empty); `pop` discards the most recent push.
/// Use [`JacobianContainer::apply`] rather than these directly — it returns
/// a scope guard so pop-on-every-exit-path is structural.
#[derive(Debug, Default)]
struct ChainRuleStack {
    frames: Vec<DMatrix<f64>>,
}

impl ChainRuleStack {
    fn with_capacity(cap: usize) -> Self {
        Self {
            frames: Vec::with_capacity(cap),
        }
    }

    fn push(&mut self, m: DMatrix<f64>) {
        let new_top = match self.frames.last() {
            Some(top) => top * &m,
            None => m,
        };
        self.frames.push(new_top);
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn top(&self) -> Option<&DMatrix<f64>> {
        self.frames.last()
    }

    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Accumulates, per design variable, the Jacobian of one expression's
/// output with respect to that variable's tangent space.
#[derive(Debug)]
pub struct JacobianContainer {
    rows: usize,
    blocks: HashMap<usize, (DvHandle, DMatrix<f64>)>,
    stack: ChainRuleStack,
}

/// Scope guard returned by [`JacobianContainer::apply`]. Pops the pushed
/// chain-rule frame when dropped, regardless of how the scope is exited.
pub struct ChainRuleGuard<'a> {
    container: &'a mut JacobianContainer,
}

impl Deref for ChainRuleGuard<'_> {
    type Target = JacobianContainer;
    fn deref(&self) -> &JacobianContainer {
        self.container
    }
}

impl DerefMut for ChainRuleGuard<'_> {
    fn deref_mut(&mut self) -> &mut JacobianContainer {
        self.container
    }
}

impl Drop for ChainRuleGuard<'_> {
    fn drop(&mut self) {
        self.container.stack.pop();
    }
}

impl JacobianContainer {
    /// A container for an expression whose root output has `rows`
    /// dimensions, with the default chain-rule stack capacity.
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            blocks: HashMap::new(),
            stack: ChainRuleStack::with_capacity(DEFAULT_STACK_CAPACITY),
        }
    }

    /// Output dimensionality of the root expression.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Push `m` as the new chain-rule factor, returning a guard that pops
    /// it when dropped. The sole way to push: `evaluate_jacobians`
    /// implementations should hold the guard for the extent of their
    /// recursive call into children.
    #[must_use = "dropping the guard immediately pops the chain-rule frame it just pushed"]
    pub fn apply(&mut self, m: DMatrix<f64>) -> ChainRuleGuard<'_> {
        self.stack.push(m);
        ChainRuleGuard { container: self }
    }

    /// The current chain-rule matrix, or `None` if the stack is empty
    /// (conceptually the `rows x rows` identity).
    pub fn top(&self) -> Option<&DMatrix<f64>> {
        self.stack.top()
    }

    /// Whether the chain-rule stack is currently empty. Used to assert the
    /// balance invariant after a full traversal.
    pub fn stack_is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Deposit `local_j`, the local Jacobian of the current node's output
    /// with respect to `dv`'s tangent space, composed with the current
    /// chain-rule matrix. A no-op if `dv` is inactive.
    pub fn add(&mut self, dv: &DvHandle, local_j: DMatrix<f64>) {
        if !dv.borrow().is_active() {
            return;
        }
        let contribution = match self.stack.top() {
            Some(top) => top * &local_j,
            None => local_j,
        };
        let key = dv_key(dv);
        match self.blocks.get_mut(&key) {
            Some((_, block)) => *block += &contribution,
            None => {
                self.blocks.insert(key, (dv.clone(), contribution));
            }
        }
    }

    /// All entries are finite for the block belonging to `dv`. Vacuously
    /// true if `dv` has no accumulated block.
    pub fn is_finite(&self, dv: &DvHandle) -> bool {
        match self.blocks.get(&dv_key(dv)) {
            Some((_, block)) => block.iter().all(|v| v.is_finite()),
            None => true,
        }
    }

    /// The accumulated block for `dv`, if any.
    pub fn block(&self, dv: &DvHandle) -> Option<&DMatrix<f64>> {
        self.blocks.get(&dv_key(dv)).map(|(_, block)| block)
    }

    /// Replace every accumulated block `B` with `scale * B`. Used by error
    /// terms to fold an M-estimator weight and a square-root information
    /// matrix into their raw (unweighted) Jacobian blocks after the DAG
    /// traversal that produced them.
    pub fn scale_blocks(&mut self, scale: &DMatrix<f64>) {
        for (_, block) in self.blocks.values_mut() {
            *block = scale * &*block;
        }
    }

    /// All `(design variable, block)` pairs accumulated so far, in no
    /// particular order. Used by error terms to scale and redistribute
    /// blocks into a parent container.
    pub fn blocks(&self) -> impl Iterator<Item = (&DvHandle, &DMatrix<f64>)> {
        self.blocks.values().map(|(dv, block)| (dv, block))
    }

    /// Concatenation of per-DV blocks ordered by ascending `column_base`,
    /// into a single `rows x total_cols` dense matrix. `total_cols` is the
    /// caller-supplied width of the assembled system (the container itself
    /// only knows about the design variables it touched).
    pub fn as_dense_matrix(&self, total_cols: usize) -> DMatrix<f64> {
        let mut out = DMatrix::<f64>::zeros(self.rows, total_cols);
        for (dv, block) in self.blocks.values() {
            let base = dv.borrow().column_base();
            let width = block.ncols();
            out.view_mut((0, base), (self.rows, width)).copy_from(block);
        }
        out
    }
}
