//! Manifold-valued optimization parameters.
//!
//! Rather than a class hierarchy per manifold kind, each concrete design
//! variable implements the same object-safe [`DesignVariable`] trait so the
//! problem registry can hold a heterogeneous `Vec<Rc<RefCell<dyn
//! DesignVariable>>>`. Expression leaf nodes additionally hold a typed
//! `Rc<RefCell<Concrete>>` so they can read the manifold value directly
//! without going through the trait's flat `get_parameters` representation.

use crate::error::{OptimizerError, OptimizerResult};
use nalgebra::{Rotation3, SVector, UnitQuaternion, Vector3};
use std::cell::RefCell;
use std::rc::Rc;

/// Non-owning vs. owning backing storage for a design variable's ambient
/// value. A `Mapped` variable reads and writes through a shared cell owned
/// elsewhere; the caller is responsible for keeping that cell alive for as
/// long as the design variable exists.
#[derive(Debug, Clone)]
pub enum Storage<T> {
    /// The design variable owns its value directly.
    Owned(T),
    /// The design variable's value lives in an externally owned cell.
    Mapped(Rc<RefCell<T>>),
}

impl<T: Clone> Storage<T> {
    fn get(&self) -> T {
        match self {
            Self::Owned(v) => v.clone(),
            Self::Mapped(cell) => cell.borrow().clone(),
        }
    }

    fn set(&mut self, v: T) {
        match self {
            Self::Owned(slot) => *slot = v,
            Self::Mapped(cell) => *cell.borrow_mut() = v,
        }
    }
}

/// Bookkeeping shared by every design variable kind: activation flag and
/// the two integers the problem registry assigns during layout.
#[derive(Debug, Clone, Copy, Default)]
struct DvMeta {
    active: bool,
    column_base: usize,
    block_index: i64,
}

/// A manifold-valued optimization parameter.
///
/// Implementors must ensure `boxplus` stores the pre-update ambient value
/// into an internal checkpoint before mutating, and that `revert` restores
/// exactly that checkpoint. Only one level of undo is required: a second
/// `boxplus` without an intervening `revert` may discard the older
/// checkpoint.
pub trait DesignVariable: std::fmt::Debug {
    /// Dimension of the tangent space used for `boxplus` updates.
    fn minimal_dim(&self) -> usize;

    /// Whether this variable currently contributes columns to the linear
    /// system.
    fn is_active(&self) -> bool;

    /// Set the activation flag.
    fn set_active(&mut self, active: bool);

    /// Starting column in the assembled linear system.
    fn column_base(&self) -> usize;

    /// Assigned by the problem registry during layout.
    fn set_column_base(&mut self, base: usize);

    /// Ordering key used for deterministic matrix layout.
    fn block_index(&self) -> i64;

    /// Assigned by the problem registry during layout.
    fn set_block_index(&mut self, index: i64);

    /// Apply a tangent-space update, checkpointing the pre-update value.
    fn boxplus(&mut self, delta: &[f64]) -> OptimizerResult<()>;

    /// Restore the checkpoint taken by the most recent `boxplus`.
    fn revert(&mut self);

    /// Flatten the ambient value into a parameter vector.
    fn get_parameters(&self) -> Vec<f64>;

    /// Overwrite the ambient value from a flattened parameter vector,
    /// without touching the checkpoint.
    fn set_parameters(&mut self, params: &[f64]) -> OptimizerResult<()>;
}

fn check_delta_len(delta: &[f64], expected: usize) -> OptimizerResult<()> {
    if delta.len() != expected {
        return Err(OptimizerError::InvalidArgument(format!(
            "boxplus expected a perturbation of length {expected}, got {}",
            delta.len()
        )));
    }
    Ok(())
}

/// A plain Euclidean point in `ℝ^D`; `boxplus` is ordinary vector addition.
#[derive(Debug, Clone)]
pub struct EuclideanPoint<const D: usize> {
    storage: Storage<SVector<f64, D>>,
    checkpoint: SVector<f64, D>,
    meta: DvMeta,
}

impl<const D: usize> EuclideanPoint<D> {
    /// An owned point initialized to `value`.
    pub fn new(value: SVector<f64, D>) -> Self {
        Self {
            storage: Storage::Owned(value),
            checkpoint: value,
            meta: DvMeta::default(),
        }
    }

    /// A point whose storage is a shared, externally owned cell. The cell
    /// must outlive this design variable.
    pub fn mapped(cell: Rc<RefCell<SVector<f64, D>>>) -> Self {
        let checkpoint = cell.borrow().clone();
        Self {
            storage: Storage::Mapped(cell),
            checkpoint,
            meta: DvMeta::default(),
        }
    }

    /// The current ambient value.
    pub fn value(&self) -> SVector<f64, D> {
        self.storage.get()
    }
}

impl<const D: usize> DesignVariable for EuclideanPoint<D> {
    fn minimal_dim(&self) -> usize {
        D
    }

    fn is_active(&self) -> bool {
        self.meta.active
    }

    fn set_active(&mut self, active: bool) {
        self.meta.active = active;
    }

    fn column_base(&self) -> usize {
        self.meta.column_base
    }

    fn set_column_base(&mut self, base: usize) {
        self.meta.column_base = base;
    }

    fn block_index(&self) -> i64 {
        self.meta.block_index
    }

    fn set_block_index(&mut self, index: i64) {
        self.meta.block_index = index;
    }

    fn boxplus(&mut self, delta: &[f64]) -> OptimizerResult<()> {
        check_delta_len(delta, D)?;
        self.checkpoint = self.storage.get();
        let mut updated = self.checkpoint;
        for i in 0..D {
            updated[i] += delta[i];
        }
        self.storage.set(updated);
        Ok(())
    }

    fn revert(&mut self) {
        self.storage.set(self.checkpoint);
    }

    fn get_parameters(&self) -> Vec<f64> {
        self.storage.get().as_slice().to_vec()
    }

    fn set_parameters(&mut self, params: &[f64]) -> OptimizerResult<()> {
        check_delta_len(params, D)?;
        let mut v = SVector::<f64, D>::zeros();
        v.as_mut_slice().copy_from_slice(params);
        self.storage.set(v);
        Ok(())
    }
}

/// A unit quaternion on SO(3). `boxplus` is the right-invariant update
/// `q ← q ⊗ exp(δ)`, consistent with `d(R·x)/dδ = -R·(x^)`.
#[derive(Debug, Clone)]
pub struct RotationQuaternion {
    storage: Storage<UnitQuaternion<f64>>,
    checkpoint: UnitQuaternion<f64>,
    /// Cached rotation matrix, refreshed on every `boxplus`/`set_parameters`.
    cached_matrix: Rotation3<f64>,
    meta: DvMeta,
}

impl RotationQuaternion {
    /// An owned quaternion initialized to `value`.
    pub fn new(value: UnitQuaternion<f64>) -> Self {
        Self {
            storage: Storage::Owned(value),
            checkpoint: value,
            cached_matrix: value.to_rotation_matrix(),
            meta: DvMeta::default(),
        }
    }

    /// A quaternion whose storage is a shared, externally owned cell.
    pub fn mapped(cell: Rc<RefCell<UnitQuaternion<f64>>>) -> Self {
        let value = *cell.borrow();
        Self {
            storage: Storage::Mapped(cell),
            checkpoint: value,
            cached_matrix: value.to_rotation_matrix(),
            meta: DvMeta::default(),
        }
    }

    /// The current unit quaternion.
    pub fn value(&self) -> UnitQuaternion<f64> {
        self.storage.get()
    }

    /// The cached rotation matrix equivalent to [`Self::value`].
    pub fn rotation_matrix(&self) -> Rotation3<f64> {
        self.cached_matrix
    }
}

impl DesignVariable for RotationQuaternion {
    fn minimal_dim(&self) -> usize {
        3
    }

    fn is_active(&self) -> bool {
        self.meta.active
    }

    fn set_active(&mut self, active: bool) {
        self.meta.active = active;
    }

    fn column_base(&self) -> usize {
        self.meta.column_base
    }

    fn set_column_base(&mut self, base: usize) {
        self.meta.column_base = base;
    }

    fn block_index(&self) -> i64 {
        self.meta.block_index
    }

    fn set_block_index(&mut self, index: i64) {
        self.meta.block_index = index;
    }

    fn boxplus(&mut self, delta: &[f64]) -> OptimizerResult<()> {
        check_delta_len(delta, 3)?;
        self.checkpoint = self.storage.get();
        let increment = UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2]));
        let updated = self.checkpoint * increment;
        self.storage.set(updated);
        self.cached_matrix = updated.to_rotation_matrix();
        Ok(())
    }

    fn revert(&mut self) {
        self.storage.set(self.checkpoint);
        self.cached_matrix = self.checkpoint.to_rotation_matrix();
    }

    fn get_parameters(&self) -> Vec<f64> {
        let q = self.storage.get();
        vec![q.i, q.j, q.k, q.w]
    }

    fn set_parameters(&mut self, params: &[f64]) -> OptimizerResult<()> {
        if params.len() != 4 {
            return Err(OptimizerError::InvalidArgument(format!(
                "rotation quaternion parameters must have length 4, got {}",
                params.len()
            )));
        }
        let q = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            params[3], params[0], params[1], params[2],
        ));
        self.storage.set(q);
        self.cached_matrix = q.to_rotation_matrix();
        Ok(())
    }
}

/// A direction on S², represented by an orthonormal basis `C` whose third
/// column is the current unit direction, scaled by a magnitude fixed at
/// construction. Minimal dimension 2: updates rotate `C` around its own
/// first two axes.
#[derive(Debug, Clone)]
pub struct EuclideanDirection {
    storage: Storage<Rotation3<f64>>,
    checkpoint: Rotation3<f64>,
    magnitude: f64,
    meta: DvMeta,
}

impl EuclideanDirection {
    /// Construct from an initial 3-vector; the magnitude is fixed at its
    /// norm and the orthonormal basis `C` is built so its third column is
    /// the unit direction of `initial`.
    pub fn new(initial: Vector3<f64>) -> OptimizerResult<Self> {
        let magnitude = initial.norm();
        if magnitude < 1e-12 {
            return Err(OptimizerError::InvalidArgument(
                "EuclideanDirection cannot be constructed from a zero vector".to_string(),
            ));
        }
        let unit = initial / magnitude;
        let basis = orthonormal_basis_with_last_column(unit);
        Ok(Self {
            storage: Storage::Owned(basis),
            checkpoint: basis,
            magnitude,
            meta: DvMeta::default(),
        })
    }

    /// The represented 3-vector, `magnitude · C[:, 2]`.
    pub fn value(&self) -> Vector3<f64> {
        self.magnitude * self.storage.get().matrix().column(2)
    }

    /// The current orthonormal basis.
    pub fn basis(&self) -> Rotation3<f64> {
        self.storage.get()
    }

    /// The fixed magnitude.
    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }
}

/// Build a right-handed orthonormal basis whose third column is `unit`.
fn orthonormal_basis_with_last_column(unit: Vector3<f64>) -> Rotation3<f64> {
    let helper = if unit.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let b0 = (helper - unit * helper.dot(&unit)).normalize();
    let b1 = unit.cross(&b0);
    Rotation3::from_matrix_unchecked(nalgebra::Matrix3::from_columns(&[b0, b1, unit]))
}

impl DesignVariable for EuclideanDirection {
    fn minimal_dim(&self) -> usize {
        2
    }

    fn is_active(&self) -> bool {
        self.meta.active
    }

    fn set_active(&mut self, active: bool) {
        self.meta.active = active;
    }

    fn column_base(&self) -> usize {
        self.meta.column_base
    }

    fn set_column_base(&mut self, base: usize) {
        self.meta.column_base = base;
    }

    fn block_index(&self) -> i64 {
        self.meta.block_index
    }

    fn set_block_index(&mut self, index: i64) {
        self.meta.block_index = index;
    }

    fn boxplus(&mut self, delta: &[f64]) -> OptimizerResult<()> {
        check_delta_len(delta, 2)?;
        self.checkpoint = self.storage.get();
        let increment = Rotation3::from_scaled_axis(Vector3::new(delta[0], delta[1], 0.0));
        let updated = self.checkpoint * increment;
        self.storage.set(updated);
        Ok(())
    }

    fn revert(&mut self) {
        self.storage.set(self.checkpoint);
    }

    fn get_parameters(&self) -> Vec<f64> {
        self.value().as_slice().to_vec()
    }

    fn set_parameters(&mut self, params: &[f64]) -> OptimizerResult<()> {
        if params.len() != 3 {
            return Err(OptimizerError::InvalidArgument(format!(
                "EuclideanDirection parameters must have length 3, got {}",
                params.len()
            )));
        }
        let v = Vector3::new(params[0], params[1], params[2]);
        let magnitude = v.norm();
        if magnitude < 1e-12 {
            return Err(OptimizerError::InvalidArgument(
                "cannot set EuclideanDirection parameters to a zero vector".to_string(),
            ));
        }
        self.magnitude = magnitude;
        self.storage.set(orthonormal_basis_with_last_column(v / magnitude));
        Ok(())
    }
}

/// A scalar optimization parameter.
#[derive(Debug, Clone)]
pub struct Scalar {
    storage: Storage<f64>,
    checkpoint: f64,
    meta: DvMeta,
}

impl Scalar {
    /// An owned scalar initialized to `value`.
    pub fn new(value: f64) -> Self {
        Self {
            storage: Storage::Owned(value),
            checkpoint: value,
            meta: DvMeta::default(),
        }
    }

    /// A scalar whose storage is a shared, externally owned cell.
    pub fn mapped(cell: Rc<RefCell<f64>>) -> Self {
        let checkpoint = *cell.borrow();
        Self {
            storage: Storage::Mapped(cell),
            checkpoint,
            meta: DvMeta::default(),
        }
    }

    /// The current value.
    pub fn value(&self) -> f64 {
        self.storage.get()
    }
}

impl DesignVariable for Scalar {
    fn minimal_dim(&self) -> usize {
        1
    }

    fn is_active(&self) -> bool {
        self.meta.active
    }

    fn set_active(&mut self, active: bool) {
        self.meta.active = active;
    }

    fn column_base(&self) -> usize {
        self.meta.column_base
    }

    fn set_column_base(&mut self, base: usize) {
        self.meta.column_base = base;
    }

    fn block_index(&self) -> i64 {
        self.meta.block_index
    }

    fn set_block_index(&mut self, index: i64) {
        self.meta.block_index = index;
    }

    fn boxplus(&mut self, delta: &[f64]) -> OptimizerResult<()> {
        check_delta_len(delta, 1)?;
        self.checkpoint = self.storage.get();
        self.storage.set(self.checkpoint + delta[0]);
        Ok(())
    }

    fn revert(&mut self) {
        self.storage.set(self.checkpoint);
    }

    fn get_parameters(&self) -> Vec<f64> {
        vec![self.storage.get()]
    }

    fn set_parameters(&mut self, params: &[f64]) -> OptimizerResult<()> {
        check_delta_len(params, 1)?;
        self.storage.set(params[0]);
        Ok(())
    }
}
