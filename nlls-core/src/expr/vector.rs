//! Fixed-dimension vector expression nodes, and the 3-dimensional
//! Euclidean specialization used throughout the rotation/transformation
//! expressions (`EuclideanExpr = VectorExpr<3>`).

use super::{insert_dv, skew, DvSet};
use crate::design_variable::{EuclideanDirection, EuclideanPoint};
use crate::jacobian::{DvHandle, JacobianContainer};
use nalgebra::{DMatrix, SVector, Vector3};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub(crate) trait VectorNode<const D: usize>: fmt::Debug {
    fn evaluate(&self) -> SVector<f64, D>;
    fn evaluate_jacobians(&self, acc: &mut JacobianContainer);
    fn collect_design_variables(&self, out: &mut DvSet);
}

#[derive(Debug)]
struct Constant<const D: usize>(SVector<f64, D>);

impl<const D: usize> VectorNode<D> for Constant<D> {
    fn evaluate(&self) -> SVector<f64, D> {
        self.0
    }
    fn evaluate_jacobians(&self, _acc: &mut JacobianContainer) {}
    fn collect_design_variables(&self, _out: &mut DvSet) {}
}

#[derive(Debug)]
struct Leaf<const D: usize>(Rc<RefCell<EuclideanPoint<D>>>);

impl<const D: usize> VectorNode<D> for Leaf<D> {
    fn evaluate(&self) -> SVector<f64, D> {
        self.0.borrow().value()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let handle: DvHandle = self.0.clone();
        acc.add(&handle, DMatrix::identity(D, D));
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        let handle: DvHandle = self.0.clone();
        insert_dv(out, &handle);
    }
}

#[derive(Debug)]
struct DirectionLeaf(Rc<RefCell<EuclideanDirection>>);

impl VectorNode<3> for DirectionLeaf {
    fn evaluate(&self) -> SVector<f64, 3> {
        self.0.borrow().value()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let (basis, magnitude) = {
            let dv = self.0.borrow();
            (dv.basis(), dv.magnitude())
        };
        // value = magnitude * C * e3; only the first two columns of C's
        // right-perturbation generator are free (minimal_dim == 2).
        let full = -basis.matrix() * skew(Vector3::z()) * magnitude;
        let local = DMatrix::from_fn(3, 2, |i, j| full[(i, j)]);
        let handle: DvHandle = self.0.clone();
        acc.add(&handle, local);
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        let handle: DvHandle = self.0.clone();
        insert_dv(out, &handle);
    }
}

#[derive(Debug)]
struct Neg<const D: usize>(VectorExpr<D>);

impl<const D: usize> VectorNode<D> for Neg<D> {
    fn evaluate(&self) -> SVector<f64, D> {
        -self.0.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let mut guard = acc.apply(-DMatrix::identity(D, D));
        self.0.evaluate_jacobians(&mut guard);
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Add<const D: usize>(VectorExpr<D>, VectorExpr<D>);

impl<const D: usize> VectorNode<D> for Add<D> {
    fn evaluate(&self) -> SVector<f64, D> {
        self.0.evaluate() + self.1.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        {
            let mut guard = acc.apply(DMatrix::identity(D, D));
            self.0.evaluate_jacobians(&mut guard);
        }
        {
            let mut guard = acc.apply(DMatrix::identity(D, D));
            self.1.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
        self.1.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Sub<const D: usize>(VectorExpr<D>, VectorExpr<D>);

impl<const D: usize> VectorNode<D> for Sub<D> {
    fn evaluate(&self) -> SVector<f64, D> {
        self.0.evaluate() - self.1.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        {
            let mut guard = acc.apply(DMatrix::identity(D, D));
            self.0.evaluate_jacobians(&mut guard);
        }
        {
            let mut guard = acc.apply(-DMatrix::identity(D, D));
            self.1.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
        self.1.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Scale<const D: usize>(VectorExpr<D>, f64);

impl<const D: usize> VectorNode<D> for Scale<D> {
    fn evaluate(&self) -> SVector<f64, D> {
        self.0.evaluate() * self.1
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let mut guard = acc.apply(DMatrix::identity(D, D) * self.1);
        self.0.evaluate_jacobians(&mut guard);
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
    }
}

/// A fixed-dimension vector-valued node in the expression DAG.
#[derive(Clone, Debug)]
pub struct VectorExpr<const D: usize>(Rc<dyn VectorNode<D>>);

impl<const D: usize> VectorExpr<D> {
    /// Wrap an arbitrary node, for composite kinds defined outside this
    /// module (e.g. rotation-applied-to-vector, SE(3) point transform).
    pub(crate) fn from_node(node: impl VectorNode<D> + 'static) -> Self {
        Self(Rc::new(node))
    }

    /// A constant, design-variable-free vector.
    pub fn constant(value: SVector<f64, D>) -> Self {
        Self(Rc::new(Constant(value)))
    }

    /// A leaf expression reading an [`EuclideanPoint`] design variable.
    pub fn from_dv(dv: Rc<RefCell<EuclideanPoint<D>>>) -> Self {
        Self(Rc::new(Leaf(dv)))
    }

    /// Evaluate the expression's current value.
    pub fn evaluate(&self) -> SVector<f64, D> {
        self.0.evaluate()
    }

    /// Accumulate this expression's Jacobian with respect to every active
    /// upstream design variable into `acc`.
    pub fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        self.0.evaluate_jacobians(acc);
    }

    /// Run a full traversal, returning a fresh `D`-row [`JacobianContainer`].
    pub fn jacobians(&self) -> JacobianContainer {
        let mut acc = JacobianContainer::new(D);
        self.evaluate_jacobians(&mut acc);
        acc
    }

    /// Populate `out` with every active design variable this expression
    /// transitively depends on.
    pub fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
    }

    /// Scale by a constant factor.
    pub fn scale(&self, factor: f64) -> Self {
        Self(Rc::new(Scale(self.clone(), factor)))
    }
}

impl<const D: usize> std::ops::Neg for VectorExpr<D> {
    type Output = VectorExpr<D>;
    fn neg(self) -> VectorExpr<D> {
        VectorExpr(Rc::new(Neg(self)))
    }
}

impl<const D: usize> std::ops::Add for VectorExpr<D> {
    type Output = VectorExpr<D>;
    fn add(self, rhs: VectorExpr<D>) -> VectorExpr<D> {
        VectorExpr(Rc::new(Add(self, rhs)))
    }
}

impl<const D: usize> std::ops::Sub for VectorExpr<D> {
    type Output = VectorExpr<D>;
    fn sub(self, rhs: VectorExpr<D>) -> VectorExpr<D> {
        VectorExpr(Rc::new(Sub(self, rhs)))
    }
}

/// A 3-dimensional Euclidean-valued expression.
pub type EuclideanExpr = VectorExpr<3>;

#[derive(Debug)]
struct Cross(EuclideanExpr, EuclideanExpr);

impl VectorNode<3> for Cross {
    fn evaluate(&self) -> SVector<f64, 3> {
        self.0.evaluate().cross(&self.1.evaluate())
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let (a, b) = (self.0.evaluate(), self.1.evaluate());
        {
            let mut guard = acc.apply(dmatrix_from_matrix3(-skew(b)));
            self.0.evaluate_jacobians(&mut guard);
        }
        {
            let mut guard = acc.apply(dmatrix_from_matrix3(skew(a)));
            self.1.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
        self.1.collect_design_variables(out);
    }
}

pub(crate) fn dmatrix_from_matrix3(m: nalgebra::Matrix3<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(3, 3, |i, j| m[(i, j)])
}

impl EuclideanExpr {
    /// Cross product `self × other`.
    pub fn cross(&self, other: &EuclideanExpr) -> EuclideanExpr {
        VectorExpr(Rc::new(Cross(self.clone(), other.clone())))
    }

    /// A leaf expression reading an [`EuclideanDirection`] design variable.
    pub fn from_direction_dv(dv: Rc<RefCell<EuclideanDirection>>) -> EuclideanExpr {
        VectorExpr(Rc::new(DirectionLeaf(dv)))
    }
}
