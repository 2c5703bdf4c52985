//! Rotation-valued (SO(3)) expression nodes.
//!
//! Rotation Jacobians follow the right-perturbation convention fixed by
//! `§4.2`: `R ⊞ δ = R · exp(δ^)`, so `d(R·x)/dδ = -R·(x^)`. This
//! convention must stay consistent across every rotation-valued node and
//! every consumer (notably [`super::vector`]'s `RotatedVector`), or the
//! gain-ratio test in the trust-region loop silently breaks.

use super::vector::{dmatrix_from_matrix3, VectorNode};
use super::{insert_dv, skew, DvSet, EuclideanExpr};
use crate::design_variable::RotationQuaternion;
use crate::jacobian::{DvHandle, JacobianContainer};
use nalgebra::{DMatrix, Rotation3, SVector};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

trait RotationNode: fmt::Debug {
    fn evaluate(&self) -> Rotation3<f64>;
    fn evaluate_jacobians(&self, acc: &mut JacobianContainer);
    fn collect_design_variables(&self, out: &mut DvSet);
}

#[derive(Debug)]
struct Leaf(Rc<RefCell<RotationQuaternion>>);

impl RotationNode for Leaf {
    fn evaluate(&self) -> Rotation3<f64> {
        self.0.borrow().rotation_matrix()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let handle: DvHandle = self.0.clone();
        acc.add(&handle, DMatrix::identity(3, 3));
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        let handle: DvHandle = self.0.clone();
        insert_dv(out, &handle);
    }
}

#[derive(Debug)]
struct Product(RotationExpr, RotationExpr);

impl RotationNode for Product {
    fn evaluate(&self) -> Rotation3<f64> {
        self.0.evaluate() * self.1.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let b = self.1.evaluate();
        {
            // d(A*B)/dδ_A = Bᵀ
            let mut guard = acc.apply(dmatrix_from_matrix3(*b.inverse().matrix()));
            self.0.evaluate_jacobians(&mut guard);
        }
        {
            // d(A*B)/dδ_B = I
            let mut guard = acc.apply(DMatrix::identity(3, 3));
            self.1.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
        self.1.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Inverse(RotationExpr);

impl RotationNode for Inverse {
    fn evaluate(&self) -> Rotation3<f64> {
        self.0.evaluate().inverse()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        // d(Aᵀ)/dδ_A = -A
        let a = self.0.evaluate();
        let mut guard = acc.apply(dmatrix_from_matrix3(-*a.matrix()));
        self.0.evaluate_jacobians(&mut guard);
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
    }
}

/// A rotation-valued (SO(3)) node in the expression DAG.
#[derive(Clone, Debug)]
pub struct RotationExpr(Rc<dyn RotationNode>);

impl RotationExpr {
    /// A leaf expression reading a [`RotationQuaternion`] design variable.
    pub fn from_dv(dv: Rc<RefCell<RotationQuaternion>>) -> Self {
        Self(Rc::new(Leaf(dv)))
    }

    /// Evaluate the expression's current rotation matrix.
    pub fn evaluate(&self) -> Rotation3<f64> {
        self.0.evaluate()
    }

    /// Accumulate this expression's Jacobian with respect to every active
    /// upstream design variable into `acc`.
    pub fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        self.0.evaluate_jacobians(acc);
    }

    /// Run a full traversal, returning a fresh 3-row [`JacobianContainer`].
    pub fn jacobians(&self) -> JacobianContainer {
        let mut acc = JacobianContainer::new(3);
        self.evaluate_jacobians(&mut acc);
        acc
    }

    /// Populate `out` with every active design variable this expression
    /// transitively depends on.
    pub fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
    }

    /// Rotation composition `self * other`.
    pub fn compose(&self, other: &RotationExpr) -> RotationExpr {
        RotationExpr(Rc::new(Product(self.clone(), other.clone())))
    }

    /// `self⁻¹`.
    pub fn inverse(&self) -> RotationExpr {
        RotationExpr(Rc::new(Inverse(self.clone())))
    }

    /// Apply this rotation to a Euclidean point: `self * point`.
    pub fn rotate(&self, point: &EuclideanExpr) -> EuclideanExpr {
        EuclideanExpr::from_node(RotatedVector(self.clone(), point.clone()))
    }
}

#[derive(Debug)]
struct RotatedVector(RotationExpr, EuclideanExpr);

impl VectorNode<3> for RotatedVector {
    fn evaluate(&self) -> SVector<f64, 3> {
        self.0.evaluate() * self.1.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let r = self.0.evaluate();
        let x = self.1.evaluate();
        {
            // d(R·x)/dδ_R = -R·(x^)
            let mut guard = acc.apply(dmatrix_from_matrix3(-r.matrix() * skew(x)));
            self.0.evaluate_jacobians(&mut guard);
        }
        {
            // d(R·x)/dx = R
            let mut guard = acc.apply(dmatrix_from_matrix3(*r.matrix()));
            self.1.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
        self.1.collect_design_variables(out);
    }
}
