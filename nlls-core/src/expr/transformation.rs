//! SE(3) transformation expressions: a rotation paired with a translation,
//! applied to Euclidean (or, equivalently, homogeneous) points.
//!
//! There is no dedicated SE(3) design variable or chain-rule node kind —
//! a transformation is simply a `(RotationExpr, EuclideanExpr)` pair, and
//! `transform_point` composes the rotate-then-translate Jacobian directly.
//! Transforming a homogeneous 4-vector `[p; 1]` reduces to the same affine
//! map since a rigid transform's bottom row is fixed at `[0 0 0 1]`.

use super::rotation::RotationExpr;
use super::vector::{dmatrix_from_matrix3, VectorNode};
use super::{skew, DvSet, EuclideanExpr};
use crate::jacobian::JacobianContainer;
use nalgebra::SVector;
use std::fmt;

/// A rigid transformation expression: `y = R·p + t`.
#[derive(Clone, Debug)]
pub struct TransformationExpr {
    rotation: RotationExpr,
    translation: EuclideanExpr,
}

impl TransformationExpr {
    /// Construct from a rotation and translation expression.
    pub fn new(rotation: RotationExpr, translation: EuclideanExpr) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// The rotation component.
    pub fn rotation(&self) -> &RotationExpr {
        &self.rotation
    }

    /// The translation component.
    pub fn translation(&self) -> &EuclideanExpr {
        &self.translation
    }

    /// Apply this transformation to a Euclidean (or homogeneous) point:
    /// `R·p + t`.
    pub fn transform_point(&self, point: &EuclideanExpr) -> EuclideanExpr {
        EuclideanExpr::from_node(TransformApply {
            rotation: self.rotation.clone(),
            translation: self.translation.clone(),
            point: point.clone(),
        })
    }
}

#[derive(Debug)]
struct TransformApply {
    rotation: RotationExpr,
    translation: EuclideanExpr,
    point: EuclideanExpr,
}

impl VectorNode<3> for TransformApply {
    fn evaluate(&self) -> SVector<f64, 3> {
        self.rotation.evaluate() * self.point.evaluate() + self.translation.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let r = self.rotation.evaluate();
        let p = self.point.evaluate();
        {
            let mut guard = acc.apply(dmatrix_from_matrix3(-r.matrix() * skew(p)));
            self.rotation.evaluate_jacobians(&mut guard);
        }
        {
            let mut guard = acc.apply(dmatrix_from_matrix3(*r.matrix()));
            self.point.evaluate_jacobians(&mut guard);
        }
        {
            let mut guard = acc.apply(nalgebra::DMatrix::identity(3, 3));
            self.translation.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.rotation.collect_design_variables(out);
        self.point.collect_design_variables(out);
        self.translation.collect_design_variables(out);
    }
}
