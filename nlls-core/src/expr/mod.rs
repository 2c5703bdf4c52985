//! The expression DAG: lazily evaluated nodes for scalar, vector, Euclidean,
//! rotation, and transformation values, with reverse-mode Jacobian
//! evaluation against a [`JacobianContainer`](crate::jacobian::JacobianContainer).
//!
//! Every composite node kind wraps its children by shared ownership
//! (`Rc`), since one node may feed more than one parent and the graph is
//! acyclic — plain reference counting is enough, no cycle breaker is
//! needed. Leaf nodes wrap a `Rc<RefCell<dyn DesignVariable>>`-compatible
//! concrete design variable.

pub mod rotation;
pub mod scalar;
pub mod transformation;
pub mod vector;

pub use rotation::RotationExpr;
pub use scalar::ScalarExpr;
pub use transformation::TransformationExpr;
pub use vector::{EuclideanExpr, VectorExpr};

use crate::jacobian::{dv_key, DvHandle};
use nalgebra::{Matrix3, Vector3};
use std::collections::HashMap;

/// Accumulator for [`collect_design_variables`], deduplicated by design
/// variable identity.
pub type DvSet = HashMap<usize, DvHandle>;

pub(crate) fn insert_dv(set: &mut DvSet, dv: &DvHandle) {
    set.entry(dv_key(dv)).or_insert_with(|| dv.clone());
}

/// The skew-symmetric (hat) matrix of a 3-vector, such that
/// `skew(v) * w == v.cross(&w)`.
pub(crate) fn skew(v: Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}
