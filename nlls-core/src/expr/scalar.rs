//! Scalar-valued expression nodes.

use super::{insert_dv, DvSet};
use crate::design_variable::Scalar;
use crate::jacobian::{DvHandle, JacobianContainer};
use nalgebra::DMatrix;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A node producing a scalar value.
trait ScalarNode: fmt::Debug {
    fn evaluate(&self) -> f64;
    fn evaluate_jacobians(&self, acc: &mut JacobianContainer);
    fn collect_design_variables(&self, out: &mut DvSet);
}

#[derive(Debug)]
struct Constant(f64);

impl ScalarNode for Constant {
    fn evaluate(&self) -> f64 {
        self.0
    }
    fn evaluate_jacobians(&self, _acc: &mut JacobianContainer) {}
    fn collect_design_variables(&self, _out: &mut DvSet) {}
}

#[derive(Debug)]
struct Leaf(Rc<RefCell<Scalar>>);

impl ScalarNode for Leaf {
    fn evaluate(&self) -> f64 {
        self.0.borrow().value()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let handle: DvHandle = self.0.clone();
        acc.add(&handle, DMatrix::identity(1, 1));
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        let handle: DvHandle = self.0.clone();
        insert_dv(out, &handle);
    }
}

#[derive(Debug)]
struct Neg(ScalarExpr);

impl ScalarNode for Neg {
    fn evaluate(&self) -> f64 {
        -self.0.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let mut guard = acc.apply(DMatrix::from_element(1, 1, -1.0));
        self.0.evaluate_jacobians(&mut guard);
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Add(ScalarExpr, ScalarExpr);

impl ScalarNode for Add {
    fn evaluate(&self) -> f64 {
        self.0.evaluate() + self.1.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        {
            let mut guard = acc.apply(DMatrix::identity(1, 1));
            self.0.evaluate_jacobians(&mut guard);
        }
        {
            let mut guard = acc.apply(DMatrix::identity(1, 1));
            self.1.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
        self.1.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Sub(ScalarExpr, ScalarExpr);

impl ScalarNode for Sub {
    fn evaluate(&self) -> f64 {
        self.0.evaluate() - self.1.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        {
            let mut guard = acc.apply(DMatrix::identity(1, 1));
            self.0.evaluate_jacobians(&mut guard);
        }
        {
            let mut guard = acc.apply(DMatrix::from_element(1, 1, -1.0));
            self.1.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
        self.1.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Mul(ScalarExpr, ScalarExpr);

impl ScalarNode for Mul {
    fn evaluate(&self) -> f64 {
        self.0.evaluate() * self.1.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let (l, r) = (self.0.evaluate(), self.1.evaluate());
        {
            let mut guard = acc.apply(DMatrix::from_element(1, 1, r));
            self.0.evaluate_jacobians(&mut guard);
        }
        {
            let mut guard = acc.apply(DMatrix::from_element(1, 1, l));
            self.1.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
        self.1.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Div(ScalarExpr, ScalarExpr);

impl ScalarNode for Div {
    fn evaluate(&self) -> f64 {
        self.0.evaluate() / self.1.evaluate()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let (l, r) = (self.0.evaluate(), self.1.evaluate());
        {
            let mut guard = acc.apply(DMatrix::from_element(1, 1, 1.0 / r));
            self.0.evaluate_jacobians(&mut guard);
        }
        {
            let mut guard = acc.apply(DMatrix::from_element(1, 1, -l / (r * r)));
            self.1.evaluate_jacobians(&mut guard);
        }
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
        self.1.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Sqrt(ScalarExpr);

impl ScalarNode for Sqrt {
    fn evaluate(&self) -> f64 {
        self.0.evaluate().sqrt()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let s = self.evaluate();
        let mut guard = acc.apply(DMatrix::from_element(1, 1, 1.0 / (2.0 * s)));
        self.0.evaluate_jacobians(&mut guard);
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
    }
}

#[derive(Debug)]
struct Ln(ScalarExpr);

impl ScalarNode for Ln {
    fn evaluate(&self) -> f64 {
        self.0.evaluate().ln()
    }

    fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        let x = self.0.evaluate();
        let mut guard = acc.apply(DMatrix::from_element(1, 1, 1.0 / x));
        self.0.evaluate_jacobians(&mut guard);
    }

    fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
    }
}

/// A scalar-valued node in the expression DAG.
#[derive(Clone, Debug)]
pub struct ScalarExpr(Rc<dyn ScalarNode>);

impl ScalarExpr {
    /// A constant, design-variable-free scalar.
    pub fn constant(value: f64) -> Self {
        Self(Rc::new(Constant(value)))
    }

    /// A leaf expression reading a [`Scalar`] design variable's value.
    pub fn from_dv(dv: Rc<RefCell<Scalar>>) -> Self {
        Self(Rc::new(Leaf(dv)))
    }

    /// Evaluate the expression's current value.
    pub fn evaluate(&self) -> f64 {
        self.0.evaluate()
    }

    /// Accumulate this expression's Jacobian with respect to every active
    /// upstream design variable into `acc`.
    pub fn evaluate_jacobians(&self, acc: &mut JacobianContainer) {
        self.0.evaluate_jacobians(acc);
    }

    /// Run a full traversal, returning a fresh one-row [`JacobianContainer`].
    pub fn jacobians(&self) -> JacobianContainer {
        let mut acc = JacobianContainer::new(1);
        self.evaluate_jacobians(&mut acc);
        acc
    }

    /// Populate `out` with every active design variable this expression
    /// transitively depends on.
    pub fn collect_design_variables(&self, out: &mut DvSet) {
        self.0.collect_design_variables(out);
    }

    /// `sqrt(self)`.
    pub fn sqrt(&self) -> Self {
        Self(Rc::new(Sqrt(self.clone())))
    }

    /// `ln(self)`.
    pub fn ln(&self) -> Self {
        Self(Rc::new(Ln(self.clone())))
    }
}

impl std::ops::Neg for ScalarExpr {
    type Output = ScalarExpr;
    fn neg(self) -> ScalarExpr {
        ScalarExpr(Rc::new(Neg(self)))
    }
}

impl std::ops::Add for ScalarExpr {
    type Output = ScalarExpr;
    fn add(self, rhs: ScalarExpr) -> ScalarExpr {
        ScalarExpr(Rc::new(Add(self, rhs)))
    }
}

impl std::ops::Sub for ScalarExpr {
    type Output = ScalarExpr;
    fn sub(self, rhs: ScalarExpr) -> ScalarExpr {
        ScalarExpr(Rc::new(Sub(self, rhs)))
    }
}

impl std::ops::Mul for ScalarExpr {
    type Output = ScalarExpr;
    fn mul(self, rhs: ScalarExpr) -> ScalarExpr {
        ScalarExpr(Rc::new(Mul(self, rhs)))
    }
}

impl std::ops::Div for ScalarExpr {
    type Output = ScalarExpr;
    fn div(self, rhs: ScalarExpr) -> ScalarExpr {
        ScalarExpr(Rc::new(Div(self, rhs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design_variable::DesignVariable;
    use approx::assert_abs_diff_eq;

    fn active_scalar(value: f64) -> (Rc<RefCell<Scalar>>, ScalarExpr) {
        let mut dv = Scalar::new(value);
        dv.set_active(true);
        dv.set_column_base(0);
        let cell = Rc::new(RefCell::new(dv));
        let expr = ScalarExpr::from_dv(cell.clone());
        (cell, expr)
    }

    #[test]
    fn constant_has_no_jacobian() {
        let c = ScalarExpr::constant(4.0);
        assert_abs_diff_eq!(c.evaluate(), 4.0);
        let jac = c.jacobians();
        assert!(jac.stack_is_empty());
    }

    #[test]
    fn sum_of_two_leaves_matches_finite_difference() {
        let (cell_a, a) = active_scalar(2.0);
        let (_cell_b, b) = active_scalar(3.0);
        let expr = a.clone() + b.clone();
        assert_abs_diff_eq!(expr.evaluate(), 5.0);

        let jac = expr.jacobians();
        assert!(jac.stack_is_empty());
        let handle: crate::jacobian::DvHandle = cell_a.clone();
        let block = jac.block(&handle).expect("block for a");
        assert_abs_diff_eq!(block[(0, 0)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn product_jacobian_matches_finite_difference() {
        let (cell_a, a) = active_scalar(2.0);
        let (cell_b, b) = active_scalar(3.0);
        let expr = a * b;
        let jac = expr.jacobians();

        let handle_a: crate::jacobian::DvHandle = cell_a.clone();
        let handle_b: crate::jacobian::DvHandle = cell_b.clone();
        assert_abs_diff_eq!(jac.block(&handle_a).unwrap()[(0, 0)], 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(jac.block(&handle_b).unwrap()[(0, 0)], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn sqrt_jacobian_matches_finite_difference() {
        let (cell, a) = active_scalar(4.0);
        let expr = a.sqrt();
        assert_abs_diff_eq!(expr.evaluate(), 2.0);

        let jac = expr.jacobians();
        let handle: crate::jacobian::DvHandle = cell.clone();
        let analytic = jac.block(&handle).unwrap()[(0, 0)];

        let h = 1e-6;
        cell.borrow_mut().boxplus(&[h]).unwrap();
        let plus = expr.evaluate();
        cell.borrow_mut().revert();
        cell.borrow_mut().boxplus(&[-h]).unwrap();
        let minus = expr.evaluate();
        cell.borrow_mut().revert();
        let numeric = (plus - minus) / (2.0 * h);

        assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-4);
    }
}
