//! Property-based invariants 1 (Jacobian correctness), 2 (checkpoint/revert
//! identity) and 4 (inactive DV discard) from spec.md §8, checked across
//! arbitrary design-variable configurations rather than one fixed case.

use super::*;
use crate::design_variable::Scalar;
use crate::error_term::ScalarNonSquaredErrorTerm;
use crate::expr::ScalarExpr;
use proptest::prelude::*;

fn point3(x: f64, y: f64, z: f64) -> EuclideanPoint<3> {
    EuclideanPoint::<3>::new(Vector3::new(x, y, z))
}

proptest! {
    /// Invariant 1 for a point-difference residual: the analytic Jacobian
    /// of `p - target` with respect to `p` is the identity everywhere, and
    /// matches a central finite-difference estimate at any starting point.
    #[test]
    fn point_difference_jacobian_matches_finite_difference(
        x in -50.0..50.0, y in -50.0..50.0, z in -50.0..50.0,
        tx in -50.0..50.0, ty in -50.0..50.0, tz in -50.0..50.0,
    ) {
        let mut dv = point3(x, y, z);
        dv.set_active(true);
        let cell = Rc::new(RefCell::new(dv));
        let p = VectorExpr::from_dv(cell.clone());
        let target = VectorExpr::<3>::constant(Vector3::new(tx, ty, tz));
        let residual = p - target;

        let jac = residual.jacobians();
        let handle: crate::jacobian::DvHandle = cell.clone();
        let analytic = jac.block(&handle).unwrap().clone();

        let h = 1e-8;
        for col in 0..3 {
            let mut delta = [0.0; 3];
            delta[col] = h;
            cell.borrow_mut().boxplus(&delta).unwrap();
            let plus = residual.evaluate();
            cell.borrow_mut().revert();
            delta[col] = -h;
            cell.borrow_mut().boxplus(&delta).unwrap();
            let minus = residual.evaluate();
            cell.borrow_mut().revert();
            let numeric = (plus - minus) / (2.0 * h);
            for row in 0..3 {
                prop_assert!((analytic[(row, col)] - numeric[row]).abs() < 1e-6);
            }
        }
    }

    /// Invariant 1 for a rotated point: `d(C·p)/dδ = -C·(p^)` matches a
    /// central finite-difference estimate for arbitrary rotation and point
    /// starting states.
    #[test]
    fn rotated_point_jacobian_matches_finite_difference(
        ax in -1.0..1.0, ay in -1.0..1.0, az in -1.0..1.0,
        px in -10.0..10.0, py in -10.0..10.0, pz in -10.0..10.0,
    ) {
        let mut rot = RotationQuaternion::new(UnitQuaternion::from_scaled_axis(
            Vector3::new(ax, ay, az),
        ));
        rot.set_active(true);
        rot.set_block_index(0);
        let rot_cell = Rc::new(RefCell::new(rot));

        let mut point = point3(px, py, pz);
        point.set_active(true);
        point.set_block_index(1);
        let point_cell = Rc::new(RefCell::new(point));

        let r = RotationExpr::from_dv(rot_cell.clone());
        let p = VectorExpr::from_dv(point_cell.clone());
        let rotated = r.rotate(&p);

        let jac = rotated.jacobians();
        let handle: crate::jacobian::DvHandle = rot_cell.clone();
        let analytic = jac.block(&handle).unwrap().clone();

        let h = 1e-7;
        for col in 0..3 {
            let mut delta = [0.0; 3];
            delta[col] = h;
            rot_cell.borrow_mut().boxplus(&delta).unwrap();
            let plus = rotated.evaluate();
            rot_cell.borrow_mut().revert();
            delta[col] = -h;
            rot_cell.borrow_mut().boxplus(&delta).unwrap();
            let minus = rotated.evaluate();
            rot_cell.borrow_mut().revert();
            let numeric = (plus - minus) / (2.0 * h);
            for row in 0..3 {
                prop_assert!((analytic[(row, col)] - numeric[row]).abs() < 1e-3);
            }
        }
    }

    /// Invariant 2 for `EuclideanPoint<3>`: boxplus then revert restores the
    /// ambient value byte-for-byte, for any starting point and delta.
    #[test]
    fn point_checkpoint_revert_is_identity(
        x in -100.0..100.0, y in -100.0..100.0, z in -100.0..100.0,
        dx in -1.0..1.0, dy in -1.0..1.0, dz in -1.0..1.0,
    ) {
        let mut dv = point3(x, y, z);
        dv.set_active(true);
        let before = dv.value();
        dv.boxplus(&[dx, dy, dz]).unwrap();
        dv.revert();
        prop_assert_eq!(dv.value(), before);
    }

    /// Invariant 2 for `RotationQuaternion`: boxplus then revert restores
    /// the ambient rotation to within `1e-14`.
    #[test]
    fn rotation_checkpoint_revert_is_identity(
        ax in -1.0..1.0, ay in -1.0..1.0, az in -1.0..1.0,
        dx in -0.5..0.5, dy in -0.5..0.5, dz in -0.5..0.5,
    ) {
        let mut dv = RotationQuaternion::new(UnitQuaternion::from_scaled_axis(
            Vector3::new(ax, ay, az),
        ));
        dv.set_active(true);
        let before = dv.rotation_matrix();
        dv.boxplus(&[dx, dy, dz]).unwrap();
        dv.revert();
        let after = dv.rotation_matrix();
        for i in 0..3 {
            for j in 0..3 {
                prop_assert!((before[(i, j)] - after[(i, j)]).abs() < 1e-14);
            }
        }
    }

    /// Invariant 4: marking a DV inactive and reassembling removes its
    /// columns entirely; the remaining block matches a sub-problem built
    /// without that DV at all.
    #[test]
    fn inactive_dv_discard_matches_sub_problem(
        a0 in -20.0..20.0, target_a in -20.0..20.0,
        b0 in -20.0..20.0, target_b in -20.0..20.0,
    ) {
        let full = {
            let mut dv_a = Scalar::new(a0);
            dv_a.set_active(true);
            dv_a.set_block_index(0);
            let cell_a = Rc::new(RefCell::new(dv_a));

            let mut dv_b = Scalar::new(b0);
            dv_b.set_active(false);
            dv_b.set_block_index(1);
            let cell_b = Rc::new(RefCell::new(dv_b));

            let a = ScalarExpr::from_dv(cell_a.clone());
            let b = ScalarExpr::from_dv(cell_b.clone());
            let ta = ScalarExpr::constant(target_a);
            let tb = ScalarExpr::constant(target_b);

            let mut problem = OptimizationProblem::new();
            problem.add_design_variable(cell_a);
            problem.add_design_variable(cell_b);
            problem.add_error_term(Box::new(ScalarNonSquaredErrorTerm::new(a - ta)));
            problem.add_error_term(Box::new(ScalarNonSquaredErrorTerm::new(b - tb)));

            let mut system = dense_qr_solver(false);
            system.init_matrix_structure(&mut problem);
            system.build_system(&problem, 1, false).unwrap();
            (system.gradient().clone(), system.hessian().clone())
        };

        let sub = {
            let mut dv_a = Scalar::new(a0);
            dv_a.set_active(true);
            dv_a.set_block_index(0);
            let cell_a = Rc::new(RefCell::new(dv_a));

            let a = ScalarExpr::from_dv(cell_a.clone());
            let ta = ScalarExpr::constant(target_a);

            let mut problem = OptimizationProblem::new();
            problem.add_design_variable(cell_a);
            problem.add_error_term(Box::new(ScalarNonSquaredErrorTerm::new(a - ta)));

            let mut system = dense_qr_solver(false);
            system.init_matrix_structure(&mut problem);
            system.build_system(&problem, 1, false).unwrap();
            (system.gradient().clone(), system.hessian().clone())
        };

        prop_assert_eq!(full.0.len(), 1);
        prop_assert_eq!(sub.0.len(), 1);
        prop_assert!((full.0[0] - sub.0[0]).abs() < 1e-12);
        prop_assert!((full.1[(0, 0)] - sub.1[(0, 0)]).abs() < 1e-12);
    }
}
