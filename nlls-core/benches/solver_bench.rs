//! Benchmarks for the nlls-core optimizer.
use std::cell::RefCell;
use std::hint::black_box;
use std::rc::Rc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use nalgebra::Vector3;
use nlls_core::design_variable::{DesignVariable, EuclideanPoint};
use nlls_core::error_term::SquaredErrorTerm;
use nlls_core::expr::VectorExpr;
use nlls_core::linear_system::dense_qr_solver;
use nlls_core::optimizer::{Options, Optimizer};
use nlls_core::problem::OptimizationProblem;
use nlls_core::trust_region::GaussNewton;

fn solve_single_point_fit(c: &mut Criterion) {
    c.bench_function("solve single point fit", |b| {
        b.iter(|| {
            let mut dv = EuclideanPoint::<3>::new(Vector3::zeros());
            dv.set_active(true);
            let cell = Rc::new(RefCell::new(dv));
            let p = VectorExpr::from_dv(cell.clone());
            let target = VectorExpr::<3>::constant(Vector3::new(1.0, 2.0, 3.0));

            let mut problem = OptimizationProblem::new();
            problem.add_design_variable(cell);
            problem.add_error_term(Box::new(SquaredErrorTerm::new(p - target)));

            let mut optimizer = Optimizer::new(
                problem,
                Box::new(dense_qr_solver(false)),
                Box::new(GaussNewton::default()),
                Options::default(),
            );
            let _status = black_box(optimizer.optimize().unwrap());
        });
    });
}

/// Many independent point design variables, each pinned to its own target
/// by its own error term. No coupling, so `H` is block-diagonal, but
/// assembly still touches every design variable's column range.
fn solve_many_independent_points(c: &mut Criterion) {
    let mut group = c.benchmark_group("many_independent_points");
    for num_points in &[10_usize, 100] {
        group.throughput(Throughput::Elements(*num_points as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_points),
            num_points,
            |b, &num_points| {
                b.iter(|| {
                    let mut problem = OptimizationProblem::new();
                    for i in 0..num_points {
                        let mut dv = EuclideanPoint::<3>::new(Vector3::zeros());
                        dv.set_active(true);
                        dv.set_block_index(i);
                        let cell = Rc::new(RefCell::new(dv));
                        let p = VectorExpr::from_dv(cell.clone());
                        let target =
                            VectorExpr::<3>::constant(Vector3::new(1.0, 2.0, i as f64));
                        problem.add_design_variable(cell);
                        problem.add_error_term(Box::new(SquaredErrorTerm::new(p - target)));
                    }

                    let mut optimizer = Optimizer::new(
                        problem,
                        Box::new(dense_qr_solver(false)),
                        Box::new(GaussNewton::default()),
                        Options::default(),
                    );
                    let _status = black_box(optimizer.optimize().unwrap());
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, solve_single_point_fit, solve_many_independent_points);
criterion_main!(benches);
