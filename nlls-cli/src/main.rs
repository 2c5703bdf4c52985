use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use nalgebra::{UnitQuaternion, Vector3};
use nlls_core::design_variable::{DesignVariable, EuclideanDirection, EuclideanPoint, RotationQuaternion};
use nlls_core::error_term::SquaredErrorTerm;
use nlls_core::expr::{EuclideanExpr, RotationExpr, VectorExpr};
use nlls_core::linear_system::dense_qr_solver;
use nlls_core::optimizer::{Options, Optimizer, StopReason};
use nlls_core::problem::OptimizationProblem;
use nlls_core::trust_region::{GaussNewton, LevenbergMarquardt};

/// One of the scenarios bundled with this driver, run against
/// `nlls-core` directly rather than through a textual problem format
/// (the core treats file I/O and CLI drivers as an out-of-scope
/// collaborator).
#[derive(Copy, Clone, ValueEnum)]
enum Scenario {
    /// A single point fit to a constant target.
    PointFit,
    /// A point and a rotation jointly fit to a single observation.
    RotatedPointFit,
    /// A direction on S² fit to a target direction.
    DirectionFit,
}

#[derive(Parser)]
#[command(name = "nlls", version, about, long_about = None)]
struct Cli {
    /// Which bundled scenario to run.
    #[arg(value_enum)]
    scenario: Scenario,

    /// Maximum number of outer iterations.
    #[arg(short = 'i', long, default_value_t = 100)]
    max_iterations: usize,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let now = std::time::Instant::now();
    let report = match cli.scenario {
        Scenario::PointFit => run_point_fit(cli.max_iterations),
        Scenario::RotatedPointFit => run_rotated_point_fit(cli.max_iterations),
        Scenario::DirectionFit => run_direction_fit(cli.max_iterations)?,
    };
    print_report(&report, now.elapsed());
    Ok(())
}

struct Report {
    iterations: usize,
    initial_cost: f64,
    final_cost: f64,
    reason: StopReason,
}

fn run_point_fit(max_iterations: usize) -> Report {
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
        Options::default().with_max_iterations(max_iterations),
    );
    let status = optimizer.optimize().expect("point fit is well-posed");
    Report {
        iterations: status.iterations,
        initial_cost: status.initial_cost,
        final_cost: status.final_cost,
        reason: status.reason,
    }
}

fn run_rotated_point_fit(max_iterations: usize) -> Report {
    let mut rot = RotationQuaternion::new(UnitQuaternion::from_scaled_axis(Vector3::new(
        0.3, -0.2, 0.1,
    )));
    rot.set_active(true);
    rot.set_block_index(0);
    let rot_cell = Rc::new(RefCell::new(rot));

    let mut point = EuclideanPoint::<3>::new(Vector3::new(0.2, 0.1, 4.0));
    point.set_active(true);
    point.set_block_index(1);
    let point_cell = Rc::new(RefCell::new(point));

    let r = RotationExpr::from_dv(rot_cell.clone());
    let p = VectorExpr::from_dv(point_cell.clone());
    let target = EuclideanExpr::constant(Vector3::new(0.0, 0.0, 1.0));

    let mut problem = OptimizationProblem::new();
    problem.add_design_variable(rot_cell);
    problem.add_design_variable(point_cell);
    problem.add_error_term(Box::new(SquaredErrorTerm::new(r.rotate(&p) - target)));

    let mut optimizer = Optimizer::new(
        problem,
        Box::new(dense_qr_solver(true)),
        Box::new(LevenbergMarquardt::default()),
        Options::default().with_max_iterations(max_iterations),
    );
    let status = optimizer
        .optimize()
        .expect("rotated point fit is well-posed");
    Report {
        iterations: status.iterations,
        initial_cost: status.initial_cost,
        final_cost: status.final_cost,
        reason: status.reason,
    }
}

fn run_direction_fit(max_iterations: usize) -> anyhow::Result<Report> {
    let mut dv = EuclideanDirection::new(Vector3::new(10.0, 0.0, 0.0))
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    dv.set_active(true);
    let cell = Rc::new(RefCell::new(dv));
    let d = EuclideanExpr::from_direction_dv(cell.clone());
    let target = EuclideanExpr::constant(Vector3::new(0.0, 0.0, 10.0));

    let mut problem = OptimizationProblem::new();
    problem.add_design_variable(cell);
    problem.add_error_term(Box::new(SquaredErrorTerm::new(d - target)));

    let mut optimizer = Optimizer::new(
        problem,
        Box::new(dense_qr_solver(false)),
        Box::new(LevenbergMarquardt::default()),
        Options::default().with_max_iterations(max_iterations),
    );
    let status = optimizer
        .optimize()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(Report {
        iterations: status.iterations,
        initial_cost: status.initial_cost,
        final_cost: status.final_cost,
        reason: status.reason,
    })
}

fn print_report(report: &Report, elapsed: Duration) {
    use colored::Colorize;

    let reason = match report.reason {
        StopReason::Converged => "converged".green(),
        StopReason::MaxIterationsReached => "max iterations reached".yellow(),
    };
    println!("Status: {reason}");
    println!("Iterations: {}", report.iterations);
    println!(
        "Cost: {:.6e} -> {:.6e}",
        report.initial_cost, report.final_cost
    );
    println!("Wall time: {:?}", elapsed);
}
