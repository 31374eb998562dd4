//! GEMM directive exploration
//!
//! Loads `data/gemm.json` and `data/target.json`, prints the per-region QoR of
//! the untouched kernel, runs the multi-level DSE and prints what each level
//! committed together with the Pareto frontier of everything evaluated.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example gemm_dse
//! ```

use hlsdse::{
    load_module_file, run_multi_level_dse, DseTargetSpec, QoREstimator, QoRReport,
};
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let data = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data");
    let spec = DseTargetSpec::from_file(data.join("target.json"))?;
    let mut module = load_module_file(data.join("gemm.json"))?;

    println!("\n[BASELINE] {} at {:.1} ns", module.name, spec.target.clock_period_ns);
    let baseline = QoREstimator::new(Some(&spec.target)).run(&mut module)?;
    for row in QoRReport::from_module(&module).rows {
        println!(
            "  {:indent$}{:<20} latency {:>8}  compute {:>3}  ports {:>3}  storage {:>3}",
            "",
            row.label,
            row.metrics.latency.to_string(),
            row.metrics.resources.compute_units,
            row.metrics.resources.memory_ports,
            row.metrics.resources.storage_elements,
            indent = row.depth * 2
        );
    }

    println!("\n[DSE] strategy {:?}", spec.options.strategy);
    let report = run_multi_level_dse(&mut module, Some(&spec))?;
    for level in &report.levels {
        let params: Vec<String> = level
            .params
            .iter()
            .map(|p| format!("{}={}", p.target, p.value))
            .collect();
        println!(
            "  {:<20} {:>3} evaluations  {}{}",
            level.label,
            level.evaluations,
            params.join(" "),
            if level.feasible { "" } else { "  (over budget)" }
        );
    }

    println!(
        "\n[RESULT] latency {} -> {} cycles, {} evaluations, {} backtracks",
        baseline.metrics.latency, report.metrics.latency, report.evaluations, report.backtracks
    );
    if report.infeasible {
        println!("  no configuration meets the target; best effort committed");
    }

    println!("\n[PARETO] {} of {} design points", report.frontier.len(), report.design_points.len());
    for point in report.frontier.iter() {
        let change = point
            .param
            .as_ref()
            .map(|p| format!("{}={}", p.target, p.value))
            .unwrap_or_else(|| "current".to_string());
        println!(
            "  {:>8} cycles  compute {:>3}  storage {:>3}  {}",
            point.latency.to_string(),
            point.resources.compute_units,
            point.resources.storage_elements,
            change
        );
    }

    Ok(())
}
