//! hlsdse CLI
//!
//! Single entry point for estimation and exploration. All commands go through
//! `pipeline.rs`; this file only parses arguments and prints summaries.
//!
//! # Usage
//!
//! ## Estimate a module
//! ```bash
//! cargo run --bin hlsdse -- estimate \
//!   --module gemm.json \
//!   --target target.json \
//!   --output gemm_qor.json
//! ```
//!
//! ## Explore directives under a target
//! ```bash
//! cargo run --bin hlsdse -- dse \
//!   --module gemm.json \
//!   --target target.json \
//!   --output gemm_opt.json \
//!   --report gemm_dse.json \
//!   --verbose
//! ```
//!
//! ## Estimate many modules in parallel
//! ```bash
//! cargo run --bin hlsdse -- batch-estimate data/*.json --target target.json
//! ```
//!
//! Log output goes through `env_logger`; `RUST_LOG` overrides the level set
//! by `--verbose`.

use clap::{Parser, Subcommand};
use env_logger::Env;
use hlsdse::pipeline::{HlsPipeline, PipelineConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hlsdse")]
#[command(about = "hlsdse - QoR estimation and multi-level DSE for HLS")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate latency and resources of every region of a module
    Estimate {
        /// Module file (JSON)
        #[arg(long, short = 'm', value_name = "FILE")]
        module: PathBuf,

        /// Target spec (clock, budgets, calibration)
        #[arg(long, short = 't', value_name = "FILE")]
        target: Option<PathBuf>,

        /// Write the per-region report here
        #[arg(long, short = 'o', value_name = "FILE")]
        output: Option<PathBuf>,

        /// Enable verbose output
        #[arg(long, short = 'v')]
        verbose: bool,
    },

    /// Explore transformation parameters and commit the best per level
    Dse {
        /// Module file (JSON)
        #[arg(long, short = 'm', value_name = "FILE")]
        module: PathBuf,

        /// Target spec with optional `dse` search options
        #[arg(long, short = 't', value_name = "FILE")]
        target: Option<PathBuf>,

        /// Write the optimized module here
        #[arg(long, short = 'o', value_name = "FILE")]
        output: Option<PathBuf>,

        /// Write the search report (levels, design points, frontier) here
        #[arg(long, short = 'r', value_name = "FILE")]
        report: Option<PathBuf>,

        /// Enable verbose output
        #[arg(long, short = 'v')]
        verbose: bool,
    },

    /// Estimate several modules in parallel
    BatchEstimate {
        /// Module files (JSON)
        #[arg(required = true, value_name = "FILES")]
        modules: Vec<PathBuf>,

        /// Target spec shared by all modules
        #[arg(long, short = 't', value_name = "FILE")]
        target: Option<PathBuf>,

        /// Enable verbose output
        #[arg(long, short = 'v')]
        verbose: bool,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Estimate {
            module,
            target,
            output,
            verbose,
        } => {
            init_logging(verbose);
            let pipeline = HlsPipeline::new(PipelineConfig {
                target,
                output,
                report: None,
            })?;
            let result = pipeline.estimate_file(&module)?;
            let summary = &result.summary;
            println!("Module: {}", summary.module);
            println!("  Latency:  {} cycles", summary.metrics.latency);
            println!("  Interval: {} cycles", summary.metrics.interval);
            print_resources(&summary.metrics.resources);
            if summary.has_violations() {
                println!(
                    "  Violations in {} region(s)",
                    summary.violating_regions.len()
                );
            }
        }
        Commands::Dse {
            module,
            target,
            output,
            report,
            verbose,
        } => {
            init_logging(verbose);
            let pipeline = HlsPipeline::new(PipelineConfig {
                target,
                output,
                report,
            })?;
            let result = pipeline.explore_file(&module)?;
            println!("Module: {}", result.summary.module);
            println!("  Baseline latency:  {} cycles", result.baseline.latency);
            println!("  Optimized latency: {} cycles", result.summary.metrics.latency);
            if let Some(speedup) = result.speedup {
                println!("  Speedup: {:.2}x", speedup);
            }
            print_resources(&result.summary.metrics.resources);
            if let Some(dse) = &result.dse {
                println!(
                    "  {} levels, {} evaluations, {} backtracks, {} Pareto points",
                    dse.levels.len(),
                    dse.evaluations,
                    dse.backtracks,
                    dse.frontier.len()
                );
                for level in &dse.levels {
                    let params: Vec<String> = level
                        .params
                        .iter()
                        .map(|p| format!("{}={}", p.target, p.value))
                        .collect();
                    println!("    {}: {}", level.label, params.join(", "));
                }
                if dse.infeasible {
                    println!("  INFEASIBLE: best-effort configuration committed");
                }
            }
        }
        Commands::BatchEstimate {
            modules,
            target,
            verbose,
        } => {
            init_logging(verbose);
            let pipeline = HlsPipeline::new(PipelineConfig {
                target,
                ..Default::default()
            })?;
            let mut failures = 0;
            for (path, result) in pipeline.estimate_batch(&modules) {
                match result {
                    Ok(summary) => println!(
                        "{}: latency {} cycles, {} compute units",
                        path.display(),
                        summary.metrics.latency,
                        summary.metrics.resources.compute_units
                    ),
                    Err(err) => {
                        failures += 1;
                        eprintln!("{}: {}", path.display(), err);
                    }
                }
            }
            if failures > 0 {
                return Err(format!("{} of {} modules failed", failures, modules.len()).into());
            }
        }
    }

    Ok(())
}

fn print_resources(resources: &hlsdse::ResourceUsage) {
    println!("  Resources:");
    println!("    compute units:    {}", resources.compute_units);
    println!("    memory ports:     {}", resources.memory_ports);
    println!("    storage elements: {}", resources.storage_elements);
    println!("    control units:    {}", resources.control_units);
}
