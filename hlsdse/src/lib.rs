//! hlsdse: QoR Estimation and Multi-Level Design Space Exploration for HLS
//!
//! This library is the optimization core of a high-level-synthesis flow:
//! 1. Estimate latency and resource usage of an affine loop / dataflow program
//!    under its current directives (pipeline, unroll, tile, partition, dataflow)
//! 2. Explore those directives level by level under a target spec, committing
//!    the best configuration per level
//!
//! # Core Flow
//! ```text
//! module.json → Module ─→ QoR Estimation Pass ─→ Metrics side-table
//!                  ↑              ↑
//!                  │      Cost Model + Aggregator
//!                  │              │
//!          Transform Operators ← DSE Engine ← target spec
//! ```
//!
//! # Module Organization
//!
//! ## Representation
//! - [`region`]: Region arena, arrays, directives, structural validation
//! - [`metrics`]: Cycles, resource usage, violations, metrics side-table
//! - [`target_spec`]: Clock, budgets, calibration and search options
//! - [`parse`]: Module file I/O
//!
//! ## Estimation
//! - [`cost_model`]: Per-region analytical latency / resource model
//! - [`aggregator`]: Sequential and dataflow composition
//! - [`qor_estimation`]: Whole-module and incremental estimation pass
//!
//! ## Exploration
//! - [`transforms`]: Transformation operators and their registry
//! - [`dse`]: Multi-level search, backtracking, Pareto frontier
//!
//! ## Orchestration
//! - [`pipeline`]: File-to-file estimate / explore / batch runs

// ============================================================================
// Representation
// ============================================================================

pub mod metrics;
pub mod parse; // Module file I/O
pub mod region;
pub mod target_spec;

// ============================================================================
// Estimation
// ============================================================================

pub mod aggregator;
pub mod cost_model;
pub mod qor_estimation;

// ============================================================================
// Exploration
// ============================================================================

pub mod dse;
pub mod transforms;

// ============================================================================
// Orchestration
// ============================================================================

pub mod pipeline;

pub use aggregator::{compose, Aggregator};
pub use cost_model::{CostModel, EstimateCtx, OpLatencyTable};
pub use dse::{
    run_multi_level_dse, DesignPoint, DseEngine, DseError, DseReport, LevelReport,
    ParetoFrontier, SearchPhase,
};
pub use metrics::{Cycles, Metrics, MetricsTable, ResourceKind, ResourceUsage, Violation};
pub use parse::{dump_module, load_module_file, parse_module, save_module_file, ParseError};
pub use pipeline::{HlsPipeline, PipelineConfig, PipelineError, PipelineResult};
pub use qor_estimation::{run_qor_estimation, QoREstimator, QoRReport, QoRSummary};
pub use region::{Module, ModuleBuilder, ModuleError, Region, RegionId, RegionKind};
pub use target_spec::{DseOptions, DseTargetSpec, SearchStrategy, TargetSpec, TargetSpecError};
pub use transforms::{
    OperatorRegistry, ParamTarget, ParamValue, TransformError, TransformOperator, TransformParam,
};
