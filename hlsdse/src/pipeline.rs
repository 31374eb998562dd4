//! End-to-end pipeline
//!
//! Glue between files on disk and the two entry points of the crate:
//!
//! ```text
//! module.json ─┐
//!              ├─> run_qor_estimation ─> QoRReport (per-region metrics)
//! target.json ─┘
//!              └─> run_multi_level_dse ─> optimized module.json + DseReport
//! ```
//!
//! The target spec is loaded and validated once, when the pipeline is built,
//! so a malformed spec fails before any module is touched.
//!
//! `estimate_batch` estimates independent modules in parallel with rayon;
//! every worker owns its module exclusively.

use rayon::prelude::*;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::dse::{DseEngine, DseError, DseReport};
use crate::metrics::{Cycles, Metrics};
use crate::parse::{load_module_file, save_json, save_module_file, ParseError};
use crate::qor_estimation::{QoREstimator, QoRReport, QoRSummary};
use crate::region::ModuleError;
use crate::target_spec::{DseTargetSpec, TargetSpecError};

// ============================================================================
// Error Types
// ============================================================================

/// Pipeline errors, wrapping the error of the failing stage
#[derive(Debug)]
pub enum PipelineError {
    /// Target spec missing, malformed or out of range
    TargetSpec(TargetSpecError),

    /// Module file unreadable or structurally invalid
    Parse(ParseError),

    /// Module rejected by the estimation pass
    Module(ModuleError),

    /// Search aborted before committing a configuration
    Dse(DseError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::TargetSpec(err) => write!(f, "Target spec error: {}", err),
            PipelineError::Parse(err) => write!(f, "{}", err),
            PipelineError::Module(err) => write!(f, "Invalid module: {}", err),
            PipelineError::Dse(err) => write!(f, "Exploration failed: {}", err),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::TargetSpec(err) => Some(err),
            PipelineError::Parse(err) => Some(err),
            PipelineError::Module(err) => Some(err),
            PipelineError::Dse(err) => Some(err),
        }
    }
}

impl From<TargetSpecError> for PipelineError {
    fn from(err: TargetSpecError) -> Self {
        PipelineError::TargetSpec(err)
    }
}

impl From<ParseError> for PipelineError {
    fn from(err: ParseError) -> Self {
        PipelineError::Parse(err)
    }
}

impl From<ModuleError> for PipelineError {
    fn from(err: ModuleError) -> Self {
        PipelineError::Module(err)
    }
}

impl From<DseError> for PipelineError {
    fn from(err: DseError) -> Self {
        PipelineError::Dse(err)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Pipeline configuration options
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    /// Target spec file (None = unconstrained defaults)
    pub target: Option<PathBuf>,

    /// Where the estimated report or the optimized module is written
    pub output: Option<PathBuf>,

    /// Where the DSE report is written (explore only)
    pub report: Option<PathBuf>,
}

// ============================================================================
// Pipeline Result
// ============================================================================

/// Result of one pipeline run over a single module
#[derive(Clone, Debug)]
pub struct PipelineResult {
    /// Root metrics of the input configuration
    pub baseline: Metrics,

    /// Root metrics after the run (equal to `baseline` for estimate)
    pub summary: QoRSummary,

    /// Search report (explore only)
    pub dse: Option<DseReport>,

    /// baseline latency / final latency, when both are known (explore only)
    pub speedup: Option<f64>,
}

fn speedup(baseline: Cycles, optimized: Cycles) -> Option<f64> {
    match (baseline, optimized) {
        (Cycles::Known(b), Cycles::Known(o)) if o > 0 => Some(b as f64 / o as f64),
        _ => None,
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct HlsPipeline {
    config: PipelineConfig,
    spec: DseTargetSpec,
}

impl HlsPipeline {
    /// Load and validate the target spec named by the config
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let spec = match &config.target {
            Some(path) => {
                log::info!("Loading target spec from {}", path.display());
                DseTargetSpec::from_file(path)?
            }
            None => DseTargetSpec::default(),
        };
        spec.validate()?;
        Ok(HlsPipeline { config, spec })
    }

    pub fn with_spec(config: PipelineConfig, spec: DseTargetSpec) -> Result<Self, PipelineError> {
        spec.validate()?;
        Ok(HlsPipeline { config, spec })
    }

    pub fn spec(&self) -> &DseTargetSpec {
        &self.spec
    }

    /// Estimate one module file; writes the per-region report to `output`
    pub fn estimate_file(&self, path: impl AsRef<Path>) -> Result<PipelineResult, PipelineError> {
        let path = path.as_ref();
        log::info!("Estimating {}", path.display());
        let mut module = load_module_file(path)?;
        let summary = QoREstimator::new(Some(&self.spec.target)).run(&mut module)?;
        for (id, entry) in module.metrics_table().iter() {
            for violation in &entry.violations {
                log::warn!("{}: {}", id, violation);
            }
        }
        if let Some(output) = &self.config.output {
            save_json(&QoRReport::from_module(&module), output)?;
            log::info!("Report written to {}", output.display());
        }
        Ok(PipelineResult {
            baseline: summary.metrics,
            speedup: None,
            summary,
            dse: None,
        })
    }

    /// Explore one module file; writes the optimized module to `output` and
    /// the search report to `report`
    pub fn explore_file(&self, path: impl AsRef<Path>) -> Result<PipelineResult, PipelineError> {
        let path = path.as_ref();
        log::info!("Exploring {}", path.display());
        let mut module = load_module_file(path)?;
        let estimator = QoREstimator::new(Some(&self.spec.target));
        let baseline = estimator.run(&mut module)?.metrics;

        let report = DseEngine::new(self.spec.clone()).explore(&mut module)?;
        let summary = estimator.summary(&module);
        if report.infeasible {
            log::warn!("No configuration of '{}' meets the target", module.name);
        }

        if let Some(output) = &self.config.output {
            save_module_file(&module, output)?;
            log::info!("Optimized module written to {}", output.display());
        }
        if let Some(path) = &self.config.report {
            save_json(&report, path)?;
            log::info!("DSE report written to {}", path.display());
        }
        Ok(PipelineResult {
            baseline,
            speedup: speedup(baseline.latency, report.metrics.latency),
            summary,
            dse: Some(report),
        })
    }

    /// Estimate many module files in parallel, one result per input (in order)
    pub fn estimate_batch(
        &self,
        paths: &[PathBuf],
    ) -> Vec<(PathBuf, Result<QoRSummary, PipelineError>)> {
        let estimator = QoREstimator::new(Some(&self.spec.target));
        paths
            .par_iter()
            .map(|path| {
                let result = load_module_file(path)
                    .map_err(PipelineError::from)
                    .and_then(|mut module| estimator.run(&mut module).map_err(PipelineError::from));
                (path.clone(), result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speedup() {
        assert_eq!(speedup(Cycles::Known(200), Cycles::Known(50)), Some(4.0));
        assert_eq!(speedup(Cycles::Unknown, Cycles::Known(50)), None);
        assert_eq!(speedup(Cycles::Known(10), Cycles::Known(0)), None);
    }

    #[test]
    fn test_invalid_spec_fails_before_modules() {
        let mut spec = DseTargetSpec::default();
        spec.target.clock_period_ns = -1.0;
        assert!(matches!(
            HlsPipeline::with_spec(PipelineConfig::default(), spec),
            Err(PipelineError::TargetSpec(_))
        ));
    }

    #[test]
    fn test_missing_module_file() {
        let pipeline = HlsPipeline::new(PipelineConfig::default()).unwrap();
        let err = pipeline.estimate_file("/nonexistent/m.json").unwrap_err();
        assert!(matches!(err, PipelineError::Parse(ParseError::Io { .. })));
    }
}
