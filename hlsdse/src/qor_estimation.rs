//! QoR estimation pass
//!
//! The externally invoked entry point of the estimation model. One call
//! validates the module, discards previously attached metrics, walks the
//! hierarchy bottom-up once and leaves a metrics entry (plus budget violations
//! when a [`TargetSpec`] is given) for every region reachable from the root.
//!
//! ```rust
//! use hlsdse::qor_estimation::run_qor_estimation;
//! use hlsdse::region::{ArrayDecl, BlockBody, MemAccess, ModuleBuilder, Storage, TripCount};
//!
//! let mut b = ModuleBuilder::new("copy");
//! let f = b.func(None, "copy");
//! let l = b.loop_(f, "i", TripCount::Static(32));
//! b.block(l, BlockBody {
//!     ops: vec![],
//!     accesses: vec![MemAccess::read("A", &["i"]).unwrap()],
//! });
//! b.array(ArrayDecl::new("A", &[32], Storage::Local));
//! let mut module = b.build().unwrap();
//!
//! let summary = run_qor_estimation(&mut module, None).unwrap();
//! assert_eq!(summary.regions, 3);
//! assert!(summary.metrics.latency.known().is_some());
//! ```
//!
//! The DSE engine uses the restricted mode: after a transform invalidates the
//! affected subtree and its ancestors, [`QoREstimator::refresh`] recomputes
//! only the missing entries.

use serde::{Deserialize, Serialize};

use crate::aggregator::Aggregator;
use crate::cost_model::CostModel;
use crate::metrics::{Metrics, RegionQoR, Violation};
use crate::region::{Module, ModuleError, RegionId};
use crate::target_spec::TargetSpec;

/// Root-level outcome of one estimation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QoRSummary {
    pub module: String,
    pub root: RegionId,
    pub metrics: Metrics,
    /// Number of regions with a metrics entry
    pub regions: usize,
    /// Regions carrying at least one violation
    pub violating_regions: Vec<RegionId>,
}

impl QoRSummary {
    pub fn has_violations(&self) -> bool {
        !self.violating_regions.is_empty()
    }
}

/// Estimation pass bound to an optional target
#[derive(Debug, Clone)]
pub struct QoREstimator {
    target: Option<TargetSpec>,
    model: CostModel,
}

impl Default for QoREstimator {
    fn default() -> Self {
        QoREstimator::new(None)
    }
}

impl QoREstimator {
    pub fn new(target: Option<&TargetSpec>) -> Self {
        QoREstimator {
            target: target.cloned(),
            model: CostModel::new(target),
        }
    }

    pub fn with_model(mut self, model: CostModel) -> Self {
        self.model = model;
        self
    }

    pub fn target(&self) -> Option<&TargetSpec> {
        self.target.as_ref()
    }

    pub fn model(&self) -> &CostModel {
        &self.model
    }

    /// Full pass: validate, discard old metrics, estimate every region
    pub fn run(&self, module: &mut Module) -> Result<QoRSummary, ModuleError> {
        module.validate()?;
        module.metrics.clear();
        self.refresh(module);
        log::debug!(
            "estimated {} regions of '{}'",
            module.metrics.len(),
            module.name
        );
        Ok(self.summary(module))
    }

    /// Recompute every missing entry reachable from the root and return the
    /// root metrics. Present entries are trusted.
    pub fn refresh(&self, module: &mut Module) -> Metrics {
        let mut table = std::mem::take(&mut module.metrics);
        let root = module.root();
        let metrics = Aggregator::new(&self.model, self.target.as_ref()).aggregate(
            module,
            root,
            &mut table,
        );
        module.metrics = table;
        metrics
    }

    /// Re-estimate the subtree of `id` and its ancestors
    pub fn refresh_region(&self, module: &mut Module, id: RegionId) -> Metrics {
        let mut stale = module.subtree(id);
        stale.extend(module.ancestors(id));
        module.metrics.invalidate(stale);
        self.refresh(module)
    }

    pub fn summary(&self, module: &Module) -> QoRSummary {
        let root = module.root();
        let table = module.metrics_table();
        QoRSummary {
            module: module.name.clone(),
            root,
            metrics: table.metrics(root).copied().unwrap_or_else(Metrics::empty),
            regions: table.len(),
            violating_regions: table
                .iter()
                .filter(|(_, entry)| !entry.violations.is_empty())
                .map(|(id, _)| *id)
                .collect(),
        }
    }
}

/// Estimate a whole module, attaching metrics to every region
pub fn run_qor_estimation(
    module: &mut Module,
    target: Option<&TargetSpec>,
) -> Result<QoRSummary, ModuleError> {
    QoREstimator::new(target).run(module)
}

// ============================================================================
// Report
// ============================================================================

/// One row of the per-region report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRow {
    pub id: RegionId,
    pub kind: String,
    pub label: String,
    pub depth: usize,
    pub op_count: usize,
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

/// Per-region metrics in pre-order, as written by `hlsdse estimate --output`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QoRReport {
    pub module: String,
    pub rows: Vec<RegionRow>,
}

impl QoRReport {
    /// Rows for every region with a metrics entry
    pub fn from_module(module: &Module) -> Self {
        let rows = module
            .preorder()
            .into_iter()
            .filter_map(|id| {
                let region = module.region(id)?;
                let RegionQoR {
                    metrics,
                    violations,
                } = module.metrics_table().get(id)?.clone();
                Some(RegionRow {
                    id,
                    kind: region.kind_name().to_string(),
                    label: region.label(),
                    depth: module.depth(id),
                    op_count: module.op_count(id),
                    metrics,
                    violations,
                })
            })
            .collect();
        QoRReport {
            module: module.name.clone(),
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Cycles, ResourceKind};
    use crate::region::{
        ArrayDecl, BlockBody, LoopDirectives, MemAccess, ModuleBuilder, OpKind, Operation,
        Storage, TripCount,
    };

    fn two_loops() -> (Module, RegionId, RegionId) {
        let mut b = ModuleBuilder::new("two");
        let f = b.func(None, "two");
        let l0 = b.loop_(f, "i", TripCount::Static(10));
        b.block(
            l0,
            BlockBody {
                ops: vec![Operation::new(OpKind::Mul, 32)],
                accesses: vec![MemAccess::write("A", &["i"]).unwrap()],
            },
        );
        let l1 = b.loop_(f, "j", TripCount::Static(10));
        b.block(
            l1,
            BlockBody {
                ops: vec![Operation::new(OpKind::Add, 32)],
                accesses: vec![MemAccess::read("A", &["j"]).unwrap()],
            },
        );
        b.array(ArrayDecl::new("A", &[10], Storage::Local));
        (b.build().unwrap(), l0, l1)
    }

    #[test]
    fn test_run_populates_every_region() {
        let (mut module, l0, l1) = two_loops();
        let summary = run_qor_estimation(&mut module, None).unwrap();
        assert_eq!(summary.regions, module.len());
        let a = module.metrics_table().metrics(l0).unwrap().latency;
        let b = module.metrics_table().metrics(l1).unwrap().latency;
        assert_eq!(summary.metrics.latency, a.add(b));
        assert!(!summary.has_violations());
    }

    #[test]
    fn test_run_is_idempotent() {
        let (mut module, _, _) = two_loops();
        let first = run_qor_estimation(&mut module, None).unwrap();
        let table = module.metrics_table().clone();
        let second = run_qor_estimation(&mut module, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(&table, module.metrics_table());
    }

    #[test]
    fn test_violations_are_flagged_not_fatal() {
        let (mut module, _, _) = two_loops();
        let target = TargetSpec::default().with_budget(ResourceKind::ComputeUnit, 1);
        let summary = run_qor_estimation(&mut module, Some(&target)).unwrap();
        assert!(summary.has_violations());
        assert!(summary.violating_regions.contains(&module.root()));
    }

    #[test]
    fn test_refresh_region_matches_full_run() {
        let (mut module, l0, _) = two_loops();
        let estimator = QoREstimator::default();
        estimator.run(&mut module).unwrap();

        if let Some(info) = module.region_mut(l0).and_then(|r| match &mut r.kind {
            crate::region::RegionKind::Loop(info) => Some(info),
            _ => None,
        }) {
            info.directives = LoopDirectives {
                pipeline: true,
                ..Default::default()
            };
        }
        let refreshed = estimator.refresh_region(&mut module, l0);
        let incremental = module.metrics_table().clone();

        let full = estimator.run(&mut module).unwrap();
        assert_eq!(refreshed, full.metrics);
        assert_eq!(&incremental, module.metrics_table());
        assert_ne!(full.metrics.latency, Cycles::Unknown);
    }

    #[test]
    fn test_report_rows_follow_preorder() {
        let (mut module, _, _) = two_loops();
        run_qor_estimation(&mut module, None).unwrap();
        let report = QoRReport::from_module(&module);
        let ids: Vec<RegionId> = report.rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, module.preorder());
        assert_eq!(report.rows[0].depth, 0);
        assert_eq!(report.rows[0].op_count, 2);
    }
}
