//! Multi-level design space exploration
//!
//! Greedy hierarchical search over transformation-operator parameters:
//!
//! ```text
//! Initializing            validate spec + module, full estimation
//!      ↓
//! for each level (bottom-up or top-down):
//!   EnumeratingCandidates   operator priority → target → domain value
//!   Evaluating              apply, refresh affected subtree + ancestors
//!   Committing              keep if it improves on best-so-far, else revert
//!   Backtracking            level infeasible → re-search previous level
//!      ↓
//! Done                    final estimation with the target spec
//! ```
//!
//! # Search Semantics
//!
//! - A *level* is a region at which at least one registered operator
//!   applies. Bottom-up visits the deepest levels first; ties follow
//!   pre-order.
//! - The first candidate of every level is the current configuration. The
//!   rest are single-parameter moves, tried coordinate-wise: each operator in
//!   priority order, each of its targets, each domain value except the
//!   current one. Domains are computed when their target is reached, so they
//!   see the moves already committed at this level.
//! - Candidates are ranked by [`Candidate::improves_on`]. Ties keep the
//!   candidate found first, which makes the search reproducible.
//! - A candidate budget caps evaluations per level search. A budget of 1
//!   commits the current configuration untouched.
//!
//! # Backtracking
//!
//! When a level ends with root resources over budget, the most recently
//! committed level is popped and searched again with the current level held.
//! If that makes the design fit, the current level is searched again and both
//! are committed. Otherwise the engine keeps stepping back. With no level
//! left (or `max_backtracks` spent) the level is recorded infeasible and the
//! search continues best-effort.
//!
//! # Mutation
//!
//! The module is mutated in place. Every trial snapshots the metrics entries
//! it is about to invalidate; a rejected trial restores both the parameter
//! and the snapshot, leaving the module exactly as it was.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::time::Instant;
use thiserror::Error;

use crate::metrics::{Cycles, Metrics, MetricsSnapshot, ResourceUsage};
use crate::qor_estimation::QoREstimator;
use crate::region::{Module, ModuleError, RegionId};
use crate::target_spec::{DseTargetSpec, SearchStrategy, TargetSpecError};
use crate::transforms::{
    OperatorRegistry, ParamDelta, ParamTarget, ParamValue, TransformError, TransformOperator,
    TransformParam,
};

#[derive(Error, Debug)]
pub enum DseError {
    #[error("invalid target spec: {0}")]
    TargetSpec(#[from] TargetSpecError),

    #[error("invalid module: {0}")]
    Module(#[from] ModuleError),

    #[error("operator '{0}' in the priority list is not registered")]
    UnknownOperator(String),

    #[error("failed to revert a rejected candidate: {0}")]
    Revert(#[from] TransformError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchPhase {
    Initializing,
    EnumeratingCandidates,
    Evaluating,
    Committing,
    Backtracking,
    Done,
}

// ============================================================================
// Candidates and Design Points
// ============================================================================

/// One evaluated configuration of a level
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// The single move that produced it (None for the current configuration)
    pub param: Option<TransformParam>,
    pub level_latency: Cycles,
    pub root: Metrics,
    /// Root resources within every budget
    pub feasible: bool,
    /// Normalized budget excess (0 when feasible)
    pub overshoot: f64,
}

impl Candidate {
    /// Strict improvement over `best`.
    ///
    /// Feasible beats infeasible. Among feasible candidates lower level
    /// latency wins, and equal latency needs Pareto-lower root resources.
    /// Among infeasible ones smaller overshoot wins, then the same latency
    /// rule. Unknown latency never beats a known one.
    pub fn improves_on(&self, best: &Candidate) -> bool {
        match (self.feasible, best.feasible) {
            (true, false) => true,
            (false, true) => false,
            (true, true) => self.faster_than(best),
            (false, false) => {
                if self.overshoot < best.overshoot {
                    true
                } else if self.overshoot > best.overshoot {
                    false
                } else {
                    self.faster_than(best)
                }
            }
        }
    }

    fn faster_than(&self, best: &Candidate) -> bool {
        let fewer_resources = self.root.resources.strictly_below(&best.root.resources);
        match (self.level_latency, best.level_latency) {
            (Cycles::Known(a), Cycles::Known(b)) => a < b || (a == b && fewer_resources),
            (Cycles::Known(_), Cycles::Unknown) => true,
            (Cycles::Unknown, Cycles::Known(_)) => false,
            (Cycles::Unknown, Cycles::Unknown) => fewer_resources,
        }
    }
}

/// Root-level outcome of one evaluated candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignPoint {
    pub level: RegionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<TransformParam>,
    pub latency: Cycles,
    pub resources: ResourceUsage,
    pub feasible: bool,
}

impl DesignPoint {
    fn dominates(&self, other: &DesignPoint) -> bool {
        match (self.latency, other.latency) {
            (Cycles::Known(a), Cycles::Known(b)) => {
                a <= b
                    && self.resources.fits_within(&other.resources)
                    && (a < b || self.resources != other.resources)
            }
            _ => false,
        }
    }
}

/// Non-dominated known-latency design points, in evaluation order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParetoFrontier {
    pub points: Vec<DesignPoint>,
}

impl ParetoFrontier {
    pub fn from_points(points: &[DesignPoint]) -> Self {
        let mut frontier: Vec<DesignPoint> = Vec::new();
        for (i, p) in points.iter().enumerate() {
            if p.latency.is_unknown() {
                continue;
            }
            let dominated = points.iter().any(|q| q.dominates(p));
            let duplicate = points[..i]
                .iter()
                .any(|q| q.latency == p.latency && q.resources == p.resources);
            if !dominated && !duplicate {
                frontier.push(p.clone());
            }
        }
        ParetoFrontier { points: frontier }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DesignPoint> {
        self.points.iter()
    }
}

// ============================================================================
// Report
// ============================================================================

/// Committed configuration of one level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelReport {
    pub region: RegionId,
    pub label: String,
    /// Full parameter assignment of the level after commit
    pub params: Vec<TransformParam>,
    pub metrics: Metrics,
    pub evaluations: usize,
    pub feasible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DseReport {
    pub module: String,
    pub strategy: SearchStrategy,
    pub levels: Vec<LevelReport>,
    /// Root metrics after the final estimation
    pub metrics: Metrics,
    /// Resources over budget or latency budget missed
    pub infeasible: bool,
    pub evaluations: usize,
    pub backtracks: usize,
    pub design_points: Vec<DesignPoint>,
    pub frontier: ParetoFrontier,
}

// ============================================================================
// Engine
// ============================================================================

/// An applied candidate that can still be undone
struct Trial {
    delta: ParamDelta,
    snapshot: MetricsSnapshot,
}

/// Mutable bookkeeping of one `explore` call
struct SearchLog {
    phase: SearchPhase,
    evaluations: usize,
    backtracks: usize,
    design_points: Vec<DesignPoint>,
}

impl SearchLog {
    fn enter(&mut self, phase: SearchPhase) {
        if self.phase != phase {
            log::trace!("phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }
}

pub struct DseEngine {
    spec: DseTargetSpec,
    registry: OperatorRegistry,
    estimator: QoREstimator,
    phase: SearchPhase,
}

impl DseEngine {
    pub fn new(spec: DseTargetSpec) -> Self {
        let estimator = QoREstimator::new(Some(&spec.target));
        DseEngine {
            spec,
            registry: OperatorRegistry::standard(),
            estimator,
            phase: SearchPhase::Initializing,
        }
    }

    pub fn with_registry(mut self, registry: OperatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn spec(&self) -> &DseTargetSpec {
        &self.spec
    }

    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    /// Phase reached by the last `explore` call
    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    fn operators(&self) -> Vec<&dyn TransformOperator> {
        self.registry.ordered(&self.spec.options.operator_priority)
    }

    /// Regions searched, in visiting order
    pub fn levels(&self, module: &Module) -> Vec<RegionId> {
        let mut levels: Vec<(usize, usize, RegionId)> = module
            .preorder()
            .into_iter()
            .enumerate()
            .filter(|(_, id)| self.registry.applies_anywhere(module, *id))
            .map(|(order, id)| (module.depth(id), order, id))
            .collect();
        match self.spec.options.strategy {
            SearchStrategy::BottomUp => {
                levels.sort_by_key(|(depth, order, _)| (Reverse(*depth), *order))
            }
            SearchStrategy::TopDown => levels.sort_by_key(|(depth, order, _)| (*depth, *order)),
        }
        levels.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Run the search, mutating `module` into the committed configuration
    pub fn explore(&mut self, module: &mut Module) -> Result<DseReport, DseError> {
        self.phase = SearchPhase::Initializing;
        self.spec.validate()?;
        for name in &self.spec.options.operator_priority {
            if self.registry.get(name).is_none() {
                return Err(DseError::UnknownOperator(name.clone()));
            }
        }
        let mut log = SearchLog {
            phase: SearchPhase::Initializing,
            evaluations: 0,
            backtracks: 0,
            design_points: Vec::new(),
        };
        let result = self.search(module, &mut log);
        self.phase = log.phase;
        result
    }

    fn search(&self, module: &mut Module, log: &mut SearchLog) -> Result<DseReport, DseError> {
        let start = Instant::now();
        let baseline = self.estimator.run(module)?;
        let levels = self.levels(module);
        log::info!(
            "[Step 1/3] '{}': {} levels, baseline latency {}",
            module.name,
            levels.len(),
            baseline.metrics.latency
        );

        log::info!("[Step 2/3] Searching levels ({:?})...", self.spec.options.strategy);
        let mut reports: Vec<LevelReport> = Vec::with_capacity(levels.len());
        let mut committed: Vec<usize> = Vec::new();
        for level in levels {
            let mut current = self.search_level(module, level, log)?;
            if !current.feasible {
                current =
                    self.backtrack(module, level, current, &mut committed, &mut reports, log)?;
            }
            if !current.feasible {
                log::warn!("{}: no configuration fits the budget", current.label);
            }
            committed.push(reports.len());
            reports.push(current);
        }

        log.enter(SearchPhase::Done);
        let summary = self.estimator.run(module)?;
        let target = &self.spec.target;
        let over_budget = !target.resources_fit(&summary.metrics);
        let late = target.meets_latency(&summary.metrics) == Some(false);
        if target.latency_budget.is_some() && summary.metrics.is_unknown() {
            log::warn!("latency budget set but final latency is unknown");
        }
        log::info!(
            "[Step 3/3] Done in {:.2}s: latency {}, {} evaluations, {} backtracks{}",
            start.elapsed().as_secs_f64(),
            summary.metrics.latency,
            log.evaluations,
            log.backtracks,
            if over_budget || late { " (infeasible)" } else { "" }
        );

        let frontier = ParetoFrontier::from_points(&log.design_points);
        Ok(DseReport {
            module: module.name.clone(),
            strategy: self.spec.options.strategy,
            levels: reports,
            metrics: summary.metrics,
            infeasible: over_budget || late,
            evaluations: log.evaluations,
            backtracks: log.backtracks,
            design_points: std::mem::take(&mut log.design_points),
            frontier,
        })
    }

    /// Step back through committed levels until `level` fits or none is left
    fn backtrack(
        &self,
        module: &mut Module,
        level: RegionId,
        mut current: LevelReport,
        committed: &mut Vec<usize>,
        reports: &mut [LevelReport],
        log: &mut SearchLog,
    ) -> Result<LevelReport, DseError> {
        while !current.feasible && log.backtracks < self.spec.options.max_backtracks {
            let previous = match committed.pop() {
                Some(index) => index,
                None => break,
            };
            log.enter(SearchPhase::Backtracking);
            log.backtracks += 1;
            let region = reports[previous].region;
            log::debug!(
                "backtracking from {} to {}",
                current.label,
                reports[previous].label
            );

            let redo = self.search_level(module, region, log)?;
            let fixed = redo.feasible;
            reports[previous] = redo;
            if fixed {
                current = self.search_level(module, level, log)?;
                committed.push(previous);
            }
        }
        Ok(current)
    }

    /// Coordinate-wise search of one level; leaves the best candidate applied
    fn search_level(
        &self,
        module: &mut Module,
        level: RegionId,
        log: &mut SearchLog,
    ) -> Result<LevelReport, DseError> {
        let budget = self.spec.options.candidate_budget.unwrap_or(usize::MAX);
        let mut evaluations = 1;
        log.enter(SearchPhase::Evaluating);
        log.evaluations += 1;
        let root = self.estimator.refresh(module);
        let mut best = self.candidate(module, level, root, None);
        log.design_points.push(self.design_point(level, &best));

        'operators: for op in self.operators() {
            log.enter(SearchPhase::EnumeratingCandidates);
            for target in op.targets(module, level) {
                let domain = op.domain(module, &target);
                let mut current = match module.param(&target) {
                    Ok(value) => value,
                    Err(err) => {
                        log::debug!("skipping {}: {}", target, err);
                        continue;
                    }
                };
                for value in domain {
                    if value == current {
                        continue;
                    }
                    if evaluations >= budget {
                        break 'operators;
                    }
                    evaluations += 1;
                    log.evaluations += 1;
                    log.enter(SearchPhase::Evaluating);

                    let trial = match self.try_candidate(module, op, &target, value) {
                        Ok(trial) => trial,
                        Err(err) => {
                            log::debug!("{} = {} rejected: {}", target, value, err);
                            continue;
                        }
                    };
                    let root = self.estimator.refresh(module);
                    let param = TransformParam {
                        operator: op.name().to_string(),
                        target: target.clone(),
                        value,
                    };
                    let candidate = self.candidate(module, level, root, Some(param));
                    log.design_points.push(self.design_point(level, &candidate));

                    log.enter(SearchPhase::Committing);
                    if candidate.improves_on(&best) {
                        log::debug!(
                            "{} = {}: level latency {} (feasible: {})",
                            target,
                            value,
                            candidate.level_latency,
                            candidate.feasible
                        );
                        best = candidate;
                        current = value;
                    } else {
                        self.revert(module, trial)?;
                    }
                }
            }
        }

        let label = module
            .region(level)
            .map(|r| r.label())
            .unwrap_or_else(|| level.to_string());
        let metrics = module
            .metrics_table()
            .metrics(level)
            .copied()
            .unwrap_or_else(Metrics::empty);
        Ok(LevelReport {
            region: level,
            label,
            params: self.committed_params(module, level),
            metrics,
            evaluations,
            feasible: best.feasible,
        })
    }

    fn try_candidate(
        &self,
        module: &mut Module,
        op: &dyn TransformOperator,
        target: &ParamTarget,
        value: ParamValue,
    ) -> Result<Trial, TransformError> {
        let snapshot = module.metrics.snapshot(module.stale_regions(target));
        let delta = op.apply(module, target, value)?;
        Ok(Trial { delta, snapshot })
    }

    fn revert(&self, module: &mut Module, trial: Trial) -> Result<(), TransformError> {
        module.restore(&trial.delta)?;
        module.metrics.restore(trial.snapshot);
        Ok(())
    }

    fn candidate(
        &self,
        module: &Module,
        level: RegionId,
        root: Metrics,
        param: Option<TransformParam>,
    ) -> Candidate {
        let target = &self.spec.target;
        Candidate {
            param,
            level_latency: module
                .metrics_table()
                .metrics(level)
                .map_or(Cycles::Unknown, |m| m.latency),
            root,
            feasible: target.resources_fit(&root),
            overshoot: target.overshoot(&root),
        }
    }

    fn design_point(&self, level: RegionId, candidate: &Candidate) -> DesignPoint {
        DesignPoint {
            level,
            param: candidate.param.clone(),
            latency: candidate.root.latency,
            resources: candidate.root.resources,
            feasible: candidate.feasible,
        }
    }

    fn committed_params(&self, module: &Module, level: RegionId) -> Vec<TransformParam> {
        let mut params = Vec::new();
        for op in self.operators() {
            for target in op.targets(module, level) {
                if let Ok(value) = module.param(&target) {
                    params.push(TransformParam {
                        operator: op.name().to_string(),
                        target,
                        value,
                    });
                }
            }
        }
        params
    }
}

/// Explore `module` under `spec` (defaults when None), committing the result
pub fn run_multi_level_dse(
    module: &mut Module,
    spec: Option<&DseTargetSpec>,
) -> Result<DseReport, DseError> {
    let spec = spec.cloned().unwrap_or_default();
    DseEngine::new(spec).explore(module)
}
