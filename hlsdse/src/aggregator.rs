//! Hierarchical QoR aggregation
//!
//! Combines child metrics bottom-up into parent metrics, writing every result
//! into the module's [`MetricsTable`]. Leaves and loops are priced by the
//! [`CostModel`]; functions and dataflow nodes compose their children.
//!
//! # Composition Rules
//!
//! | | latency | compute / ports / control | storage | interval |
//! |---|---|---|---|---|
//! | sequential | Σ | max | Σ | latency |
//! | dataflow | max + 2·(n−1) | Σ | Σ | max child latency |
//!
//! Functions add one control unit. Unknown child latency makes the composed
//! latency unknown.
//!
//! # Dataflow Granularity
//!
//! A function with `k` dataflow stages groups its `n` children into `k`
//! consecutive stages. Children inside a stage run sequentially, the stages
//! run as a dataflow pipeline. `k = 1` is the sequential function and
//! `k = n` gives every child its own stage. Stage boundaries split the
//! children evenly, or, with balancing on and every child latency known,
//! minimize the slowest stage. Local arrays shared across stages are
//! double-buffered.
//!
//! Aggregation is cache-aware: a region whose entry is present in the table
//! is not recomputed. After a transform invalidates the affected subtree and
//! its ancestors, re-aggregating the root only touches those regions.

use std::ops::Range;

use crate::cost_model::{CostModel, EstimateCtx};
use crate::metrics::{Cycles, Metrics, MetricsTable, RegionQoR};
use crate::region::{Composition, Module, Region, RegionId, RegionKind};
use crate::target_spec::TargetSpec;

/// Pipeline skew added per extra stage of a dataflow composition
pub const DATAFLOW_SKEW_CYCLES: u64 = 2;

/// Compose child metrics under the given composition.
///
/// An empty child list yields [`Metrics::empty`].
pub fn compose(kind: Composition, children: &[Metrics]) -> Metrics {
    let (first, rest) = match children.split_first() {
        Some(split) => split,
        None => return Metrics::empty(),
    };
    match kind {
        Composition::Sequential => {
            let (latency, resources) = rest.iter().fold(
                (first.latency, first.resources),
                |(latency, resources), m| {
                    (latency.add(m.latency), resources.sequential(&m.resources))
                },
            );
            Metrics::new(latency, latency, resources)
        }
        Composition::Dataflow => {
            let (slowest, resources) = rest.iter().fold(
                (first.latency, first.resources),
                |(latency, resources), m| {
                    (latency.max(m.latency), resources.concurrent(&m.resources))
                },
            );
            let skew = DATAFLOW_SKEW_CYCLES.saturating_mul(rest.len() as u64);
            Metrics::new(slowest.add(Cycles::Known(skew)), slowest, resources)
        }
    }
}

/// `n` children in `k` consecutive groups of near-equal size, larger
/// groups first
pub fn even_stages(n: usize, k: usize) -> Vec<Range<usize>> {
    let k = k.clamp(1, n.max(1));
    let (size, extra) = (n / k, n % k);
    let mut start = 0;
    (0..k)
        .map(|i| {
            let end = start + size + usize::from(i < extra);
            let stage = start..end;
            start = end;
            stage
        })
        .collect()
}

/// Contiguous grouping of `latencies` into `k` stages minimizing the slowest
/// stage. Ties keep the earliest split.
pub fn balanced_stages(latencies: &[u64], k: usize) -> Vec<Range<usize>> {
    let n = latencies.len();
    let k = k.clamp(1, n.max(1));
    if n == 0 {
        return vec![0..0];
    }
    let mut prefix = vec![0u64; n + 1];
    for (i, l) in latencies.iter().enumerate() {
        prefix[i + 1] = prefix[i].saturating_add(*l);
    }
    let span = |a: usize, b: usize| prefix[b].saturating_sub(prefix[a]);

    // best[s][j]: slowest stage when the first j children form s stages
    let mut best: Vec<Vec<Option<u64>>> = vec![vec![None; n + 1]; k + 1];
    let mut split = vec![vec![0usize; n + 1]; k + 1];
    best[0][0] = Some(0);
    for s in 1..=k {
        for j in s..=n {
            for i in (s - 1)..j {
                let before = match best[s - 1][i] {
                    Some(before) => before,
                    None => continue,
                };
                let slowest = before.max(span(i, j));
                if best[s][j].map_or(true, |b| slowest < b) {
                    best[s][j] = Some(slowest);
                    split[s][j] = i;
                }
            }
        }
    }

    let mut stages = Vec::with_capacity(k);
    let mut end = n;
    for s in (1..=k).rev() {
        let start = split[s][end];
        stages.push(start..end);
        end = start;
    }
    stages.reverse();
    stages
}

/// Bottom-up aggregator over one module
pub struct Aggregator<'a> {
    model: &'a CostModel,
    target: Option<&'a TargetSpec>,
}

impl<'a> Aggregator<'a> {
    pub fn new(model: &'a CostModel, target: Option<&'a TargetSpec>) -> Self {
        Aggregator { model, target }
    }

    /// Ensure `id` (and everything below it) has an entry in `table`
    pub fn aggregate(&self, module: &Module, id: RegionId, table: &mut MetricsTable) -> Metrics {
        let ctx = EstimateCtx::for_region(module, id);
        self.aggregate_in(module, id, &ctx, table)
    }

    fn aggregate_in(
        &self,
        module: &Module,
        id: RegionId,
        ctx: &EstimateCtx,
        table: &mut MetricsTable,
    ) -> Metrics {
        if let Some(cached) = table.metrics(id) {
            return *cached;
        }
        let region = match module.region(id) {
            Some(region) => region,
            None => return Metrics::empty(),
        };

        let child_ctx = ctx.enter(module, id);
        let children: Vec<Metrics> = region
            .children()
            .iter()
            .map(|child| self.aggregate_in(module, *child, &child_ctx, table))
            .collect();

        let metrics = self.combine(module, region, ctx, &children);
        let violations = self
            .target
            .map(|t| t.violations(&metrics))
            .unwrap_or_default();
        log::trace!(
            "{}: latency {} resources {:?}",
            region.label(),
            metrics.latency,
            metrics.resources
        );
        table.insert(id, RegionQoR { metrics, violations });
        metrics
    }

    /// Metrics of one region given its children's metrics (in child order)
    pub fn combine(
        &self,
        module: &Module,
        region: &Region,
        ctx: &EstimateCtx,
        children: &[Metrics],
    ) -> Metrics {
        match &region.kind {
            RegionKind::Block(body) => self.model.estimate_block(module, body, ctx),
            RegionKind::Loop(info)
                if info.directives.pipeline || module.is_innermost_loop(region.id) =>
            {
                self.model.estimate_flat_loop(module, region.id, ctx)
            }
            RegionKind::Loop(_) => {
                let stages = self.stages(region, children);
                let body = compose_stages(children, &stages);
                self.model.estimate_outer_loop(module, region.id, ctx, &body)
            }
            RegionKind::Func(_) | RegionKind::Dataflow => {
                let stages = self.stages(region, children);
                let mut metrics = compose_stages(children, &stages);
                let storage = self.model.scoped_storage(module, region.id, &stages);
                metrics.resources.storage_elements =
                    metrics.resources.storage_elements.saturating_add(storage);
                if matches!(region.kind, RegionKind::Func(_)) {
                    metrics.resources.control_units =
                        metrics.resources.control_units.saturating_add(1);
                }
                metrics
            }
        }
    }

    /// Stage grouping of a region's children
    fn stages(&self, region: &Region, children: &[Metrics]) -> Vec<Range<usize>> {
        let k = region.dataflow_stages();
        if region.balances_stages() {
            let latencies: Option<Vec<u64>> =
                children.iter().map(|m| m.latency.known()).collect();
            if let Some(latencies) = latencies {
                return balanced_stages(&latencies, k);
            }
        }
        even_stages(children.len(), k)
    }
}

/// Sequential within each stage, dataflow between stages
fn compose_stages(children: &[Metrics], stages: &[Range<usize>]) -> Metrics {
    if stages.len() <= 1 {
        return compose(Composition::Sequential, children);
    }
    let per_stage: Vec<Metrics> = stages
        .iter()
        .map(|stage| compose(Composition::Sequential, &children[stage.clone()]))
        .collect();
    compose(Composition::Dataflow, &per_stage)
}
