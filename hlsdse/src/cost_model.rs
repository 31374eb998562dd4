//! Analytical QoR cost model
//!
//! Estimates latency and resource usage of a single region under its current
//! directives, in isolation from the rest of the module. Composition of
//! children is the [`aggregator`](crate::aggregator)'s job; this module only
//! knows how one block or one loop behaves.
//!
//! # Latency
//!
//! ```text
//! block            = Σ op cycles + Σ access cycles + memory stall
//! pipelined loop   = tiles × ((T / u) × II + depth − 1 + tile overhead)
//! sequential loop  = tiles × ((T / u) × (depth + stall) + tile overhead)
//! outer loop       = tiles × ((T / u) × body + tile overhead)
//! ```
//!
//! `T` is the tile size (the trip count when untiled, in which case
//! `tiles = 1` and the overhead vanishes), `u` the unroll factor, `depth` the
//! single-iteration latency. For an untiled pipelined loop the formula reduces
//! to `(tripCount / u) × II + depth − 1`.
//!
//! # Loop nests
//!
//! Unrolling a loop that holds other loops is an unroll-jam: the inner bodies
//! are replicated `u` times. Enclosing unroll factors reach the inner loops
//! through [`EstimateCtx`] and multiply their compute units and port demand.
//!
//! Pipelining a loop that holds other loops fully unrolls them (the choice of
//! pipelining depth). The nest is priced as one flat pipelined body: every
//! block is replicated by the trip counts of the loops between it and the
//! pipelined loop, and a block that accumulates across an unrolled loop
//! chains its copies, which lengthens the pipeline depth.
//!
//! # Initiation interval
//!
//! `II = max(1, II_mem, II_rec)` where `II_mem` is the worst ratio of
//! requested to available memory ports over all arrays and `II_rec = u × depth`
//! for loops carrying a reduction.
//!
//! # Resources
//!
//! - compute units: `u × units` (sequential) or `ceil(u × units / II)`
//!   (pipelined, units are shared across the II)
//! - memory ports: Σ over arrays of `min(requested, available)`. An access
//!   is requested once per unrolled copy of the loop variables it uses;
//!   partitioning an on-chip array by `k` multiplies available ports by `k`
//!   when the last subscript follows an unrolled variable
//! - storage elements: `k × max(1, ceil(ceil(n / k) × bits / 18Kb))` per array
//!   or tile buffer
//! - control units: one per loop
//!
//! # Unknown trip counts
//!
//! Symbolic or zero trip counts yield [`Cycles::Unknown`] latency. Resource
//! counts stay computed.
//!
//! All counts saturate at `u64::MAX` instead of overflowing.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::metrics::{Cycles, Metrics, ResourceUsage};
use crate::region::{
    AccessKind, ArrayDecl, BlockBody, MemAccess, Module, OpKind, Operation, RegionId,
    RegionKind, Storage,
};
use crate::target_spec::{TargetSpec, DEFAULT_CLOCK_PERIOD_NS};

/// Bits per storage element (18Kb block RAM equivalent)
pub const STORAGE_BANK_BITS: u64 = 18 * 1024;

/// Fixed per-tile control overhead of a tiled loop
pub const TILE_OVERHEAD_CYCLES: u64 = 2;

const LOAD_CYCLES: u64 = 2;
const STORE_CYCLES: u64 = 1;
const EXT_LOAD_CYCLES: u64 = 8;
const EXT_STORE_CYCLES: u64 = 4;

// ============================================================================
// Operation Latency Table
// ============================================================================

/// Delay and functional-unit cost of one operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpCost {
    pub delay_ns: f64,
    pub units: u64,
}

/// Lookup table keyed by operation kind and bit-width bucket
#[derive(Debug, Clone, PartialEq)]
pub struct OpLatencyTable {
    entries: BTreeMap<(OpKind, u32), OpCost>,
}

impl OpLatencyTable {
    pub const BUCKETS: [u32; 4] = [8, 16, 32, 64];

    pub fn bucket(bits: u32) -> u32 {
        Self::BUCKETS
            .iter()
            .copied()
            .find(|b| bits <= *b)
            .unwrap_or(64)
    }

    pub fn lookup(&self, kind: OpKind, bits: u32) -> OpCost {
        self.entries
            .get(&(kind, Self::bucket(bits)))
            .copied()
            .unwrap_or_else(|| default_cost(kind, Self::bucket(bits)))
    }

    pub fn set(&mut self, kind: OpKind, bits: u32, cost: OpCost) {
        self.entries.insert((kind, Self::bucket(bits)), cost);
    }
}

impl Default for OpLatencyTable {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        for kind in OpKind::ALL {
            for bucket in Self::BUCKETS {
                entries.insert((kind, bucket), default_cost(kind, bucket));
            }
        }
        OpLatencyTable { entries }
    }
}

fn default_cost(kind: OpKind, bucket: u32) -> OpCost {
    let wide = bucket > 32;
    let (delay_ns, units) = match kind {
        OpKind::Add | OpKind::Sub => (if wide { 2.5 } else { 1.5 }, 1),
        OpKind::Mul => match bucket {
            8 | 16 => (3.0, 1),
            32 => (8.0, 3),
            _ => (16.0, 10),
        },
        OpKind::Div | OpKind::Rem => (bucket as f64 * 1.1, 1),
        OpKind::Shift | OpKind::Logic | OpKind::Select => (0.5, 0),
        OpKind::Cmp => (1.0, 0),
        OpKind::Cast => (0.0, 0),
        OpKind::FAdd | OpKind::FSub => (if wide { 20.0 } else { 14.0 }, if wide { 3 } else { 2 }),
        OpKind::FMul => (if wide { 18.0 } else { 12.0 }, if wide { 11 } else { 3 }),
        OpKind::FDiv => (if wide { 120.0 } else { 55.0 }, 1),
        OpKind::FSqrt => (if wide { 110.0 } else { 50.0 }, 1),
        OpKind::FCmp => (5.0, 0),
    };
    OpCost { delay_ns, units }
}

// ============================================================================
// Estimation Context
// ============================================================================

/// What the enclosing loops impose on the region being estimated: arrays
/// promoted on chip by tiled ancestors and the unroll factors of unrolled
/// ancestors, keyed by induction variable
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstimateCtx {
    promoted: BTreeSet<String>,
    unrolled: BTreeMap<String, u64>,
}

impl EstimateCtx {
    /// Context in effect at `id` (imposed by its strict ancestors)
    pub fn for_region(module: &Module, id: RegionId) -> Self {
        module
            .ancestors(id)
            .into_iter()
            .rev()
            .fold(EstimateCtx::default(), |ctx, anc| ctx.enter(module, anc))
    }

    /// Context seen by the children of `id`
    pub fn enter(&self, module: &Module, id: RegionId) -> Self {
        let mut next = self.clone();
        next.promoted.extend(
            self.promotions(module, id)
                .into_iter()
                .map(|a| a.name.clone()),
        );
        if let Some(info) = module.region(id).and_then(|r| r.as_loop()) {
            if info.directives.unroll > 1 {
                next.unrolled.insert(info.iv.clone(), info.directives.unroll);
            }
        }
        next
    }

    /// Context with the loop variable `iv` replicated `factor` times
    pub fn with_factor(&self, iv: &str, factor: u64) -> Self {
        let mut next = self.clone();
        if factor > 1 {
            next.unrolled.insert(iv.to_string(), factor);
        }
        next
    }

    pub fn factor(&self, iv: &str) -> u64 {
        self.unrolled.get(iv).copied().unwrap_or(1)
    }

    /// Copies of the whole body (product of every unroll factor in scope)
    pub fn copies(&self) -> u64 {
        self.unrolled
            .values()
            .fold(1u64, |n, f| n.saturating_mul(*f))
    }

    /// Distinct copies of one access: the product of the factors of the
    /// unrolled variables its subscripts use
    pub fn replication(&self, access: &MemAccess) -> u64 {
        self.unrolled
            .iter()
            .filter(|(iv, _)| access.uses(iv))
            .fold(1u64, |n, (_, f)| n.saturating_mul(*f))
    }

    /// Whether the copies of an access spread over the partitioned banks
    pub fn spreads(&self, access: &MemAccess) -> bool {
        self.unrolled.keys().any(|iv| access.last_dim_uses(iv))
    }

    pub fn is_promoted(&self, array: &str) -> bool {
        self.promoted.contains(array)
    }

    pub fn is_on_chip(&self, array: &ArrayDecl) -> bool {
        array.storage == Storage::Local || self.promoted.contains(&array.name)
    }

    /// External arrays a tiled loop `id` promotes (not already promoted above)
    pub fn promotions<'m>(&self, module: &'m Module, id: RegionId) -> Vec<&'m ArrayDecl> {
        let tiled = module
            .region(id)
            .and_then(|r| r.as_loop())
            .map_or(false, |info| info.is_tiled());
        if !tiled {
            return Vec::new();
        }
        let accessed: BTreeSet<&str> = module
            .accesses_in(id)
            .into_iter()
            .map(|a| a.array.as_str())
            .collect();
        module
            .arrays()
            .iter()
            .filter(|a| a.storage == Storage::External)
            .filter(|a| accessed.contains(a.name.as_str()))
            .filter(|a| !self.promoted.contains(&a.name))
            .collect()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Storage elements for `elements` values of `bits` split into `partition` banks
pub fn storage_elements(elements: u64, bits: u32, partition: u64) -> u64 {
    let banks = partition.max(1);
    let bank_bits = ceil_div(elements, banks).saturating_mul(bits as u64);
    banks.saturating_mul(ceil_div(bank_bits, STORAGE_BANK_BITS).max(1))
}

/// `(tripCount / u) × II + depth − 1`
pub fn pipelined_loop_latency(iterations: u64, interval: u64, depth: u64) -> u64 {
    iterations
        .saturating_mul(interval)
        .saturating_add(depth)
        .saturating_sub(1)
}

/// Whether the body carries a reduction over `iv`: an array written at an
/// index independent of `iv` that is also read in the body.
fn carries_reduction(accesses: &[&MemAccess], iv: &str) -> bool {
    accesses
        .iter()
        .filter(|a| a.kind == AccessKind::Write && !a.uses(iv))
        .any(|w| {
            accesses
                .iter()
                .any(|r| r.kind == AccessKind::Read && r.array == w.array)
        })
}

fn ceil_div(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        a / b + u64::from(a % b != 0)
    }
}

fn saturating_sum<I: IntoIterator<Item = u64>>(values: I) -> u64 {
    values.into_iter().fold(0u64, |acc, v| acc.saturating_add(v))
}

/// One access as issued per step of the estimated loop
#[derive(Debug, Clone, Copy)]
struct Issue<'m> {
    access: &'m MemAccess,
    copies: u64,
    spread: bool,
}

impl<'m> Issue<'m> {
    fn new(access: &'m MemAccess, ctx: &EstimateCtx) -> Self {
        Issue {
            access,
            copies: ctx.replication(access),
            spread: ctx.spreads(access),
        }
    }
}

/// A block of a flattened loop body with the context it is replicated under
struct FlatBlock<'m> {
    body: &'m BlockBody,
    ctx: EstimateCtx,
    /// Copies chained through a reduction over a fully unrolled loop
    chain: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemoryPressure {
    interval: u64,
    ports: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Buffers {
    storage: u64,
    fill_cycles: u64,
}

// ============================================================================
// Cost Model
// ============================================================================

/// Cost model bound to one target (clock, calibration, port model)
#[derive(Debug, Clone)]
pub struct CostModel {
    clock_period_ns: f64,
    table: OpLatencyTable,
    overrides: BTreeMap<String, u64>,
    ports_per_bank: u64,
    external_ports: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        CostModel::new(None)
    }
}

impl CostModel {
    pub fn new(target: Option<&TargetSpec>) -> Self {
        let defaults = TargetSpec::default();
        let target = target.unwrap_or(&defaults);
        CostModel {
            clock_period_ns: if target.clock_period_ns > 0.0 {
                target.clock_period_ns
            } else {
                DEFAULT_CLOCK_PERIOD_NS
            },
            table: OpLatencyTable::default(),
            overrides: target.op_latency.clone(),
            ports_per_bank: target.memory_ports_per_bank.max(1),
            external_ports: target.external_ports.max(1),
        }
    }

    pub fn with_table(mut self, table: OpLatencyTable) -> Self {
        self.table = table;
        self
    }

    pub fn op_cycles(&self, op: &Operation) -> u64 {
        if let Some(cycles) = self.overrides.get(op.kind.name()) {
            return *cycles;
        }
        let cost = self.table.lookup(op.kind, op.bits);
        if cost.delay_ns <= 0.0 {
            return 0;
        }
        ((cost.delay_ns / self.clock_period_ns).ceil() as u64).max(1)
    }

    pub fn op_units(&self, op: &Operation) -> u64 {
        self.table.lookup(op.kind, op.bits).units
    }

    pub fn access_cycles(&self, kind: AccessKind, on_chip: bool) -> u64 {
        let (key, default) = match (kind, on_chip) {
            (AccessKind::Read, true) => ("load", LOAD_CYCLES),
            (AccessKind::Write, true) => ("store", STORE_CYCLES),
            (AccessKind::Read, false) => ("ext-load", EXT_LOAD_CYCLES),
            (AccessKind::Write, false) => ("ext-store", EXT_STORE_CYCLES),
        };
        self.overrides.get(key).copied().unwrap_or(default)
    }

    fn on_chip(&self, module: &Module, array: &str, ctx: &EstimateCtx) -> bool {
        module.array(array).map_or(true, |a| ctx.is_on_chip(a))
    }

    /// Straight-line latency (without memory stall) and functional units of
    /// one copy of the body
    fn straight_line(&self, module: &Module, body: &BlockBody, ctx: &EstimateCtx) -> (u64, u64) {
        let op_latency = saturating_sum(body.ops.iter().map(|op| self.op_cycles(op)));
        let access_latency = saturating_sum(
            body.accesses
                .iter()
                .map(|a| self.access_cycles(a.kind, self.on_chip(module, &a.array, ctx))),
        );
        let units = saturating_sum(body.ops.iter().map(|op| self.op_units(op)));
        (op_latency.saturating_add(access_latency), units)
    }

    /// Port demand of one step over all issued access copies
    fn memory_pressure(
        &self,
        module: &Module,
        issues: &[Issue<'_>],
        ctx: &EstimateCtx,
    ) -> MemoryPressure {
        let mut requests: BTreeMap<&str, u64> = BTreeMap::new();
        let mut spread: BTreeSet<&str> = BTreeSet::new();
        for issue in issues {
            let name = issue.access.array.as_str();
            if issue.spread {
                spread.insert(name);
            }
            let entry = requests.entry(name).or_insert(0);
            *entry = entry.saturating_add(issue.copies);
        }

        let mut interval = 1;
        let mut ports: u64 = 0;
        for (name, requested) in requests {
            let available = match module.array(name) {
                Some(array) if ctx.is_on_chip(array) => {
                    let banks = if spread.contains(name) {
                        array.partition.max(1)
                    } else {
                        1
                    };
                    banks.saturating_mul(self.ports_per_bank)
                }
                Some(_) => self.external_ports,
                None => continue,
            };
            interval = interval.max(ceil_div(requested, available));
            ports = ports.saturating_add(requested.min(available));
        }
        MemoryPressure { interval, ports }
    }

    /// Footprint (elements) of `array` touched by one tile of loop `id`
    pub fn tile_footprint(&self, module: &Module, id: RegionId, array: &ArrayDecl) -> u64 {
        let info = match module.region(id).and_then(|r| r.as_loop()) {
            Some(info) => info,
            None => return array.elements(),
        };
        let tile = info.effective_tile().unwrap_or(1);
        let ranges = module.loop_ranges_in(id);
        let accesses: Vec<&MemAccess> = module
            .accesses_in(id)
            .into_iter()
            .filter(|a| a.array == array.name)
            .collect();

        let mut footprint = 1u64;
        for (dim, extent) in array.shape.iter().enumerate() {
            let mut vars: BTreeSet<&str> = BTreeSet::new();
            for access in &accesses {
                if let Some(index) = access.index.get(dim) {
                    vars.extend(index.vars().iter().map(|v| v.as_str()));
                }
            }
            if vars.is_empty() {
                continue;
            }
            let span = saturating_sum(vars.iter().map(|v| {
                if *v == info.iv {
                    tile
                } else {
                    match ranges.get(*v) {
                        Some(Some(trip)) => *trip,
                        Some(None) => *extent,
                        // Defined by an enclosing loop: fixed within a tile
                        None => 1,
                    }
                }
            }));
            let dim_extent = span
                .saturating_sub(vars.len() as u64 - 1)
                .clamp(1, (*extent).max(1));
            footprint = footprint.saturating_mul(dim_extent);
        }
        footprint
    }

    /// Tile buffers allocated by loop `id` (zero unless it is tiled)
    fn tile_buffers(&self, module: &Module, id: RegionId, ctx: &EstimateCtx) -> Buffers {
        let mut buffers = Buffers::default();
        let accesses = module.accesses_in(id);
        for array in ctx.promotions(module, id) {
            let elements = self.tile_footprint(module, id, array);
            buffers.storage = buffers
                .storage
                .saturating_add(storage_elements(elements, array.bits, array.partition));
            let reads = accesses
                .iter()
                .any(|a| a.array == array.name && a.kind == AccessKind::Read);
            let writes = accesses
                .iter()
                .any(|a| a.array == array.name && a.kind == AccessKind::Write);
            buffers.fill_cycles = buffers
                .fill_cycles
                .saturating_add(elements.saturating_mul(reads as u64 + writes as u64));
        }
        buffers
    }

    // ------------------------------------------------------------------------
    // Region estimates
    // ------------------------------------------------------------------------

    /// One straight-line block, replicated by the unroll factors in scope
    pub fn estimate_block(&self, module: &Module, body: &BlockBody, ctx: &EstimateCtx) -> Metrics {
        let (latency, units) = self.straight_line(module, body, ctx);
        let issues: Vec<Issue<'_>> = body.accesses.iter().map(|a| Issue::new(a, ctx)).collect();
        let pressure = self.memory_pressure(module, &issues, ctx);
        let latency = latency.saturating_add(pressure.interval - 1);
        Metrics::new(
            Cycles::Known(latency),
            Cycles::Known(latency),
            ResourceUsage {
                compute_units: units.saturating_mul(ctx.copies()),
                memory_ports: pressure.ports,
                storage_elements: 0,
                control_units: 0,
            },
        )
    }

    /// Blocks below `id` with the unrolled context each is replicated under.
    ///
    /// Every loop on the way down is fully unrolled; tiling and directives of
    /// those loops have no effect inside a flattened body.
    fn flatten<'m>(
        &self,
        module: &'m Module,
        id: RegionId,
        ctx: &EstimateCtx,
        chain: u64,
        out: &mut Vec<FlatBlock<'m>>,
    ) {
        for child in module.children(id) {
            let region = match module.region(*child) {
                Some(region) => region,
                None => continue,
            };
            match &region.kind {
                RegionKind::Block(body) => out.push(FlatBlock {
                    body,
                    ctx: ctx.clone(),
                    chain,
                }),
                RegionKind::Loop(info) => {
                    let trip = info.trip.bounded().unwrap_or(1);
                    let accesses = module.accesses_in(*child);
                    let chain = if carries_reduction(&accesses, &info.iv) {
                        chain.saturating_mul(trip)
                    } else {
                        chain
                    };
                    self.flatten(module, *child, &ctx.with_factor(&info.iv, trip), chain, out);
                }
                RegionKind::Func(_) | RegionKind::Dataflow => {
                    self.flatten(module, *child, ctx, chain, out)
                }
            }
        }
    }

    /// Loop priced as one straight-line body per iteration: an innermost loop,
    /// or a pipelined loop whose inner loops are fully unrolled.
    ///
    /// `ctx` is the context at the loop itself; promotions and the unroll
    /// factor of the loop are applied internally.
    pub fn estimate_flat_loop(&self, module: &Module, id: RegionId, ctx: &EstimateCtx) -> Metrics {
        let info = match module.region(id).and_then(|r| r.as_loop()) {
            Some(info) => info,
            None => return Metrics::empty(),
        };
        let inner = ctx.enter(module, id);
        let mut blocks = Vec::new();
        self.flatten(module, id, &inner, 1, &mut blocks);

        let mut depth = 0u64;
        let mut units = 0u64;
        let mut issues: Vec<Issue<'_>> = Vec::new();
        let mut accesses: Vec<&MemAccess> = Vec::new();
        for block in &blocks {
            let (latency, block_units) = self.straight_line(module, block.body, &inner);
            depth = depth.saturating_add(latency.saturating_mul(block.chain));
            units = units.saturating_add(block_units.saturating_mul(block.ctx.copies()));
            issues.extend(block.body.accesses.iter().map(|a| Issue::new(a, &block.ctx)));
            accesses.extend(block.body.accesses.iter());
        }
        let depth = depth.max(1);
        let unroll = info.directives.unroll.max(1);
        let pressure = self.memory_pressure(module, &issues, &inner);
        let buffers = self.tile_buffers(module, id, ctx);
        let pipelined = info.directives.pipeline;

        let interval = if pipelined {
            let recurrence = if carries_reduction(&accesses, &info.iv) {
                unroll.saturating_mul(depth)
            } else {
                1
            };
            pressure.interval.max(recurrence).max(1)
        } else {
            1
        };
        let compute_units = if pipelined {
            ceil_div(units, interval)
        } else {
            units
        };
        let resources = ResourceUsage {
            compute_units,
            memory_ports: pressure.ports,
            storage_elements: buffers.storage,
            control_units: 1,
        };

        let (trip, tile) = match (info.trip.bounded(), info.effective_tile()) {
            (Some(n), Some(t)) => (n, t),
            _ => {
                let ii = if pipelined {
                    Cycles::Known(interval)
                } else {
                    Cycles::Unknown
                };
                return Metrics::new(Cycles::Unknown, ii, resources);
            }
        };
        let tiles = trip / tile;
        let iterations = tile / unroll;
        let per_tile = if pipelined {
            pipelined_loop_latency(iterations, interval, depth)
        } else {
            iterations.saturating_mul(depth.saturating_add(pressure.interval - 1))
        };
        let overhead = if info.is_tiled() {
            buffers.fill_cycles.saturating_add(TILE_OVERHEAD_CYCLES)
        } else {
            0
        };
        let latency = tiles.saturating_mul(per_tile.saturating_add(overhead));
        let interval = if pipelined { interval } else { latency };
        Metrics::new(Cycles::Known(latency), Cycles::Known(interval), resources)
    }

    /// Loop whose body holds other loops; `body` is the composed body metrics
    pub fn estimate_outer_loop(
        &self,
        module: &Module,
        id: RegionId,
        ctx: &EstimateCtx,
        body: &Metrics,
    ) -> Metrics {
        let info = match module.region(id).and_then(|r| r.as_loop()) {
            Some(info) => info,
            None => return *body,
        };
        let buffers = self.tile_buffers(module, id, ctx);
        let mut resources = body.resources;
        resources.storage_elements = resources.storage_elements.saturating_add(buffers.storage);
        resources.control_units = resources.control_units.saturating_add(1);

        let (trip, tile) = match (info.trip.bounded(), info.effective_tile()) {
            (Some(n), Some(t)) => (n, t),
            _ => return Metrics::new(Cycles::Unknown, Cycles::Unknown, resources),
        };
        let overhead = if info.is_tiled() {
            buffers.fill_cycles.saturating_add(TILE_OVERHEAD_CYCLES)
        } else {
            0
        };
        // Unroll-jam: the jammed copies run inside one body execution
        let latency = body
            .latency
            .scale(tile / info.directives.unroll.max(1))
            .add(Cycles::Known(overhead))
            .scale(trip / tile);
        Metrics::new(latency, latency, resources)
    }

    /// Storage of local arrays scoped to a function or dataflow region whose
    /// children are grouped into `stages` (ranges of child positions).
    ///
    /// An array touched by more than one stage is double-buffered; arrays
    /// shared only within a stage are not.
    pub fn scoped_storage(&self, module: &Module, id: RegionId, stages: &[Range<usize>]) -> u64 {
        let children = module.children(id);
        saturating_sum(
            module
                .arrays_scoped_to(id)
                .into_iter()
                .filter(|a| a.storage == Storage::Local)
                .map(|array| {
                    let base = storage_elements(array.elements(), array.bits, array.partition);
                    let touching = stages
                        .iter()
                        .filter(|stage| {
                            children[(*stage).clone()].iter().any(|c| {
                                module
                                    .accesses_in(*c)
                                    .iter()
                                    .any(|a| a.array == array.name)
                            })
                        })
                        .count();
                    if touching > 1 {
                        base.saturating_mul(2)
                    } else {
                        base
                    }
                }),
        )
    }
}
