//! Transformation operators
//!
//! A transformation operator is modelled as a typed directive mutation on the
//! representation: applying `unroll(r4) = 4` writes the directive, and the
//! cost model interprets it the way the downstream loop rewrite would realize
//! it. The concrete IR rewrites live outside this crate.
//!
//! Every mutation goes through [`Module::set_param`], which validates the
//! result, returns the previous value as a [`ParamDelta`] and invalidates the
//! stale metrics entries. [`Module::restore`] undoes a delta.
//!
//! # Standard Operators
//!
//! | operator | applies to | domain |
//! |---|---|---|
//! | `pipeline` | loop, static trip, static inner nest | {false, true} |
//! | `unroll` | loop, static trip | divisors of the tile size |
//! | `tile` | loop, static trip | divisors of the trip count that are multiples of the unroll |
//! | `partition` | function / dataflow region owning arrays | divisors of the last extent |
//! | `dataflow` | function with at least two children | stage counts `1..=children` |
//!
//! Pipelining a loop that holds other loops fully unrolls them, so the level
//! at which a nest is pipelined (innermost, or a tile loop above it) is
//! chosen by which loop the search turns the flag on for. Unrolling an outer
//! loop is an unroll-jam of its body.
//!
//! New operators plug in through [`OperatorRegistry::register`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::region::{Module, ModuleError, RegionId, RegionKind};

// ============================================================================
// Parameters
// ============================================================================

/// One tunable directive of the representation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "param", content = "target", rename_all = "lowercase")]
pub enum ParamTarget {
    Pipeline(RegionId),
    Unroll(RegionId),
    Tile(RegionId),
    Partition(String),
    Dataflow(RegionId),
}

impl fmt::Display for ParamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamTarget::Pipeline(r) => write!(f, "pipeline({})", r),
            ParamTarget::Unroll(r) => write!(f, "unroll({})", r),
            ParamTarget::Tile(r) => write!(f, "tile({})", r),
            ParamTarget::Partition(a) => write!(f, "partition({})", a),
            ParamTarget::Dataflow(r) => write!(f, "dataflow({})", r),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Factor(u64),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Flag(b) => write!(f, "{}", b),
            ParamValue::Factor(n) => write!(f, "{}", n),
        }
    }
}

/// Previous value of a mutated parameter (enough to revert it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDelta {
    pub target: ParamTarget,
    pub previous: ParamValue,
}

/// A committed operator parameter, as reported by the DSE engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformParam {
    pub operator: String,
    pub target: ParamTarget,
    pub value: ParamValue,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("region {0} does not exist")]
    UnknownRegion(RegionId),

    #[error("array '{0}' does not exist")]
    UnknownArray(String),

    #[error("{target} is not applicable: {reason}")]
    NotApplicable { target: ParamTarget, reason: String },

    #[error("value {value} is outside the domain of {target}")]
    OutOfDomain {
        target: ParamTarget,
        value: ParamValue,
    },

    #[error("value {value} has the wrong type for {target}")]
    TypeMismatch {
        target: ParamTarget,
        value: ParamValue,
    },

    #[error("mutation leaves an invalid module: {0}")]
    Invalid(#[from] ModuleError),
}

/// Ascending divisors of `n`
pub fn divisors(n: u64) -> Vec<u64> {
    let mut small = Vec::new();
    let mut large = Vec::new();
    let mut d = 1;
    while d <= n / d {
        if n % d == 0 {
            small.push(d);
            if d != n / d {
                large.push(n / d);
            }
        }
        d += 1;
    }
    small.extend(large.into_iter().rev());
    small
}

// ============================================================================
// Parameter Access on the Module
// ============================================================================

impl Module {
    /// Current value of a parameter
    pub fn param(&self, target: &ParamTarget) -> Result<ParamValue, TransformError> {
        match target {
            ParamTarget::Pipeline(r) | ParamTarget::Unroll(r) | ParamTarget::Tile(r) => {
                let info = self
                    .region(*r)
                    .ok_or(TransformError::UnknownRegion(*r))?
                    .as_loop()
                    .ok_or_else(|| not_a(target, "loop"))?;
                Ok(match target {
                    ParamTarget::Pipeline(_) => ParamValue::Flag(info.directives.pipeline),
                    ParamTarget::Unroll(_) => ParamValue::Factor(info.directives.unroll),
                    _ => match info.effective_tile() {
                        Some(t) => ParamValue::Factor(t),
                        None => return Err(not_applicable(target, "trip count is not static")),
                    },
                })
            }
            ParamTarget::Partition(name) => self
                .array(name)
                .map(|a| ParamValue::Factor(a.partition))
                .ok_or_else(|| TransformError::UnknownArray(name.clone())),
            ParamTarget::Dataflow(r) => match &self
                .region(*r)
                .ok_or(TransformError::UnknownRegion(*r))?
                .kind
            {
                RegionKind::Func(info) => Ok(ParamValue::Factor(info.directives.dataflow)),
                _ => Err(not_a(target, "function")),
            },
        }
    }

    /// Write a parameter, validate the module and invalidate stale metrics.
    ///
    /// On a validation failure the previous value is written back and the
    /// module is left untouched.
    pub fn set_param(
        &mut self,
        target: &ParamTarget,
        value: ParamValue,
    ) -> Result<ParamDelta, TransformError> {
        let previous = self.param(target)?;
        self.write_param(target, value)?;
        if let Err(err) = self.validate() {
            self.write_param(target, previous)?;
            return Err(err.into());
        }
        let stale = self.stale_regions(target);
        self.metrics.invalidate(stale);
        Ok(ParamDelta {
            target: target.clone(),
            previous,
        })
    }

    /// Undo a delta returned by [`set_param`](Module::set_param)
    pub fn restore(&mut self, delta: &ParamDelta) -> Result<(), TransformError> {
        self.write_param(&delta.target, delta.previous)?;
        let stale = self.stale_regions(&delta.target);
        self.metrics.invalidate(stale);
        Ok(())
    }

    /// Region whose estimate a parameter change alters first
    pub fn affected_region(&self, target: &ParamTarget) -> Option<RegionId> {
        match target {
            ParamTarget::Pipeline(r)
            | ParamTarget::Unroll(r)
            | ParamTarget::Tile(r)
            | ParamTarget::Dataflow(r) => self.region(*r).map(|region| region.id),
            ParamTarget::Partition(name) => self.array(name).map(|a| self.array_scope(a)),
        }
    }

    /// Regions whose metrics entries a change of `target` makes stale
    pub fn stale_regions(&self, target: &ParamTarget) -> Vec<RegionId> {
        let mut stale: BTreeSet<RegionId> = BTreeSet::new();
        let with_ancestors = |id: RegionId, stale: &mut BTreeSet<RegionId>| {
            stale.insert(id);
            stale.extend(self.ancestors(id));
        };
        match target {
            ParamTarget::Pipeline(r) | ParamTarget::Dataflow(r) => {
                with_ancestors(*r, &mut stale);
            }
            // Inner loops see the unroll and the promoted tiles of their ancestors
            ParamTarget::Unroll(r) | ParamTarget::Tile(r) => {
                stale.extend(self.subtree(*r));
                with_ancestors(*r, &mut stale);
            }
            ParamTarget::Partition(name) => {
                if let Some(array) = self.array(name) {
                    with_ancestors(self.array_scope(array), &mut stale);
                }
                let accessors: Vec<RegionId> = self
                    .regions()
                    .filter(|r| {
                        r.as_block()
                            .map_or(false, |b| b.accesses.iter().any(|a| &a.array == name))
                    })
                    .map(|r| r.id)
                    .collect();
                for block in accessors {
                    with_ancestors(block, &mut stale);
                }
            }
        }
        stale.into_iter().collect()
    }

    fn write_param(&mut self, target: &ParamTarget, value: ParamValue) -> Result<(), TransformError> {
        let mismatch = || TransformError::TypeMismatch {
            target: target.clone(),
            value,
        };
        match target {
            ParamTarget::Pipeline(r) | ParamTarget::Unroll(r) | ParamTarget::Tile(r) => {
                let region = self
                    .region_mut(*r)
                    .ok_or(TransformError::UnknownRegion(*r))?;
                let info = match &mut region.kind {
                    RegionKind::Loop(info) => info,
                    _ => return Err(not_a(target, "loop")),
                };
                match (target, value) {
                    (ParamTarget::Pipeline(_), ParamValue::Flag(on)) => {
                        info.directives.pipeline = on
                    }
                    (ParamTarget::Unroll(_), ParamValue::Factor(u)) => info.directives.unroll = u,
                    (ParamTarget::Tile(_), ParamValue::Factor(t)) => {
                        // A single tile spanning the loop is the untiled form
                        info.directives.tile = match info.trip.bounded() {
                            Some(n) if n == t => None,
                            _ => Some(t),
                        };
                    }
                    _ => return Err(mismatch()),
                }
            }
            ParamTarget::Partition(name) => {
                let factor = match value {
                    ParamValue::Factor(k) => k,
                    ParamValue::Flag(_) => return Err(mismatch()),
                };
                self.array_mut(name)
                    .ok_or_else(|| TransformError::UnknownArray(name.clone()))?
                    .partition = factor;
            }
            ParamTarget::Dataflow(r) => {
                let stages = match value {
                    ParamValue::Factor(k) => k,
                    ParamValue::Flag(_) => return Err(mismatch()),
                };
                let region = self
                    .region_mut(*r)
                    .ok_or(TransformError::UnknownRegion(*r))?;
                match &mut region.kind {
                    RegionKind::Func(info) => info.directives.dataflow = stages,
                    _ => return Err(not_a(target, "function")),
                }
            }
        }
        Ok(())
    }
}

fn not_applicable(target: &ParamTarget, reason: &str) -> TransformError {
    TransformError::NotApplicable {
        target: target.clone(),
        reason: reason.to_string(),
    }
}

fn not_a(target: &ParamTarget, what: &str) -> TransformError {
    not_applicable(target, &format!("region is not a {}", what))
}

// ============================================================================
// Operator Trait
// ============================================================================

/// A named, parameterized transformation over one hierarchy level
pub trait TransformOperator: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the operator has anything to tune at `region`
    fn applies_to(&self, module: &Module, region: RegionId) -> bool;

    /// Parameters tuned at `region`, in enumeration order
    fn targets(&self, module: &Module, region: RegionId) -> Vec<ParamTarget>;

    /// Legal values of `target` under the current configuration (ascending)
    fn domain(&self, module: &Module, target: &ParamTarget) -> Vec<ParamValue>;

    fn apply(
        &self,
        module: &mut Module,
        target: &ParamTarget,
        value: ParamValue,
    ) -> Result<ParamDelta, TransformError> {
        if !self.domain(module, target).contains(&value) {
            return Err(TransformError::OutOfDomain {
                target: target.clone(),
                value,
            });
        }
        module.set_param(target, value)
    }
}

fn flags() -> Vec<ParamValue> {
    vec![ParamValue::Flag(false), ParamValue::Flag(true)]
}

fn factors(values: Vec<u64>) -> Vec<ParamValue> {
    values.into_iter().map(ParamValue::Factor).collect()
}

fn is_static_loop(module: &Module, region: RegionId) -> bool {
    module
        .region(region)
        .and_then(|r| r.trip_count())
        .and_then(|t| t.bounded())
        .is_some()
}

/// Pipeline a loop, fully unrolling any loops below it
pub struct LoopPipelining;

impl TransformOperator for LoopPipelining {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn applies_to(&self, module: &Module, region: RegionId) -> bool {
        is_static_loop(module, region) && module.inner_loops_static(region)
    }

    fn targets(&self, module: &Module, region: RegionId) -> Vec<ParamTarget> {
        if self.applies_to(module, region) {
            vec![ParamTarget::Pipeline(region)]
        } else {
            Vec::new()
        }
    }

    fn domain(&self, _module: &Module, target: &ParamTarget) -> Vec<ParamValue> {
        match target {
            ParamTarget::Pipeline(_) => flags(),
            _ => Vec::new(),
        }
    }
}

/// Unroll a loop by a divisor of its tile size (unroll-jam for outer loops)
pub struct LoopUnroll;

impl TransformOperator for LoopUnroll {
    fn name(&self) -> &str {
        "unroll"
    }

    fn applies_to(&self, module: &Module, region: RegionId) -> bool {
        is_static_loop(module, region)
    }

    fn targets(&self, module: &Module, region: RegionId) -> Vec<ParamTarget> {
        if self.applies_to(module, region) {
            vec![ParamTarget::Unroll(region)]
        } else {
            Vec::new()
        }
    }

    fn domain(&self, module: &Module, target: &ParamTarget) -> Vec<ParamValue> {
        match target {
            ParamTarget::Unroll(r) => module
                .region(*r)
                .and_then(|region| region.as_loop())
                .and_then(|info| info.effective_tile())
                .map(|t| factors(divisors(t)))
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// Strip-mine a loop into tiles; a tile equal to the trip count is untiled
pub struct LoopTiling;

impl TransformOperator for LoopTiling {
    fn name(&self) -> &str {
        "tile"
    }

    fn applies_to(&self, module: &Module, region: RegionId) -> bool {
        is_static_loop(module, region)
    }

    fn targets(&self, module: &Module, region: RegionId) -> Vec<ParamTarget> {
        if self.applies_to(module, region) {
            vec![ParamTarget::Tile(region)]
        } else {
            Vec::new()
        }
    }

    fn domain(&self, module: &Module, target: &ParamTarget) -> Vec<ParamValue> {
        let info = match target {
            ParamTarget::Tile(r) => module.region(*r).and_then(|region| region.as_loop()),
            _ => None,
        };
        match info.and_then(|info| info.trip.bounded().map(|n| (n, info.directives.unroll))) {
            Some((n, unroll)) => factors(
                divisors(n)
                    .into_iter()
                    .filter(|t| t % unroll.max(1) == 0)
                    .collect(),
            ),
            None => Vec::new(),
        }
    }
}

/// Cyclically partition the last dimension of arrays owned by a region
pub struct ArrayPartition;

impl TransformOperator for ArrayPartition {
    fn name(&self) -> &str {
        "partition"
    }

    fn applies_to(&self, module: &Module, region: RegionId) -> bool {
        matches!(
            module.region(region).map(|r| &r.kind),
            Some(RegionKind::Func(_)) | Some(RegionKind::Dataflow)
        ) && !module.arrays_scoped_to(region).is_empty()
    }

    fn targets(&self, module: &Module, region: RegionId) -> Vec<ParamTarget> {
        if !self.applies_to(module, region) {
            return Vec::new();
        }
        module
            .arrays_scoped_to(region)
            .into_iter()
            .map(|a| ParamTarget::Partition(a.name.clone()))
            .collect()
    }

    fn domain(&self, module: &Module, target: &ParamTarget) -> Vec<ParamValue> {
        match target {
            ParamTarget::Partition(name) => module
                .array(name)
                .map(|a| factors(divisors(a.last_extent())))
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// Group the children of a function into overlapped dataflow stages.
///
/// One stage is the sequential function; one stage per child is full
/// dataflow.
pub struct FuncDataflow;

impl TransformOperator for FuncDataflow {
    fn name(&self) -> &str {
        "dataflow"
    }

    fn applies_to(&self, module: &Module, region: RegionId) -> bool {
        matches!(
            module.region(region).map(|r| &r.kind),
            Some(RegionKind::Func(_))
        ) && module.children(region).len() >= 2
    }

    fn targets(&self, module: &Module, region: RegionId) -> Vec<ParamTarget> {
        if self.applies_to(module, region) {
            vec![ParamTarget::Dataflow(region)]
        } else {
            Vec::new()
        }
    }

    fn domain(&self, module: &Module, target: &ParamTarget) -> Vec<ParamValue> {
        match target {
            ParamTarget::Dataflow(r) => {
                let children = module.children(*r).len() as u64;
                factors((1..=children.max(1)).collect())
            }
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Ordered set of operators available to the search
#[derive(Default)]
pub struct OperatorRegistry {
    operators: Vec<Box<dyn TransformOperator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// pipeline, unroll, tile, partition, dataflow
    pub fn standard() -> Self {
        let mut registry = OperatorRegistry::new();
        registry
            .register(Box::new(LoopPipelining))
            .register(Box::new(LoopUnroll))
            .register(Box::new(LoopTiling))
            .register(Box::new(ArrayPartition))
            .register(Box::new(FuncDataflow));
        registry
    }

    /// Add an operator, replacing any operator with the same name
    pub fn register(&mut self, operator: Box<dyn TransformOperator>) -> &mut Self {
        match self
            .operators
            .iter()
            .position(|op| op.name() == operator.name())
        {
            Some(i) => self.operators[i] = operator,
            None => self.operators.push(operator),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn TransformOperator> {
        self.operators
            .iter()
            .find(|op| op.name() == name)
            .map(|op| op.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.operators.iter().map(|op| op.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Operators listed in `priority` first (in that order), then the rest in
    /// registration order
    pub fn ordered(&self, priority: &[String]) -> Vec<&dyn TransformOperator> {
        let mut out: Vec<&dyn TransformOperator> = priority
            .iter()
            .filter_map(|name| self.get(name))
            .collect();
        for op in &self.operators {
            if !priority.iter().any(|p| p == op.name()) {
                out.push(op.as_ref());
            }
        }
        out
    }

    /// Whether any operator applies to `region`
    pub fn applies_anywhere(&self, module: &Module, region: RegionId) -> bool {
        self.operators
            .iter()
            .any(|op| op.applies_to(module, region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qor_estimation::QoREstimator;
    use crate::region::{
        ArrayDecl, BlockBody, MemAccess, ModuleBuilder, OpKind, Operation, Storage, TripCount,
    };

    fn nest() -> (Module, RegionId, RegionId, RegionId) {
        let mut b = ModuleBuilder::new("nest");
        let f = b.func(None, "nest");
        let outer = b.loop_(f, "i", TripCount::Static(8));
        let inner = b.loop_(outer, "j", TripCount::Static(12));
        b.block(
            inner,
            BlockBody {
                ops: vec![Operation::new(OpKind::FAdd, 32)],
                accesses: vec![
                    MemAccess::read("A", &["i", "j"]).unwrap(),
                    MemAccess::write("A", &["i", "j"]).unwrap(),
                ],
            },
        );
        b.array(ArrayDecl::new("A", &[8, 12], Storage::Local));
        (b.build().unwrap(), f, outer, inner)
    }

    #[test]
    fn test_divisors() {
        assert_eq!(divisors(12), vec![1, 2, 3, 4, 6, 12]);
        assert_eq!(divisors(1), vec![1]);
        assert_eq!(divisors(16), vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_applicability() {
        let (module, f, outer, inner) = nest();
        assert!(LoopPipelining.applies_to(&module, inner));
        assert!(LoopPipelining.applies_to(&module, outer));
        assert!(LoopUnroll.applies_to(&module, outer));
        assert!(LoopTiling.applies_to(&module, outer));
        assert!(ArrayPartition.applies_to(&module, f));
        // Only one child
        assert!(!FuncDataflow.applies_to(&module, f));
    }

    #[test]
    fn test_pipeline_needs_static_inner_nest() {
        let mut b = ModuleBuilder::new("ragged");
        let f = b.func(None, "ragged");
        let outer = b.loop_(f, "i", TripCount::Static(8));
        let inner = b.loop_(outer, "j", TripCount::Symbolic("N".to_string()));
        b.block(inner, BlockBody::default());
        let module = b.build().unwrap();
        assert!(!LoopPipelining.applies_to(&module, outer));
        assert!(LoopUnroll.applies_to(&module, outer));
        assert!(!LoopPipelining.applies_to(&module, inner));
    }

    #[test]
    fn test_dataflow_domain_counts_stages() {
        let mut b = ModuleBuilder::new("three");
        let f = b.func(None, "three");
        for iv in ["i", "j", "k"] {
            let l = b.loop_(f, iv, TripCount::Static(4));
            b.block(l, BlockBody::default());
        }
        let mut module = b.build().unwrap();
        let target = ParamTarget::Dataflow(f);
        assert!(FuncDataflow.applies_to(&module, f));
        assert_eq!(FuncDataflow.domain(&module, &target), factors(vec![1, 2, 3]));
        assert_eq!(module.param(&target).unwrap(), ParamValue::Factor(1));

        let delta = FuncDataflow
            .apply(&mut module, &target, ParamValue::Factor(2))
            .unwrap();
        assert_eq!(delta.previous, ParamValue::Factor(1));
        assert_eq!(module.region(f).unwrap().dataflow_stages(), 2);
        assert!(matches!(
            FuncDataflow.apply(&mut module, &target, ParamValue::Factor(4)),
            Err(TransformError::OutOfDomain { .. })
        ));
        assert!(matches!(
            module.set_param(&target, ParamValue::Flag(true)),
            Err(TransformError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_outer_unroll_invalidates_inner_loops() {
        let (mut module, f, outer, inner) = nest();
        QoREstimator::default().run(&mut module).unwrap();
        module
            .set_param(&ParamTarget::Unroll(outer), ParamValue::Factor(2))
            .unwrap();
        let table = module.metrics_table();
        assert!(table.get(inner).is_none());
        assert!(table.get(outer).is_none());
        assert!(table.get(f).is_none());
    }

    #[test]
    fn test_domains() {
        let (module, _, outer, inner) = nest();
        assert_eq!(
            LoopUnroll.domain(&module, &ParamTarget::Unroll(inner)),
            factors(divisors(12))
        );
        assert_eq!(
            LoopTiling.domain(&module, &ParamTarget::Tile(outer)),
            factors(vec![1, 2, 4, 8])
        );
        assert_eq!(
            ArrayPartition.domain(&module, &ParamTarget::Partition("A".to_string())),
            factors(divisors(12))
        );
    }

    #[test]
    fn test_tile_domain_respects_unroll() {
        let (mut module, _, _, inner) = nest();
        module
            .set_param(&ParamTarget::Unroll(inner), ParamValue::Factor(4))
            .unwrap();
        assert_eq!(
            LoopTiling.domain(&module, &ParamTarget::Tile(inner)),
            factors(vec![4, 12])
        );
    }

    #[test]
    fn test_apply_and_restore() {
        let (mut module, _, _, inner) = nest();
        let target = ParamTarget::Unroll(inner);
        let delta = LoopUnroll
            .apply(&mut module, &target, ParamValue::Factor(3))
            .unwrap();
        assert_eq!(delta.previous, ParamValue::Factor(1));
        assert_eq!(module.param(&target).unwrap(), ParamValue::Factor(3));
        module.restore(&delta).unwrap();
        assert_eq!(module.param(&target).unwrap(), ParamValue::Factor(1));
    }

    #[test]
    fn test_out_of_domain_is_rejected() {
        let (mut module, _, _, inner) = nest();
        let err = LoopUnroll
            .apply(&mut module, &ParamTarget::Unroll(inner), ParamValue::Factor(5))
            .unwrap_err();
        assert!(matches!(err, TransformError::OutOfDomain { .. }));
        assert_eq!(
            module.param(&ParamTarget::Unroll(inner)).unwrap(),
            ParamValue::Factor(1)
        );
    }

    #[test]
    fn test_invalid_result_rolls_back() {
        let (mut module, _, outer, inner) = nest();
        module
            .set_param(&ParamTarget::Tile(inner), ParamValue::Factor(6))
            .unwrap();
        // 4 does not divide the tile size 6
        let err = module
            .set_param(&ParamTarget::Unroll(inner), ParamValue::Factor(4))
            .unwrap_err();
        assert!(matches!(err, TransformError::Invalid(_)));
        assert_eq!(
            module.param(&ParamTarget::Unroll(inner)).unwrap(),
            ParamValue::Factor(1)
        );
        // Wrong value type
        assert!(matches!(
            module.set_param(&ParamTarget::Tile(outer), ParamValue::Flag(true)),
            Err(TransformError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_full_tile_is_untiled() {
        let (mut module, _, outer, _) = nest();
        let target = ParamTarget::Tile(outer);
        module.set_param(&target, ParamValue::Factor(2)).unwrap();
        module.set_param(&target, ParamValue::Factor(8)).unwrap();
        let info = module.region(outer).unwrap().as_loop().unwrap();
        assert_eq!(info.directives.tile, None);
    }

    #[test]
    fn test_set_param_invalidates_ancestors() {
        let (mut module, f, outer, inner) = nest();
        QoREstimator::default().run(&mut module).unwrap();
        module
            .set_param(&ParamTarget::Pipeline(inner), ParamValue::Flag(true))
            .unwrap();
        let table = module.metrics_table();
        assert!(table.get(inner).is_none());
        assert!(table.get(outer).is_none());
        assert!(table.get(f).is_none());
    }

    #[test]
    fn test_registry_order() {
        let registry = OperatorRegistry::standard();
        assert_eq!(
            registry.names(),
            vec!["pipeline", "unroll", "tile", "partition", "dataflow"]
        );
        let priority = ["tile".to_string(), "pipeline".to_string()];
        let operators = registry.ordered(&priority);
        let ordered: Vec<&str> = operators.iter().map(|op| op.name()).collect();
        assert_eq!(
            ordered,
            vec!["tile", "pipeline", "unroll", "partition", "dataflow"]
        );
    }
}
