//! Hierarchical affine / dataflow program representation
//!
//! The representation is produced upstream (graph import + legalization) and
//! only read and annotated here. A [`Module`] is an arena of [`Region`]s keyed
//! by [`RegionId`] plus a table of arrays. Every region is one variant of the
//! closed sum type [`RegionKind`]:
//!
//! ```text
//! Dataflow / Func            children grouped into sequential or overlapped stages
//!   └── Loop (nest)          trip count + directives (pipeline, unroll, tile)
//!         └── Loop           innermost loop: body holds only blocks
//!               └── Block    straight-line operations + array accesses
//! ```
//!
//! # Design Invariants
//!
//! 1. Exactly one root; every parent reference resolves; no parent cycles.
//! 2. Blocks are leaves.
//! 3. `unroll > 1` and tiles need a static trip count; tiles divide the trip
//!    count and are multiples of the unroll. A pipelined loop fully unrolls
//!    the loops below it, so all of them need static trip counts.
//! 4. A function's dataflow stage count lies in `1..=children`.
//! 5. Metrics live in the side-table ([`MetricsTable`]), never on regions.
//!
//! Violating 1–2 is a fatal precondition error ([`ModuleError`]).

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use crate::metrics::MetricsTable;

// ============================================================================
// Errors
// ============================================================================

/// Structural errors in the input representation (fatal)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("region {0} is defined more than once")]
    DuplicateRegion(RegionId),

    #[error("region {region} references undefined parent {parent}")]
    UndefinedParent { region: RegionId, parent: RegionId },

    #[error("module has no root region")]
    NoRoot,

    #[error("module has multiple root regions: {0} and {1}")]
    MultipleRoots(RegionId, RegionId),

    #[error("region {0} is part of a parent cycle")]
    Cycle(RegionId),

    #[error("block {0} cannot have children")]
    ChildOfBlock(RegionId),

    #[error("array '{0}' is declared more than once")]
    DuplicateArray(String),

    #[error("region {region} accesses undeclared array '{array}'")]
    UndeclaredArray { region: RegionId, array: String },

    #[error("access to '{array}' in region {region} has rank {found}, array has rank {expected}")]
    RankMismatch {
        region: RegionId,
        array: String,
        expected: usize,
        found: usize,
    },

    #[error("array '{array}' has invalid scope {scope}: {reason}")]
    InvalidScope {
        array: String,
        scope: RegionId,
        reason: String,
    },

    #[error("invalid array '{array}': {reason}")]
    InvalidArray { array: String, reason: String },

    #[error("invalid directive on region {region}: {reason}")]
    InvalidDirective { region: RegionId, reason: String },

    #[error("invalid affine index '{0}'")]
    InvalidIndex(String),
}

// ============================================================================
// Identifiers and Leaf Types
// ============================================================================

/// Stable region identifier (as given by the upstream representation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub usize);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Operation kinds known to the latency table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shift,
    Logic,
    Cmp,
    Select,
    Cast,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FCmp,
    FSqrt,
}

impl OpKind {
    pub const ALL: [OpKind; 16] = [
        OpKind::Add,
        OpKind::Sub,
        OpKind::Mul,
        OpKind::Div,
        OpKind::Rem,
        OpKind::Shift,
        OpKind::Logic,
        OpKind::Cmp,
        OpKind::Select,
        OpKind::Cast,
        OpKind::FAdd,
        OpKind::FSub,
        OpKind::FMul,
        OpKind::FDiv,
        OpKind::FCmp,
        OpKind::FSqrt,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Rem => "rem",
            OpKind::Shift => "shift",
            OpKind::Logic => "logic",
            OpKind::Cmp => "cmp",
            OpKind::Select => "select",
            OpKind::Cast => "cast",
            OpKind::FAdd => "fadd",
            OpKind::FSub => "fsub",
            OpKind::FMul => "fmul",
            OpKind::FDiv => "fdiv",
            OpKind::FCmp => "fcmp",
            OpKind::FSqrt => "fsqrt",
        }
    }

    pub fn from_name(name: &str) -> Option<OpKind> {
        OpKind::ALL.iter().copied().find(|k| k.name() == name)
    }
}

fn default_bits() -> u32 {
    32
}

fn default_factor() -> u64 {
    1
}

/// One operation of a straight-line body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    #[serde(default = "default_bits")]
    pub bits: u32,
}

impl Operation {
    pub fn new(kind: OpKind, bits: u32) -> Self {
        Operation { kind, bits }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
}

lazy_static! {
    static ref INDEX_CHARSET: Regex = Regex::new(r"^[A-Za-z0-9_+\-*\s]+$").unwrap();
    static ref INDEX_VAR: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap();
}

/// One dimension of an affine subscript, e.g. `i+k` or `2*j+1`
///
/// Only the set of loop variables matters to the cost model; coefficients
/// and constants are kept in `expr` for round-tripping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AffineIndex {
    expr: String,
    vars: Vec<String>,
}

impl AffineIndex {
    pub fn parse(expr: &str) -> Result<Self, ModuleError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() || !INDEX_CHARSET.is_match(trimmed) {
            return Err(ModuleError::InvalidIndex(expr.to_string()));
        }
        let mut vars: Vec<String> = Vec::new();
        for m in INDEX_VAR.find_iter(trimmed) {
            let name = m.as_str().to_string();
            if !vars.contains(&name) {
                vars.push(name);
            }
        }
        Ok(AffineIndex {
            expr: trimmed.to_string(),
            vars,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    pub fn uses(&self, iv: &str) -> bool {
        self.vars.iter().any(|v| v == iv)
    }
}

impl TryFrom<String> for AffineIndex {
    type Error = ModuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AffineIndex::parse(&value)
    }
}

impl From<AffineIndex> for String {
    fn from(index: AffineIndex) -> Self {
        index.expr
    }
}

/// Array access inside a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemAccess {
    pub array: String,
    pub kind: AccessKind,
    pub index: Vec<AffineIndex>,
}

impl MemAccess {
    pub fn new(array: &str, kind: AccessKind, index: &[&str]) -> Result<Self, ModuleError> {
        Ok(MemAccess {
            array: array.to_string(),
            kind,
            index: index
                .iter()
                .map(|e| AffineIndex::parse(e))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn read(array: &str, index: &[&str]) -> Result<Self, ModuleError> {
        Self::new(array, AccessKind::Read, index)
    }

    pub fn write(array: &str, index: &[&str]) -> Result<Self, ModuleError> {
        Self::new(array, AccessKind::Write, index)
    }

    /// Whether the last (partitioned) dimension is indexed by `iv`
    pub fn last_dim_uses(&self, iv: &str) -> bool {
        self.index.last().map_or(false, |d| d.uses(iv))
    }

    pub fn uses(&self, iv: &str) -> bool {
        self.index.iter().any(|d| d.uses(iv))
    }
}

// ============================================================================
// Region Kinds
// ============================================================================

/// Straight-line body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    #[serde(default)]
    pub ops: Vec<Operation>,
    #[serde(default)]
    pub accesses: Vec<MemAccess>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TripCount {
    Static(u64),
    Symbolic(String),
}

impl TripCount {
    /// Static, non-zero trip count
    pub fn bounded(&self) -> Option<u64> {
        match self {
            TripCount::Static(n) if *n > 0 => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopDirectives {
    #[serde(default)]
    pub pipeline: bool,
    #[serde(default = "default_factor")]
    pub unroll: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile: Option<u64>,
}

impl Default for LoopDirectives {
    fn default() -> Self {
        LoopDirectives {
            pipeline: false,
            unroll: 1,
            tile: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    pub iv: String,
    pub trip: TripCount,
    #[serde(default)]
    pub directives: LoopDirectives,
}

impl LoopInfo {
    /// Tile size, where an untiled loop is one tile spanning the trip count
    pub fn effective_tile(&self) -> Option<u64> {
        let n = self.trip.bounded()?;
        Some(self.directives.tile.unwrap_or(n))
    }

    /// Tiled with a tile strictly smaller than the trip count
    pub fn is_tiled(&self) -> bool {
        match (self.trip.bounded(), self.directives.tile) {
            (Some(n), Some(t)) => t < n,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncDirectives {
    /// Dataflow stages the children are grouped into (1 = sequential)
    #[serde(default = "default_factor")]
    pub dataflow: u64,
    /// Group stages by child latency instead of child count
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub balance: bool,
}

impl Default for FuncDirectives {
    fn default() -> Self {
        FuncDirectives {
            dataflow: 1,
            balance: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncInfo {
    pub name: String,
    #[serde(default)]
    pub directives: FuncDirectives,
}

/// Closed set of region kinds, dispatched by `match`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegionKind {
    Block(BlockBody),
    Loop(LoopInfo),
    Func(FuncInfo),
    Dataflow,
}

/// How children of a region are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Composition {
    Sequential,
    Dataflow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    /// On-chip for the lifetime of the scope region
    #[default]
    Local,
    /// Off-chip; promoted into on-chip tile buffers by tiled loops
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayDecl {
    pub name: String,
    pub shape: Vec<u64>,
    #[serde(default = "default_bits")]
    pub bits: u32,
    #[serde(default)]
    pub storage: Storage,
    /// Region whose lifetime the array shares (defaults to the root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<RegionId>,
    /// Cyclic partition factor of the last dimension
    #[serde(default = "default_factor")]
    pub partition: u64,
}

impl ArrayDecl {
    pub fn new(name: &str, shape: &[u64], storage: Storage) -> Self {
        ArrayDecl {
            name: name.to_string(),
            shape: shape.to_vec(),
            bits: 32,
            storage,
            scope: None,
            partition: 1,
        }
    }

    /// Element count, saturating for shapes beyond `u64`
    pub fn elements(&self) -> u64 {
        self.shape.iter().fold(1u64, |n, d| n.saturating_mul(*d))
    }

    pub fn last_extent(&self) -> u64 {
        self.shape.last().copied().unwrap_or(1)
    }
}

// ============================================================================
// Region
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub id: RegionId,
    pub parent: Option<RegionId>,
    pub children: Vec<RegionId>,
    pub kind: RegionKind,
    /// Explicit composition annotation (None = not annotated)
    pub composition: Option<Composition>,
}

impl Region {
    pub fn trip_count(&self) -> Option<&TripCount> {
        match &self.kind {
            RegionKind::Loop(info) => Some(&info.trip),
            _ => None,
        }
    }

    pub fn children(&self) -> &[RegionId] {
        &self.children
    }

    /// Number of consecutive child groups that run as overlapped stages.
    ///
    /// Dataflow nodes give every child its own stage; functions follow their
    /// `dataflow` directive; everything else follows its annotation and
    /// defaults to a single sequential stage.
    pub fn dataflow_stages(&self) -> usize {
        let n = self.children.len().max(1);
        match &self.kind {
            RegionKind::Dataflow => n,
            RegionKind::Func(info) => {
                usize::try_from(info.directives.dataflow).map_or(n, |k| k.clamp(1, n))
            }
            _ => match self.composition {
                Some(Composition::Dataflow) => n,
                _ => 1,
            },
        }
    }

    /// Whether stage boundaries follow child latency (functions only)
    pub fn balances_stages(&self) -> bool {
        matches!(&self.kind, RegionKind::Func(info) if info.directives.balance)
    }

    /// Composition used by the aggregator between stages
    pub fn composition_kind(&self) -> Composition {
        if self.dataflow_stages() > 1 {
            Composition::Dataflow
        } else {
            Composition::Sequential
        }
    }

    pub fn as_loop(&self) -> Option<&LoopInfo> {
        match &self.kind {
            RegionKind::Loop(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&BlockBody> {
        match &self.kind {
            RegionKind::Block(body) => Some(body),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            RegionKind::Block(_) => "block",
            RegionKind::Loop(_) => "loop",
            RegionKind::Func(_) => "func",
            RegionKind::Dataflow => "dataflow",
        }
    }

    pub fn label(&self) -> String {
        match &self.kind {
            RegionKind::Loop(info) => format!("{} (loop {})", self.id, info.iv),
            RegionKind::Func(info) => format!("{} (func {})", self.id, info.name),
            _ => format!("{} ({})", self.id, self.kind_name()),
        }
    }
}

// ============================================================================
// Textual Form
// ============================================================================

/// Flat region record of the module file; children follow list order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub id: RegionId,
    #[serde(default)]
    pub parent: Option<RegionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition: Option<Composition>,
    #[serde(flatten)]
    pub kind: RegionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleFile {
    pub name: String,
    pub regions: Vec<RegionRecord>,
    #[serde(default)]
    pub arrays: Vec<ArrayDecl>,
}

// ============================================================================
// Module
// ============================================================================

/// The program representation plus its metrics side-table
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    root: RegionId,
    regions: BTreeMap<RegionId, Region>,
    arrays: Vec<ArrayDecl>,
    pub(crate) metrics: MetricsTable,
}

impl Module {
    /// Build and validate a module from its flat textual form
    pub fn from_file(file: ModuleFile) -> Result<Module, ModuleError> {
        let mut regions: BTreeMap<RegionId, Region> = BTreeMap::new();
        let mut order = Vec::with_capacity(file.regions.len());
        for record in file.regions {
            if regions.contains_key(&record.id) {
                return Err(ModuleError::DuplicateRegion(record.id));
            }
            order.push((record.id, record.parent));
            regions.insert(
                record.id,
                Region {
                    id: record.id,
                    parent: record.parent,
                    children: Vec::new(),
                    kind: record.kind,
                    composition: record.composition,
                },
            );
        }

        let mut root = None;
        for (id, parent) in &order {
            match parent {
                None => match root {
                    None => root = Some(*id),
                    Some(first) => return Err(ModuleError::MultipleRoots(first, *id)),
                },
                Some(p) => match regions.get_mut(p) {
                    Some(parent_region) => parent_region.children.push(*id),
                    None => {
                        return Err(ModuleError::UndefinedParent {
                            region: *id,
                            parent: *p,
                        })
                    }
                },
            }
        }
        let root = root.ok_or(ModuleError::NoRoot)?;

        let module = Module {
            name: file.name,
            root,
            regions,
            arrays: file.arrays,
            metrics: MetricsTable::new(),
        };
        module.validate()?;
        Ok(module)
    }

    /// Flat textual form (pre-order, children in order)
    pub fn to_file(&self) -> ModuleFile {
        let regions = self
            .preorder()
            .into_iter()
            .filter_map(|id| self.regions.get(&id))
            .map(|r| RegionRecord {
                id: r.id,
                parent: r.parent,
                composition: r.composition,
                kind: r.kind.clone(),
            })
            .collect();
        ModuleFile {
            name: self.name.clone(),
            regions,
            arrays: self.arrays.clone(),
        }
    }

    /// Check the structural invariants; any failure is a precondition error.
    pub fn validate(&self) -> Result<(), ModuleError> {
        // Reachability from the root catches parent cycles: with one root and
        // all parents resolved, a region off the root's tree sits on a cycle.
        let reachable: BTreeSet<RegionId> = self.preorder().into_iter().collect();
        if let Some(orphan) = self.regions.keys().find(|id| !reachable.contains(id)) {
            return Err(ModuleError::Cycle(*orphan));
        }

        let mut names = BTreeSet::new();
        for array in &self.arrays {
            if !names.insert(array.name.as_str()) {
                return Err(ModuleError::DuplicateArray(array.name.clone()));
            }
            self.validate_array(array)?;
        }

        for region in self.regions.values() {
            match &region.kind {
                RegionKind::Block(body) => {
                    if !region.children.is_empty() {
                        return Err(ModuleError::ChildOfBlock(region.id));
                    }
                    for access in &body.accesses {
                        let array = self.array(&access.array).ok_or_else(|| {
                            ModuleError::UndeclaredArray {
                                region: region.id,
                                array: access.array.clone(),
                            }
                        })?;
                        if array.shape.len() != access.index.len() {
                            return Err(ModuleError::RankMismatch {
                                region: region.id,
                                array: access.array.clone(),
                                expected: array.shape.len(),
                                found: access.index.len(),
                            });
                        }
                    }
                }
                RegionKind::Loop(info) => self.validate_loop(region.id, info)?,
                RegionKind::Func(info) => {
                    let stages = info.directives.dataflow;
                    let limit = region.children.len().max(1) as u64;
                    if stages == 0 || stages > limit {
                        return Err(ModuleError::InvalidDirective {
                            region: region.id,
                            reason: format!(
                                "dataflow stages {} outside 1..={}",
                                stages, limit
                            ),
                        });
                    }
                }
                RegionKind::Dataflow => {}
            }
        }
        Ok(())
    }

    fn validate_array(&self, array: &ArrayDecl) -> Result<(), ModuleError> {
        let invalid = |reason: &str| ModuleError::InvalidArray {
            array: array.name.clone(),
            reason: reason.to_string(),
        };
        if array.shape.is_empty() || array.shape.iter().any(|d| *d == 0) {
            return Err(invalid("shape must be non-empty with positive extents"));
        }
        if array.bits == 0 {
            return Err(invalid("element width must be positive"));
        }
        if array.partition == 0 || array.last_extent() % array.partition != 0 {
            return Err(invalid("partition factor must divide the last extent"));
        }
        let scope = self.array_scope(array);
        match self.regions.get(&scope).map(|r| &r.kind) {
            Some(RegionKind::Func(_)) | Some(RegionKind::Dataflow) => Ok(()),
            Some(_) => Err(ModuleError::InvalidScope {
                array: array.name.clone(),
                scope,
                reason: "scope must be a function or dataflow region".to_string(),
            }),
            None => Err(ModuleError::InvalidScope {
                array: array.name.clone(),
                scope,
                reason: "region does not exist".to_string(),
            }),
        }
    }

    fn validate_loop(&self, id: RegionId, info: &LoopInfo) -> Result<(), ModuleError> {
        let invalid = |reason: String| ModuleError::InvalidDirective { region: id, reason };
        let d = &info.directives;
        if d.unroll == 0 {
            return Err(invalid("unroll factor must be positive".to_string()));
        }
        if d.pipeline && !self.inner_loops_static(id) {
            return Err(invalid(
                "pipelined loop nest has an inner loop without a static trip count".to_string(),
            ));
        }
        match info.trip.bounded() {
            Some(n) => {
                let tile = d.tile.unwrap_or(n);
                if tile == 0 || n % tile != 0 {
                    return Err(invalid(format!("tile {} does not divide trip {}", tile, n)));
                }
                if tile % d.unroll != 0 {
                    return Err(invalid(format!(
                        "unroll {} does not divide tile {}",
                        d.unroll, tile
                    )));
                }
            }
            None => {
                if d.unroll > 1 || d.tile.is_some() {
                    return Err(invalid(
                        "unbounded loops cannot be unrolled or tiled".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn root(&self) -> RegionId {
        self.root
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id)
    }

    pub(crate) fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.get_mut(&id)
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn children(&self, id: RegionId) -> &[RegionId] {
        self.regions
            .get(&id)
            .map(|r| r.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn arrays(&self) -> &[ArrayDecl] {
        &self.arrays
    }

    pub fn array(&self, name: &str) -> Option<&ArrayDecl> {
        self.arrays.iter().find(|a| a.name == name)
    }

    pub(crate) fn array_mut(&mut self, name: &str) -> Option<&mut ArrayDecl> {
        self.arrays.iter_mut().find(|a| a.name == name)
    }

    pub fn array_scope(&self, array: &ArrayDecl) -> RegionId {
        array.scope.unwrap_or(self.root)
    }

    /// Arrays whose lifetime is tied to `id`, in declaration order
    pub fn arrays_scoped_to(&self, id: RegionId) -> Vec<&ArrayDecl> {
        self.arrays
            .iter()
            .filter(|a| self.array_scope(a) == id)
            .collect()
    }

    /// Parent chain, nearest first
    pub fn ancestors(&self, id: RegionId) -> Vec<RegionId> {
        let mut chain = Vec::new();
        let mut current = self.regions.get(&id).and_then(|r| r.parent);
        while let Some(p) = current {
            if chain.contains(&p) || chain.len() > self.regions.len() {
                break;
            }
            chain.push(p);
            current = self.regions.get(&p).and_then(|r| r.parent);
        }
        chain
    }

    /// Nesting depth (root = 0)
    pub fn depth(&self, id: RegionId) -> usize {
        self.ancestors(id).len()
    }

    /// Pre-order traversal from the root
    pub fn preorder(&self) -> Vec<RegionId> {
        self.subtree(self.root)
    }

    /// Pre-order traversal of the subtree rooted at `id` (inclusive)
    pub fn subtree(&self, id: RegionId) -> Vec<RegionId> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(region) = self.regions.get(&current) {
                out.push(current);
                stack.extend(region.children.iter().rev().copied());
            }
        }
        out
    }

    /// A loop whose body holds only blocks
    pub fn is_innermost_loop(&self, id: RegionId) -> bool {
        match self.regions.get(&id) {
            Some(region) if region.as_loop().is_some() => region.children.iter().all(|c| {
                self.regions
                    .get(c)
                    .map_or(false, |r| matches!(r.kind, RegionKind::Block(_)))
            }),
            _ => false,
        }
    }

    /// Every loop strictly below `id` has a static, non-zero trip count
    pub fn inner_loops_static(&self, id: RegionId) -> bool {
        self.subtree(id)
            .into_iter()
            .skip(1)
            .filter_map(|r| self.regions.get(&r).and_then(|r| r.trip_count()))
            .all(|trip| trip.bounded().is_some())
    }

    /// Number of operations in the subtree (body size)
    pub fn op_count(&self, id: RegionId) -> usize {
        self.subtree(id)
            .iter()
            .filter_map(|r| self.regions.get(r).and_then(|r| r.as_block()))
            .map(|b| b.ops.len())
            .sum()
    }

    /// All accesses in the subtree, in pre-order
    pub fn accesses_in(&self, id: RegionId) -> Vec<&MemAccess> {
        self.subtree(id)
            .iter()
            .filter_map(|r| self.regions.get(r).and_then(|r| r.as_block()))
            .flat_map(|b| b.accesses.iter())
            .collect()
    }

    /// Static trip counts of the loops in the subtree, keyed by induction var
    pub fn loop_ranges_in(&self, id: RegionId) -> BTreeMap<String, Option<u64>> {
        self.subtree(id)
            .iter()
            .filter_map(|r| self.regions.get(r).and_then(|r| r.as_loop()))
            .map(|info| (info.iv.clone(), info.trip.bounded()))
            .collect()
    }

    pub fn metrics_table(&self) -> &MetricsTable {
        &self.metrics
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Programmatic construction of modules (ids assigned in insertion order)
///
/// ```rust
/// use hlsdse::region::{ArrayDecl, BlockBody, MemAccess, ModuleBuilder, Storage, TripCount};
///
/// let mut b = ModuleBuilder::new("scale");
/// let f = b.func(None, "scale");
/// let l = b.loop_(f, "i", TripCount::Static(64));
/// b.block(l, BlockBody {
///     ops: vec![],
///     accesses: vec![MemAccess::read("A", &["i"]).unwrap()],
/// });
/// b.array(ArrayDecl::new("A", &[64], Storage::Local));
/// let module = b.build().unwrap();
/// assert_eq!(module.len(), 3);
/// ```
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    name: String,
    regions: Vec<RegionRecord>,
    arrays: Vec<ArrayDecl>,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        ModuleBuilder {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn push(&mut self, parent: Option<RegionId>, kind: RegionKind) -> RegionId {
        let id = RegionId(self.regions.len());
        self.regions.push(RegionRecord {
            id,
            parent,
            composition: None,
            kind,
        });
        id
    }

    pub fn func(&mut self, parent: Option<RegionId>, name: &str) -> RegionId {
        self.push(
            parent,
            RegionKind::Func(FuncInfo {
                name: name.to_string(),
                directives: FuncDirectives::default(),
            }),
        )
    }

    pub fn dataflow(&mut self, parent: Option<RegionId>) -> RegionId {
        self.push(parent, RegionKind::Dataflow)
    }

    pub fn loop_(&mut self, parent: RegionId, iv: &str, trip: TripCount) -> RegionId {
        self.push(
            Some(parent),
            RegionKind::Loop(LoopInfo {
                iv: iv.to_string(),
                trip,
                directives: LoopDirectives::default(),
            }),
        )
    }

    pub fn block(&mut self, parent: RegionId, body: BlockBody) -> RegionId {
        self.push(Some(parent), RegionKind::Block(body))
    }

    /// Annotate the composition of an already added region
    pub fn compose(&mut self, id: RegionId, composition: Composition) -> &mut Self {
        if let Some(record) = self.regions.iter_mut().find(|r| r.id == id) {
            record.composition = Some(composition);
        }
        self
    }

    /// Replace the directives of an already added loop
    pub fn directives(&mut self, id: RegionId, directives: LoopDirectives) -> &mut Self {
        if let Some(RegionKind::Loop(info)) = self
            .regions
            .iter_mut()
            .find(|r| r.id == id)
            .map(|r| &mut r.kind)
        {
            info.directives = directives;
        }
        self
    }

    pub fn array(&mut self, array: ArrayDecl) -> &mut Self {
        self.arrays.push(array);
        self
    }

    pub fn build(self) -> Result<Module, ModuleError> {
        Module::from_file(ModuleFile {
            name: self.name,
            regions: self.regions,
            arrays: self.arrays,
        })
    }
}
