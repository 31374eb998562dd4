//! QoR metrics and the per-region side-table
//!
//! Metrics are never stored on regions. The [`MetricsTable`] is owned by the
//! module as a side-table keyed by [`RegionId`], populated by the QoR
//! estimation pass and invalidated whenever a directive changes.
//!
//! # Unknown latency
//!
//! A loop with a symbolic (or zero) trip count has no bounded latency. This is
//! modelled by [`Cycles::Unknown`], which absorbs every arithmetic operation it
//! takes part in. Resource usage stays computable for unknown metrics, so the
//! search can still fall back to a resource-based preference.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::region::RegionId;

// ============================================================================
// Resource Kinds
// ============================================================================

/// Hardware resource classes tracked by the cost model
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Functional units (DSP-like arithmetic blocks)
    ComputeUnit,
    /// Concurrently used memory ports
    MemoryPort,
    /// On-chip storage banks (18Kb-equivalent)
    StorageElement,
    /// Loop / function controllers (FSMs)
    ControlUnit,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::ComputeUnit,
        ResourceKind::MemoryPort,
        ResourceKind::StorageElement,
        ResourceKind::ControlUnit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::ComputeUnit => "compute-unit",
            ResourceKind::MemoryPort => "memory-port",
            ResourceKind::StorageElement => "storage-element",
            ResourceKind::ControlUnit => "control-unit",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s.trim())
            .ok_or_else(|| format!("unknown resource kind '{}'", s))
    }
}

// ============================================================================
// Resource Usage
// ============================================================================

/// Resource counts for one region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub compute_units: u64,
    pub memory_ports: u64,
    pub storage_elements: u64,
    pub control_units: u64,
}

impl ResourceUsage {
    pub fn get(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::ComputeUnit => self.compute_units,
            ResourceKind::MemoryPort => self.memory_ports,
            ResourceKind::StorageElement => self.storage_elements,
            ResourceKind::ControlUnit => self.control_units,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, value: u64) {
        match kind {
            ResourceKind::ComputeUnit => self.compute_units = value,
            ResourceKind::MemoryPort => self.memory_ports = value,
            ResourceKind::StorageElement => self.storage_elements = value,
            ResourceKind::ControlUnit => self.control_units = value,
        }
    }

    /// Combine two time-disjoint regions.
    ///
    /// Compute units, ports and controllers are reused across sequential
    /// regions (peak = max), but buffers stay live and accumulate.
    pub fn sequential(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            compute_units: self.compute_units.max(other.compute_units),
            memory_ports: self.memory_ports.max(other.memory_ports),
            storage_elements: self.storage_elements.saturating_add(other.storage_elements),
            control_units: self.control_units.max(other.control_units),
        }
    }

    /// Combine two concurrently running regions (no reuse)
    pub fn concurrent(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            compute_units: self.compute_units.saturating_add(other.compute_units),
            memory_ports: self.memory_ports.saturating_add(other.memory_ports),
            storage_elements: self.storage_elements.saturating_add(other.storage_elements),
            control_units: self.control_units.saturating_add(other.control_units),
        }
    }

    /// Sum over all kinds, used as a coarse size measure
    pub fn total(&self) -> u64 {
        ResourceKind::ALL
            .iter()
            .fold(0u64, |acc, k| acc.saturating_add(self.get(*k)))
    }

    /// True if every count is `<=` the other's
    pub fn fits_within(&self, other: &ResourceUsage) -> bool {
        ResourceKind::ALL
            .iter()
            .all(|k| self.get(*k) <= other.get(*k))
    }

    /// Pareto comparison: no count larger and at least one strictly smaller
    pub fn strictly_below(&self, other: &ResourceUsage) -> bool {
        self.fits_within(other) && self != other
    }
}

// ============================================================================
// Cycles
// ============================================================================

/// A cycle count that may be unbounded
///
/// `Unknown` is not zero and not infinity: it is non-comparable. Every
/// arithmetic helper propagates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cycles {
    Known(u64),
    Unknown,
}

impl Cycles {
    pub const ZERO: Cycles = Cycles::Known(0);

    pub fn known(&self) -> Option<u64> {
        match self {
            Cycles::Known(c) => Some(*c),
            Cycles::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Cycles::Unknown)
    }

    pub fn add(self, other: Cycles) -> Cycles {
        match (self, other) {
            (Cycles::Known(a), Cycles::Known(b)) => Cycles::Known(a.saturating_add(b)),
            _ => Cycles::Unknown,
        }
    }

    pub fn max(self, other: Cycles) -> Cycles {
        match (self, other) {
            (Cycles::Known(a), Cycles::Known(b)) => Cycles::Known(a.max(b)),
            _ => Cycles::Unknown,
        }
    }

    pub fn scale(self, factor: u64) -> Cycles {
        match self {
            Cycles::Known(a) => Cycles::Known(a.saturating_mul(factor)),
            Cycles::Unknown => Cycles::Unknown,
        }
    }
}

impl fmt::Display for Cycles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cycles::Known(c) => write!(f, "{}", c),
            Cycles::Unknown => f.write_str("unknown"),
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Estimated QoR of one region under its current directives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub latency: Cycles,
    /// Cycles between successive starts (the II for pipelined loops)
    pub interval: Cycles,
    pub resources: ResourceUsage,
}

impl Metrics {
    pub fn new(latency: Cycles, interval: Cycles, resources: ResourceUsage) -> Self {
        Metrics {
            latency,
            interval,
            resources,
        }
    }

    /// Zero-latency, zero-resource metrics (identity of sequential composition)
    pub fn empty() -> Self {
        Metrics::new(Cycles::ZERO, Cycles::ZERO, ResourceUsage::default())
    }

    pub fn is_unknown(&self) -> bool {
        self.latency.is_unknown()
    }
}

/// Budget violation attached to a region by the estimation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Violation {
    Resource {
        kind: ResourceKind,
        used: u64,
        budget: u64,
    },
    Latency {
        cycles: u64,
        budget: u64,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Resource { kind, used, budget } => {
                write!(f, "{} usage {} exceeds budget {}", kind, used, budget)
            }
            Violation::Latency { cycles, budget } => {
                write!(f, "latency {} exceeds budget {}", cycles, budget)
            }
        }
    }
}

/// Side-table entry for one region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionQoR {
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

// ============================================================================
// Metrics Table
// ============================================================================

/// Saved side-table entries, restored verbatim when a candidate is reverted
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    entries: Vec<(RegionId, Option<RegionQoR>)>,
}

/// Per-region metrics side-table
///
/// A missing entry means "stale or never computed"; readers must refresh
/// through the estimation pass rather than fall back to an old value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsTable {
    entries: BTreeMap<RegionId, RegionQoR>,
}

impl MetricsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: RegionId) -> Option<&RegionQoR> {
        self.entries.get(&id)
    }

    pub fn metrics(&self, id: RegionId) -> Option<&Metrics> {
        self.entries.get(&id).map(|e| &e.metrics)
    }

    pub fn insert(&mut self, id: RegionId, entry: RegionQoR) {
        self.entries.insert(id, entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RegionId, &RegionQoR)> {
        self.entries.iter()
    }

    /// Drop the entries of the given regions
    pub fn invalidate<I: IntoIterator<Item = RegionId>>(&mut self, ids: I) {
        for id in ids {
            self.entries.remove(&id);
        }
    }

    pub fn snapshot<I: IntoIterator<Item = RegionId>>(&self, ids: I) -> MetricsSnapshot {
        MetricsSnapshot {
            entries: ids
                .into_iter()
                .map(|id| (id, self.entries.get(&id).cloned()))
                .collect(),
        }
    }

    pub fn restore(&mut self, snapshot: MetricsSnapshot) {
        for (id, entry) in snapshot.entries {
            match entry {
                Some(e) => {
                    self.entries.insert(id, e);
                }
                None => {
                    self.entries.remove(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_absorbs_arithmetic() {
        assert_eq!(Cycles::Known(3).add(Cycles::Known(4)), Cycles::Known(7));
        assert_eq!(Cycles::Known(3).add(Cycles::Unknown), Cycles::Unknown);
        assert_eq!(Cycles::Unknown.max(Cycles::Known(9)), Cycles::Unknown);
        assert_eq!(Cycles::Unknown.scale(0), Cycles::Unknown);
    }

    #[test]
    fn test_sequential_reuses_compute_but_accumulates_storage() {
        let a = ResourceUsage {
            compute_units: 4,
            memory_ports: 2,
            storage_elements: 3,
            control_units: 1,
        };
        let b = ResourceUsage {
            compute_units: 1,
            memory_ports: 5,
            storage_elements: 2,
            control_units: 1,
        };
        let seq = a.sequential(&b);
        assert_eq!(seq.compute_units, 4);
        assert_eq!(seq.memory_ports, 5);
        assert_eq!(seq.storage_elements, 5);

        let par = a.concurrent(&b);
        assert_eq!(par.compute_units, 5);
        assert_eq!(par.control_units, 2);
    }

    #[test]
    fn test_resource_kind_names() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.name().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("luts".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_snapshot_restores_missing_entries() {
        let mut table = MetricsTable::new();
        table.insert(
            RegionId(1),
            RegionQoR {
                metrics: Metrics::empty(),
                violations: vec![],
            },
        );
        let snap = table.snapshot([RegionId(1), RegionId(2)]);
        table.invalidate([RegionId(1)]);
        table.insert(
            RegionId(2),
            RegionQoR {
                metrics: Metrics::empty(),
                violations: vec![],
            },
        );
        table.restore(snap);
        assert!(table.get(RegionId(1)).is_some());
        assert!(table.get(RegionId(2)).is_none());
    }
}
