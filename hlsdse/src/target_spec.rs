//! Target specifications for QoR estimation and DSE
//!
//! A target spec is a JSON document:
//!
//! ```json
//! {
//!   "clock_period": "5ns",
//!   "resource_budgets": { "compute-unit": 220, "storage-element": 280 },
//!   "latency_budget": 100000,
//!   "op_latency": { "fmul": 4, "load": 2 },
//!   "memory_ports_per_bank": 2,
//!   "external_ports": 1,
//!   "dse": {
//!     "strategy": "bottom-up",
//!     "operator_priority": ["pipeline", "unroll", "tile", "partition", "dataflow"],
//!     "candidate_budget": 64,
//!     "max_backtracks": 8
//!   }
//! }
//! ```
//!
//! Every field is optional; an unset budget leaves that dimension
//! unconstrained. `clock_period` accepts a number (ns) or a string with a
//! time (`ps`, `ns`, `us`) or frequency (`kHz`, `MHz`, `GHz`) unit.
//!
//! Malformed specs (unknown fields, negative or non-integral counts, unknown
//! resource kinds or operation names) are rejected here, before any search
//! starts or any directive is touched.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::metrics::{Cycles, Metrics, ResourceKind, Violation};
use crate::region::OpKind;

pub const DEFAULT_CLOCK_PERIOD_NS: f64 = 10.0;

/// Memory latency keys accepted in `op_latency` besides operation names
pub const MEMORY_LATENCY_KEYS: [&str; 4] = ["load", "store", "ext-load", "ext-store"];

#[derive(Error, Debug)]
pub enum TargetSpecError {
    #[error("Failed to parse target spec JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to read target spec {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Field '{field}' must not be negative (got {value})")]
    Negative { field: String, value: String },

    #[error("Field '{field}' is invalid: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Unknown resource kind '{0}'")]
    UnknownResourceKind(String),

    #[error("Unknown operation '{0}' in op_latency")]
    UnknownOperation(String),
}

// ============================================================================
// Target Spec
// ============================================================================

/// Immutable target description for one estimation or DSE run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSpec {
    pub clock_period_ns: f64,
    pub resource_budgets: BTreeMap<ResourceKind, u64>,
    pub latency_budget: Option<u64>,
    /// Cycle overrides keyed by operation name or memory key (calibration)
    pub op_latency: BTreeMap<String, u64>,
    pub memory_ports_per_bank: u64,
    pub external_ports: u64,
}

impl Default for TargetSpec {
    fn default() -> Self {
        TargetSpec {
            clock_period_ns: DEFAULT_CLOCK_PERIOD_NS,
            resource_budgets: BTreeMap::new(),
            latency_budget: None,
            op_latency: BTreeMap::new(),
            memory_ports_per_bank: 2,
            external_ports: 1,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTargetSpec {
    #[serde(default)]
    clock_period: Option<Value>,
    #[serde(default)]
    resource_budgets: BTreeMap<String, Value>,
    #[serde(default)]
    latency_budget: Option<Value>,
    #[serde(default)]
    op_latency: BTreeMap<String, Value>,
    #[serde(default)]
    memory_ports_per_bank: Option<Value>,
    #[serde(default)]
    external_ports: Option<Value>,
    #[serde(default)]
    dse: Option<RawDseOptions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDseOptions {
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    operator_priority: Option<Vec<String>>,
    #[serde(default)]
    candidate_budget: Option<Value>,
    #[serde(default)]
    max_backtracks: Option<Value>,
}

lazy_static! {
    static ref CLOCK_WITH_UNIT: Regex =
        Regex::new(r"(?i)^\s*(-?[0-9]*\.?[0-9]+)\s*(ps|ns|us|khz|mhz|ghz)?\s*$").unwrap();
}

/// Non-negative integer from a JSON value
fn count(field: &str, value: &Value) -> Result<u64, TargetSpecError> {
    if let Some(v) = value.as_u64() {
        return Ok(v);
    }
    if let Some(v) = value.as_i64() {
        return Err(TargetSpecError::Negative {
            field: field.to_string(),
            value: v.to_string(),
        });
    }
    if let Some(v) = value.as_f64() {
        if v < 0.0 {
            return Err(TargetSpecError::Negative {
                field: field.to_string(),
                value: v.to_string(),
            });
        }
        if v.fract() == 0.0 && v.is_finite() {
            return Ok(v as u64);
        }
    }
    Err(TargetSpecError::Invalid {
        field: field.to_string(),
        reason: format!("expected a non-negative integer, got {}", value),
    })
}

fn positive_count(field: &str, value: &Value) -> Result<u64, TargetSpecError> {
    let v = count(field, value)?;
    if v == 0 {
        return Err(TargetSpecError::Invalid {
            field: field.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(v)
}

/// Clock period in ns from a number or a unit-suffixed string
pub fn parse_clock_period(value: &Value) -> Result<f64, TargetSpecError> {
    let field = "clock_period";
    let period = match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| TargetSpecError::Invalid {
            field: field.to_string(),
            reason: format!("not a number: {}", n),
        })?,
        Value::String(s) => {
            let caps = CLOCK_WITH_UNIT
                .captures(s)
                .ok_or_else(|| TargetSpecError::Invalid {
                    field: field.to_string(),
                    reason: format!("cannot parse '{}'", s),
                })?;
            let magnitude: f64 = caps[1].parse().map_err(|_| TargetSpecError::Invalid {
                field: field.to_string(),
                reason: format!("cannot parse '{}'", s),
            })?;
            if magnitude <= 0.0 {
                return Err(TargetSpecError::Negative {
                    field: field.to_string(),
                    value: s.clone(),
                });
            }
            let unit = caps
                .get(2)
                .map(|m| m.as_str().to_ascii_lowercase())
                .unwrap_or_else(|| "ns".to_string());
            match unit.as_str() {
                "ps" => magnitude / 1000.0,
                "ns" => magnitude,
                "us" => magnitude * 1000.0,
                "khz" => 1.0e6 / magnitude,
                "mhz" => 1.0e3 / magnitude,
                "ghz" => 1.0 / magnitude,
                other => {
                    return Err(TargetSpecError::Invalid {
                        field: field.to_string(),
                        reason: format!("unknown unit '{}'", other),
                    })
                }
            }
        }
        other => {
            return Err(TargetSpecError::Invalid {
                field: field.to_string(),
                reason: format!("expected number or string, got {}", other),
            })
        }
    };
    if !period.is_finite() || period <= 0.0 {
        return Err(TargetSpecError::Negative {
            field: field.to_string(),
            value: period.to_string(),
        });
    }
    Ok(period)
}

impl TargetSpec {
    /// Parse a target spec from JSON text (the `dse` section is ignored)
    pub fn parse(text: &str) -> Result<Self, TargetSpecError> {
        let raw: RawTargetSpec = serde_json::from_str(text)?;
        Self::from_raw(&raw)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TargetSpecError> {
        Self::parse(&read_spec(path.as_ref())?)
    }

    fn from_raw(raw: &RawTargetSpec) -> Result<Self, TargetSpecError> {
        let mut spec = TargetSpec::default();
        if let Some(clock) = &raw.clock_period {
            spec.clock_period_ns = parse_clock_period(clock)?;
        }
        for (name, value) in &raw.resource_budgets {
            let kind: ResourceKind = name
                .parse()
                .map_err(|_| TargetSpecError::UnknownResourceKind(name.clone()))?;
            let field = format!("resource_budgets.{}", name);
            spec.resource_budgets.insert(kind, count(&field, value)?);
        }
        if let Some(v) = &raw.latency_budget {
            spec.latency_budget = Some(count("latency_budget", v)?);
        }
        for (name, value) in &raw.op_latency {
            if OpKind::from_name(name).is_none() && !MEMORY_LATENCY_KEYS.contains(&name.as_str())
            {
                return Err(TargetSpecError::UnknownOperation(name.clone()));
            }
            let field = format!("op_latency.{}", name);
            spec.op_latency.insert(name.clone(), count(&field, value)?);
        }
        if let Some(v) = &raw.memory_ports_per_bank {
            spec.memory_ports_per_bank = positive_count("memory_ports_per_bank", v)?;
        }
        if let Some(v) = &raw.external_ports {
            spec.external_ports = positive_count("external_ports", v)?;
        }
        Ok(spec)
    }

    /// Re-check invariants of a programmatically built spec
    pub fn validate(&self) -> Result<(), TargetSpecError> {
        if !self.clock_period_ns.is_finite() || self.clock_period_ns <= 0.0 {
            return Err(TargetSpecError::Negative {
                field: "clock_period".to_string(),
                value: self.clock_period_ns.to_string(),
            });
        }
        if self.memory_ports_per_bank == 0 || self.external_ports == 0 {
            return Err(TargetSpecError::Invalid {
                field: "memory ports".to_string(),
                reason: "port counts must be at least 1".to_string(),
            });
        }
        for name in self.op_latency.keys() {
            if OpKind::from_name(name).is_none() && !MEMORY_LATENCY_KEYS.contains(&name.as_str())
            {
                return Err(TargetSpecError::UnknownOperation(name.clone()));
            }
        }
        Ok(())
    }

    pub fn with_budget(mut self, kind: ResourceKind, budget: u64) -> Self {
        self.resource_budgets.insert(kind, budget);
        self
    }

    pub fn budget(&self, kind: ResourceKind) -> Option<u64> {
        self.resource_budgets.get(&kind).copied()
    }

    pub fn has_resource_budgets(&self) -> bool {
        !self.resource_budgets.is_empty()
    }

    /// Budget violations of one region's metrics
    pub fn violations(&self, metrics: &Metrics) -> Vec<Violation> {
        let mut out = Vec::new();
        for (kind, budget) in &self.resource_budgets {
            let used = metrics.resources.get(*kind);
            if used > *budget {
                out.push(Violation::Resource {
                    kind: *kind,
                    used,
                    budget: *budget,
                });
            }
        }
        if let (Some(budget), Cycles::Known(cycles)) = (self.latency_budget, metrics.latency) {
            if cycles > budget {
                out.push(Violation::Latency { cycles, budget });
            }
        }
        out
    }

    /// All resource counts within budget
    pub fn resources_fit(&self, metrics: &Metrics) -> bool {
        self.resource_budgets
            .iter()
            .all(|(kind, budget)| metrics.resources.get(*kind) <= *budget)
    }

    /// `Some(true/false)` when a latency budget is set and latency is known
    pub fn meets_latency(&self, metrics: &Metrics) -> Option<bool> {
        let budget = self.latency_budget?;
        metrics.latency.known().map(|c| c <= budget)
    }

    /// Normalized budget excess summed over resource kinds (0 when feasible)
    pub fn overshoot(&self, metrics: &Metrics) -> f64 {
        self.resource_budgets
            .iter()
            .map(|(kind, budget)| {
                let used = metrics.resources.get(*kind);
                if used <= *budget {
                    0.0
                } else if *budget == 0 {
                    used as f64
                } else {
                    (used - budget) as f64 / *budget as f64
                }
            })
            .sum()
    }
}

fn read_spec(path: &Path) -> Result<String, TargetSpecError> {
    fs::read_to_string(path).map_err(|source| TargetSpecError::Io {
        path: path.display().to_string(),
        source,
    })
}

// ============================================================================
// DSE Options
// ============================================================================

/// Order in which hierarchy levels are optimized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchStrategy {
    /// Innermost regions first
    BottomUp,
    /// Outermost regions first
    TopDown,
}

/// Search knobs of the multi-level DSE
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DseOptions {
    pub strategy: SearchStrategy,
    /// Operator names, most promising first; unlisted operators run last
    pub operator_priority: Vec<String>,
    /// Maximum candidate evaluations per level search (None = exhaustive)
    pub candidate_budget: Option<usize>,
    pub max_backtracks: usize,
}

impl Default for DseOptions {
    fn default() -> Self {
        DseOptions {
            strategy: SearchStrategy::BottomUp,
            operator_priority: ["pipeline", "unroll", "tile", "partition", "dataflow"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            candidate_budget: None,
            max_backtracks: 8,
        }
    }
}

impl DseOptions {
    fn from_raw(raw: &RawDseOptions) -> Result<Self, TargetSpecError> {
        let mut options = DseOptions::default();
        if let Some(strategy) = &raw.strategy {
            options.strategy = match strategy.as_str() {
                "bottom-up" => SearchStrategy::BottomUp,
                "top-down" => SearchStrategy::TopDown,
                other => {
                    return Err(TargetSpecError::Invalid {
                        field: "dse.strategy".to_string(),
                        reason: format!("expected 'bottom-up' or 'top-down', got '{}'", other),
                    })
                }
            };
        }
        if let Some(priority) = &raw.operator_priority {
            let mut seen = Vec::new();
            for name in priority {
                if seen.contains(name) {
                    return Err(TargetSpecError::Invalid {
                        field: "dse.operator_priority".to_string(),
                        reason: format!("operator '{}' listed twice", name),
                    });
                }
                seen.push(name.clone());
            }
            options.operator_priority = seen;
        }
        if let Some(v) = &raw.candidate_budget {
            options.candidate_budget = Some(positive_count("dse.candidate_budget", v)? as usize);
        }
        if let Some(v) = &raw.max_backtracks {
            options.max_backtracks = count("dse.max_backtracks", v)? as usize;
        }
        Ok(options)
    }
}

/// Target spec plus search options for one DSE run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DseTargetSpec {
    pub target: TargetSpec,
    pub options: DseOptions,
}

impl DseTargetSpec {
    pub fn parse(text: &str) -> Result<Self, TargetSpecError> {
        let raw: RawTargetSpec = serde_json::from_str(text)?;
        let target = TargetSpec::from_raw(&raw)?;
        let options = match &raw.dse {
            Some(dse) => DseOptions::from_raw(dse)?,
            None => DseOptions::default(),
        };
        Ok(DseTargetSpec { target, options })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TargetSpecError> {
        Self::parse(&read_spec(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<(), TargetSpecError> {
        self.target.validate()?;
        if self.options.candidate_budget == Some(0) {
            return Err(TargetSpecError::Invalid {
                field: "dse.candidate_budget".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_spec_is_unconstrained() {
        let spec = TargetSpec::parse("{}").unwrap();
        assert_eq!(spec.clock_period_ns, DEFAULT_CLOCK_PERIOD_NS);
        assert!(spec.resource_budgets.is_empty());
        assert!(spec.latency_budget.is_none());
    }

    #[test]
    fn test_clock_units() {
        assert_eq!(parse_clock_period(&json!(5)).unwrap(), 5.0);
        assert_eq!(parse_clock_period(&json!("4ns")).unwrap(), 4.0);
        assert_eq!(parse_clock_period(&json!("200MHz")).unwrap(), 5.0);
        assert_eq!(parse_clock_period(&json!("1 GHz")).unwrap(), 1.0);
        assert_eq!(parse_clock_period(&json!("2500ps")).unwrap(), 2.5);
        assert!(parse_clock_period(&json!("fast")).is_err());
        assert!(matches!(
            parse_clock_period(&json!("-3ns")),
            Err(TargetSpecError::Negative { .. })
        ));
        assert!(parse_clock_period(&json!(0)).is_err());
    }

    #[test]
    fn test_negative_budget_rejected() {
        let err =
            TargetSpec::parse(r#"{"resource_budgets": {"compute-unit": -4}}"#).unwrap_err();
        assert!(matches!(err, TargetSpecError::Negative { .. }), "{}", err);
    }

    #[test]
    fn test_unknown_resource_kind_rejected() {
        let err = TargetSpec::parse(r#"{"resource_budgets": {"lut": 4}}"#).unwrap_err();
        assert!(matches!(err, TargetSpecError::UnknownResourceKind(ref k) if k == "lut"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            TargetSpec::parse(r#"{"frequency": "100MHz"}"#),
            Err(TargetSpecError::Json(_))
        ));
    }

    #[test]
    fn test_fractional_count_rejected() {
        assert!(TargetSpec::parse(r#"{"latency_budget": 10.5}"#).is_err());
        assert_eq!(
            TargetSpec::parse(r#"{"latency_budget": 10.0}"#)
                .unwrap()
                .latency_budget,
            Some(10)
        );
    }

    #[test]
    fn test_dse_options() {
        let spec = DseTargetSpec::parse(
            r#"{
                "resource_budgets": {"storage-element": 12},
                "dse": {"strategy": "top-down", "candidate_budget": 3,
                        "operator_priority": ["unroll", "pipeline"]}
            }"#,
        )
        .unwrap();
        assert_eq!(spec.target.budget(ResourceKind::StorageElement), Some(12));
        assert_eq!(spec.options.strategy, SearchStrategy::TopDown);
        assert_eq!(spec.options.candidate_budget, Some(3));
        assert_eq!(spec.options.operator_priority, vec!["unroll", "pipeline"]);
        assert_eq!(spec.options.max_backtracks, 8);

        assert!(DseTargetSpec::parse(r#"{"dse": {"candidate_budget": 0}}"#).is_err());
        assert!(DseTargetSpec::parse(r#"{"dse": {"strategy": "sideways"}}"#).is_err());
    }

    #[test]
    fn test_violations_and_overshoot() {
        let spec = TargetSpec::default().with_budget(ResourceKind::ComputeUnit, 4);
        let mut metrics = Metrics::empty();
        metrics.resources.compute_units = 6;
        metrics.latency = Cycles::Known(10);
        assert!(!spec.resources_fit(&metrics));
        assert_eq!(spec.violations(&metrics).len(), 1);
        assert!((spec.overshoot(&metrics) - 0.5).abs() < 1e-9);
        assert_eq!(spec.meets_latency(&metrics), None);
    }
}
