//! KPI-tree and benchmark-scope configuration.
//!
//! The registry is loaded once at startup from a JSON document and fully
//! validated before anything is served: duplicate keys, dangling or
//! level-inconsistent parent references, formula syntax errors, and formula
//! references to unknown or explicitly unmapped aggregates are all
//! configuration errors, never silent gaps at query time.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::compute::formula::{parse_formula, Expr};
use crate::errors::{PeerbenchError, PeerbenchResult};

/// Marker string for an aggregate that is declared but intentionally not
/// mapped to any line-item selector.
pub const UNMAPPED_MARKER: &str = "unmapped";

const MIN_KPI_LEVEL: u8 = 1;
const MAX_KPI_LEVEL: u8 = 3;

// ---------------------------------------------------------------------------
// Raw (as-deserialized) configuration
// ---------------------------------------------------------------------------

/// Line-item selector for one named aggregate: the sum of every row whose
/// `line` and `column` codes match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSelector {
    pub line: String,
    pub column: String,
}

/// One aggregate mapping entry: either a concrete selector or the explicit
/// `"unmapped"` marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateMapping {
    Selector(AggregateSelector),
    Marker(String),
}

/// A KPI definition as it appears in the configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KpiSpec {
    pub key: String,
    pub level: u8,
    #[serde(default)]
    pub parent_key: Option<String>,
    pub formula: String,
    pub unit: String,
    pub higher_is_better: bool,
    pub aggregates: IndexMap<String, AggregateMapping>,
}

/// One peer-group scope: entities are partitioned by their attribute values
/// for `dimensions`, joined in order. An empty dimension list is the
/// all-entities scope with the constant key `all`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDef {
    pub id: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
}

/// Top-level configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrySpec {
    pub kpis: Vec<KpiSpec>,
    pub scopes: Vec<ScopeDef>,
}

// ---------------------------------------------------------------------------
// Validated registry
// ---------------------------------------------------------------------------

/// A validated KPI definition with its parsed formula and the mapped
/// aggregates the formula references.
#[derive(Clone, Debug)]
pub struct KpiDefinition {
    pub key: String,
    pub level: u8,
    pub parent_key: Option<String>,
    pub unit: String,
    pub higher_is_better: bool,
    pub formula: Expr,
    /// Name to selector for every aggregate the formula references.
    pub aggregates: IndexMap<String, AggregateSelector>,
}

/// The typed registry: the fixed 3-level KPI tree plus the benchmark
/// scopes, in configuration order.
#[derive(Clone, Debug)]
pub struct Registry {
    pub kpis: IndexMap<String, KpiDefinition>,
    pub scopes: IndexMap<String, ScopeDef>,
}

impl Registry {
    /// Load and validate a registry from a JSON string.
    pub fn from_json(text: &str) -> PeerbenchResult<Self> {
        let spec: RegistrySpec = serde_json::from_str(text)?;
        Self::from_spec(spec)
    }

    /// Load and validate a registry from a JSON file.
    pub fn from_json_file(path: &Path) -> PeerbenchResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Validate a deserialized spec into a usable registry.
    pub fn from_spec(spec: RegistrySpec) -> PeerbenchResult<Self> {
        let mut kpis: IndexMap<String, KpiDefinition> = IndexMap::new();

        for kpi in &spec.kpis {
            if kpis.contains_key(&kpi.key) {
                return Err(config_error(format!("duplicate KPI key '{}'", kpi.key)));
            }
            if !(MIN_KPI_LEVEL..=MAX_KPI_LEVEL).contains(&kpi.level) {
                return Err(config_error(format!(
                    "KPI '{}' has level {}, expected {MIN_KPI_LEVEL}..={MAX_KPI_LEVEL}",
                    kpi.key, kpi.level
                )));
            }

            let formula = parse_formula(&kpi.formula)
                .map_err(|e| config_error(format!("KPI '{}': {e}", kpi.key)))?;

            // Every formula reference must resolve to exactly one concrete
            // selector. An explicit "unmapped" marker is a declared gap and
            // still rejects the reference; any other marker string is a typo.
            let mut aggregates = IndexMap::new();
            for name in formula.aggregate_names() {
                match kpi.aggregates.get(&name) {
                    Some(AggregateMapping::Selector(sel)) => {
                        aggregates.insert(name, sel.clone());
                    }
                    Some(AggregateMapping::Marker(marker)) if marker == UNMAPPED_MARKER => {
                        return Err(config_error(format!(
                            "KPI '{}' references aggregate '{name}' which is explicitly unmapped",
                            kpi.key
                        )));
                    }
                    Some(AggregateMapping::Marker(marker)) => {
                        return Err(config_error(format!(
                            "KPI '{}' aggregate '{name}' has unknown marker '{marker}' \
                             (expected a selector or \"{UNMAPPED_MARKER}\")",
                            kpi.key
                        )));
                    }
                    None => {
                        return Err(config_error(format!(
                            "KPI '{}' references undeclared aggregate '{name}'",
                            kpi.key
                        )));
                    }
                }
            }

            kpis.insert(
                kpi.key.clone(),
                KpiDefinition {
                    key: kpi.key.clone(),
                    level: kpi.level,
                    parent_key: kpi.parent_key.clone(),
                    unit: kpi.unit.clone(),
                    higher_is_better: kpi.higher_is_better,
                    formula,
                    aggregates,
                },
            );
        }

        // Tree shape: level-1 KPIs are roots; every deeper KPI names a
        // parent exactly one level up. With that constraint a cycle cannot
        // form, so dangling and level-inconsistent parents are the only
        // structural failures left to detect.
        for def in kpis.values() {
            match (&def.parent_key, def.level) {
                (None, 1) => {}
                (Some(parent), 1) => {
                    return Err(config_error(format!(
                        "level-1 KPI '{}' must not have a parent (found '{parent}')",
                        def.key
                    )));
                }
                (None, level) => {
                    return Err(config_error(format!(
                        "level-{level} KPI '{}' is missing its parent_key",
                        def.key
                    )));
                }
                (Some(parent), level) => {
                    let Some(parent_def) = kpis.get(parent) else {
                        return Err(config_error(format!(
                            "KPI '{}' references unknown parent '{parent}'",
                            def.key
                        )));
                    };
                    if parent_def.level + 1 != level {
                        return Err(config_error(format!(
                            "KPI '{}' (level {level}) has parent '{parent}' at level {}, \
                             expected level {}",
                            def.key,
                            parent_def.level,
                            level - 1
                        )));
                    }
                }
            }
        }

        let mut scopes: IndexMap<String, ScopeDef> = IndexMap::new();
        for scope in &spec.scopes {
            if scope.id.is_empty() {
                return Err(config_error("scope with empty id".to_string()));
            }
            if scopes.contains_key(&scope.id) {
                return Err(config_error(format!("duplicate scope id '{}'", scope.id)));
            }
            if scope.dimensions.iter().any(String::is_empty) {
                return Err(config_error(format!(
                    "scope '{}' has an empty dimension name",
                    scope.id
                )));
            }
            scopes.insert(scope.id.clone(), scope.clone());
        }

        Ok(Self { kpis, scopes })
    }
}

fn config_error(message: String) -> PeerbenchError {
    PeerbenchError::Config(message)
}
