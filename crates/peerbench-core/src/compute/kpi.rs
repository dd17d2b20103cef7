//! KPI computation from raw line items.
//!
//! Pure and I/O-free: the caller supplies the line items, the definition
//! carries the parsed formula, and the result depends on nothing else.
//! Memoization by `(entity_id, period, kpi_key, snapshot_hash)` is safe.

use std::collections::BTreeMap;

use crate::config::KpiDefinition;
use crate::models::LineItem;

/// Soft computational failures. These resolve into null KPI values at the
/// storage and serving layers, never into errors for callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KpiError {
    /// A referenced aggregate had zero contributing rows. Distinct from an
    /// aggregate that legitimately sums to zero.
    #[error("insufficient data: aggregate '{0}' has no contributing rows")]
    InsufficientData(String),
}

/// Resolve every aggregate the definition's formula references from the
/// entity/period line-item subset.
fn resolve_aggregates(
    def: &KpiDefinition,
    items: &[LineItem],
) -> Result<BTreeMap<String, f64>, KpiError> {
    let mut resolved = BTreeMap::new();
    for (name, selector) in &def.aggregates {
        let mut sum = 0.0;
        let mut rows = 0usize;
        for item in items {
            if item.line == selector.line && item.column == selector.column {
                sum += item.value;
                rows += 1;
            }
        }
        if rows == 0 {
            return Err(KpiError::InsufficientData(name.clone()));
        }
        resolved.insert(name.clone(), sum);
    }
    Ok(resolved)
}

/// Compute one KPI value for one entity and period.
///
/// `Ok(Some(v))` is a computed value, `Ok(None)` means a denominator
/// resolved to exactly zero (a null result, not an error), and
/// `Err(InsufficientData)` means a required aggregate had no contributing
/// rows. Line items belonging to other entities or periods are ignored.
pub fn compute(
    entity_id: &str,
    period: i64,
    def: &KpiDefinition,
    line_items: &[LineItem],
) -> Result<Option<f64>, KpiError> {
    let subset: Vec<LineItem> = line_items
        .iter()
        .filter(|it| it.entity_id == entity_id && it.period == period)
        .cloned()
        .collect();
    let resolved = resolve_aggregates(def, &subset)?;
    Ok(def.formula.eval(&resolved))
}
