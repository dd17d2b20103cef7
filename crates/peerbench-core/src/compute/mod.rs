//! Pure computation kernels: formula parsing, KPI evaluation, and grouped
//! percentile aggregation.

pub mod formula;
pub mod kpi;
pub mod percentile;
