//! Peerbench core library — KPI precomputation, peer-group percentile
//! benchmarks, and the tiered serving layer.
//!
//! This crate ingests immutable long-format financial line items, runs an
//! offline build pipeline that precomputes per-entity KPI values and
//! peer-group percentile benchmarks into generation-scoped SQLite tables,
//! and serves them through a query router that decides per request between
//! a precomputed point lookup, an on-the-fly raw-fallback computation, and
//! an explicit no-data answer.

pub mod compute;
pub mod config;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod store;

pub use config::{KpiDefinition, Registry, ScopeDef};
pub use errors::{PeerbenchError, PeerbenchResult};
pub use models::{
    BenchmarkResponse, BenchmarkStat, BuildReport, EntityAttribute, KpiResponse, LineItem,
    ServedFrom,
};
pub use pipeline::{build, BuildOptions};
pub use query::capability::{AccessMode, CapabilityDetector, CapabilityReport};
pub use query::router::{CallBudget, QueryRouter, RouterOptions};
pub use store::database::Database;
