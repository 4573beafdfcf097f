//! Data-quality and reconciliation pipeline: staged customers, products and sales in,
//! conformed dimensions and facts out, every rejection quarantined and every run audited.

pub mod audit;
pub mod clean;
pub mod config;
pub mod dedup;
pub mod enforce;
pub mod load;
pub mod quality;
pub mod transform;

mod pipeline;

pub use audit::{AuditState, AuditTracker, RunCounters};
pub use config::{EtlConfig, NameRules};
pub use dedup::{CustomerDeduplicator, ProductDeduplicator};
pub use load::LoadReport;
pub use pipeline::{
    connect_postgres_pipeline, fixture_pipeline, run_brief_markdown, run_once_from_env, Clock,
    EtlPipeline, RunSummary,
};
pub use quality::QualityGate;

pub const CRATE_NAME: &str = "sdw-etl";
