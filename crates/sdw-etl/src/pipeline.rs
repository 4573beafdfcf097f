use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use sdw_adapters::{FixtureStagingSource, PgStagingSource, StagingSource};
use sdw_core::{EtlError, Outcome, RejectedBatch, RunStatus};
use sdw_storage::{
    connect_with_backoff, AuditStore, BackoffPolicy, InMemoryWarehouse, ParquetRejectStore,
    PgAuditStore, PgWarehouse, RejectSink, Warehouse,
};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::audit::{AuditTracker, RunCounters};
use crate::clean::{clean_product_prices, clean_sales_numeric, normalize_batch};
use crate::config::{EtlConfig, NameRules};
use crate::dedup::{CustomerDeduplicator, ProductDeduplicator};
use crate::enforce::{enforce_customers, enforce_products, enforce_sales};
use crate::load::{load_dimension, load_fact, LoadReport};
use crate::quality::QualityGate;
use crate::transform::{
    build_date_dimension, build_facts, transform_customers, transform_products,
};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub watermark_before: NaiveDateTime,
    pub watermark_after: NaiveDateTime,
    pub counters: RunCounters,
    /// Rejected row counts keyed by `stage/REASON`.
    pub rejections: BTreeMap<String, u64>,
    pub loads: Vec<LoadReport>,
    pub error: Option<String>,
    pub reports_dir: Option<String>,
}

/// Everything one run learned, kept for the summary whether it succeeds or not.
#[derive(Debug, Default)]
struct RunLedger {
    rejections: BTreeMap<String, u64>,
    loads: Vec<LoadReport>,
}

pub struct EtlPipeline {
    config: EtlConfig,
    source: Arc<dyn StagingSource>,
    warehouse: Arc<dyn Warehouse>,
    audit: Arc<dyn AuditStore>,
    rejects: Arc<dyn RejectSink>,
    product_dedup: ProductDeduplicator,
    clock: Clock,
    run_lock: Mutex<()>,
}

impl EtlPipeline {
    pub fn new(
        config: EtlConfig,
        source: Arc<dyn StagingSource>,
        warehouse: Arc<dyn Warehouse>,
        audit: Arc<dyn AuditStore>,
        rejects: Arc<dyn RejectSink>,
    ) -> Result<Self, EtlError> {
        config.validate()?;
        let rules = config.name_rules()?;
        Ok(Self {
            config,
            source,
            warehouse,
            audit,
            rejects,
            product_dedup: ProductDeduplicator::new(rules),
            clock: Arc::new(Utc::now),
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_name_rules(mut self, rules: NameRules) -> Self {
        self.product_dedup = ProductDeduplicator::new(rules);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Runs the pipeline once. A second call while one is in flight fails with `AlreadyRunning`.
    pub async fn run_once(&self) -> Result<RunSummary, EtlError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| EtlError::AlreadyRunning(self.config.pipeline_name.clone()))?;
        let run_id = Uuid::new_v4();
        let span = info_span!("etl_run", %run_id, pipeline = %self.config.pipeline_name);
        self.run_locked(run_id).instrument(span).await
    }

    async fn run_locked(&self, run_id: Uuid) -> Result<RunSummary, EtlError> {
        let started_at = (self.clock)();
        let mut tracker =
            AuditTracker::open(self.audit.as_ref(), &self.config.pipeline_name).await?;
        let watermark_before = tracker.start();
        info!(
            source = %self.source.describe(),
            %watermark_before,
            prior = ?tracker.previous().map(|e| e.run_status),
            "run started"
        );

        let mut ledger = RunLedger::default();
        let result = self
            .execute(&mut tracker, &mut ledger, started_at)
            .await;

        let (status, watermark_after, error) = match &result {
            Ok(()) => {
                tracker.mark_succeeded();
                (RunStatus::Success, started_at.naive_utc(), None)
            }
            Err(err) => {
                error!(error = %err, "run failed");
                tracker.record_failure(self.audit.as_ref()).await;
                (RunStatus::Failed, watermark_before, Some(err.to_string()))
            }
        };

        let mut summary = RunSummary {
            run_id,
            pipeline_name: self.config.pipeline_name.clone(),
            source: self.source.describe(),
            started_at,
            finished_at: (self.clock)(),
            status,
            watermark_before,
            watermark_after,
            counters: tracker.counters(),
            rejections: ledger.rejections,
            loads: ledger.loads,
            error,
            reports_dir: None,
        };
        match write_reports(&self.config.reports_dir, &summary).await {
            Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run reports"),
        }

        result.map(|()| {
            info!(counters = ?summary.counters, "run completed");
            summary
        })
    }

    async fn execute(
        &self,
        tracker: &mut AuditTracker,
        ledger: &mut RunLedger,
        started_at: DateTime<Utc>,
    ) -> Result<(), EtlError> {
        let batch = self.source.fetch(tracker.watermark()).await?;
        tracker.add_processed(batch.len());
        if batch.is_empty() {
            info!("no staged rows after watermark");
        }

        let batch = normalize_batch(batch);
        let products = clean_product_prices(batch.products);
        let sales = clean_sales_numeric(batch.sales);

        let customers = self.absorb(CustomerDeduplicator.apply(batch.customers), tracker, ledger)?;
        let products = self.absorb(self.product_dedup.apply(products), tracker, ledger)?;
        let sales = self.absorb(
            QualityGate::new(&customers, &products).apply(sales),
            tracker,
            ledger,
        )?;

        let customers = enforce_customers(customers)?;
        let products = enforce_products(products)?;
        let sales = enforce_sales(sales)?;

        let customers = transform_customers(customers, started_at.date_naive());
        let products = transform_products(products);
        let dates = build_date_dimension(&sales);
        let facts = build_facts(&sales);

        let mut tx = self.warehouse.begin().await.map_err(EtlError::Load)?;
        ledger.loads.push(load_dimension(tx.as_mut(), customers).await?);
        ledger.loads.push(load_dimension(tx.as_mut(), products).await?);
        ledger.loads.push(load_dimension(tx.as_mut(), dates).await?);
        let facts = load_fact(tx.as_mut(), facts).await?;
        tracker.set_loaded(facts.inserted);
        ledger.loads.push(facts);

        tx.upsert_run(&tracker.success_entry(started_at.naive_utc()))
            .await
            .map_err(EtlError::Audit)?;
        tx.commit().await.map_err(EtlError::Load)
    }

    /// Quarantines a stage's rejected rows and hands back its clean rows. Sink failures are
    /// logged and dropped; only `Fatal` stops the run.
    fn absorb<T>(
        &self,
        outcome: Outcome<T>,
        tracker: &mut AuditTracker,
        ledger: &mut RunLedger,
    ) -> Result<Vec<T>, EtlError> {
        let (clean, rejected) = outcome.into_parts()?;
        for batch in RejectedBatch::group(rejected) {
            tracker.add_rejected(batch.len());
            *ledger
                .rejections
                .entry(format!("{}/{}", batch.stage, batch.reason))
                .or_default() += batch.len() as u64;
            warn!(
                stage = %batch.stage,
                reason = %batch.reason,
                rows = batch.len(),
                "rows quarantined"
            );
            if let Err(err) = self.rejects.persist(&batch) {
                error!(
                    stage = %batch.stage,
                    reason = %batch.reason,
                    rows = batch.len(),
                    error = %format!("{err:#}"),
                    "reject sink write failed; batch dropped"
                );
            }
        }
        Ok(clean)
    }

    /// Registers a cron job that calls `run_once`, when the scheduler is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        loaded = summary.counters.loaded,
                        "scheduled run finished"
                    ),
                    Err(EtlError::AlreadyRunning(name)) => {
                        info!(pipeline = %name, "previous run still in flight; skipping")
                    }
                    Err(err) => error!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn write_reports(reports_root: &Path, summary: &RunSummary) -> anyhow::Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(dir)
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Sales ETL Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Pipeline: `{}`", summary.pipeline_name),
        format!("- Source: `{}`", summary.source),
        format!("- Status: {}", summary.status.as_str()),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Watermark: {} -> {}",
            summary.watermark_before, summary.watermark_after
        ),
        format!(
            "- Records: processed {}, rejected {}, loaded {}",
            summary.counters.processed, summary.counters.rejected, summary.counters.loaded
        ),
    ];
    if let Some(err) = &summary.error {
        lines.push(format!("- Error: {err}"));
    }
    lines.push(String::new());
    lines.push("## Rejections".to_string());
    if summary.rejections.is_empty() {
        lines.push("- none".to_string());
    }
    for (key, count) in &summary.rejections {
        lines.push(format!("- {key}: {count}"));
    }
    lines.push(String::new());
    lines.push("## Loads".to_string());
    for load in &summary.loads {
        lines.push(format!(
            "- {}: offered {}, new {}, inserted {}",
            load.table, load.offered, load.new_rows, load.inserted
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Postgres staging, warehouse and audit log, with Parquet quarantine files.
pub async fn connect_postgres_pipeline(config: EtlConfig) -> anyhow::Result<EtlPipeline> {
    let backoff = BackoffPolicy {
        max_retries: config.connect_retries,
        ..BackoffPolicy::default()
    };
    let pool = connect_with_backoff(&config.database_url, backoff).await?;
    let source = PgStagingSource::new(pool.clone(), &config.staging_schema)?;
    let warehouse = PgWarehouse::new(
        pool.clone(),
        &config.warehouse_schema,
        &config.staging_schema,
        &config.pipeline_name,
    )?;
    let audit = PgAuditStore::new(pool, &config.staging_schema)?;
    let rejects = ParquetRejectStore::new(config.rejects_dir.clone());
    Ok(EtlPipeline::new(
        config,
        Arc::new(source),
        Arc::new(warehouse),
        Arc::new(audit),
        Arc::new(rejects),
    )?)
}

/// Dry run: a fixture bundle loaded into a fresh in-memory warehouse.
pub fn fixture_pipeline(
    config: EtlConfig,
    bundle: impl Into<PathBuf>,
) -> Result<(EtlPipeline, InMemoryWarehouse), EtlError> {
    let warehouse = InMemoryWarehouse::new();
    let rejects = ParquetRejectStore::new(config.rejects_dir.clone());
    let pipeline = EtlPipeline::new(
        config,
        Arc::new(FixtureStagingSource::new(bundle)),
        Arc::new(warehouse.clone()),
        Arc::new(warehouse.clone()),
        Arc::new(rejects),
    )?;
    Ok((pipeline, warehouse))
}

pub async fn run_once_from_env() -> anyhow::Result<RunSummary> {
    let config = EtlConfig::from_env()?;
    let pipeline = connect_postgres_pipeline(config).await?;
    Ok(pipeline.run_once().await?)
}
