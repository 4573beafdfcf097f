use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sdw_adapters::StagingSource;
use sdw_core::{
    AuditLogEntry, CustomerRecord, EtlError, ProductRecord, RejectReason, RunStatus,
    SalesTransactionRecord, StagedBatch,
};
use sdw_etl::{fixture_pipeline, EtlConfig, EtlPipeline};
use sdw_storage::{AuditStore, InMemoryRejectSink, InMemoryWarehouse, RejectSink, Table};
use tempfile::TempDir;
use tokio::sync::Notify;

const INGEST: &str = "2024-05-04 09:00:00";

struct StaticSource {
    batch: StagedBatch,
}

#[async_trait]
impl StagingSource for StaticSource {
    fn describe(&self) -> String {
        "static".into()
    }

    async fn fetch(&self, _watermark: NaiveDateTime) -> Result<StagedBatch, EtlError> {
        Ok(self.batch.clone())
    }
}

/// Blocks inside `fetch` until released, so a run can be held in flight.
struct GatedSource {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl StagingSource for GatedSource {
    fn describe(&self) -> String {
        "gated".into()
    }

    async fn fetch(&self, _watermark: NaiveDateTime) -> Result<StagedBatch, EtlError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(StagedBatch::default())
    }
}

fn customer(
    id: i64,
    name: &str,
    signup: &str,
    city: Option<&str>,
    state: Option<&str>,
) -> CustomerRecord {
    CustomerRecord {
        customer_id: id,
        customer_name: Some(name.into()),
        email: None,
        city: city.map(Into::into),
        state: state.map(Into::into),
        signup_date: Some(signup.into()),
        ingest_date: Some(INGEST.into()),
    }
}

fn product(
    id: i64,
    name: &str,
    price: Option<f64>,
    category: Option<&str>,
    brand: Option<&str>,
) -> ProductRecord {
    ProductRecord {
        product_id: id,
        product_name: Some(name.into()),
        category: category.map(Into::into),
        brand: brand.map(Into::into),
        unit_price: price,
        ingest_date: Some(INGEST.into()),
    }
}

fn sale(
    tid: i64,
    cust: i64,
    prod: i64,
    date: &str,
    qty: f64,
    price: Option<f64>,
) -> SalesTransactionRecord {
    SalesTransactionRecord {
        transaction_id: Some(tid),
        customer_id: Some(cust),
        product_id: Some(prod),
        transaction_date: Some(date.into()),
        quantity: Some(qty),
        unit_price: price,
        discount: None,
        ingest_date: Some(INGEST.into()),
    }
}

fn mixed_batch() -> StagedBatch {
    let mut bob = customer(2, "Bob", "2022-02-02", None, Some("ny"));
    bob.email = Some(" BOB@X.COM ".into());
    let mut discounted = sale(2, 1, 12, "2024-05-02", 1.0, Some(7.5));
    discounted.discount = Some(0.5);
    StagedBatch {
        customers: vec![
            customer(1, "Ada", "2020-01-01", Some("Austin"), Some("tx")),
            customer(1, "Ada L", "2021-06-01", Some("Austin"), Some("tx")),
            bob,
        ],
        products: vec![
            product(10, "the", Some(5.0), None, None),
            product(10, "Acme Widget", Some(-5.0), Some("X"), None),
            product(11, "oil", Some(3.0), None, None),
            product(12, "Gadget Pro", Some(7.5), Some("tools"), Some("acme")),
        ],
        sales: vec![
            sale(1, 1, 10, "2024-05-02", 2.0, Some(5.0)),
            discounted,
            sale(3, 1, 10, "bad-date", 1.0, Some(5.0)),
            sale(4, 1, 10, "2024-05-02", 1.0, Some(5.0)),
            sale(4, 2, 10, "2024-05-02", 1.0, Some(5.0)),
            sale(5, 2, 12, "2024-05-02", 0.0, Some(7.5)),
            sale(6, 2, 11, "2024-05-02", 1.0, Some(3.0)),
            sale(7, 99, 12, "2024-05-02", 1.0, Some(7.5)),
            sale(8, 2, 10, "2024-05-03", -3.0, None),
        ],
    }
}

fn run_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 5, 2, 0, 0).unwrap()
}

struct Harness {
    warehouse: InMemoryWarehouse,
    sink: Arc<InMemoryRejectSink>,
    pipeline: EtlPipeline,
    _dirs: (TempDir, TempDir),
}

fn harness_with(source: Arc<dyn StagingSource>, sink: InMemoryRejectSink) -> Harness {
    let reports = tempfile::tempdir().unwrap();
    let rejects = tempfile::tempdir().unwrap();
    let config = EtlConfig {
        reports_dir: reports.path().to_path_buf(),
        rejects_dir: rejects.path().to_path_buf(),
        ..EtlConfig::default()
    };
    let warehouse = InMemoryWarehouse::new();
    let sink = Arc::new(sink);
    let pipeline = EtlPipeline::new(
        config,
        source,
        Arc::new(warehouse.clone()),
        Arc::new(warehouse.clone()),
        Arc::clone(&sink) as Arc<dyn RejectSink>,
    )
    .unwrap()
    .with_clock(Arc::new(run_clock));
    Harness {
        warehouse,
        sink,
        pipeline,
        _dirs: (reports, rejects),
    }
}

fn harness(batch: StagedBatch) -> Harness {
    harness_with(Arc::new(StaticSource { batch }), InMemoryRejectSink::new())
}

#[tokio::test]
async fn mixed_batch_is_cleaned_quarantined_and_loaded() {
    let h = harness(mixed_batch());
    let summary = h.pipeline.run_once().await.unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.counters.processed, 16);
    assert_eq!(summary.counters.rejected, 9);
    assert_eq!(summary.counters.loaded, 3);
    assert_eq!(summary.rejections["single_owner/MULTI_CUSTOMER_TRANSACTION"], 2);
    assert_eq!(summary.rejections["orphan/ORPHAN_REFERENCE"], 2);
    assert_eq!(summary.rejections["product_dedup/INVALID_PRODUCT_NAME"], 1);

    let batches = h.sink.batches();
    assert_eq!(batches.len(), 7);
    assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 9);
    assert_eq!(batches[0].reason, RejectReason::DuplicateCustomerId);

    let customers = h.warehouse.customers().unwrap();
    assert_eq!(customers.len(), 2);
    assert_eq!(customers[0].customer_name.as_deref(), Some("Ada L"));
    assert_eq!(customers[1].email.as_deref(), Some("bob@x.com"));
    assert_eq!(customers[1].city.as_deref(), Some("Austin"));
    assert_eq!(customers[1].state.as_deref(), Some("NY"));

    let products = h.warehouse.products().unwrap();
    let widget = products.iter().find(|p| p.product_id == 10).unwrap();
    assert_eq!(widget.product_name.as_deref(), Some("acme widget"));
    assert_eq!(widget.unit_price, Some(5.0));
    assert_eq!(widget.category.as_deref(), Some("x"));
    assert_eq!(widget.brand.as_deref(), Some("acme"));
    assert!(products.iter().all(|p| p.product_id != 11));

    let facts = h.warehouse.facts().unwrap();
    let grains: Vec<_> = facts.iter().map(|f| f.grain_key()).collect();
    assert_eq!(
        grains,
        vec![(1, 10, 20240502), (1, 12, 20240502), (2, 10, 20240503)]
    );
    assert_eq!(facts[1].net_sale_amount, 7.0);
    assert_eq!(facts[2].quantity, 3);
    assert_eq!(facts[2].unit_price, 5.0);
    assert_eq!(h.warehouse.row_count(Table::DimDate).unwrap(), 2);

    let entry = h.warehouse.read_entry("sales_etl").await.unwrap().unwrap();
    assert_eq!(entry.run_status, RunStatus::Success);
    assert_eq!(entry.last_processed_ingest_date, run_clock().naive_utc());
    assert_eq!(entry.records_loaded, 3);

    let reports = std::path::PathBuf::from(summary.reports_dir.unwrap());
    assert!(reports.join("run_summary.json").exists());
    let brief = std::fs::read_to_string(reports.join("run_brief.md")).unwrap();
    assert!(brief.contains("Status: SUCCESS"));
}

#[tokio::test]
async fn rerunning_the_same_window_loads_nothing_new() {
    let h = harness(mixed_batch());
    h.pipeline.run_once().await.unwrap();
    let second = h.pipeline.run_once().await.unwrap();

    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.counters.loaded, 0);
    assert!(second.loads.iter().all(|l| l.inserted == 0));
    assert_eq!(h.warehouse.facts().unwrap().len(), 3);
    assert_eq!(h.warehouse.customers().unwrap().len(), 2);
}

#[tokio::test]
async fn coercion_failure_records_failed_run_and_keeps_watermark() {
    let mut batch = mixed_batch();
    batch.sales[0].ingest_date = Some("not a timestamp".into());
    let h = harness(batch);

    let previous = AuditLogEntry {
        pipeline_name: "sales_etl".into(),
        last_processed_ingest_date: Utc
            .with_ymd_and_hms(2024, 5, 1, 0, 0, 0)
            .unwrap()
            .naive_utc(),
        records_processed: 1,
        records_rejected: 0,
        records_loaded: 1,
        run_status: RunStatus::Success,
    };
    h.warehouse.upsert_run(&previous).await.unwrap();

    let err = h.pipeline.run_once().await.unwrap_err();
    assert!(matches!(
        err,
        EtlError::Coercion {
            entity: "sale",
            field: "ingest_date",
            ..
        }
    ));

    let entry = h.warehouse.read_entry("sales_etl").await.unwrap().unwrap();
    assert_eq!(entry.run_status, RunStatus::Failed);
    assert_eq!(entry.records_loaded, 0);
    assert_eq!(entry.records_processed, 16);
    assert_eq!(entry.records_rejected, 9);
    assert_eq!(entry.last_processed_ingest_date, previous.last_processed_ingest_date);
    assert_eq!(h.warehouse.row_count(Table::FactSales).unwrap(), 0);
    assert_eq!(h.warehouse.row_count(Table::DimCustomer).unwrap(), 0);
}

#[tokio::test]
async fn product_price_is_repaired_before_ranking() {
    let h = harness(StagedBatch {
        customers: Vec::new(),
        products: vec![
            product(10, "the", Some(5.0), None, None),
            product(10, "Acme Widget", Some(-5.0), Some("X"), None),
        ],
        sales: Vec::new(),
    });
    let summary = h.pipeline.run_once().await.unwrap();
    assert_eq!(summary.rejections["product_dedup/DUPLICATE_PRODUCT_ID"], 1);
    assert!(!summary.rejections.contains_key("product_dedup/INVALID_PRODUCT_NAME"));

    let products = h.warehouse.products().unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].unit_price, Some(5.0));
    assert_eq!(products[0].product_name.as_deref(), Some("acme widget"));
}

#[tokio::test]
async fn reject_sink_failures_do_not_fail_the_run() {
    let h = harness_with(
        Arc::new(StaticSource { batch: mixed_batch() }),
        InMemoryRejectSink::failing(),
    );
    let summary = h.pipeline.run_once().await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.counters.rejected, 9);
    assert_eq!(h.warehouse.facts().unwrap().len(), 3);
}

#[tokio::test]
async fn audit_write_failure_is_fatal_and_rolls_back_the_load() {
    let h = harness(mixed_batch());
    h.warehouse.fail_audit_writes(true).unwrap();

    let err = h.pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, EtlError::Audit(_)));
    assert_eq!(h.warehouse.row_count(Table::FactSales).unwrap(), 0);
    assert!(h.warehouse.read_entry("sales_etl").await.unwrap().is_none());
}

#[tokio::test]
async fn overlapping_runs_are_refused() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness_with(
        Arc::new(GatedSource {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        }),
        InMemoryRejectSink::new(),
    );
    let pipeline = Arc::new(h.pipeline);

    let first = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.run_once().await }
    });
    entered.notified().await;

    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, EtlError::AlreadyRunning(name) if name == "sales_etl"));

    release.notify_one();
    let summary = first.await.unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.counters.processed, 0);
}

fn sample_bundle() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample/bundle.json")
}

fn dir_config(reports: &Path, rejects: &Path) -> EtlConfig {
    EtlConfig {
        reports_dir: reports.to_path_buf(),
        rejects_dir: rejects.to_path_buf(),
        ..EtlConfig::default()
    }
}

fn previous_success() -> AuditLogEntry {
    AuditLogEntry {
        pipeline_name: "sales_etl".into(),
        last_processed_ingest_date: Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .unwrap()
            .naive_utc(),
        records_processed: 3,
        records_rejected: 0,
        records_loaded: 3,
        run_status: RunStatus::Success,
    }
}

#[tokio::test]
async fn sample_fixture_runs_end_to_end_in_memory() {
    let reports = tempfile::tempdir().unwrap();
    let rejects = tempfile::tempdir().unwrap();
    let (pipeline, warehouse) =
        fixture_pipeline(dir_config(reports.path(), rejects.path()), sample_bundle()).unwrap();
    let pipeline = pipeline.with_clock(Arc::new(run_clock));

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);
    assert!(summary.source.starts_with("fixture:"));
    assert_eq!(summary.counters.processed, 20);
    assert_eq!(summary.counters.rejected, 7);
    assert_eq!(summary.counters.loaded, 4);
    assert_eq!(summary.rejections["customer_dedup/DUPLICATE_CUSTOMER_ID"], 1);
    assert_eq!(summary.rejections["product_dedup/INVALID_PRODUCT_NAME"], 1);
    assert_eq!(summary.rejections["date_validity/INVALID_DATE"], 1);
    assert_eq!(summary.rejections["single_owner/MULTI_CUSTOMER_TRANSACTION"], 2);
    assert_eq!(summary.rejections["corrupt_value/NONPOSITIVE_VALUE"], 1);
    assert_eq!(summary.rejections["orphan/ORPHAN_REFERENCE"], 1);

    let customers = warehouse.customers().unwrap();
    assert_eq!(customers.len(), 4);
    let ada = customers.iter().find(|c| c.customer_id == 1).unwrap();
    assert_eq!(ada.signup_date, NaiveDate::from_ymd_opt(2022, 1, 15));
    assert_eq!(ada.email.as_deref(), Some("ada@example.com"));
    let alan = customers.iter().find(|c| c.customer_id == 3).unwrap();
    assert_eq!(alan.signup_date, Some(run_clock().date_naive()));

    let products = warehouse.products().unwrap();
    assert_eq!(products.len(), 4);
    assert!(products.iter().all(|p| p.product_id != 13));
    let drill = products.iter().find(|p| p.product_id == 14).unwrap();
    assert_eq!(drill.unit_price, Some(4.75));

    let facts = warehouse.facts().unwrap();
    let grains: Vec<_> = facts.iter().map(|f| f.grain_key()).collect();
    assert_eq!(
        grains,
        vec![
            (1, 10, 20240301),
            (2, 14, 20240301),
            (3, 12, 20240229),
            (4, 10, 20240109),
        ]
    );
    assert_eq!(facts[0].quantity, 3);
    assert_eq!(facts[0].total_sale_amount, 15.0);
    assert_eq!(facts[0].net_sale_amount, 14.0);
    assert_eq!(facts[2].quantity, 3);
    assert_eq!(warehouse.row_count(Table::DimDate).unwrap(), 3);

    let quarantined = std::fs::read_dir(rejects.path()).unwrap().count();
    assert_eq!(quarantined, 6);

    let entry = warehouse.read_entry("sales_etl").await.unwrap().unwrap();
    assert_eq!(entry.run_status, RunStatus::Success);
    assert_eq!(entry.last_processed_ingest_date, run_clock().naive_utc());

    let rerun = pipeline.run_once().await.unwrap();
    assert_eq!(rerun.counters.processed, 0);
    assert_eq!(rerun.counters.loaded, 0);
    assert_eq!(warehouse.facts().unwrap().len(), 4);
}

#[tokio::test]
async fn missing_staging_column_fails_the_run_without_loading() {
    let reports = tempfile::tempdir().unwrap();
    let rejects = tempfile::tempdir().unwrap();
    let bundle = reports.path().join("bundle.json");
    std::fs::write(
        &bundle,
        r#"{
            "customers": [{"customer_id": 1, "customer_name": "Ada Lovelace", "email": null,
                           "city": "Austin", "state": "TX", "signup_date": "2021-06-01",
                           "ingest_date": "2024-05-04 09:00:00"}],
            "products": [{"product_id": 10, "product_name": "Acme Widget", "category": "tools",
                          "brand": "acme", "ingest_date": "2024-05-04 09:00:00"}],
            "sales": []
        }"#,
    )
    .unwrap();

    let (pipeline, warehouse) =
        fixture_pipeline(dir_config(reports.path(), rejects.path()), &bundle).unwrap();
    let pipeline = pipeline.with_clock(Arc::new(run_clock));
    let previous = previous_success();
    warehouse.upsert_run(&previous).await.unwrap();

    let err = pipeline.run_once().await.unwrap_err();
    match err {
        EtlError::SchemaViolation { table, missing } => {
            assert_eq!(table, "products_stage");
            assert_eq!(missing, vec!["unit_price".to_string()]);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let entry = warehouse.read_entry("sales_etl").await.unwrap().unwrap();
    assert_eq!(entry.run_status, RunStatus::Failed);
    assert_eq!(entry.last_processed_ingest_date, previous.last_processed_ingest_date);
    assert_eq!(entry.records_processed, 0);
    assert_eq!(entry.records_loaded, 0);
    for table in [Table::DimCustomer, Table::DimProduct, Table::DimDate, Table::FactSales] {
        assert_eq!(warehouse.row_count(table).unwrap(), 0);
    }
}
