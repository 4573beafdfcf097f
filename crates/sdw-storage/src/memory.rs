use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use sdw_core::{
    AuditLogEntry, DateDimensionRecord, DimCustomer, DimProduct, FactSalesRecord, RejectedBatch,
};

use crate::{
    AuditStore, RejectSink, RowKey, Table, Warehouse, WarehouseRow, WarehouseRows, WarehouseTx,
};

#[derive(Debug, Default)]
struct MemoryState {
    customers: Vec<DimCustomer>,
    products: Vec<DimProduct>,
    dates: Vec<DateDimensionRecord>,
    facts: Vec<FactSalesRecord>,
    audit: HashMap<String, AuditLogEntry>,
    fail_audit_writes: bool,
}

impl MemoryState {
    fn keys(&self, table: Table) -> HashSet<RowKey> {
        match table {
            Table::DimCustomer => self.customers.iter().map(WarehouseRow::key).collect(),
            Table::DimProduct => self.products.iter().map(WarehouseRow::key).collect(),
            Table::DimDate => self.dates.iter().map(WarehouseRow::key).collect(),
            Table::FactSales => self.facts.iter().map(WarehouseRow::key).collect(),
        }
    }

    /// Appends with primary/grain-key uniqueness, skipping conflicting rows.
    fn apply(&mut self, rows: WarehouseRows) -> u64 {
        let mut existing = self.keys(rows.table());
        let mut inserted = 0;
        macro_rules! append {
            ($target:expr, $batch:expr) => {
                for row in $batch {
                    if existing.insert(row.key()) {
                        $target.push(row);
                        inserted += 1;
                    }
                }
            };
        }
        match rows {
            WarehouseRows::Customers(batch) => append!(self.customers, batch),
            WarehouseRows::Products(batch) => append!(self.products, batch),
            WarehouseRows::Dates(batch) => append!(self.dates, batch),
            WarehouseRows::Facts(batch) => append!(self.facts, batch),
        }
        inserted
    }
}

/// Process-local warehouse and audit log with the same transactional contract as Postgres.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWarehouse {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> anyhow::Result<MutexGuard<'_, MemoryState>> {
        lock(&self.state)
    }

    /// Makes every audit write fail, transactional or not.
    pub fn fail_audit_writes(&self, fail: bool) -> anyhow::Result<()> {
        self.state()?.fail_audit_writes = fail;
        Ok(())
    }

    pub fn customers(&self) -> anyhow::Result<Vec<DimCustomer>> {
        Ok(self.state()?.customers.clone())
    }

    pub fn products(&self) -> anyhow::Result<Vec<DimProduct>> {
        Ok(self.state()?.products.clone())
    }

    pub fn dates(&self) -> anyhow::Result<Vec<DateDimensionRecord>> {
        Ok(self.state()?.dates.clone())
    }

    pub fn facts(&self) -> anyhow::Result<Vec<FactSalesRecord>> {
        Ok(self.state()?.facts.clone())
    }

    pub fn row_count(&self, table: Table) -> anyhow::Result<usize> {
        Ok(self.state()?.keys(table).len())
    }
}

fn lock(state: &Mutex<MemoryState>) -> anyhow::Result<MutexGuard<'_, MemoryState>> {
    state
        .lock()
        .map_err(|_| anyhow!("in-memory warehouse lock poisoned"))
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn begin(&self) -> anyhow::Result<Box<dyn WarehouseTx + '_>> {
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
            pending_audit: None,
        }))
    }
}

#[async_trait]
impl AuditStore for InMemoryWarehouse {
    async fn read_entry(&self, pipeline_name: &str) -> anyhow::Result<Option<AuditLogEntry>> {
        Ok(self.state()?.audit.get(pipeline_name).cloned())
    }

    async fn upsert_run(&self, entry: &AuditLogEntry) -> anyhow::Result<()> {
        let mut state = self.state()?;
        if state.fail_audit_writes {
            bail!("audit log is unavailable");
        }
        state
            .audit
            .insert(entry.pipeline_name.clone(), entry.clone());
        Ok(())
    }
}

struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<WarehouseRows>,
    pending_audit: Option<AuditLogEntry>,
}

#[async_trait]
impl WarehouseTx for MemoryTx {
    async fn read_existing_keys(&mut self, table: Table) -> anyhow::Result<HashSet<RowKey>> {
        let mut keys = lock(&self.state)?.keys(table);
        for rows in self.pending.iter().filter(|rows| rows.table() == table) {
            keys.extend(rows.keys());
        }
        Ok(keys)
    }

    async fn append_rows(&mut self, rows: WarehouseRows) -> anyhow::Result<u64> {
        let existing = self.read_existing_keys(rows.table()).await?;
        let mut seen = HashSet::new();
        let inserted = rows
            .keys()
            .into_iter()
            .filter(|key| !existing.contains(key) && seen.insert(key.clone()))
            .count();
        self.pending.push(rows);
        Ok(inserted as u64)
    }

    async fn upsert_run(&mut self, entry: &AuditLogEntry) -> anyhow::Result<()> {
        if lock(&self.state)?.fail_audit_writes {
            bail!("audit log is unavailable");
        }
        self.pending_audit = Some(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let MemoryTx {
            state,
            pending,
            pending_audit,
        } = *self;
        let mut state = lock(&state)?;
        for rows in pending {
            state.apply(rows);
        }
        if let Some(entry) = pending_audit {
            state.audit.insert(entry.pipeline_name.clone(), entry);
        }
        Ok(())
    }
}

/// Keeps every persisted batch in memory.
#[derive(Debug, Default)]
pub struct InMemoryRejectSink {
    batches: Mutex<Vec<RejectedBatch>>,
    fail: bool,
}

impl InMemoryRejectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every write fails.
    pub fn failing() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn batches(&self) -> Vec<RejectedBatch> {
        self.batches
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }
}

impl RejectSink for InMemoryRejectSink {
    fn persist(&self, batch: &RejectedBatch) -> anyhow::Result<()> {
        if self.fail {
            bail!("reject sink is unavailable");
        }
        self.batches
            .lock()
            .map_err(|_| anyhow!("reject sink lock poisoned"))?
            .push(batch.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use sdw_core::RunStatus;

    fn fact(customer_id: i64, product_id: i64, date_id: i64) -> FactSalesRecord {
        FactSalesRecord {
            customer_id,
            product_id,
            date_id,
            quantity: 1,
            unit_price: 1.0,
            total_sale_amount: 1.0,
            net_sale_amount: 1.0,
        }
    }

    fn entry(status: RunStatus) -> AuditLogEntry {
        AuditLogEntry {
            pipeline_name: "sales_etl".into(),
            last_processed_ingest_date: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            records_processed: 3,
            records_rejected: 1,
            records_loaded: 2,
            run_status: status,
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let warehouse = InMemoryWarehouse::new();
        {
            let mut tx = warehouse.begin().await.unwrap();
            let inserted = tx
                .append_rows(WarehouseRows::Facts(vec![fact(1, 1, 20240101)]))
                .await
                .unwrap();
            assert_eq!(inserted, 1);
            tx.upsert_run(&entry(RunStatus::Success)).await.unwrap();
        }
        assert_eq!(warehouse.row_count(Table::FactSales).unwrap(), 0);
        assert!(warehouse.read_entry("sales_etl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_applies_rows_and_audit_together() {
        let warehouse = InMemoryWarehouse::new();
        let mut tx = warehouse.begin().await.unwrap();
        tx.append_rows(WarehouseRows::Facts(vec![fact(1, 1, 20240101), fact(1, 1, 20240101)]))
            .await
            .unwrap();
        let keys = tx.read_existing_keys(Table::FactSales).await.unwrap();
        assert!(keys.contains(&vec![1, 1, 20240101]));
        tx.upsert_run(&entry(RunStatus::Success)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(warehouse.facts().unwrap().len(), 1);
        let stored = warehouse.read_entry("sales_etl").await.unwrap().unwrap();
        assert_eq!(stored.run_status, RunStatus::Success);
    }

    #[tokio::test]
    async fn watermark_defaults_until_first_entry() {
        let warehouse = InMemoryWarehouse::new();
        let before = warehouse.read_last_watermark("sales_etl").await.unwrap();
        assert_eq!(before, sdw_core::default_watermark());

        warehouse.upsert_run(&entry(RunStatus::Failed)).await.unwrap();
        let after = warehouse.read_last_watermark("sales_etl").await.unwrap();
        assert_eq!(after.date(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[tokio::test]
    async fn audit_failures_can_be_injected() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.fail_audit_writes(true).unwrap();
        assert!(warehouse.upsert_run(&entry(RunStatus::Failed)).await.is_err());
        let mut tx = warehouse.begin().await.unwrap();
        assert!(tx.upsert_run(&entry(RunStatus::Success)).await.is_err());
    }

    #[test]
    fn failing_sink_reports_errors() {
        let sink = InMemoryRejectSink::failing();
        let batch = RejectedBatch {
            stage: sdw_core::Stage::Orphan,
            reason: sdw_core::RejectReason::OrphanReference,
            rows: Vec::new(),
        };
        assert!(sink.persist(&batch).is_err());
        assert!(sink.batches().is_empty());
    }
}
