//! Warehouse, audit and rejection storage boundaries plus their Postgres, Parquet and
//! in-memory implementations.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sdw_core::{
    default_watermark, AuditLogEntry, DateDimensionRecord, DimCustomer, DimProduct,
    FactSalesRecord, RejectedBatch,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

mod memory;
mod postgres;
mod rejects;

pub use memory::{InMemoryRejectSink, InMemoryWarehouse};
pub use postgres::{PgAuditStore, PgWarehouse};
pub use rejects::{ParquetRejectStore, StoredReject};

pub const CRATE_NAME: &str = "sdw-storage";

/// Primary or grain key values of one warehouse row, in `Table::key_columns` order.
pub type RowKey = Vec<i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    DimCustomer,
    DimProduct,
    DimDate,
    FactSales,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Self::DimCustomer => "dim_customer",
            Self::DimProduct => "dim_product",
            Self::DimDate => "dim_date",
            Self::FactSales => "fact_sales",
        }
    }

    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            Self::DimCustomer => &["customer_id"],
            Self::DimProduct => &["product_id"],
            Self::DimDate => &["date_id"],
            Self::FactSales => &["customer_id", "product_id", "date_id"],
        }
    }
}

/// A typed batch bound for one warehouse table.
#[derive(Debug, Clone, PartialEq)]
pub enum WarehouseRows {
    Customers(Vec<DimCustomer>),
    Products(Vec<DimProduct>),
    Dates(Vec<DateDimensionRecord>),
    Facts(Vec<FactSalesRecord>),
}

impl WarehouseRows {
    pub fn table(&self) -> Table {
        match self {
            Self::Customers(_) => Table::DimCustomer,
            Self::Products(_) => Table::DimProduct,
            Self::Dates(_) => Table::DimDate,
            Self::Facts(_) => Table::FactSales,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Customers(rows) => rows.len(),
            Self::Products(rows) => rows.len(),
            Self::Dates(rows) => rows.len(),
            Self::Facts(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<RowKey> {
        match self {
            Self::Customers(rows) => rows.iter().map(WarehouseRow::key).collect(),
            Self::Products(rows) => rows.iter().map(WarehouseRow::key).collect(),
            Self::Dates(rows) => rows.iter().map(WarehouseRow::key).collect(),
            Self::Facts(rows) => rows.iter().map(WarehouseRow::key).collect(),
        }
    }
}

/// A row type stored in exactly one warehouse table.
pub trait WarehouseRow: Clone + Send + Sync + 'static {
    const TABLE: Table;

    fn key(&self) -> RowKey;

    fn into_rows(rows: Vec<Self>) -> WarehouseRows;
}

impl WarehouseRow for DimCustomer {
    const TABLE: Table = Table::DimCustomer;

    fn key(&self) -> RowKey {
        vec![self.customer_id]
    }

    fn into_rows(rows: Vec<Self>) -> WarehouseRows {
        WarehouseRows::Customers(rows)
    }
}

impl WarehouseRow for DimProduct {
    const TABLE: Table = Table::DimProduct;

    fn key(&self) -> RowKey {
        vec![self.product_id]
    }

    fn into_rows(rows: Vec<Self>) -> WarehouseRows {
        WarehouseRows::Products(rows)
    }
}

impl WarehouseRow for DateDimensionRecord {
    const TABLE: Table = Table::DimDate;

    fn key(&self) -> RowKey {
        vec![self.date_id]
    }

    fn into_rows(rows: Vec<Self>) -> WarehouseRows {
        WarehouseRows::Dates(rows)
    }
}

impl WarehouseRow for FactSalesRecord {
    const TABLE: Table = Table::FactSales;

    fn key(&self) -> RowKey {
        let (customer_id, product_id, date_id) = self.grain_key();
        vec![customer_id, product_id, date_id]
    }

    fn into_rows(rows: Vec<Self>) -> WarehouseRows {
        WarehouseRows::Facts(rows)
    }
}

/// Entry point for one load unit of work.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn begin(&self) -> anyhow::Result<Box<dyn WarehouseTx + '_>>;
}

/// Loads and the success audit entry share one transaction. Dropping without `commit`
/// discards everything written through it.
#[async_trait]
pub trait WarehouseTx: Send {
    /// Keys already present in `table`, projected on `table.key_columns()`.
    async fn read_existing_keys(&mut self, table: Table) -> anyhow::Result<HashSet<RowKey>>;

    /// Appends `rows` and returns how many were inserted.
    async fn append_rows(&mut self, rows: WarehouseRows) -> anyhow::Result<u64>;

    async fn upsert_run(&mut self, entry: &AuditLogEntry) -> anyhow::Result<()>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn read_entry(&self, pipeline_name: &str) -> anyhow::Result<Option<AuditLogEntry>>;

    async fn upsert_run(&self, entry: &AuditLogEntry) -> anyhow::Result<()>;

    async fn read_last_watermark(&self, pipeline_name: &str) -> anyhow::Result<NaiveDateTime> {
        Ok(self
            .read_entry(pipeline_name)
            .await?
            .map_or_else(default_watermark, |entry| entry.last_processed_ingest_date))
    }
}

/// Durable quarantine for rejected rows. Callers treat failures as non-fatal.
pub trait RejectSink: Send + Sync {
    fn persist(&self, batch: &RejectedBatch) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Opens a pool, retrying connection failures with capped exponential backoff.
pub async fn connect_with_backoff(
    database_url: &str,
    backoff: BackoffPolicy,
) -> anyhow::Result<PgPool> {
    let mut attempt = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(err) if attempt < backoff.max_retries => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(attempt, ?delay, error = %err, "postgres connect failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err).context("connecting to postgres"),
        }
    }
}
