use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use sdw_core::{checked_identifier, AuditLogEntry, EtlError, RunStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use crate::{AuditStore, RowKey, Table, Warehouse, WarehouseRows, WarehouseTx};

/// Rows per INSERT statement; the widest table binds 7 values per row, well under 65535.
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    warehouse_schema: String,
    audit_schema: String,
    pipeline_name: String,
}

impl PgWarehouse {
    pub fn new(
        pool: PgPool,
        warehouse_schema: &str,
        audit_schema: &str,
        pipeline_name: &str,
    ) -> Result<Self, EtlError> {
        Ok(Self {
            pool,
            warehouse_schema: checked_identifier(warehouse_schema)?.to_string(),
            audit_schema: checked_identifier(audit_schema)?.to_string(),
            pipeline_name: pipeline_name.to_string(),
        })
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn begin(&self) -> anyhow::Result<Box<dyn WarehouseTx + '_>> {
        let mut tx = self.pool.begin().await.context("opening warehouse transaction")?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.pipeline_name)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("taking run lock for pipeline {}", self.pipeline_name))?;
        Ok(Box::new(PgWarehouseTx {
            tx,
            warehouse_schema: &self.warehouse_schema,
            audit_schema: &self.audit_schema,
        }))
    }
}

struct PgWarehouseTx<'a> {
    tx: Transaction<'static, Postgres>,
    warehouse_schema: &'a str,
    audit_schema: &'a str,
}

#[async_trait]
impl WarehouseTx for PgWarehouseTx<'_> {
    async fn read_existing_keys(&mut self, table: Table) -> anyhow::Result<HashSet<RowKey>> {
        let sql = existing_keys_sql(self.warehouse_schema, table);
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .with_context(|| {
                format!("reading keys of {}.{}", self.warehouse_schema, table.name())
            })?;
        let width = table.key_columns().len();
        rows.iter()
            .map(|row| -> anyhow::Result<RowKey> {
                (0..width)
                    .map(|i| row.try_get::<i64, _>(i).map_err(anyhow::Error::from))
                    .collect()
            })
            .collect()
    }

    async fn append_rows(&mut self, rows: WarehouseRows) -> anyhow::Result<u64> {
        let table = rows.table();
        let mut inserted = 0;
        for mut builder in insert_statements(self.warehouse_schema, &rows) {
            let result = builder
                .build()
                .execute(&mut *self.tx)
                .await
                .with_context(|| {
                    format!("appending to {}.{}", self.warehouse_schema, table.name())
                })?;
            inserted += result.rows_affected();
        }
        debug!(table = table.name(), offered = rows.len(), inserted, "rows appended");
        Ok(inserted)
    }

    async fn upsert_run(&mut self, entry: &AuditLogEntry) -> anyhow::Result<()> {
        upsert_audit(&mut *self.tx, self.audit_schema, entry).await
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.tx.commit().await.context("committing warehouse transaction")
    }
}

fn existing_keys_sql(schema: &str, table: Table) -> String {
    let columns = table
        .key_columns()
        .iter()
        .map(|c| format!("{c}::bigint"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {columns} FROM {schema}.{}", table.name())
}

fn insert_statements(schema: &str, rows: &WarehouseRows) -> Vec<QueryBuilder<'static, Postgres>> {
    let table = rows.table();
    let conflict = format!(" ON CONFLICT ({}) DO NOTHING", table.key_columns().join(", "));
    let head = |columns: &str| format!("INSERT INTO {schema}.{} ({columns}) ", table.name());

    macro_rules! chunks {
        ($rows:expr, $columns:expr, |$b:ident, $r:ident| $bind:block) => {
            $rows
                .chunks(INSERT_CHUNK)
                .map(|chunk| {
                    let mut qb = QueryBuilder::<Postgres>::new(head($columns));
                    qb.push_values(chunk, |mut $b, $r| $bind);
                    qb.push(&conflict);
                    qb
                })
                .collect()
        };
    }

    match rows {
        WarehouseRows::Customers(batch) => chunks!(
            batch,
            "customer_id, customer_name, email, city, state, signup_date, ingest_date",
            |b, r| {
                b.push_bind(r.customer_id)
                    .push_bind(r.customer_name.clone())
                    .push_bind(r.email.clone())
                    .push_bind(r.city.clone())
                    .push_bind(r.state.clone())
                    .push_bind(r.signup_date)
                    .push_bind(r.ingest_date);
            }
        ),
        WarehouseRows::Products(batch) => chunks!(
            batch,
            "product_id, product_name, category, brand, unit_price, ingest_date",
            |b, r| {
                b.push_bind(r.product_id)
                    .push_bind(r.product_name.clone())
                    .push_bind(r.category.clone())
                    .push_bind(r.brand.clone())
                    .push_bind(r.unit_price)
                    .push_bind(r.ingest_date);
            }
        ),
        WarehouseRows::Dates(batch) => chunks!(
            batch,
            "date_id, date, day, month, quarter, year, weekday",
            |b, r| {
                b.push_bind(r.date_id)
                    .push_bind(r.date)
                    // day <= 31, month <= 12, quarter <= 4
                    .push_bind(r.day as i32)
                    .push_bind(r.month as i32)
                    .push_bind(r.quarter as i32)
                    .push_bind(r.year)
                    .push_bind(r.weekday.clone());
            }
        ),
        WarehouseRows::Facts(batch) => chunks!(
            batch,
            concat!(
                "customer_id, product_id, date_id, quantity, unit_price, ",
                "total_sale_amount, net_sale_amount"
            ),
            |b, r| {
                b.push_bind(r.customer_id)
                    .push_bind(r.product_id)
                    .push_bind(r.date_id)
                    .push_bind(r.quantity)
                    .push_bind(r.unit_price)
                    .push_bind(r.total_sale_amount)
                    .push_bind(r.net_sale_amount);
            }
        ),
    }
}

fn counter(value: u64) -> anyhow::Result<i64> {
    i64::try_from(value).context("audit counter exceeds bigint")
}

async fn upsert_audit<'e>(
    executor: impl PgExecutor<'e>,
    schema: &str,
    entry: &AuditLogEntry,
) -> anyhow::Result<()> {
    let sql = format!(
        r#"
        INSERT INTO {schema}.etl_audit_log
            (pipeline_name, last_processed_ingest_date, records_processed,
             records_rejected, records_loaded, run_status, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (pipeline_name) DO UPDATE
           SET last_processed_ingest_date = EXCLUDED.last_processed_ingest_date,
               records_processed = EXCLUDED.records_processed,
               records_rejected = EXCLUDED.records_rejected,
               records_loaded = EXCLUDED.records_loaded,
               run_status = EXCLUDED.run_status,
               updated_at = NOW()
        "#
    );
    sqlx::query(&sql)
        .bind(&entry.pipeline_name)
        .bind(entry.last_processed_ingest_date)
        .bind(counter(entry.records_processed)?)
        .bind(counter(entry.records_rejected)?)
        .bind(counter(entry.records_loaded)?)
        .bind(entry.run_status.as_str())
        .execute(executor)
        .await
        .with_context(|| format!("upserting audit entry for {}", entry.pipeline_name))?;
    Ok(())
}

/// Audit access outside the load transaction: the watermark read and the FAILED upsert.
#[derive(Debug, Clone)]
pub struct PgAuditStore {
    pool: PgPool,
    schema: String,
}

impl PgAuditStore {
    pub fn new(pool: PgPool, schema: &str) -> Result<Self, EtlError> {
        Ok(Self {
            pool,
            schema: checked_identifier(schema)?.to_string(),
        })
    }
}

fn entry_from_row(row: &PgRow) -> anyhow::Result<AuditLogEntry> {
    let status: String = row.try_get("run_status")?;
    let unsigned = |column: &str| -> anyhow::Result<u64> {
        let value: i64 = row.try_get(column)?;
        u64::try_from(value).with_context(|| format!("{column} is negative"))
    };
    Ok(AuditLogEntry {
        pipeline_name: row.try_get("pipeline_name")?,
        last_processed_ingest_date: row.try_get("last_processed_ingest_date")?,
        records_processed: unsigned("records_processed")?,
        records_rejected: unsigned("records_rejected")?,
        records_loaded: unsigned("records_loaded")?,
        run_status: RunStatus::parse(&status)
            .with_context(|| format!("unknown run_status {status:?}"))?,
    })
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn read_entry(&self, pipeline_name: &str) -> anyhow::Result<Option<AuditLogEntry>> {
        let sql = format!(
            r#"
            SELECT pipeline_name, last_processed_ingest_date, records_processed,
                   records_rejected, records_loaded, run_status
              FROM {}.etl_audit_log
             WHERE pipeline_name = $1
            "#,
            self.schema
        );
        let row: Option<PgRow> = sqlx::query(&sql)
            .bind(pipeline_name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading audit entry for {pipeline_name}"))?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn upsert_run(&self, entry: &AuditLogEntry) -> anyhow::Result<()> {
        upsert_audit(&self.pool, &self.schema, entry).await
    }
}
