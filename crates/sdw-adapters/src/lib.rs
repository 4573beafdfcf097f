//! Staging source contracts, the expected staging schema, and fixture-first sources.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sdw_core::{
    parse_timestamp, CustomerRecord, EtlError, ProductRecord, SalesTransactionRecord, StagedBatch,
};

use crate::rows::{
    customer_from_fields, json_field, product_from_fields, sale_from_fields, Field,
};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

mod postgres;
mod rows;

pub use postgres::PgStagingSource;

pub const CRATE_NAME: &str = "sdw-adapters";

pub const CUSTOMERS_STAGE: &str = "customers_stage";
pub const PRODUCTS_STAGE: &str = "products_stage";
pub const SALES_STAGE: &str = "sales_transactions_stage";

/// Extraction boundary: everything staged after `watermark`.
#[async_trait]
pub trait StagingSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self, watermark: NaiveDateTime) -> Result<StagedBatch, EtlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Text,
    Timestamp,
}

impl ColumnKind {
    /// Maps an `information_schema.columns.data_type` value.
    pub fn from_pg_type(data_type: &str) -> Option<Self> {
        match data_type {
            "smallint" | "integer" | "bigint" => Some(Self::Integer),
            "real" | "double precision" | "numeric" => Some(Self::Float),
            "text" | "character varying" | "character" => Some(Self::Text),
            "date"
            | "timestamp without time zone"
            | "timestamp with time zone" => Some(Self::Timestamp),
            _ => None,
        }
    }

    pub fn of_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) if n.is_i64() || n.is_u64() => Some(Self::Integer),
            JsonValue::Number(_) => Some(Self::Float),
            JsonValue::String(_) => Some(Self::Text),
            _ => None,
        }
    }

    /// Kinds a column may arrive as without counting as drift.
    fn accepts(self, actual: Self) -> bool {
        matches!(
            (self, actual),
            (Self::Float, Self::Integer) | (Self::Timestamp, Self::Text)
        ) || self == actual
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub table: &'static str,
    pub columns: &'static [(&'static str, ColumnKind)],
}

pub static EXPECTED_STAGING_SCHEMAS: [TableSchema; 3] = [
    TableSchema {
        table: CUSTOMERS_STAGE,
        columns: &[
            ("customer_id", ColumnKind::Integer),
            ("customer_name", ColumnKind::Text),
            ("email", ColumnKind::Text),
            ("city", ColumnKind::Text),
            ("state", ColumnKind::Text),
            ("signup_date", ColumnKind::Text),
            ("ingest_date", ColumnKind::Timestamp),
        ],
    },
    TableSchema {
        table: PRODUCTS_STAGE,
        columns: &[
            ("product_id", ColumnKind::Integer),
            ("product_name", ColumnKind::Text),
            ("category", ColumnKind::Text),
            ("brand", ColumnKind::Text),
            ("unit_price", ColumnKind::Float),
            ("ingest_date", ColumnKind::Timestamp),
        ],
    },
    TableSchema {
        table: SALES_STAGE,
        columns: &[
            ("transaction_id", ColumnKind::Integer),
            ("customer_id", ColumnKind::Integer),
            ("product_id", ColumnKind::Integer),
            ("transaction_date", ColumnKind::Text),
            ("quantity", ColumnKind::Float),
            ("unit_price", ColumnKind::Float),
            ("discount", ColumnKind::Float),
            ("ingest_date", ColumnKind::Timestamp),
        ],
    },
];

pub fn expected_schema(table: &str) -> Option<&'static TableSchema> {
    EXPECTED_STAGING_SCHEMAS.iter().find(|s| s.table == table)
}

/// Soft drift found by [`check_schema`]; already logged when returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub extra_columns: Vec<String>,
    pub kind_mismatches: Vec<String>,
}

/// Missing columns are fatal. Extra columns and kind mismatches are logged and tolerated.
/// An observed kind of `None` means the type could not be determined and is not checked.
pub fn check_schema(
    schema: &TableSchema,
    observed: &[(String, Option<ColumnKind>)],
) -> Result<SchemaReport, EtlError> {
    let missing = schema
        .columns
        .iter()
        .filter(|(name, _)| !observed.iter().any(|(col, _)| col == name))
        .map(|(name, _)| (*name).to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        tracing::error!(
            table = schema.table,
            ?missing,
            "staging table is missing required columns"
        );
        return Err(EtlError::SchemaViolation {
            table: schema.table.to_string(),
            missing,
        });
    }

    let mut report = SchemaReport::default();
    for (column, kind) in observed {
        match schema.columns.iter().find(|(name, _)| name == column) {
            None => report.extra_columns.push(column.clone()),
            Some((_, expected)) => {
                if let Some(actual) = kind {
                    if !expected.accepts(*actual) {
                        warn!(
                            table = schema.table,
                            column = column.as_str(),
                            ?expected,
                            ?actual,
                            "staging column type drift"
                        );
                        report.kind_mismatches.push(column.clone());
                    }
                }
            }
        }
    }
    if !report.extra_columns.is_empty() {
        warn!(table = schema.table, extra = ?report.extra_columns, "unexpected staging columns");
    }
    Ok(report)
}

/// Reads a JSON bundle `{customers: [...], products: [...], sales: [...]}` of staged rows.
#[derive(Debug, Clone)]
pub struct FixtureStagingSource {
    path: PathBuf,
}

impl FixtureStagingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StagingSource for FixtureStagingSource {
    fn describe(&self) -> String {
        format!("fixture:{}", self.path.display())
    }

    async fn fetch(&self, watermark: NaiveDateTime) -> Result<StagedBatch, EtlError> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))
            .map_err(EtlError::Extract)?;
        let batch = parse_fixture_bundle(&text, watermark)?;
        info!(
            source = %self.describe(),
            customers = batch.customers.len(),
            products = batch.products.len(),
            sales = batch.sales.len(),
            "fixture extract completed"
        );
        Ok(batch)
    }
}

/// Schema-checks and decodes a fixture bundle, keeping rows ingested after `watermark`.
pub fn parse_fixture_bundle(text: &str, watermark: NaiveDateTime) -> Result<StagedBatch, EtlError> {
    let root: JsonValue = serde_json::from_str(text)
        .context("parsing fixture bundle")
        .map_err(EtlError::Extract)?;

    let customers: Vec<CustomerRecord> =
        decode_table(&root, "customers", CUSTOMERS_STAGE, customer_from_fields)?;
    let products: Vec<ProductRecord> =
        decode_table(&root, "products", PRODUCTS_STAGE, product_from_fields)?;
    let sales: Vec<SalesTransactionRecord> =
        decode_table(&root, "sales", SALES_STAGE, sale_from_fields)?;

    Ok(StagedBatch {
        customers: customers
            .into_iter()
            .filter(|r| after_watermark(r.ingest_date.as_deref(), watermark))
            .collect(),
        products: products
            .into_iter()
            .filter(|r| after_watermark(r.ingest_date.as_deref(), watermark))
            .collect(),
        sales: sales
            .into_iter()
            .filter(|r| after_watermark(r.ingest_date.as_deref(), watermark))
            .collect(),
    })
}

/// Mirrors `ingest_date > watermark` in SQL: rows without a usable ingest date fall outside
/// the window.
fn after_watermark(ingest_date: Option<&str>, watermark: NaiveDateTime) -> bool {
    ingest_date
        .and_then(parse_timestamp)
        .is_some_and(|ts| ts > watermark)
}

/// Rows are decoded leniently: drifted values are coerced like Postgres text, or nulled.
fn decode_table<T>(
    root: &JsonValue,
    key: &str,
    table: &str,
    decode: fn(&Field<'_>) -> anyhow::Result<T>,
) -> Result<Vec<T>, EtlError> {
    let rows = match root.get(key) {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::Array(rows)) => rows,
        Some(_) => {
            return Err(EtlError::Extract(anyhow::anyhow!(
                "fixture key `{key}` must be an array"
            )))
        }
    };
    if rows.is_empty() {
        debug!(table, "fixture table is empty; skipping schema check");
        return Ok(Vec::new());
    }

    let objects = rows
        .iter()
        .map(|row| {
            row.as_object()
                .ok_or_else(|| EtlError::Extract(anyhow::anyhow!("{table}: rows must be objects")))
        })
        .collect::<Result<Vec<&Map<String, JsonValue>>, _>>()?;

    if let Some(schema) = expected_schema(table) {
        check_schema(schema, &observed_json_columns(&objects))?;
    }

    objects
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            decode(&json_field(row))
                .with_context(|| format!("{table}: decoding row {idx}"))
                .map_err(EtlError::Extract)
        })
        .collect()
}

/// Column names across all rows, typed by the first non-null value seen.
fn observed_json_columns(rows: &[&Map<String, JsonValue>]) -> Vec<(String, Option<ColumnKind>)> {
    let names: BTreeSet<&String> = rows.iter().flat_map(|r| r.keys()).collect();
    names
        .into_iter()
        .map(|name| {
            let kind = rows
                .iter()
                .filter_map(|r| r.get(name))
                .find_map(ColumnKind::of_json);
            (name.clone(), kind)
        })
        .collect()
}
