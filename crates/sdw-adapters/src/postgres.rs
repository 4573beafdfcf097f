use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sdw_core::{
    checked_identifier, CustomerRecord, EtlError, ProductRecord, SalesTransactionRecord,
    StagedBatch,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::rows::{customer_from_fields, product_from_fields, sale_from_fields};
use crate::{
    check_schema, expected_schema, ColumnKind, StagingSource, TableSchema, CUSTOMERS_STAGE,
    PRODUCTS_STAGE, SALES_STAGE,
};

/// Reads the staging tables that the ingestion process appends to.
///
/// Every column is selected as text and parsed here so that soft type drift in a staging
/// table does not break extraction.
#[derive(Debug, Clone)]
pub struct PgStagingSource {
    pool: PgPool,
    schema: String,
}

impl PgStagingSource {
    pub fn new(pool: PgPool, schema: &str) -> Result<Self, EtlError> {
        Ok(Self {
            pool,
            schema: checked_identifier(schema)?.to_string(),
        })
    }

    async fn observed_columns(
        &self,
        table: &str,
    ) -> anyhow::Result<Vec<(String, Option<ColumnKind>)>> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
              FROM information_schema.columns
             WHERE table_schema = $1
               AND table_name = $2
             ORDER BY ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("inspecting columns of {}.{table}", self.schema))?;

        rows.iter()
            .map(|row| -> anyhow::Result<(String, Option<ColumnKind>)> {
                let name: String = row.try_get("column_name")?;
                let data_type: String = row.try_get("data_type")?;
                Ok((name, ColumnKind::from_pg_type(&data_type)))
            })
            .collect()
    }

    async fn checked_rows(
        &self,
        table: &str,
        watermark: NaiveDateTime,
    ) -> Result<Vec<PgRow>, EtlError> {
        let schema = expected_schema(table)
            .ok_or_else(|| EtlError::Extract(anyhow!("no expected schema for {table}")))?;
        let observed = self.observed_columns(table).await.map_err(EtlError::Extract)?;
        check_schema(schema, &observed)?;

        let sql = select_sql(&self.schema, schema);
        sqlx::query(&sql)
            .bind(watermark)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("reading {}.{table}", self.schema))
            .map_err(EtlError::Extract)
    }
}

#[async_trait]
impl StagingSource for PgStagingSource {
    fn describe(&self) -> String {
        format!("postgres:{}", self.schema)
    }

    async fn fetch(&self, watermark: NaiveDateTime) -> Result<StagedBatch, EtlError> {
        let customers = self
            .checked_rows(CUSTOMERS_STAGE, watermark)
            .await?
            .iter()
            .map(customer_from_row)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(EtlError::Extract)?;
        let products = self
            .checked_rows(PRODUCTS_STAGE, watermark)
            .await?
            .iter()
            .map(product_from_row)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(EtlError::Extract)?;
        let sales = self
            .checked_rows(SALES_STAGE, watermark)
            .await?
            .iter()
            .map(sale_from_row)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(EtlError::Extract)?;

        info!(
            schema = %self.schema,
            %watermark,
            customers = customers.len(),
            products = products.len(),
            sales = sales.len(),
            "staging extract completed"
        );
        Ok(StagedBatch {
            customers,
            products,
            sales,
        })
    }
}

fn select_sql(staging_schema: &str, table: &TableSchema) -> String {
    let columns = table
        .columns
        .iter()
        .map(|(name, _)| format!("{name}::text AS {name}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {columns} FROM {staging_schema}.{} \
         WHERE ingest_date::timestamp > $1 ORDER BY ingest_date",
        table.table
    )
}

fn text(row: &PgRow, column: &str) -> anyhow::Result<Option<String>> {
    row.try_get::<Option<String>, _>(column)
        .with_context(|| format!("reading column {column}"))
}

fn fields(row: &PgRow) -> impl Fn(&str) -> anyhow::Result<Option<String>> + '_ {
    move |column| text(row, column)
}

fn customer_from_row(row: &PgRow) -> anyhow::Result<CustomerRecord> {
    customer_from_fields(&fields(row))
}

fn product_from_row(row: &PgRow) -> anyhow::Result<ProductRecord> {
    product_from_fields(&fields(row))
}

fn sale_from_row(row: &PgRow) -> anyhow::Result<SalesTransactionRecord> {
    sale_from_fields(&fields(row))
}
