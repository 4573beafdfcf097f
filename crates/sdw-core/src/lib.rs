//! Core record model, reject taxonomy and stage outcomes for the sales warehouse pipeline.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

mod error;
mod reject;

pub use error::EtlError;
pub use reject::{Outcome, RejectReason, RejectedBatch, RejectedRecord, Stage, StagedRow};

pub const CRATE_NAME: &str = "sdw-core";

/// Pipeline name used when none is configured.
pub const DEFAULT_PIPELINE_NAME: &str = "sales_etl";

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y"];

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Lenient date parse. Timestamps are truncated to their calendar date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| parse_timestamp_only(raw).map(|ts| ts.date()))
}

/// Lenient timestamp parse. Bare dates resolve to midnight.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    parse_timestamp_only(raw).or_else(|| {
        DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
            .map(|d| d.and_time(NaiveTime::MIN))
    })
}

fn parse_timestamp_only(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// `YYYYMMDD` integer key of the date dimension.
pub fn date_id(date: NaiveDate) -> i64 {
    use chrono::Datelike;
    i64::from(date.year()) * 10_000 + i64::from(date.month()) * 100 + i64::from(date.day())
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*` so schema and table names can be spliced into SQL.
pub fn checked_identifier(name: &str) -> Result<&str, EtlError> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(EtlError::InvalidConfig(format!("`{name}` is not a plain SQL identifier")))
    }
}

/// Watermark used when a pipeline has never completed a run.
pub fn default_watermark() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_time(NaiveTime::MIN)
}

/// Staged customer row as extracted. Dates stay raw until dedup/enforcement parse them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: i64,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub signup_date: Option<String>,
    #[serde(default)]
    pub ingest_date: Option<String>,
}

/// Staged product row as extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: i64,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub ingest_date: Option<String>,
}

/// Staged sales transaction row as extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesTransactionRecord {
    #[serde(default)]
    pub transaction_id: Option<i64>,
    #[serde(default)]
    pub customer_id: Option<i64>,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub transaction_date: Option<String>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub discount: Option<f64>,
    #[serde(default)]
    pub ingest_date: Option<String>,
}

/// The three staged batches pulled for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagedBatch {
    #[serde(default)]
    pub customers: Vec<CustomerRecord>,
    #[serde(default)]
    pub products: Vec<ProductRecord>,
    #[serde(default)]
    pub sales: Vec<SalesTransactionRecord>,
}

impl StagedBatch {
    pub fn len(&self) -> usize {
        self.customers.len() + self.products.len() + self.sales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Customer after strict type enforcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimCustomer {
    pub customer_id: i64,
    pub customer_name: Option<String>,
    pub email: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub signup_date: Option<NaiveDate>,
    pub ingest_date: NaiveDateTime,
}

/// Product after strict type enforcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimProduct {
    pub product_id: i64,
    pub product_name: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub unit_price: Option<f64>,
    pub ingest_date: NaiveDateTime,
}

/// Sales transaction after strict type enforcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub transaction_id: i64,
    pub customer_id: i64,
    pub product_id: i64,
    pub transaction_date: NaiveDate,
    pub quantity: i64,
    pub unit_price: f64,
    pub discount: Option<f64>,
    pub ingest_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateDimensionRecord {
    pub date_id: i64,
    pub date: NaiveDate,
    pub day: u32,
    pub month: u32,
    pub quarter: u32,
    pub year: i32,
    pub weekday: String,
}

/// One row of `fact_sales`, unique on `(customer_id, product_id, date_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSalesRecord {
    pub customer_id: i64,
    pub product_id: i64,
    pub date_id: i64,
    pub quantity: i64,
    pub unit_price: f64,
    pub total_sale_amount: f64,
    pub net_sale_amount: f64,
}

impl FactSalesRecord {
    pub fn grain_key(&self) -> (i64, i64, i64) {
        (self.customer_id, self.product_id, self.date_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Latest run state per pipeline; upserted on `pipeline_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub pipeline_name: String,
    pub last_processed_ingest_date: NaiveDateTime,
    pub records_processed: u64,
    pub records_rejected: u64,
    pub records_loaded: u64,
    pub run_status: RunStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_date_shapes() {
        let expected = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();
        assert_eq!(parse_date("2021-06-01"), Some(expected));
        assert_eq!(parse_date(" 2021/06/01 "), Some(expected));
        assert_eq!(parse_date("06/01/2021"), Some(expected));
        assert_eq!(parse_date("2021-06-01 13:45:00"), Some(expected));
        assert_eq!(parse_date("2021-06-01T13:45:00Z"), Some(expected));
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date("2021-02-30"), None);
        assert_eq!(parse_date("   "), None);
    }

    #[test]
    fn timestamps_accept_postgres_text_and_bare_dates() {
        let ts = parse_timestamp("2024-03-05 10:11:12.5").unwrap();
        assert_eq!(ts.date(), NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        let tz = parse_timestamp("2024-03-05 10:11:12+00").unwrap();
        assert_eq!(tz.format("%H:%M:%S").to_string(), "10:11:12");
        let midnight = parse_timestamp("2024-03-05").unwrap();
        assert_eq!(midnight.time(), NaiveTime::MIN);
    }

    #[test]
    fn date_id_is_yyyymmdd() {
        let date = NaiveDate::from_ymd_opt(2023, 1, 9).unwrap();
        assert_eq!(date_id(date), 20230109);
    }

    #[test]
    fn identifiers_reject_sql_fragments() {
        assert!(checked_identifier("sales_dw").is_ok());
        assert!(checked_identifier("_stage2").is_ok());
        assert!(checked_identifier("2stage").is_err());
        assert!(checked_identifier("dw; DROP TABLE x").is_err());
        assert!(checked_identifier("").is_err());
    }

    #[test]
    fn run_status_round_trips_through_text() {
        assert_eq!(RunStatus::parse("success"), Some(RunStatus::Success));
        assert_eq!(RunStatus::Failed.as_str(), "FAILED");
        assert_eq!(RunStatus::parse("RUNNING"), None);
    }
}
