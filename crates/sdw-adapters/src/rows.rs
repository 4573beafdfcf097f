//! Lenient staged-row decoding shared by every source. Columns arrive as text and are
//! parsed per field; a value that does not parse becomes `None` and is left to cleaning
//! and the quality gate. Only dimension ids are required.

use anyhow::anyhow;
use sdw_core::{CustomerRecord, ProductRecord, SalesTransactionRecord};
use serde_json::{Map, Value as JsonValue};

/// Text of one staged column, `None` when null or absent.
pub(crate) type Field<'a> = dyn Fn(&str) -> anyhow::Result<Option<String>> + 'a;

/// Integer ids may arrive as `12.0` when the ingest side widened the column to float.
pub(crate) fn parse_int(raw: Option<&str>) -> Option<i64> {
    let raw = raw?.trim();
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    let v = raw.parse::<f64>().ok()?;
    (v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15).then_some(v as i64)
}

pub(crate) fn parse_float(raw: Option<&str>) -> Option<f64> {
    raw?.trim().parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// JSON scalar rendered the way Postgres renders `column::text`.
pub(crate) fn json_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn json_field(
    row: &Map<String, JsonValue>,
) -> impl Fn(&str) -> anyhow::Result<Option<String>> + '_ {
    move |column| Ok(json_text(row.get(column)))
}

fn required_id(field: &Field<'_>, column: &str) -> anyhow::Result<i64> {
    let raw = field(column)?;
    parse_int(raw.as_deref())
        .ok_or_else(|| anyhow!("{column} must be a non-null integer, got {raw:?}"))
}

fn int(field: &Field<'_>, column: &str) -> anyhow::Result<Option<i64>> {
    Ok(parse_int(field(column)?.as_deref()))
}

fn float(field: &Field<'_>, column: &str) -> anyhow::Result<Option<f64>> {
    Ok(parse_float(field(column)?.as_deref()))
}

pub(crate) fn customer_from_fields(field: &Field<'_>) -> anyhow::Result<CustomerRecord> {
    Ok(CustomerRecord {
        customer_id: required_id(field, "customer_id")?,
        customer_name: field("customer_name")?,
        email: field("email")?,
        city: field("city")?,
        state: field("state")?,
        signup_date: field("signup_date")?,
        ingest_date: field("ingest_date")?,
    })
}

pub(crate) fn product_from_fields(field: &Field<'_>) -> anyhow::Result<ProductRecord> {
    Ok(ProductRecord {
        product_id: required_id(field, "product_id")?,
        product_name: field("product_name")?,
        category: field("category")?,
        brand: field("brand")?,
        unit_price: float(field, "unit_price")?,
        ingest_date: field("ingest_date")?,
    })
}

pub(crate) fn sale_from_fields(field: &Field<'_>) -> anyhow::Result<SalesTransactionRecord> {
    Ok(SalesTransactionRecord {
        transaction_id: int(field, "transaction_id")?,
        customer_id: int(field, "customer_id")?,
        product_id: int(field, "product_id")?,
        transaction_date: field("transaction_date")?,
        quantity: float(field, "quantity")?,
        unit_price: float(field, "unit_price")?,
        discount: float(field, "discount")?,
        ingest_date: field("ingest_date")?,
    })
}
