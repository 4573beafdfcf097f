//! Strict coercion of surviving rows to warehouse types. Any failure aborts the run.

use chrono::NaiveDateTime;
use sdw_core::{
    parse_date, parse_timestamp, CustomerRecord, DimCustomer, DimProduct, EtlError, ProductRecord,
    Sale, SalesTransactionRecord,
};

fn ingest_timestamp(
    entity: &'static str,
    key: impl ToString,
    raw: Option<&str>,
) -> Result<NaiveDateTime, EtlError> {
    match raw {
        None => Err(EtlError::coercion(entity, "ingest_date", key, "missing")),
        Some(raw) => parse_timestamp(raw).ok_or_else(|| {
            EtlError::coercion(entity, "ingest_date", key, format!("`{raw}` is not a timestamp"))
        }),
    }
}

fn finite(
    entity: &'static str,
    field: &'static str,
    key: impl ToString,
    value: Option<f64>,
) -> Result<f64, EtlError> {
    match value {
        Some(v) if v.is_finite() => Ok(v),
        Some(v) => Err(EtlError::coercion(entity, field, key, format!("{v} is not finite"))),
        None => Err(EtlError::coercion(entity, field, key, "missing")),
    }
}

fn whole(
    entity: &'static str,
    field: &'static str,
    key: impl ToString + Copy,
    value: Option<f64>,
) -> Result<i64, EtlError> {
    let v = finite(entity, field, key, value)?;
    if v.fract() != 0.0 || v.abs() >= 9.0e15 {
        return Err(EtlError::coercion(entity, field, key, format!("{v} is not an integer")));
    }
    Ok(v as i64)
}

/// Signup dates that do not parse coerce to missing; the transformer fills them.
pub fn enforce_customers(customers: Vec<CustomerRecord>) -> Result<Vec<DimCustomer>, EtlError> {
    customers
        .into_iter()
        .map(|c| {
            Ok(DimCustomer {
                ingest_date: ingest_timestamp("customer", c.customer_id, c.ingest_date.as_deref())?,
                signup_date: c.signup_date.as_deref().and_then(parse_date),
                customer_id: c.customer_id,
                customer_name: c.customer_name,
                email: c.email,
                city: c.city,
                state: c.state,
            })
        })
        .collect()
}

pub fn enforce_products(products: Vec<ProductRecord>) -> Result<Vec<DimProduct>, EtlError> {
    products
        .into_iter()
        .map(|p| {
            let unit_price = match p.unit_price {
                None => None,
                price => Some(finite("product", "unit_price", p.product_id, price)?),
            };
            Ok(DimProduct {
                ingest_date: ingest_timestamp("product", p.product_id, p.ingest_date.as_deref())?,
                product_id: p.product_id,
                product_name: p.product_name,
                category: p.category,
                brand: p.brand,
                unit_price,
            })
        })
        .collect()
}

pub fn enforce_sales(sales: Vec<SalesTransactionRecord>) -> Result<Vec<Sale>, EtlError> {
    sales.into_iter().map(enforce_sale).collect()
}

fn enforce_sale(s: SalesTransactionRecord) -> Result<Sale, EtlError> {
    const ENTITY: &str = "sale";
    let transaction_id = s
        .transaction_id
        .ok_or_else(|| EtlError::coercion(ENTITY, "transaction_id", "-", "missing"))?;
    let id = |field: &'static str, value: Option<i64>| {
        value.ok_or_else(|| EtlError::coercion(ENTITY, field, transaction_id, "missing"))
    };
    let raw_date = s.transaction_date.as_deref().unwrap_or_default();
    let transaction_date = parse_date(raw_date).ok_or_else(|| {
        EtlError::coercion(
            ENTITY,
            "transaction_date",
            transaction_id,
            format!("`{raw_date}` is not a date"),
        )
    })?;
    let discount = match s.discount {
        None => None,
        discount => Some(finite(ENTITY, "discount", transaction_id, discount)?),
    };

    Ok(Sale {
        transaction_id,
        customer_id: id("customer_id", s.customer_id)?,
        product_id: id("product_id", s.product_id)?,
        transaction_date,
        quantity: whole(ENTITY, "quantity", transaction_id, s.quantity)?,
        unit_price: finite(ENTITY, "unit_price", transaction_id, s.unit_price)?,
        discount,
        ingest_date: ingest_timestamp(ENTITY, transaction_id, s.ingest_date.as_deref())?,
    })
}
