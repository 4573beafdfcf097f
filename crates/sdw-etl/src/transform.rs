//! Derived fields, dimension fill-ins and the date dimension.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};
use sdw_core::{date_id, DateDimensionRecord, DimCustomer, DimProduct, FactSalesRecord, Sale};

pub const UNKNOWN_EMAIL: &str = "unknown@example.com";
pub const UNKNOWN_LABEL: &str = "unknown";

/// Most frequent value; ties go to the lexicographically smallest.
pub fn mode<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, n)| count > n) {
            best = Some((value, count));
        }
    }
    best.map(|(v, _)| v.to_string())
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Email lowercased or defaulted, city and state filled with the batch mode, state uppercased,
/// missing signup dates set to `today`.
pub fn transform_customers(customers: Vec<DimCustomer>, today: NaiveDate) -> Vec<DimCustomer> {
    let city_mode = mode(customers.iter().filter_map(|c| c.city.as_deref()));
    let state_mode = mode(customers.iter().filter_map(|c| c.state.as_deref()));
    customers
        .into_iter()
        .map(|c| DimCustomer {
            email: Some(
                c.email
                    .map(|e| e.trim().to_lowercase())
                    .unwrap_or_else(|| UNKNOWN_EMAIL.to_string()),
            ),
            city: c.city.or_else(|| city_mode.clone()),
            state: c.state.or_else(|| state_mode.clone()).map(|s| s.trim().to_uppercase()),
            signup_date: c.signup_date.or(Some(today)),
            ..c
        })
        .collect()
}

/// Brand and category filled with the batch mode (or `unknown`), then trimmed and lowercased
/// together with the product name.
pub fn transform_products(products: Vec<DimProduct>) -> Vec<DimProduct> {
    let brand_mode = mode(products.iter().filter_map(|p| p.brand.as_deref()))
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
    let category_mode = mode(products.iter().filter_map(|p| p.category.as_deref()))
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
    let canonical = |s: String| s.trim().to_lowercase();
    products
        .into_iter()
        .map(|p| DimProduct {
            product_name: p.product_name.map(canonical),
            brand: Some(canonical(p.brand.unwrap_or_else(|| brand_mode.clone()))),
            category: Some(canonical(p.category.unwrap_or_else(|| category_mode.clone()))),
            ..p
        })
        .collect()
}

pub fn fact_from_sale(sale: &Sale) -> FactSalesRecord {
    let total = round2(sale.quantity as f64 * sale.unit_price);
    FactSalesRecord {
        customer_id: sale.customer_id,
        product_id: sale.product_id,
        date_id: date_id(sale.transaction_date),
        quantity: sale.quantity,
        unit_price: sale.unit_price,
        total_sale_amount: total,
        net_sale_amount: round2(total - sale.discount.unwrap_or(0.0)),
    }
}

/// One fact per grain key. Transactions sharing a grain coalesce: quantities and amounts are
/// summed and the unit price becomes the quantity-weighted average. Output is in grain order.
pub fn build_facts(sales: &[Sale]) -> Vec<FactSalesRecord> {
    let mut by_grain: BTreeMap<(i64, i64, i64), FactSalesRecord> = BTreeMap::new();
    for fact in sales.iter().map(fact_from_sale) {
        by_grain
            .entry(fact.grain_key())
            .and_modify(|acc| {
                let quantity = acc.quantity + fact.quantity;
                if quantity > 0 {
                    acc.unit_price = (acc.unit_price * acc.quantity as f64
                        + fact.unit_price * fact.quantity as f64)
                        / quantity as f64;
                }
                acc.quantity = quantity;
                acc.total_sale_amount = round2(acc.total_sale_amount + fact.total_sale_amount);
                acc.net_sale_amount = round2(acc.net_sale_amount + fact.net_sale_amount);
            })
            .or_insert(fact);
    }
    by_grain
        .into_values()
        .map(|f| FactSalesRecord {
            unit_price: round2(f.unit_price),
            ..f
        })
        .collect()
}

pub fn date_record(date: NaiveDate) -> DateDimensionRecord {
    DateDimensionRecord {
        date_id: date_id(date),
        date,
        day: date.day(),
        month: date.month(),
        quarter: (date.month() - 1) / 3 + 1,
        year: date.year(),
        weekday: date.format("%A").to_string(),
    }
}

/// One row per distinct transaction date, ordered by date.
pub fn build_date_dimension(sales: &[Sale]) -> Vec<DateDimensionRecord> {
    let dates: HashMap<i64, NaiveDate> = sales
        .iter()
        .map(|s| (date_id(s.transaction_date), s.transaction_date))
        .collect();
    let mut rows: Vec<_> = dates.into_values().map(date_record).collect();
    rows.sort_by_key(|r| r.date_id);
    rows
}
