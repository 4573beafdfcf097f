//! Non-rejecting repairs applied before any stage decides what to quarantine.

use sdw_core::{CustomerRecord, ProductRecord, SalesTransactionRecord, StagedBatch};
use tracing::debug;

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Blank and whitespace-only text becomes missing across all three batches.
pub fn normalize_batch(batch: StagedBatch) -> StagedBatch {
    StagedBatch {
        customers: batch.customers.into_iter().map(normalize_customer).collect(),
        products: batch.products.into_iter().map(normalize_product).collect(),
        sales: batch.sales.into_iter().map(normalize_sale).collect(),
    }
}

fn normalize_customer(r: CustomerRecord) -> CustomerRecord {
    CustomerRecord {
        customer_id: r.customer_id,
        customer_name: blank_to_none(r.customer_name),
        email: blank_to_none(r.email),
        city: blank_to_none(r.city),
        state: blank_to_none(r.state),
        signup_date: blank_to_none(r.signup_date),
        ingest_date: blank_to_none(r.ingest_date),
    }
}

fn normalize_product(r: ProductRecord) -> ProductRecord {
    ProductRecord {
        product_name: blank_to_none(r.product_name),
        category: blank_to_none(r.category),
        brand: blank_to_none(r.brand),
        ingest_date: blank_to_none(r.ingest_date),
        ..r
    }
}

fn normalize_sale(r: SalesTransactionRecord) -> SalesTransactionRecord {
    SalesTransactionRecord {
        transaction_date: blank_to_none(r.transaction_date),
        ingest_date: blank_to_none(r.ingest_date),
        ..r
    }
}

/// Median of the finite values; the mean of the middle pair for even counts.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Sign flipped, zero and non-finite treated as missing.
fn repaired_price(price: Option<f64>) -> Option<f64> {
    price.map(f64::abs).filter(|p| p.is_finite() && *p > 0.0)
}

/// Missing prices take the median of the batch's valid prices. With no valid price
/// anywhere the value stays missing and the quality gate decides.
fn impute_prices(prices: Vec<Option<f64>>) -> Vec<Option<f64>> {
    let repaired: Vec<Option<f64>> = prices.into_iter().map(repaired_price).collect();
    let fill = median(repaired.iter().flatten().copied());
    let imputed = repaired.iter().filter(|p| p.is_none()).count();
    if imputed > 0 {
        debug!(imputed, median = ?fill, "imputing missing prices");
    }
    repaired.into_iter().map(|p| p.or(fill)).collect()
}

/// Quantity: missing becomes 0, sign dropped, fraction truncated. Price: see [`impute_prices`].
pub fn clean_sales_numeric(sales: Vec<SalesTransactionRecord>) -> Vec<SalesTransactionRecord> {
    let prices = impute_prices(sales.iter().map(|s| s.unit_price).collect());
    sales
        .into_iter()
        .zip(prices)
        .map(|(sale, unit_price)| {
            let quantity = sale
                .quantity
                .filter(|q| q.is_finite())
                .map_or(0.0, |q| q.abs().trunc());
            SalesTransactionRecord {
                quantity: Some(quantity),
                unit_price,
                ..sale
            }
        })
        .collect()
}

pub fn clean_product_prices(products: Vec<ProductRecord>) -> Vec<ProductRecord> {
    let prices = impute_prices(products.iter().map(|p| p.unit_price).collect());
    products
        .into_iter()
        .zip(prices)
        .map(|(product, unit_price)| ProductRecord {
            unit_price,
            ..product
        })
        .collect()
}
