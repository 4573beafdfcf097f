//! Fact-level filter chain: date validity, single owner per transaction, positive values,
//! then orphan references against the already-deduplicated dimensions.

use std::collections::{BTreeSet, HashMap, HashSet};

use sdw_core::{
    parse_date, CustomerRecord, Outcome, ProductRecord, RejectReason, RejectedRecord,
    SalesTransactionRecord, Stage,
};
use tracing::warn;

type Sales = Vec<SalesTransactionRecord>;

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    customer_ids: HashSet<i64>,
    product_ids: HashSet<i64>,
}

impl QualityGate {
    /// `customers` and `products` must be the clean output of the deduplicators.
    pub fn new(customers: &[CustomerRecord], products: &[ProductRecord]) -> Self {
        Self {
            customer_ids: customers.iter().map(|c| c.customer_id).collect(),
            product_ids: products.iter().map(|p| p.product_id).collect(),
        }
    }

    pub fn apply(&self, sales: Sales) -> Outcome<SalesTransactionRecord> {
        check_dates(sales)
            .and_then(check_single_owner)
            .and_then(check_values)
            .and_then(|sales| self.check_orphans(sales))
    }

    pub fn check_orphans(&self, sales: Sales) -> Outcome<SalesTransactionRecord> {
        split(sales, Stage::Orphan, RejectReason::OrphanReference, |s| {
            s.customer_id.is_some_and(|id| self.customer_ids.contains(&id))
                && s.product_id.is_some_and(|id| self.product_ids.contains(&id))
        })
    }
}

fn split(
    sales: Sales,
    stage: Stage,
    reason: RejectReason,
    keep: impl Fn(&SalesTransactionRecord) -> bool,
) -> Outcome<SalesTransactionRecord> {
    let (clean, bad): (Sales, Sales) = sales.into_iter().partition(|s| keep(s));
    if !bad.is_empty() {
        warn!(%stage, %reason, rejected = bad.len(), "transactions rejected");
    }
    Outcome::partition(
        clean,
        bad.into_iter()
            .map(|s| RejectedRecord::sale(stage, reason, s))
            .collect(),
    )
}

pub fn check_dates(sales: Sales) -> Outcome<SalesTransactionRecord> {
    split(sales, Stage::DateValidity, RejectReason::InvalidDate, |s| {
        s.transaction_date.as_deref().and_then(parse_date).is_some()
    })
}

/// A `transaction_id` seen with more than one distinct `customer_id` takes every one of its
/// rows down with it. Rows without a transaction id or customer id are left to later checks.
pub fn check_single_owner(sales: Sales) -> Outcome<SalesTransactionRecord> {
    let mut owners: HashMap<i64, BTreeSet<i64>> = HashMap::new();
    for sale in &sales {
        if let (Some(tid), Some(cid)) = (sale.transaction_id, sale.customer_id) {
            owners.entry(tid).or_default().insert(cid);
        }
    }
    let corrupt: HashSet<i64> = owners
        .into_iter()
        .filter(|(_, customers)| customers.len() > 1)
        .map(|(tid, _)| tid)
        .collect();
    if !corrupt.is_empty() {
        warn!(transactions = corrupt.len(), "transaction ids shared by several customers");
    }
    split(
        sales,
        Stage::SingleOwner,
        RejectReason::MultiCustomerTransaction,
        |s| s.transaction_id.map_or(true, |tid| !corrupt.contains(&tid)),
    )
}

pub fn check_values(sales: Sales) -> Outcome<SalesTransactionRecord> {
    split(sales, Stage::CorruptValue, RejectReason::NonpositiveValue, |s| {
        s.quantity.is_some_and(|q| q > 0.0) && s.unit_price.is_some_and(|p| p > 0.0)
    })
}
