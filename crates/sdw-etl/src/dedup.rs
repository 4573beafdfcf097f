//! One canonical record per dimension id; every other row for that id is quarantined.

use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

use sdw_core::{
    parse_date, CustomerRecord, Outcome, ProductRecord, RejectReason, RejectedRecord, Stage,
};
use tracing::{info, warn};

use crate::config::NameRules;

/// Keeps the row with the latest parseable signup date per `customer_id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CustomerDeduplicator;

impl CustomerDeduplicator {
    /// Rows are stably sorted by id ascending then signup date descending, unparseable dates
    /// last; the first row per id wins. Clean output is in id order.
    pub fn apply(&self, customers: Vec<CustomerRecord>) -> Outcome<CustomerRecord> {
        let mut keyed: Vec<_> = customers
            .into_iter()
            .map(|c| (c.signup_date.as_deref().and_then(parse_date), c))
            .collect();
        keyed.sort_by_key(|(signup, c)| (c.customer_id, Reverse(*signup)));

        let mut clean: Vec<CustomerRecord> = Vec::with_capacity(keyed.len());
        let mut rejected = Vec::new();
        for (_, customer) in keyed {
            if clean
                .last()
                .is_some_and(|kept| kept.customer_id == customer.customer_id)
            {
                rejected.push(RejectedRecord::customer(
                    Stage::CustomerDedup,
                    RejectReason::DuplicateCustomerId,
                    customer,
                ));
            } else {
                clean.push(customer);
            }
        }

        if rejected.is_empty() {
            info!("no duplicate customer ids found");
        } else {
            warn!(
                rejected = rejected.len(),
                customer_ids = distinct_keys(&rejected),
                "customer deduplication applied"
            );
        }
        Outcome::partition(clean, rejected)
    }
}

/// Picks the best-described row among those with a valid name per `product_id`.
#[derive(Debug, Clone, Default)]
pub struct ProductDeduplicator {
    rules: NameRules,
}

impl ProductDeduplicator {
    pub fn new(rules: NameRules) -> Self {
        Self { rules }
    }

    pub fn apply(&self, products: Vec<ProductRecord>) -> Outcome<ProductRecord> {
        let mut groups: BTreeMap<i64, Vec<ProductRecord>> = BTreeMap::new();
        for product in products {
            groups.entry(product.product_id).or_default().push(product);
        }

        let mut clean = Vec::with_capacity(groups.len());
        let mut rejected = Vec::new();
        for (product_id, group) in groups {
            let Some(keeper) = self.canonical_index(&group) else {
                warn!(
                    product_id,
                    rows = group.len(),
                    "no valid product_name; rejecting product group"
                );
                rejected.extend(group.into_iter().map(|p| {
                    RejectedRecord::product(
                        Stage::ProductDedup,
                        RejectReason::InvalidProductName,
                        p,
                    )
                }));
                continue;
            };

            let duplicates = group.len() - 1;
            for (i, product) in group.into_iter().enumerate() {
                if i == keeper {
                    clean.push(product);
                } else {
                    rejected.push(RejectedRecord::product(
                        Stage::ProductDedup,
                        RejectReason::DuplicateProductId,
                        product,
                    ));
                }
            }
            if duplicates > 0 {
                warn!(product_id, rejected = duplicates, "product deduplication applied");
            }
        }
        Outcome::partition(clean, rejected)
    }

    /// Index of the highest ranked valid-name row; the earliest wins among equals.
    fn canonical_index(&self, group: &[ProductRecord]) -> Option<usize> {
        group
            .iter()
            .enumerate()
            .filter(|(_, p)| self.rules.is_valid_name(p.product_name.as_deref()))
            .fold(None, |best: Option<(usize, &ProductRecord)>, (i, p)| match best {
                Some((_, b)) if rank(p, b) != Ordering::Greater => best,
                _ => Some((i, p)),
            })
            .map(|(i, _)| i)
    }
}

/// Positive price, then category present, then brand present, then higher price.
fn rank(a: &ProductRecord, b: &ProductRecord) -> Ordering {
    let valid_price = |p: &ProductRecord| p.unit_price.is_some_and(|v| v > 0.0);
    valid_price(a)
        .cmp(&valid_price(b))
        .then(a.category.is_some().cmp(&b.category.is_some()))
        .then(a.brand.is_some().cmp(&b.brand.is_some()))
        .then_with(|| match (a.unit_price, b.unit_price) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (x, y) => x.is_some().cmp(&y.is_some()),
        })
}

fn distinct_keys(rejected: &[RejectedRecord]) -> usize {
    let mut keys: Vec<String> = rejected.iter().map(|r| r.row.key()).collect();
    keys.sort();
    keys.dedup();
    keys.len()
}
