use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CustomerRecord, EtlError, ProductRecord, SalesTransactionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    DuplicateCustomerId,
    DuplicateProductId,
    InvalidProductName,
    InvalidDate,
    MultiCustomerTransaction,
    NonpositiveValue,
    OrphanReference,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateCustomerId => "DUPLICATE_CUSTOMER_ID",
            Self::DuplicateProductId => "DUPLICATE_PRODUCT_ID",
            Self::InvalidProductName => "INVALID_PRODUCT_NAME",
            Self::InvalidDate => "INVALID_DATE",
            Self::MultiCustomerTransaction => "MULTI_CUSTOMER_TRANSACTION",
            Self::NonpositiveValue => "NONPOSITIVE_VALUE",
            Self::OrphanReference => "ORPHAN_REFERENCE",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage that produced a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CustomerDedup,
    ProductDedup,
    DateValidity,
    SingleOwner,
    CorruptValue,
    Orphan,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CustomerDedup => "customer_dedup",
            Self::ProductDedup => "product_dedup",
            Self::DateValidity => "date_validity",
            Self::SingleOwner => "single_owner",
            Self::CorruptValue => "corrupt_value",
            Self::Orphan => "orphan",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quarantined copy of any staged row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "record", rename_all = "snake_case")]
pub enum StagedRow {
    Customer(CustomerRecord),
    Product(ProductRecord),
    Sale(SalesTransactionRecord),
}

impl StagedRow {
    pub fn entity(&self) -> &'static str {
        match self {
            Self::Customer(_) => "customer",
            Self::Product(_) => "product",
            Self::Sale(_) => "sale",
        }
    }

    /// Natural key rendered for humans; `-` marks a missing transaction id.
    pub fn key(&self) -> String {
        match self {
            Self::Customer(c) => c.customer_id.to_string(),
            Self::Product(p) => p.product_id.to_string(),
            Self::Sale(s) => s
                .transaction_id
                .map_or_else(|| "-".to_string(), |id| id.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub stage: Stage,
    pub reason: RejectReason,
    pub row: StagedRow,
}

impl RejectedRecord {
    pub fn customer(stage: Stage, reason: RejectReason, record: CustomerRecord) -> Self {
        Self {
            stage,
            reason,
            row: StagedRow::Customer(record),
        }
    }

    pub fn product(stage: Stage, reason: RejectReason, record: ProductRecord) -> Self {
        Self {
            stage,
            reason,
            row: StagedRow::Product(record),
        }
    }

    pub fn sale(stage: Stage, reason: RejectReason, record: SalesTransactionRecord) -> Self {
        Self {
            stage,
            reason,
            row: StagedRow::Sale(record),
        }
    }
}

/// Rows quarantined by one stage for one reason; the unit handed to a reject sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedBatch {
    pub stage: Stage,
    pub reason: RejectReason,
    pub rows: Vec<StagedRow>,
}

impl RejectedBatch {
    /// Groups records by `(stage, reason)` in first-seen order, keeping row order within a group.
    pub fn group(records: Vec<RejectedRecord>) -> Vec<Self> {
        let mut batches: Vec<Self> = Vec::new();
        for record in records {
            match batches
                .iter_mut()
                .find(|b| b.stage == record.stage && b.reason == record.reason)
            {
                Some(batch) => batch.rows.push(record.row),
                None => batches.push(Self {
                    stage: record.stage,
                    reason: record.reason,
                    rows: vec![record.row],
                }),
            }
        }
        batches
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Result of one pipeline stage. Composition only short-circuits on `Fatal`.
#[derive(Debug)]
pub enum Outcome<T> {
    Continue(Vec<T>),
    Quarantine {
        clean: Vec<T>,
        rejected: Vec<RejectedRecord>,
    },
    Fatal(EtlError),
}

impl<T> Outcome<T> {
    pub fn partition(clean: Vec<T>, rejected: Vec<RejectedRecord>) -> Self {
        if rejected.is_empty() {
            Self::Continue(clean)
        } else {
            Self::Quarantine { clean, rejected }
        }
    }

    /// Feeds the clean rows into `next`, accumulating quarantined rows from both stages.
    pub fn and_then<U>(self, next: impl FnOnce(Vec<T>) -> Outcome<U>) -> Outcome<U> {
        match self {
            Self::Continue(clean) => next(clean),
            Self::Quarantine { clean, mut rejected } => match next(clean) {
                Outcome::Continue(clean) => Outcome::Quarantine { clean, rejected },
                Outcome::Quarantine {
                    clean,
                    rejected: more,
                } => {
                    rejected.extend(more);
                    Outcome::Quarantine { clean, rejected }
                }
                Outcome::Fatal(err) => Outcome::Fatal(err),
            },
            Self::Fatal(err) => Outcome::Fatal(err),
        }
    }

    pub fn rejected(&self) -> &[RejectedRecord] {
        match self {
            Self::Quarantine { rejected, .. } => rejected,
            _ => &[],
        }
    }

    pub fn into_parts(self) -> Result<(Vec<T>, Vec<RejectedRecord>), EtlError> {
        match self {
            Self::Continue(clean) => Ok((clean, Vec::new())),
            Self::Quarantine { clean, rejected } => Ok((clean, rejected)),
            Self::Fatal(err) => Err(err),
        }
    }
}
