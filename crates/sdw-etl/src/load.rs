//! Delta loads: only rows whose key is absent from the target table are appended.

use std::collections::HashSet;

use sdw_core::{EtlError, FactSalesRecord};
use sdw_storage::{RowKey, WarehouseRow, WarehouseTx};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub table: &'static str,
    pub offered: usize,
    pub new_rows: usize,
    pub inserted: u64,
}

/// Rows whose key is neither in `existing` nor repeated earlier in `rows`.
pub fn delta<R: WarehouseRow>(rows: Vec<R>, existing: &HashSet<RowKey>) -> Vec<R> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| {
            let key = row.key();
            !existing.contains(&key) && seen.insert(key)
        })
        .collect()
}

async fn load<R: WarehouseRow>(
    tx: &mut dyn WarehouseTx,
    rows: Vec<R>,
) -> Result<LoadReport, EtlError> {
    let table = R::TABLE;
    let offered = rows.len();
    let existing = tx
        .read_existing_keys(table)
        .await
        .map_err(EtlError::Load)?;
    let fresh = delta(rows, &existing);
    let new_rows = fresh.len();
    let inserted = if fresh.is_empty() {
        0
    } else {
        tx.append_rows(R::into_rows(fresh))
            .await
            .map_err(EtlError::Load)?
    };
    info!(table = table.name(), offered, new_rows, inserted, "delta load");
    Ok(LoadReport {
        table: table.name(),
        offered,
        new_rows,
        inserted,
    })
}

/// Anti-join on the dimension's primary key.
pub async fn load_dimension<R: WarehouseRow>(
    tx: &mut dyn WarehouseTx,
    rows: Vec<R>,
) -> Result<LoadReport, EtlError> {
    load(tx, rows).await
}

/// Anti-join on `(customer_id, product_id, date_id)`.
pub async fn load_fact(
    tx: &mut dyn WarehouseTx,
    facts: Vec<FactSalesRecord>,
) -> Result<LoadReport, EtlError> {
    load(tx, facts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use sdw_core::DateDimensionRecord;
    use sdw_storage::{InMemoryWarehouse, Table, Warehouse};

    fn fact(customer_id: i64, date_id: i64) -> FactSalesRecord {
        FactSalesRecord {
            customer_id,
            product_id: 1,
            date_id,
            quantity: 1,
            unit_price: 2.0,
            total_sale_amount: 2.0,
            net_sale_amount: 2.0,
        }
    }

    #[test]
    fn delta_skips_existing_and_repeated_keys() {
        let existing: HashSet<RowKey> = [vec![1, 1, 20240101]].into_iter().collect();
        let fresh = delta(
            vec![fact(1, 20240101), fact(2, 20240101), fact(2, 20240101)],
            &existing,
        );
        assert_eq!(fresh, vec![fact(2, 20240101)]);
    }

    #[tokio::test]
    async fn second_load_of_same_batch_inserts_nothing() {
        let warehouse = InMemoryWarehouse::new();
        let batch = vec![fact(1, 20240101), fact(2, 20240102)];

        let mut tx = warehouse.begin().await.unwrap();
        let first = load_fact(tx.as_mut(), batch.clone()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(first.inserted, 2);

        let mut tx = warehouse.begin().await.unwrap();
        let second = load_fact(tx.as_mut(), batch).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(second.new_rows, 0);
        assert_eq!(second.inserted, 0);
        assert_eq!(warehouse.row_count(Table::FactSales).unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_delta_is_a_noop() {
        let warehouse = InMemoryWarehouse::new();
        let date = DateDimensionRecord {
            date_id: 20240101,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            day: 1,
            month: 1,
            quarter: 1,
            year: 2024,
            weekday: "Monday".into(),
        };
        let mut tx = warehouse.begin().await.unwrap();
        load_dimension(tx.as_mut(), vec![date.clone()]).await.unwrap();
        let again = load_dimension(tx.as_mut(), vec![date]).await.unwrap();
        assert_eq!(again.offered, 1);
        assert_eq!(again.inserted, 0);
        let none = load_dimension::<DateDimensionRecord>(tx.as_mut(), Vec::new()).await.unwrap();
        assert_eq!(none.offered, 0);
    }
}
