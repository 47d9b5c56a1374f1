//! Row counts for usage reporting.
//!
//! Counts are read and stored without locking the counted tables, so a count
//! can trail concurrent row writes until the next pass.

use tracing::{debug, error, info};

use crate::catalog::TableRecord;
use crate::query::{Executor, Order, Query, Update};
use crate::storable::fetch_records;
use crate::{StorageDatetime, TableError};

/// Count and store the rows of one table.
pub async fn count_table_rows<E: Executor + ?Sized>(
    exec: &mut E,
    table: &TableRecord,
) -> Result<u64, TableError> {
    let count = exec.count(&Query::for_table(table.relation_name())).await?;
    exec.update(
        &Update::of::<TableRecord>()
            .set("row_count", i64::try_from(count).unwrap_or(i64::MAX))
            .set("row_count_updated_at", StorageDatetime::now())
            .eq("id", table.id),
    )
    .await?;
    Ok(count)
}

/// Recount every table that is not trashed. A table that fails is logged
/// and skipped. Returns the number of tables counted.
pub async fn count_rows<E: Executor + ?Sized>(exec: &mut E) -> Result<u64, TableError> {
    let tables: Vec<TableRecord> = fetch_records(
        exec,
        &Query::of::<TableRecord>()
            .eq("trashed", false)
            .order_by("id", Order::Asc),
    )
    .await?;

    let mut processed = 0;
    for table in &tables {
        match count_table_rows(exec, table).await {
            Ok(count) => {
                debug!(table_id = table.id, count, "Counted rows");
                processed += 1;
            }
            Err(e) => {
                error!(table_id = table.id, error = %e, "Failed to count rows");
            }
        }
    }
    info!(processed, total = tables.len(), "Row count finished");
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryExecutor, TransactionExecutor};
    use crate::storable::{get_record, insert_record};
    use crate::{MemoryStore, catalog, schema};

    #[tokio::test]
    async fn counts_live_tables_and_skips_missing_relations() {
        let store = MemoryStore::new();
        let mut tx = store.begin_transaction().await.unwrap();
        catalog::install(&mut tx).await.unwrap();
        let counted = insert_record(&mut tx, &TableRecord::new(1, "Counted", 0))
            .await
            .unwrap();
        schema::create_table_relation(&mut tx, &counted).await.unwrap();
        // Catalog entry without storage: counting it fails.
        let broken = insert_record(&mut tx, &TableRecord::new(1, "Broken", 1))
            .await
            .unwrap();
        let mut trashed = TableRecord::new(1, "Trashed", 2);
        trashed.trashed = true;
        insert_record(&mut tx, &trashed).await.unwrap();
        tx.commit().await.unwrap();

        let mut pool = store.clone();
        for _ in 0..3 {
            pool.insert(&counted.relation_name(), &[]).await.unwrap();
        }

        assert_eq!(count_rows(&mut pool).await.unwrap(), 1);
        let counted: TableRecord = get_record(&mut pool, counted.id).await.unwrap().unwrap();
        assert_eq!(counted.row_count, Some(3));
        assert!(counted.row_count_updated_at.is_some());
        let broken: TableRecord = get_record(&mut pool, broken.id).await.unwrap().unwrap();
        assert_eq!(broken.row_count, None);
    }
}
