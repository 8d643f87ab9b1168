use std::sync::Arc;

use diesel::insert_into;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::RunQueryDsl;
use futures::future::BoxFuture;

use crate::chain_client::BlockRecord;
use crate::db::models::{NewBlock, NewTransaction};
use crate::db::schema::{block_transactions, blocks};

use super::super::types::PersistError;
use super::error_mapping::map_diesel_error;

/// Persists one fetched block into a storage backend.
///
/// This is intentionally abstracted so we can test transient/fatal persistence behavior without
/// requiring a Postgres instance or a writable filesystem.
pub trait BlockPersister: Send + Sync {
    fn persist_block<'a>(&'a self, block: &'a BlockRecord)
        -> BoxFuture<'a, Result<(), PersistError>>;
}

impl<T> BlockPersister for Arc<T>
where
    T: BlockPersister + ?Sized,
{
    fn persist_block<'a>(
        &'a self,
        block: &'a BlockRecord,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        (**self).persist_block(block)
    }
}

/// Postgres-backed block persister used by production runtime.
pub struct PgBlockPersister {
    pool: Pool<diesel_async::AsyncPgConnection>,
}

impl PgBlockPersister {
    pub fn new(pool: Pool<diesel_async::AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

pub(crate) fn transaction_rows(block: &BlockRecord) -> Vec<NewTransaction> {
    block
        .transactions
        .iter()
        .map(|tx| NewTransaction {
            tx_hash: tx.tx_hash.clone(),
            height: block.height,
            payload: if tx.payload.is_null() {
                None
            } else {
                Some(tx.payload.to_string())
            },
        })
        .collect()
}

impl BlockPersister for PgBlockPersister {
    fn persist_block<'a>(
        &'a self,
        block: &'a BlockRecord,
    ) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(|err| {
                PersistError::retryable(format!("failed to acquire DB pool connection: {err}"))
            })?;

            let block_row = NewBlock {
                height: block.height,
                block_hash: block.hash.clone(),
                timestamp: block.timestamp,
            };

            // Re-persisting a height already stored is a no-op, not a conflict.
            insert_into(blocks::dsl::blocks)
                .values(&block_row)
                .on_conflict(blocks::height)
                .do_nothing()
                .execute(&mut conn)
                .await
                .map_err(map_diesel_error)?;

            let tx_rows = transaction_rows(block);
            if !tx_rows.is_empty() {
                insert_into(block_transactions::dsl::block_transactions)
                    .values(&tx_rows)
                    .on_conflict(block_transactions::tx_hash)
                    .do_nothing()
                    .execute(&mut conn)
                    .await
                    .map_err(map_diesel_error)?;
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::BlockTransaction;

    #[test]
    fn null_payload_maps_to_none() {
        let block = BlockRecord {
            height: 7,
            hash: "0xabc".to_string(),
            timestamp: 1,
            transactions: vec![
                BlockTransaction {
                    tx_hash: "0x01".to_string(),
                    payload: serde_json::Value::Null,
                },
                BlockTransaction {
                    tx_hash: "0x02".to_string(),
                    payload: serde_json::json!({"amount": 5}),
                },
            ],
        };

        let rows = transaction_rows(&block);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payload, None);
        assert_eq!(rows[1].payload.as_deref(), Some(r#"{"amount":5}"#));
        assert!(rows.iter().all(|row| row.height == 7));
    }
}
