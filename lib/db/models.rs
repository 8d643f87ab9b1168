use diesel::prelude::*;

use super::schema::{block_transactions, blocks};

/// Insertable row for the `blocks` primary table.
///
/// `created_at` is filled by the database default.
#[derive(Debug, Clone, PartialEq, Eq, Insertable)]
#[diesel(table_name = blocks)]
pub struct NewBlock {
    pub height: i64,
    pub block_hash: String,
    pub timestamp: i64,
}

/// Insertable row for the `block_transactions` sub-record table.
#[derive(Debug, Clone, PartialEq, Eq, Insertable)]
#[diesel(table_name = block_transactions)]
pub struct NewTransaction {
    pub tx_hash: String,
    pub height: i64,
    pub payload: Option<String>,
}
