#![cfg(feature = "sqlite-tests")]

use block_indexer_lib::db::sqlite_test::setup_in_memory_sqlite;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Text};

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

#[test]
fn sqlite_harness_runs_expected_schema_migrations() {
    let mut conn = setup_in_memory_sqlite();

    let tables: Vec<NameRow> = sql_query(
        "
        SELECT name
        FROM sqlite_master
        WHERE type = 'table'
          AND name IN ('blocks', 'block_transactions', 'gap_ranges')
        ORDER BY name
        ",
    )
    .load(&mut conn)
    .expect("failed to query sqlite_master");

    let names: Vec<String> = tables.into_iter().map(|row| row.name).collect();
    assert_eq!(
        names,
        vec![
            "block_transactions".to_string(),
            "blocks".to_string(),
            "gap_ranges".to_string(),
        ]
    );

    let views: CountRow = sql_query(
        "
        SELECT COUNT(*) AS count
        FROM sqlite_master
        WHERE type = 'view'
          AND name = 'missing_ranges'
        ",
    )
    .get_result(&mut conn)
    .expect("failed to query sqlite view metadata");
    assert_eq!(views.count, 1, "expected missing_ranges view to exist");
}

#[test]
fn sqlite_harness_creates_gap_range_claim_index() {
    let mut conn = setup_in_memory_sqlite();

    let index_count: CountRow = sql_query(
        "
        SELECT COUNT(*) AS count
        FROM sqlite_master
        WHERE type = 'index'
          AND name = 'idx_gap_ranges_status'
        ",
    )
    .get_result(&mut conn)
    .expect("failed to query sqlite index metadata");

    assert_eq!(
        index_count.count, 1,
        "expected idx_gap_ranges_status index to exist"
    );
}

#[test]
fn sqlite_harness_enforces_gap_range_checks() {
    let mut conn = setup_in_memory_sqlite();

    let bad_status = sql_query(
        "
        INSERT INTO gap_ranges (start_height, end_height, status)
        VALUES (1, 10, 'not_real')
        ",
    )
    .execute(&mut conn)
    .expect_err("expected status check constraint to fail");
    assert!(
        bad_status.to_string().contains("CHECK constraint failed"),
        "unexpected sqlite error: {bad_status}"
    );

    let bad_range = sql_query(
        "
        INSERT INTO gap_ranges (start_height, end_height, status)
        VALUES (10, 1, 'pending')
        ",
    )
    .execute(&mut conn)
    .expect_err("expected range check constraint to fail");
    assert!(
        bad_range.to_string().contains("CHECK constraint failed"),
        "unexpected sqlite error: {bad_range}"
    );

    let negative_start = sql_query(
        "
        INSERT INTO gap_ranges (start_height, end_height, status)
        VALUES (-5, 1, 'pending')
        ",
    )
    .execute(&mut conn)
    .expect_err("expected non-negative start check constraint to fail");
    assert!(
        negative_start
            .to_string()
            .contains("CHECK constraint failed"),
        "unexpected sqlite error: {negative_start}"
    );
}

#[test]
fn sqlite_harness_rejects_negative_block_heights() {
    let mut conn = setup_in_memory_sqlite();

    let negative_height = sql_query(
        "
        INSERT INTO blocks (height, block_hash, timestamp)
        VALUES (-1, '0xdead', 1700000000)
        ",
    )
    .execute(&mut conn)
    .expect_err("expected height check constraint to fail");
    assert!(
        negative_height
            .to_string()
            .contains("CHECK constraint failed"),
        "unexpected sqlite error: {negative_height}"
    );
}

#[test]
fn sqlite_harness_enforces_transaction_fk_cascade() {
    let mut conn = setup_in_memory_sqlite();

    sql_query(
        "
        INSERT INTO blocks (height, block_hash, timestamp)
        VALUES (100, '0xabc', 1700000000)
        ",
    )
    .execute(&mut conn)
    .expect("failed to insert block");

    sql_query(
        "
        INSERT INTO block_transactions (tx_hash, height, payload)
        VALUES ('0xfeed', 100, NULL)
        ",
    )
    .execute(&mut conn)
    .expect("failed to insert block transaction");

    sql_query(
        "
        DELETE FROM blocks
        WHERE height = 100
        ",
    )
    .execute(&mut conn)
    .expect("failed to delete block");

    let remaining: CountRow = sql_query(
        "
        SELECT COUNT(*) AS count
        FROM block_transactions
        ",
    )
    .get_result(&mut conn)
    .expect("failed to count block transactions");

    assert_eq!(remaining.count, 0);
}
