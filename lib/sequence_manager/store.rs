use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Integer, Nullable, Text};
use diesel::sqlite::SqliteConnection;

use super::types::{GapRange, GapStatus, SequenceStateError};

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct HeightRow {
    #[diesel(sql_type = BigInt)]
    pub height: i64,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct GapRow {
    #[diesel(sql_type = BigInt)]
    pub gap_id: i64,
    #[diesel(sql_type = BigInt)]
    pub start_height: i64,
    #[diesel(sql_type = BigInt)]
    pub end_height: i64,
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = Integer)]
    pub attempts: i32,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub next_retry_at: Option<i64>,
    #[diesel(sql_type = Nullable<Text>)]
    pub last_error: Option<String>,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct GapIdRow {
    #[diesel(sql_type = BigInt)]
    pub gap_id: i64,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct CountRow {
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

/// Raw-SQL access seam shared by Postgres (production) and SQLite (tests).
pub trait SequenceDb {
    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError>;
    fn load_heights(&mut self, sql: &str) -> Result<Vec<HeightRow>, DieselError>;
    fn load_gap_ids(&mut self, sql: &str) -> Result<Vec<GapIdRow>, DieselError>;
    fn load_gaps(&mut self, sql: &str) -> Result<Vec<GapRow>, DieselError>;
    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountRow>, DieselError>;
}

impl SequenceDb for PgConnection {
    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError> {
        sql_query(sql).execute(self)
    }

    fn load_heights(&mut self, sql: &str) -> Result<Vec<HeightRow>, DieselError> {
        sql_query(sql).load::<HeightRow>(self)
    }

    fn load_gap_ids(&mut self, sql: &str) -> Result<Vec<GapIdRow>, DieselError> {
        sql_query(sql).load::<GapIdRow>(self)
    }

    fn load_gaps(&mut self, sql: &str) -> Result<Vec<GapRow>, DieselError> {
        sql_query(sql).load::<GapRow>(self)
    }

    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountRow>, DieselError> {
        sql_query(sql).load::<CountRow>(self)
    }
}

impl SequenceDb for SqliteConnection {
    fn execute_sql(&mut self, sql: &str) -> Result<usize, DieselError> {
        sql_query(sql).execute(self)
    }

    fn load_heights(&mut self, sql: &str) -> Result<Vec<HeightRow>, DieselError> {
        sql_query(sql).load::<HeightRow>(self)
    }

    fn load_gap_ids(&mut self, sql: &str) -> Result<Vec<GapIdRow>, DieselError> {
        sql_query(sql).load::<GapIdRow>(self)
    }

    fn load_gaps(&mut self, sql: &str) -> Result<Vec<GapRow>, DieselError> {
        sql_query(sql).load::<GapRow>(self)
    }

    fn load_counts(&mut self, sql: &str) -> Result<Vec<CountRow>, DieselError> {
        sql_query(sql).load::<CountRow>(self)
    }
}

pub(crate) fn map_gap_row(row: GapRow) -> Result<GapRange, SequenceStateError> {
    Ok(GapRange {
        gap_id: row.gap_id,
        start_height: row.start_height,
        end_height: row.end_height,
        status: GapStatus::from_db_str(&row.status)?,
        attempts: row.attempts,
        next_retry_at: row.next_retry_at,
        last_error: row.last_error,
    })
}

pub(crate) fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
