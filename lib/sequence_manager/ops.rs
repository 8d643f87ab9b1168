use super::store::{map_gap_row, quote, SequenceDb};
use super::types::{GapDetectionReport, GapRange, GapStatus, SequenceStateError};

/// Records one known height with its block identity.
///
/// Idempotent: a repeated insert for the same height is a no-op, not an error.
/// Returns `true` when the height was newly recorded.
pub fn record_height<C>(
    conn: &mut C,
    height: i64,
    block_hash: &str,
    timestamp: i64,
) -> Result<bool, SequenceStateError>
where
    C: SequenceDb,
{
    if height < 0 {
        return Err(SequenceStateError::InvalidInput(format!(
            "height must be >= 0, got {height}"
        )));
    }

    let sql = format!(
        "INSERT INTO blocks (height, block_hash, timestamp) \
         VALUES ({height}, {}, {timestamp}) \
         ON CONFLICT (height) DO NOTHING",
        quote(block_hash),
    );

    Ok(conn.execute_sql(&sql)? > 0)
}

/// Returns the highest recorded height, if any.
pub fn max_recorded_height<C>(conn: &mut C) -> Result<Option<i64>, SequenceStateError>
where
    C: SequenceDb,
{
    let mut rows =
        conn.load_heights("SELECT height FROM blocks ORDER BY height DESC LIMIT 1")?;
    Ok(rows.pop().map(|row| row.height))
}

/// Computes the contiguous frontier: the largest height `h` such that every
/// height in `[genesis, h]` is recorded.
///
/// Returns `genesis - 1` when genesis itself is not yet recorded, so callers
/// can always plan from `frontier + 1`. The walk stops at the first break, so
/// sparse heights above the frontier never cost a full scan.
pub fn compute_frontier<C>(conn: &mut C, genesis: i64) -> Result<i64, SequenceStateError>
where
    C: SequenceDb,
{
    let sql = format!("SELECT height FROM blocks WHERE height >= {genesis} ORDER BY height ASC");
    let rows = conn.load_heights(&sql)?;

    let mut frontier = genesis - 1;
    for row in rows {
        if row.height != frontier + 1 {
            break;
        }
        frontier = row.height;
    }

    Ok(frontier)
}

/// Pairwise gap scan over a sorted set of known heights.
///
/// For adjacent known heights `a < b` with `b - a > 1`, emits `(a + 1, b - 1)`.
/// Heights above `upper_bound` are ignored. No known heights or a single known
/// height yields no gaps. Pure function of its input: repeated calls over the
/// same set always return the same list.
pub fn detect_gaps(known_sorted: &[i64], upper_bound: i64) -> Vec<(i64, i64)> {
    let mut gaps = Vec::new();
    let mut previous: Option<i64> = None;

    for &height in known_sorted {
        if height > upper_bound {
            break;
        }
        if let Some(prev) = previous {
            if height - prev > 1 {
                gaps.push((prev + 1, height - 1));
            }
        }
        previous = Some(height);
    }

    gaps
}

/// Runs one detection pass and enqueues repair tasks for new gaps.
///
/// The scan covers everything below the highest observed height, plus the
/// leading range `[genesis, first_known - 1]` when the smallest recorded
/// height sits above genesis. At most `max_new` ranges are enqueued per pass;
/// ranges already covered by an open row are counted, not duplicated.
pub fn detect_and_enqueue_gaps<C>(
    conn: &mut C,
    genesis: i64,
    max_new: i64,
) -> Result<GapDetectionReport, SequenceStateError>
where
    C: SequenceDb,
{
    if max_new <= 0 {
        return Err(SequenceStateError::InvalidInput(format!(
            "max_new must be > 0, got {max_new}"
        )));
    }

    let sql = format!("SELECT height FROM blocks WHERE height >= {genesis} ORDER BY height ASC");
    let known: Vec<i64> = conn
        .load_heights(&sql)?
        .into_iter()
        .map(|row| row.height)
        .collect();

    let observed_max = known.last().copied();
    let mut detected_ranges = Vec::new();
    if let (Some(first), Some(max)) = (known.first().copied(), observed_max) {
        if first > genesis {
            detected_ranges.push((genesis, first - 1));
        }
        detected_ranges.extend(detect_gaps(&known, max));
    }

    let mut enqueued = 0usize;
    let mut already_open = 0usize;
    for &(start, end) in &detected_ranges {
        if enqueued as i64 >= max_new {
            break;
        }
        if enqueue_gap(conn, start, end)? {
            enqueued += 1;
        } else {
            already_open += 1;
        }
    }

    Ok(GapDetectionReport {
        observed_max,
        detected_ranges,
        enqueued,
        already_open,
    })
}

/// Enqueues one `pending` repair range covering `[start_height, end_height]`.
///
/// The insert is guarded against overlap with any existing row, which both
/// deduplicates identical `(start, end)` tasks and preserves the invariant
/// that no two open ranges overlap. Returns `true` when a row was created.
pub fn enqueue_gap<C>(
    conn: &mut C,
    start_height: i64,
    end_height: i64,
) -> Result<bool, SequenceStateError>
where
    C: SequenceDb,
{
    if start_height < 0 {
        return Err(SequenceStateError::InvalidInput(format!(
            "start_height must be >= 0, got {start_height}"
        )));
    }
    if start_height > end_height {
        return Err(SequenceStateError::InvalidInput(format!(
            "start_height ({start_height}) must be <= end_height ({end_height})"
        )));
    }

    let sql = format!(
        "INSERT INTO gap_ranges (start_height, end_height, status, attempts) \
         SELECT {start_height}, {end_height}, {}, 0 \
         WHERE NOT EXISTS ( \
             SELECT 1 FROM gap_ranges \
             WHERE start_height <= {end_height} AND end_height >= {start_height} \
         )",
        quote(GapStatus::Pending.as_db_str()),
    );

    Ok(conn.execute_sql(&sql)? > 0)
}

/// Reads one gap range by `gap_id`, if present.
pub fn get_gap<C>(conn: &mut C, gap_id: i64) -> Result<Option<GapRange>, SequenceStateError>
where
    C: SequenceDb,
{
    let sql = format!(
        "SELECT gap_id, start_height, end_height, status, attempts, next_retry_at, last_error \
         FROM gap_ranges WHERE gap_id = {gap_id} LIMIT 1"
    );

    let mut rows = conn.load_gaps(&sql)?;
    match rows.pop() {
        Some(row) => Ok(Some(map_gap_row(row)?)),
        None => Ok(None),
    }
}

/// Claims the next eligible `pending` range by moving it to `in_flight`.
///
/// Eligibility honors the backoff schedule: rows with `next_retry_at` in the
/// future are skipped. Returns `None` when nothing is claimable at `now_epoch`.
/// Safe across concurrent claimers: the swap re-checks eligibility, so a row
/// taken by another process between select and update is skipped and the next
/// candidate is tried.
pub fn claim_next_pending_gap<C>(
    conn: &mut C,
    now_epoch: i64,
) -> Result<Option<GapRange>, SequenceStateError>
where
    C: SequenceDb,
{
    loop {
        let mut rows = conn.load_gap_ids(&format!(
            "SELECT gap_id FROM gap_ranges \
             WHERE status = {} \
               AND (next_retry_at IS NULL OR next_retry_at <= {now_epoch}) \
             ORDER BY start_height ASC, gap_id ASC \
             LIMIT 1",
            quote(GapStatus::Pending.as_db_str())
        ))?;

        let Some(next) = rows.pop() else {
            return Ok(None);
        };

        if try_claim_gap(conn, next.gap_id, now_epoch)? {
            return get_gap(conn, next.gap_id);
        }
    }
}

/// Compare-and-swap of one row from `pending` to `in_flight`.
///
/// The eligibility predicates are repeated in the UPDATE itself, so the swap
/// applies at most once no matter how many processes race on the same row.
/// Returns `true` only when this caller's update took effect.
fn try_claim_gap<C>(
    conn: &mut C,
    gap_id: i64,
    now_epoch: i64,
) -> Result<bool, SequenceStateError>
where
    C: SequenceDb,
{
    let sql = format!(
        "UPDATE gap_ranges \
         SET status = {}, updated_at = CURRENT_TIMESTAMP \
         WHERE gap_id = {gap_id} \
           AND status = {} \
           AND (next_retry_at IS NULL OR next_retry_at <= {now_epoch})",
        quote(GapStatus::InFlight.as_db_str()),
        quote(GapStatus::Pending.as_db_str()),
    );

    Ok(conn.execute_sql(&sql)? > 0)
}

/// Returns a failed range to `pending` with `attempts + 1` and a retry-eligibility time.
pub fn requeue_gap<C>(
    conn: &mut C,
    gap_id: i64,
    next_retry_at: Option<i64>,
    last_error: &str,
) -> Result<usize, SequenceStateError>
where
    C: SequenceDb,
{
    let sql = format!(
        "UPDATE gap_ranges \
         SET status = {}, attempts = attempts + 1, next_retry_at = {}, last_error = {}, \
             updated_at = CURRENT_TIMESTAMP \
         WHERE gap_id = {gap_id}",
        quote(GapStatus::Pending.as_db_str()),
        next_retry_at
            .map(|v| v.to_string())
            .unwrap_or_else(|| "NULL".to_string()),
        quote(last_error),
    );

    Ok(conn.execute_sql(&sql)?)
}

/// Deletes a fully resolved range.
///
/// A resolved range disappears from the queue and, because its heights are now
/// recorded, does not reappear on the next detection pass.
pub fn resolve_gap<C>(conn: &mut C, gap_id: i64) -> Result<usize, SequenceStateError>
where
    C: SequenceDb,
{
    let sql = format!("DELETE FROM gap_ranges WHERE gap_id = {gap_id}");
    Ok(conn.execute_sql(&sql)?)
}

/// Marks a range `stuck` after exhausting its repair budget.
///
/// Stuck rows are held for operator attention; they are never silently
/// requeued or dropped.
pub fn mark_gap_stuck<C>(
    conn: &mut C,
    gap_id: i64,
    last_error: &str,
) -> Result<usize, SequenceStateError>
where
    C: SequenceDb,
{
    let sql = format!(
        "UPDATE gap_ranges \
         SET status = {}, last_error = {}, updated_at = CURRENT_TIMESTAMP \
         WHERE gap_id = {gap_id}",
        quote(GapStatus::Stuck.as_db_str()),
        quote(last_error),
    );

    Ok(conn.execute_sql(&sql)?)
}

/// Marks every `in_flight` range as `pending`.
///
/// Intended for process restart recovery: a crash mid-repair must not strand
/// claimed work. Attempt counters are preserved.
pub fn requeue_in_flight_gaps<C>(conn: &mut C) -> Result<usize, SequenceStateError>
where
    C: SequenceDb,
{
    let sql = format!(
        "UPDATE gap_ranges \
         SET status = {}, updated_at = CURRENT_TIMESTAMP \
         WHERE status = {}",
        quote(GapStatus::Pending.as_db_str()),
        quote(GapStatus::InFlight.as_db_str())
    );
    Ok(conn.execute_sql(&sql)?)
}

/// Lists gap ranges by status, ordered by `(start_height, gap_id)`.
pub fn list_gaps_by_status<C>(
    conn: &mut C,
    status: GapStatus,
    limit: i64,
) -> Result<Vec<GapRange>, SequenceStateError>
where
    C: SequenceDb,
{
    if limit <= 0 {
        return Err(SequenceStateError::InvalidInput(format!(
            "limit must be > 0, got {limit}"
        )));
    }

    let sql = format!(
        "SELECT gap_id, start_height, end_height, status, attempts, next_retry_at, last_error \
         FROM gap_ranges \
         WHERE status = {} \
         ORDER BY start_height ASC, gap_id ASC \
         LIMIT {limit}",
        quote(status.as_db_str()),
    );

    conn.load_gaps(&sql)?.into_iter().map(map_gap_row).collect()
}

/// Lists stuck ranges for the operator report.
pub fn list_stuck_gaps<C>(conn: &mut C, limit: i64) -> Result<Vec<GapRange>, SequenceStateError>
where
    C: SequenceDb,
{
    list_gaps_by_status(conn, GapStatus::Stuck, limit)
}

/// Counts gap ranges in one status.
pub fn count_gaps_by_status<C>(conn: &mut C, status: GapStatus) -> Result<i64, SequenceStateError>
where
    C: SequenceDb,
{
    let sql = format!(
        "SELECT COUNT(*) AS count FROM gap_ranges WHERE status = {}",
        quote(status.as_db_str())
    );
    let mut rows = conn.load_counts(&sql)?;
    Ok(rows.pop().map(|row| row.count).unwrap_or(0))
}

/// Lists the heights in `[start_height, end_height]` that are not yet recorded.
///
/// Gap repair walks exactly this set, so heights already filled by a
/// concurrent collector are skipped instead of re-fetched.
pub fn list_missing_heights_in_range<C>(
    conn: &mut C,
    start_height: i64,
    end_height: i64,
) -> Result<Vec<i64>, SequenceStateError>
where
    C: SequenceDb,
{
    if start_height > end_height {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT height FROM blocks \
         WHERE height >= {start_height} AND height <= {end_height} \
         ORDER BY height ASC"
    );
    let known: Vec<i64> = conn
        .load_heights(&sql)?
        .into_iter()
        .map(|row| row.height)
        .collect();

    let mut missing = Vec::new();
    let mut known_iter = known.into_iter().peekable();
    for height in start_height..=end_height {
        match known_iter.peek() {
            Some(&next_known) if next_known == height => {
                known_iter.next();
            }
            _ => missing.push(height),
        }
    }

    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite_test::setup_in_memory_sqlite;
    use diesel::sqlite::SqliteConnection;

    fn record(conn: &mut SqliteConnection, height: i64) {
        record_height(conn, height, &format!("0x{height:08x}"), 1_700_000_000 + height)
            .expect("failed to record height");
    }

    #[test]
    fn detect_gaps_matches_pairwise_fixture() {
        let known = vec![0, 1, 2, 5, 6, 9];
        assert_eq!(detect_gaps(&known, 9), vec![(3, 4), (7, 8)]);
    }

    #[test]
    fn detect_gaps_on_contiguous_run_is_empty() {
        assert_eq!(detect_gaps(&[4, 5, 6, 7], 7), Vec::<(i64, i64)>::new());
    }

    #[test]
    fn detect_gaps_on_empty_or_singleton_is_empty() {
        assert_eq!(detect_gaps(&[], 100), Vec::<(i64, i64)>::new());
        assert_eq!(detect_gaps(&[42], 100), Vec::<(i64, i64)>::new());
    }

    #[test]
    fn detect_gaps_ignores_heights_above_upper_bound() {
        let known = vec![0, 1, 5, 9];
        assert_eq!(detect_gaps(&known, 5), vec![(2, 4)]);
    }

    #[test]
    fn record_height_is_idempotent() {
        let mut conn = setup_in_memory_sqlite();

        let first = record_height(&mut conn, 10, "0xaa", 1).expect("first record failed");
        let second = record_height(&mut conn, 10, "0xaa", 1).expect("second record failed");

        assert!(first);
        assert!(!second);
        assert_eq!(max_recorded_height(&mut conn).expect("max failed"), Some(10));
    }

    #[test]
    fn frontier_walks_contiguous_prefix_and_ignores_sparse_tail() {
        let mut conn = setup_in_memory_sqlite();
        for height in [0, 1, 2, 5, 6, 9] {
            record(&mut conn, height);
        }

        assert_eq!(compute_frontier(&mut conn, 0).expect("frontier failed"), 2);

        // Filling the first break advances the frontier monotonically.
        record(&mut conn, 3);
        record(&mut conn, 4);
        assert_eq!(compute_frontier(&mut conn, 0).expect("frontier failed"), 6);
    }

    #[test]
    fn frontier_is_genesis_minus_one_for_empty_store() {
        let mut conn = setup_in_memory_sqlite();
        assert_eq!(compute_frontier(&mut conn, 0).expect("frontier failed"), -1);
        assert_eq!(compute_frontier(&mut conn, 100).expect("frontier failed"), 99);
    }

    #[test]
    fn enqueue_gap_deduplicates_identical_and_overlapping_ranges() {
        let mut conn = setup_in_memory_sqlite();

        assert!(enqueue_gap(&mut conn, 3, 4).expect("first enqueue failed"));
        assert!(!enqueue_gap(&mut conn, 3, 4).expect("duplicate enqueue failed"));
        assert!(!enqueue_gap(&mut conn, 4, 6).expect("overlap enqueue failed"));
        assert!(enqueue_gap(&mut conn, 7, 8).expect("disjoint enqueue failed"));

        assert_eq!(
            count_gaps_by_status(&mut conn, GapStatus::Pending).expect("count failed"),
            2
        );
    }

    #[test]
    fn detection_pass_enqueues_gaps_and_skips_open_ones() {
        let mut conn = setup_in_memory_sqlite();
        for height in [0, 1, 2, 5, 6, 9] {
            record(&mut conn, height);
        }

        let first_pass =
            detect_and_enqueue_gaps(&mut conn, 0, 1000).expect("first detection failed");
        assert_eq!(first_pass.observed_max, Some(9));
        assert_eq!(first_pass.detected_ranges, vec![(3, 4), (7, 8)]);
        assert_eq!(first_pass.enqueued, 2);
        assert_eq!(first_pass.already_open, 0);

        // A concurrent second pass over the same state must not double-enqueue.
        let second_pass =
            detect_and_enqueue_gaps(&mut conn, 0, 1000).expect("second detection failed");
        assert_eq!(second_pass.enqueued, 0);
        assert_eq!(second_pass.already_open, 2);
    }

    #[test]
    fn detection_includes_leading_gap_above_genesis() {
        let mut conn = setup_in_memory_sqlite();
        record(&mut conn, 5);
        record(&mut conn, 6);

        let report = detect_and_enqueue_gaps(&mut conn, 0, 1000).expect("detection failed");
        assert_eq!(report.detected_ranges, vec![(0, 4)]);
        assert_eq!(report.enqueued, 1);
    }

    #[test]
    fn detection_pass_caps_new_ranges() {
        let mut conn = setup_in_memory_sqlite();
        for height in [0, 2, 4, 6, 8] {
            record(&mut conn, height);
        }

        let report = detect_and_enqueue_gaps(&mut conn, 0, 2).expect("detection failed");
        assert_eq!(report.detected_ranges.len(), 4);
        assert_eq!(report.enqueued, 2);
    }

    #[test]
    fn claim_honors_retry_schedule() {
        let mut conn = setup_in_memory_sqlite();
        enqueue_gap(&mut conn, 3, 4).expect("enqueue failed");

        let claimed = claim_next_pending_gap(&mut conn, 1_000).expect("claim failed");
        let gap = claimed.expect("expected claimable gap");
        assert_eq!(gap.status, GapStatus::InFlight);

        requeue_gap(&mut conn, gap.gap_id, Some(2_000), "upstream timeout at height 3")
            .expect("requeue failed");

        // Not yet eligible at now = 1500.
        assert!(claim_next_pending_gap(&mut conn, 1_500)
            .expect("claim failed")
            .is_none());

        let reclaimed = claim_next_pending_gap(&mut conn, 2_000)
            .expect("claim failed")
            .expect("expected gap eligible at its retry time");
        assert_eq!(reclaimed.gap_id, gap.gap_id);
        assert_eq!(reclaimed.attempts, 1);
    }

    #[test]
    fn claim_swap_applies_only_to_eligible_pending_rows() {
        let mut conn = setup_in_memory_sqlite();
        enqueue_gap(&mut conn, 3, 4).expect("enqueue failed");

        let gap = claim_next_pending_gap(&mut conn, 0)
            .expect("claim failed")
            .expect("expected pending gap");

        // The row is already in flight, so a second swap must not apply.
        assert!(!try_claim_gap(&mut conn, gap.gap_id, i64::MAX).expect("swap failed"));
        let reread = get_gap(&mut conn, gap.gap_id)
            .expect("get failed")
            .expect("expected gap row");
        assert_eq!(reread.status, GapStatus::InFlight);

        // After a requeue the swap still refuses rows whose retry time is in
        // the future, and takes them once it passes.
        requeue_gap(&mut conn, gap.gap_id, Some(2_000), "upstream timeout")
            .expect("requeue failed");
        assert!(!try_claim_gap(&mut conn, gap.gap_id, 1_500).expect("swap failed"));
        assert!(try_claim_gap(&mut conn, gap.gap_id, 2_000).expect("swap failed"));
    }

    #[test]
    fn resolved_gap_disappears_and_does_not_return_on_next_pass() {
        let mut conn = setup_in_memory_sqlite();
        for height in [0, 1, 2, 5] {
            record(&mut conn, height);
        }

        let report = detect_and_enqueue_gaps(&mut conn, 0, 1000).expect("detection failed");
        assert_eq!(report.detected_ranges, vec![(3, 4)]);

        let gap = claim_next_pending_gap(&mut conn, 0)
            .expect("claim failed")
            .expect("expected pending gap");

        // Simulate repair: record the missing heights, then resolve.
        record(&mut conn, 3);
        record(&mut conn, 4);
        resolve_gap(&mut conn, gap.gap_id).expect("resolve failed");

        let next_pass = detect_and_enqueue_gaps(&mut conn, 0, 1000).expect("detection failed");
        assert!(next_pass.detected_ranges.is_empty());
        assert_eq!(
            count_gaps_by_status(&mut conn, GapStatus::Pending).expect("count failed"),
            0
        );
    }

    #[test]
    fn stuck_gap_is_held_and_reported() {
        let mut conn = setup_in_memory_sqlite();
        enqueue_gap(&mut conn, 3, 4).expect("enqueue failed");

        let gap = claim_next_pending_gap(&mut conn, 0)
            .expect("claim failed")
            .expect("expected pending gap");
        mark_gap_stuck(&mut conn, gap.gap_id, "malformed payload at height 3")
            .expect("mark stuck failed");

        // Stuck rows are not claimable.
        assert!(claim_next_pending_gap(&mut conn, i64::MAX)
            .expect("claim failed")
            .is_none());

        let stuck = list_stuck_gaps(&mut conn, 100).expect("list failed");
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].gap_id, gap.gap_id);
        assert_eq!(
            stuck[0].last_error.as_deref(),
            Some("malformed payload at height 3")
        );
    }

    #[test]
    fn restart_requeues_crashed_in_flight_gaps() {
        let mut conn = setup_in_memory_sqlite();
        enqueue_gap(&mut conn, 3, 4).expect("enqueue failed");
        enqueue_gap(&mut conn, 7, 8).expect("enqueue failed");

        claim_next_pending_gap(&mut conn, 0)
            .expect("claim failed")
            .expect("expected first gap");

        // Simulate a process crash where in-flight work is left behind.
        let requeued = requeue_in_flight_gaps(&mut conn).expect("requeue failed");
        assert_eq!(requeued, 1);
        assert_eq!(
            count_gaps_by_status(&mut conn, GapStatus::Pending).expect("count failed"),
            2
        );
    }

    #[test]
    fn missing_heights_in_range_skips_recorded_ones() {
        let mut conn = setup_in_memory_sqlite();
        for height in [3, 5] {
            record(&mut conn, height);
        }

        let missing =
            list_missing_heights_in_range(&mut conn, 2, 6).expect("missing scan failed");
        assert_eq!(missing, vec![2, 4, 6]);
    }

    #[test]
    fn missing_ranges_view_agrees_with_pairwise_detector() {
        use diesel::prelude::*;
        use diesel::sql_query;
        use diesel::sql_types::BigInt;

        #[derive(QueryableByName)]
        struct ViewRow {
            #[diesel(sql_type = BigInt)]
            range_start: i64,
            #[diesel(sql_type = BigInt)]
            range_end: i64,
        }

        let mut conn = setup_in_memory_sqlite();
        let known = vec![0, 1, 2, 5, 6, 9];
        for &height in &known {
            record(&mut conn, height);
        }

        let view_rows: Vec<ViewRow> = sql_query(
            "SELECT range_start, range_end FROM missing_ranges ORDER BY range_start",
        )
        .load(&mut conn)
        .expect("failed to query missing_ranges view");

        let view_ranges: Vec<(i64, i64)> = view_rows
            .into_iter()
            .map(|row| (row.range_start, row.range_end))
            .collect();

        assert_eq!(view_ranges, detect_gaps(&known, 9));
    }
}
