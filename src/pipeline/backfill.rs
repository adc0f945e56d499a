//! Batch backfill of the checkpoint store.
//!
//! Marks a contiguous range of rows as already submitted without touching
//! the browser, e.g. after an earlier run whose checkpoint was lost.
//!
//! K_i: Entries are written exactly as requested; no cross-validation
//! K_i: The store is saved once, after every entry is inserted

use crate::checkpoint::{timestamp_now, CheckpointEntry, CheckpointStore};
use crate::models::{ConfigError, Result};
use crate::source::RowSource;
use serde::Serialize;
use tracing::info;

/// Which rows to mark and how to number them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRequest {
    /// Valid rows at the start of the file that are already accounted for
    pub skip_count: usize,
    /// Serial number of the first appended row
    pub start_serial: u64,
    /// Maximum rows to append; `None` takes every remaining row
    pub limit: Option<usize>,
}

/// What a backfill did, and the values to pass for the next batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub loaded_entries: usize,
    pub appended: usize,
    pub total_entries: usize,
    pub next_skip: usize,
    pub next_serial: u64,
}

/// Append the requested range of `source` rows to `store` as successes.
pub fn backfill(
    source: &RowSource,
    store: &mut CheckpointStore,
    request: BackfillRequest,
) -> Result<BackfillReport> {
    let loaded_entries = store.len();
    let take = request.limit.unwrap_or(usize::MAX);
    let timestamp = timestamp_now();

    let mut appended = 0;
    for row in source.rows().skip(request.skip_count).take(take) {
        let serial = request
            .start_serial
            .checked_add(appended as u64)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "start serial {} leaves no room for {} more rows",
                    request.start_serial,
                    appended + 1
                ))
            })?;
        store.insert(
            row.key(),
            CheckpointEntry::success(serial, &row.phone, timestamp.as_str()),
        );
        appended += 1;
    }

    store.save()?;

    let report = BackfillReport {
        loaded_entries,
        appended,
        total_entries: store.len(),
        next_skip: request.skip_count.saturating_add(appended),
        next_serial: request.start_serial.saturating_add(appended as u64),
    };

    info!(
        source = %source.path().display(),
        loaded = report.loaded_entries,
        appended = report.appended,
        total = report.total_entries,
        next_skip = report.next_skip,
        next_serial = report.next_serial,
        "Backfill complete"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Row, RowKey};
    use tempfile::TempDir;

    const CSV: &str = "555-0100,I pledge A\n555-0101,I pledge B\n\n555-0102,I pledge C\nshort\n555-0103,I pledge D\n";

    #[test]
    fn test_backfill_range_and_next_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("processed.json");
        let source = RowSource::from_text(CSV);

        let mut store = CheckpointStore::open(&path);
        store
            .record_success(&Row::new(1, "555-0100", "I pledge A"))
            .unwrap();

        let report = backfill(
            &source,
            &mut store,
            BackfillRequest {
                skip_count: 1,
                start_serial: 2,
                limit: Some(2),
            },
        )
        .unwrap();

        assert_eq!(
            report,
            BackfillReport {
                loaded_entries: 1,
                appended: 2,
                total_entries: 3,
                next_skip: 3,
                next_serial: 4,
            }
        );

        let reloaded = CheckpointStore::open(&path);
        let b = reloaded.get(&RowKey::new("555-0101", "I pledge B")).unwrap();
        let c = reloaded.get(&RowKey::new("555-0102", "I pledge C")).unwrap();
        assert_eq!((b.serial_no, c.serial_no), (2, 3));
        assert!(b.is_success() && c.is_success());
        assert_eq!(b.timestamp, c.timestamp);
        assert!(!reloaded.is_done(&RowKey::new("555-0103", "I pledge D")));
    }

    #[test]
    fn test_backfill_without_limit_takes_the_rest() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::open(&temp_dir.path().join("processed.json"));
        let source = RowSource::from_text(CSV);

        let report = backfill(
            &source,
            &mut store,
            BackfillRequest {
                skip_count: 2,
                start_serial: 10,
                limit: None,
            },
        )
        .unwrap();

        assert_eq!(report.appended, 2);
        assert_eq!(report.next_serial, 12);

        // Past the end appends nothing but still writes the file.
        let report = backfill(
            &source,
            &mut store,
            BackfillRequest {
                skip_count: 50,
                start_serial: 12,
                limit: None,
            },
        )
        .unwrap();
        assert_eq!(report.appended, 0);
        assert_eq!(report.total_entries, 2);
        assert!(store.path().exists());
    }

    #[test]
    fn test_store_never_shrinks_and_serials_increase() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("processed.json");
        let source = RowSource::from_text(CSV);
        let mut store = CheckpointStore::open(&path);

        let mut previous = 0;
        for skip in 0..4 {
            let report = backfill(
                &source,
                &mut store,
                BackfillRequest {
                    skip_count: skip,
                    start_serial: skip as u64 + 1,
                    limit: Some(1),
                },
            )
            .unwrap();
            assert!(report.total_entries >= previous);
            previous = report.total_entries;
        }
        assert_eq!(previous, 4);

        let mut serials: Vec<u64> = CheckpointStore::open(&path)
            .entries()
            .values()
            .filter_map(|e| e.serial_no())
            .collect();
        serials.sort_unstable();
        assert_eq!(serials, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_serial_overflow_is_rejected_before_saving() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("processed.json");
        let source = RowSource::from_text(CSV);
        let mut store = CheckpointStore::open(&path);

        let last = backfill(
            &source,
            &mut store,
            BackfillRequest {
                skip_count: 0,
                start_serial: u64::MAX,
                limit: Some(1),
            },
        )
        .unwrap();
        assert_eq!(last.appended, 1);
        assert_eq!(last.next_serial, u64::MAX);

        let mut fresh = CheckpointStore::open(&temp_dir.path().join("other.json"));
        let err = backfill(
            &source,
            &mut fresh,
            BackfillRequest {
                skip_count: 0,
                start_serial: u64::MAX,
                limit: Some(2),
            },
        )
        .unwrap_err();
        assert!(matches!(err, crate::models::PledgeError::Config(_)));
        assert!(!temp_dir.path().join("other.json").exists());
    }

    #[test]
    fn test_zero_limit_appends_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::open(&temp_dir.path().join("processed.json"));
        let report = backfill(
            &RowSource::from_text(CSV),
            &mut store,
            BackfillRequest {
                skip_count: 0,
                start_serial: 1,
                limit: Some(0),
            },
        )
        .unwrap();
        assert_eq!((report.appended, report.next_skip, report.next_serial), (0, 0, 1));
        assert!(store.is_empty());
    }
}
