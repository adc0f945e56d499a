//! Row, key, and run statistics types.
//!
//! K_i: These types represent the core data flow through the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of pledge characters that participate in a row key.
pub const KEY_PLEDGE_PREFIX: usize = 40;

/// One input record.
///
/// K_i: Both fields are trimmed; a row is immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// 1-based position among the valid rows of the source file
    pub index: usize,

    /// Phone number (column 0)
    pub phone: String,

    /// Pledge / free text (column 1)
    pub pledge: String,
}

impl Row {
    pub fn new(index: usize, phone: impl Into<String>, pledge: impl Into<String>) -> Self {
        Self {
            index,
            phone: phone.into(),
            pledge: pledge.into(),
        }
    }

    /// Derived checkpoint identity of this row.
    pub fn key(&self) -> RowKey {
        RowKey::new(&self.phone, &self.pledge)
    }

    /// Rows missing either field are never submitted.
    pub fn is_complete(&self) -> bool {
        !self.phone.is_empty() && !self.pledge.is_empty()
    }
}

/// Checkpoint identity: `phone::<first 40 chars of pledge>`.
///
/// K_i: Pure function of its two inputs, stable across runs.
/// B_i: Two rows sharing phone and pledge prefix collide (accepted).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(phone: &str, pledge: &str) -> Self {
        let prefix: String = pledge.chars().take(KEY_PLEDGE_PREFIX).collect();
        Self(format!("{phone}::{prefix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RowKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Why a submission run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every row was visited
    #[default]
    Exhausted,
    /// Wall-clock budget spent; remaining rows left for the next run
    RuntimeBudgetExceeded,
    /// Verification challenge found; run aborted
    VerificationChallenge,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Exhausted => write!(f, "all rows visited"),
            StopReason::RuntimeBudgetExceeded => write!(f, "runtime budget exceeded"),
            StopReason::VerificationChallenge => write!(f, "verification challenge"),
        }
    }
}

/// Statistics for a submission run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Rows read from the source
    pub total_rows: usize,

    /// Rows already marked successful before this run
    pub skipped_done: usize,

    /// Rows with an empty phone or pledge
    pub skipped_incomplete: usize,

    /// Rows submitted and confirmed in this run
    pub succeeded: usize,

    /// Rows that exhausted their attempts
    pub abandoned: usize,

    /// Attempts made across all rows
    pub attempts: usize,

    /// Entries in the store when the run ended
    pub store_entries: usize,

    /// Total runtime in seconds
    pub runtime_secs: f64,

    /// Confirmed submissions per hour
    pub throughput_per_hour: f64,

    pub stop_reason: StopReason,
}

impl RunStats {
    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.succeeded as f64 / self.runtime_secs * 3600.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_key_is_deterministic() {
        let a = RowKey::new("555-0100", "I pledge X");
        let b = RowKey::new("555-0100", "I pledge X");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "555-0100::I pledge X");
        assert_ne!(a, RowKey::new("555-0101", "I pledge X"));
    }

    #[test]
    fn test_row_key_truncates_by_characters() {
        let long = "é".repeat(60);
        let key = RowKey::new("1", &long);
        assert_eq!(key.as_str(), format!("1::{}", "é".repeat(40)));

        // Shared 40-char prefix collides by construction.
        let base = "x".repeat(40);
        assert_eq!(
            RowKey::new("1", &format!("{base}A")),
            RowKey::new("1", &format!("{base}B"))
        );
    }

    #[test]
    fn test_row_completeness() {
        assert!(Row::new(1, "555", "pledge").is_complete());
        assert!(!Row::new(2, "", "pledge").is_complete());
        assert!(!Row::new(3, "555", "").is_complete());
    }
}
