//! Checkpointed submission pipeline.
//!
//! Pipeline flow:
//! Rows → skip done → per-row attempts against a FormPage → checkpoint → pause
//!
//! Per-row state machine:
//! Pending → Attempting → {Succeeded | Failed}; Failed loops back to
//! Attempting while attempts remain, otherwise the row is Abandoned for this
//! run and stays absent from the store.

use crate::checkpoint::{CheckpointEntry, CheckpointStore};
use crate::models::{PledgeError, Result, Row, RunConfig, RunStats, StopReason};
use crate::pipeline::{jittered_delay, Confirmation, ConfirmationWatch, FormPage, RetryPolicy};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Terminal state of one row in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Succeeded(CheckpointEntry),
    Abandoned { attempts: u32, last_error: String },
}

/// Drives rows through a form page one at a time.
pub struct SubmissionDriver<P: FormPage> {
    page: P,
    config: RunConfig,
    policy: RetryPolicy,
    /// Cleared after every success and failure so the next attempt starts fresh
    page_loaded: bool,
    progress: ProgressBar,
}

impl<P: FormPage> SubmissionDriver<P> {
    pub fn new(page: P, config: RunConfig) -> Self {
        let policy = RetryPolicy::for_rows(&config);
        Self {
            page,
            config,
            policy,
            page_loaded: false,
            progress: ProgressBar::hidden(),
        }
    }

    /// Show a progress bar while running.
    pub fn with_progress(mut self) -> Self {
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        self.progress = pb;
        self
    }

    /// Hand back the page, e.g. to close it.
    pub fn into_page(self) -> P {
        self.page
    }

    /// Run every unfinished row until rows run out, the wall-clock budget is
    /// spent, or a verification challenge stops the run.
    pub async fn run(&mut self, rows: Vec<Row>, store: &mut CheckpointStore) -> Result<RunStats> {
        let start = Instant::now();
        let budget = self.config.max_runtime();
        let mut stats = RunStats {
            total_rows: rows.len(),
            ..Default::default()
        };

        let pending = rows.iter().filter(|r| !store.is_done(&r.key())).count();
        info!(
            total_rows = rows.len(),
            pending = pending,
            already_done = rows.len() - pending,
            max_attempts = self.policy.max_attempts,
            "Starting submission run"
        );

        self.progress.set_length(rows.len() as u64);

        for row in &rows {
            if start.elapsed() > budget {
                info!(
                    elapsed_secs = start.elapsed().as_secs(),
                    "Runtime budget reached, stopping before next row"
                );
                stats.stop_reason = StopReason::RuntimeBudgetExceeded;
                break;
            }

            self.progress.inc(1);

            if store.is_done(&row.key()) {
                debug!(row = row.index, "Skipping processed row");
                stats.skipped_done += 1;
                continue;
            }

            if !row.is_complete() {
                debug!(row = row.index, "Skipping row with empty phone or pledge");
                stats.skipped_incomplete += 1;
                continue;
            }

            match self.submit_row(row, store, &mut stats).await {
                Ok(RowOutcome::Succeeded(_)) => {
                    stats.succeeded += 1;
                    let pause = jittered_delay(self.config.min_delay_ms, self.config.max_delay_ms);
                    tokio::time::sleep(pause).await;
                }
                Ok(RowOutcome::Abandoned {
                    attempts,
                    last_error,
                }) => {
                    stats.abandoned += 1;
                    warn!(
                        row = row.index,
                        phone = %row.phone,
                        attempts = attempts,
                        error = %last_error,
                        "Row abandoned for this run"
                    );
                }
                Err(PledgeError::VerificationChallenge { marker }) => {
                    warn!(
                        row = row.index,
                        marker = %marker,
                        "Verification challenge detected, aborting run"
                    );
                    stats.stop_reason = StopReason::VerificationChallenge;
                    break;
                }
                Err(e) => {
                    self.progress.abandon();
                    return Err(e);
                }
            }

            self.progress.set_message(format!(
                "ok: {}, abandoned: {}",
                stats.succeeded, stats.abandoned
            ));
        }

        self.progress.finish_with_message(format!(
            "Done! {} submitted, {} abandoned",
            stats.succeeded, stats.abandoned
        ));

        stats.store_entries = store.len();
        stats.runtime_secs = start.elapsed().as_secs_f64();
        stats.finalize();

        info!(
            succeeded = stats.succeeded,
            abandoned = stats.abandoned,
            skipped = stats.skipped_done,
            stop_reason = %stats.stop_reason,
            throughput = %format!("{:.0}/hr", stats.throughput_per_hour),
            "Submission run complete"
        );

        Ok(stats)
    }

    /// Attempt one row until it succeeds or its attempts run out.
    ///
    /// Returns `Err` only for fatal errors; any other failure consumes an
    /// attempt.
    pub async fn submit_row(
        &mut self,
        row: &Row,
        store: &mut CheckpointStore,
        stats: &mut RunStats,
    ) -> Result<RowOutcome> {
        let serial = store.next_serial();
        let mut attempt = 1;

        loop {
            stats.attempts += 1;
            info!(
                row = row.index,
                serial = serial,
                attempt = attempt,
                phone = %row.phone,
                "Submitting"
            );

            match self.attempt(row).await {
                Ok(confirmation) => {
                    self.page_loaded = false;
                    let entry = store.record_success(row)?;
                    info!(
                        row = row.index,
                        serial = entry.serial_no,
                        via = %confirmation,
                        "Submission confirmed"
                    );
                    return Ok(RowOutcome::Succeeded(entry));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        row = row.index,
                        phone = %row.phone,
                        attempt = attempt,
                        error = %e,
                        "Attempt failed"
                    );
                    self.capture_diagnostics(row).await;
                    self.page_loaded = false;

                    if !self.policy.allows_retry_after(attempt) {
                        return Ok(RowOutcome::Abandoned {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One pass through the form.
    async fn attempt(&mut self, row: &Row) -> Result<Confirmation> {
        if !self.page_loaded {
            self.page.open().await?;
            self.page_loaded = true;
        }

        if let Some(marker) = self.page.detect_challenge().await? {
            return Err(PledgeError::VerificationChallenge { marker });
        }

        self.page.fill(row).await?;

        let mut watch = self.page.arm_confirmation().await?;
        self.page.submit().await?;
        self.await_confirmation(&mut watch).await
    }

    /// Wait for whichever success signal shows up first.
    async fn await_confirmation(&mut self, watch: &mut ConfirmationWatch) -> Result<Confirmation> {
        let timeout = self.config.confirmation_timeout();
        let poll = self.config.poll_interval();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(confirmation) = watch.try_take() {
                return Ok(confirmation);
            }
            // I^B: the form may already be gone mid-submit; keep waiting.
            match self.page.page_confirmation().await {
                Ok(Some(confirmation)) => return Ok(confirmation),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Confirmation poll failed, still waiting"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PledgeError::ConfirmationTimeout(timeout));
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Best effort; never replaces the attempt's own error.
    async fn capture_diagnostics(&mut self, row: &Row) {
        if !self.config.capture_diagnostics {
            return;
        }
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let stamp = format!("{secs}-row{}", row.index);

        match self
            .page
            .capture_diagnostics(&self.config.log_dir, &stamp)
            .await
        {
            Ok(files) => debug!(row = row.index, files = files.len(), "Diagnostics captured"),
            Err(e) => debug!(row = row.index, error = %e, "Diagnostics capture failed"),
        }
    }
}
