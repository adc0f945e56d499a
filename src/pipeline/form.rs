//! The page seam the submission driver works against.
//!
//! Foundation:
//! - K_i: One attempt = open → challenge check → fill → arm → submit → confirm
//! - B_i: Every page interaction may fail → Result
//! - I^B: The endpoint response arrives asynchronously → per-attempt channel

use crate::models::{Result, Row};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Which signal confirmed a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The submission endpoint answered with `success: true`
    EndpointResponse,
    /// A success indicator element became visible
    IndicatorVisible,
    /// Success text appeared in the page body
    SuccessText,
}

impl fmt::Display for Confirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confirmation::EndpointResponse => write!(f, "endpoint response"),
            Confirmation::IndicatorVisible => write!(f, "success indicator"),
            Confirmation::SuccessText => write!(f, "success text"),
        }
    }
}

/// Result slot for one attempt's endpoint observation.
///
/// Created fresh for every attempt, so a response seen during an earlier
/// attempt can never confirm a later one. Dropping the watch stops the
/// observer task behind it.
pub struct ConfirmationWatch {
    rx: Option<oneshot::Receiver<Confirmation>>,
    observer: Option<JoinHandle<()>>,
}

impl ConfirmationWatch {
    /// A watch fed by `tx`, with no background observer.
    pub fn channel() -> (oneshot::Sender<Confirmation>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                rx: Some(rx),
                observer: None,
            },
        )
    }

    /// Tie a background observer's lifetime to this watch.
    pub fn with_observer(mut self, observer: JoinHandle<()>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// A watch that never fires.
    pub fn inert() -> Self {
        Self {
            rx: None,
            observer: None,
        }
    }

    /// Take the published result, if any. Yields a value at most once.
    pub fn try_take(&mut self) -> Option<Confirmation> {
        let rx = self.rx.as_mut()?;
        match rx.try_recv() {
            Ok(confirmation) => {
                self.rx = None;
                Some(confirmation)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.rx = None;
                None
            }
        }
    }
}

impl Drop for ConfirmationWatch {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
    }
}

/// A web form the driver can fill and submit.
#[async_trait]
pub trait FormPage: Send {
    /// Load the form fresh (navigate, falling back to reload).
    async fn open(&mut self) -> Result<()>;

    /// Marker of a human-verification challenge on the page, if any.
    async fn detect_challenge(&mut self) -> Result<Option<String>>;

    /// Fill the row into the form, pick selection options, tick consent.
    async fn fill(&mut self, row: &Row) -> Result<()>;

    /// Start observing the submission endpoint for this attempt.
    async fn arm_confirmation(&mut self) -> Result<ConfirmationWatch>;

    /// Trigger the submit control.
    async fn submit(&mut self) -> Result<()>;

    /// Check the page itself for a visible indicator or success text.
    async fn page_confirmation(&mut self) -> Result<Option<Confirmation>>;

    /// Write best-effort diagnostics named after `stamp` into `dir`.
    async fn capture_diagnostics(&mut self, dir: &Path, stamp: &str) -> Result<Vec<PathBuf>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_yields_once() {
        let (tx, mut watch) = ConfirmationWatch::channel();
        assert_eq!(watch.try_take(), None);

        tx.send(Confirmation::EndpointResponse).unwrap();
        assert_eq!(watch.try_take(), Some(Confirmation::EndpointResponse));
        assert_eq!(watch.try_take(), None);
    }

    #[test]
    fn test_dropped_sender_and_inert_watch() {
        let (tx, mut watch) = ConfirmationWatch::channel();
        drop(tx);
        assert_eq!(watch.try_take(), None);

        assert_eq!(ConfirmationWatch::inert().try_take(), None);
    }

    #[tokio::test]
    async fn test_drop_aborts_observer() {
        let (_tx, watch) = ConfirmationWatch::channel();
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        let observer = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await
        });
        drop(watch.with_observer(observer));
        // The observer's future (and the sender it holds) is dropped on abort.
        assert!(alive_rx.await.is_err());
    }
}
