/*!
 * Transfer of one unit: package, transmit, confirm
 *
 * ```text
 * Pending → Packaging → Transmitting → AwaitingConfirmation → Confirmed
 *                          ↑    │                 │
 *                          └────┴── retry ────────┘          → Failed
 * ```
 *
 * Retryable errors re-enter `Transmitting` until the retry budget is spent.
 * An expired session is refreshed once per unit without consuming an
 * attempt; a second authentication failure fails the unit.
 */

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use super::client::{ProcessingStatus, RemoteError, RemoteRepository, SessionToken, UploadTarget};
use super::package::{package_async, PackagedArchive, PackagingMethod};
use super::retry::RetryPolicy;
use super::session::SessionHandle;
use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Packaging,
    Transmitting,
    AwaitingConfirmation,
    Confirmed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Confirmed | TransferState::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Pending => "pending",
            TransferState::Packaging => "packaging",
            TransferState::Transmitting => "transmitting",
            TransferState::AwaitingConfirmation => "awaiting-confirmation",
            TransferState::Confirmed => "confirmed",
            TransferState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tuning shared by every unit of a run
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub retry: RetryPolicy,
    /// Pause before the first status poll
    pub wait_period: Duration,
    /// Status polls per attempt; 0 accepts the upload without polling
    pub confirm_polls: u32,
    pub confirm_interval: Duration,
    pub packaging: PackagingMethod,
    pub temp_dir: Option<PathBuf>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            wait_period: Duration::from_secs(10),
            confirm_polls: 6,
            confirm_interval: Duration::from_secs(5),
            packaging: PackagingMethod::default(),
            temp_dir: None,
        }
    }
}

/// One packaged upload: files under `base_dir` bound for `target`
#[derive(Debug, Clone)]
pub struct TransferUnit {
    pub label: String,
    pub target: UploadTarget,
    pub base_dir: PathBuf,
    pub files: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct TransferResult {
    pub state: TransferState,
    pub attempts: u32,
    pub error: Option<IngestError>,
}

struct Attempt<'a> {
    remote: &'a dyn RemoteRepository,
    session: &'a SessionHandle,
    settings: &'a TransferSettings,
    target: &'a UploadTarget,
    refreshed: bool,
}

impl Attempt<'_> {
    /// Handle an auth failure by refreshing the session once per unit
    async fn recover(&mut self, err: RemoteError, generation: u64) -> Result<(SessionToken, u64), RemoteError> {
        if !err.is_auth_error() || self.refreshed {
            return Err(err);
        }
        self.refreshed = true;
        warn!(error = %err, "session rejected, re-authenticating");
        self.session.refresh(generation).await
    }

    async fn run(&mut self, archive: &PackagedArchive, state: &mut TransferState) -> Result<(), RemoteError> {
        let (mut token, mut generation) = self.session.current().await?;

        let receipt = loop {
            let result = self
                .remote
                .upload(&token, self.target, archive.path(), archive.method)
                .await;
            match result {
                Ok(receipt) => break receipt,
                Err(e) => (token, generation) = self.recover(e, generation).await?,
            }
        };

        if receipt.confirmed || self.settings.confirm_polls == 0 {
            return Ok(());
        }

        *state = TransferState::AwaitingConfirmation;
        debug!(wait = ?self.settings.wait_period, "awaiting remote processing");
        tokio::time::sleep(self.settings.wait_period).await;

        let mut poll = 0;
        while poll < self.settings.confirm_polls {
            let status = self.remote.processing_status(&token, self.target).await;
            match status {
                Ok(ProcessingStatus::Complete) => return Ok(()),
                Ok(ProcessingStatus::Pending) => {
                    poll += 1;
                    if poll < self.settings.confirm_polls {
                        tokio::time::sleep(self.settings.confirm_interval).await;
                    }
                }
                Err(e) => (token, generation) = self.recover(e, generation).await?,
            }
        }
        Err(RemoteError::Unconfirmed(self.target.to_string()))
    }
}

/// Drive one unit to a terminal state
pub async fn transfer(
    remote: &dyn RemoteRepository,
    session: &SessionHandle,
    settings: &TransferSettings,
    unit: TransferUnit,
) -> TransferResult {
    let span = info_span!("transfer", unit = %unit.label, scan = %unit.target.scan_id);
    run_transfer(remote, session, settings, unit).instrument(span).await
}

async fn run_transfer(
    remote: &dyn RemoteRepository,
    session: &SessionHandle,
    settings: &TransferSettings,
    unit: TransferUnit,
) -> TransferResult {
    let mut state = TransferState::Pending;
    debug!(state = %state, files = unit.files.len(), "unit queued");

    state = TransferState::Packaging;
    let archive = match package_async(
        unit.base_dir.clone(),
        unit.files.clone(),
        settings.packaging,
        settings.temp_dir.clone(),
    )
    .await
    {
        Ok(archive) => archive,
        Err(e) => {
            warn!(state = %state, error = %e, "packaging failed");
            return TransferResult {
                state: TransferState::Failed,
                attempts: 0,
                error: Some(e),
            };
        }
    };

    let mut attempt = Attempt {
        remote,
        session,
        settings,
        target: &unit.target,
        refreshed: false,
    };
    let mut attempts = 0;
    loop {
        attempts += 1;
        state = TransferState::Transmitting;
        debug!(state = %state, attempt = attempts, bytes = archive.size, "transmitting");

        match attempt.run(&archive, &mut state).await {
            Ok(()) => {
                info!(attempts, target = %unit.target, "unit confirmed");
                return TransferResult {
                    state: TransferState::Confirmed,
                    attempts,
                    error: None,
                };
            }
            Err(e) if e.is_retriable() && settings.retry.should_retry(attempts) => {
                let delay = settings.retry.calculate_delay(attempts);
                warn!(state = %state, attempt = attempts, error = %e, delay = ?delay, "retrying unit");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(state = %state, attempt = attempts, error = %e, "unit failed");
                return TransferResult {
                    state: TransferState::Failed,
                    attempts,
                    error: Some(IngestError::TransferFailure {
                        unit: unit.label.clone(),
                        attempts,
                        message: e.to_string(),
                    }),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Confirmed.is_terminal());
        assert!(TransferState::Failed.is_terminal());
        assert!(!TransferState::Transmitting.is_terminal());
        assert_eq!(TransferState::AwaitingConfirmation.to_string(), "awaiting-confirmation");
    }
}
