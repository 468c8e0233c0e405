//! CSV export and re-import of per-job results.

use std::{path::Path, str::FromStr, time::Duration};

use csv::{ReaderBuilder, WriterBuilder};
use pacer_core::{
    client::{ClientError, ReceiptHandle},
    confirm::{ConfirmationOutcome, ConfirmationRecord, FailureKind, TimeoutCause},
    dispatch::OutcomeKind,
    AccountId, DispatchJob, JobOutcome, JobReport, RunReport,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CliError;

/// One CSV row per job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub job_id: u64,
    pub account: String,
    pub nonce: u64,
    pub target: String,
    pub amount: String,
    pub node_index: Option<usize>,
    pub node_url: Option<String>,
    pub submitted_at_ms: Option<u64>,
    pub responded_at_ms: Option<u64>,
    pub submit_latency_us: Option<u64>,
    pub success: bool,
    pub outcome: String,
    /// Failure label or timeout cause.
    pub cause: Option<String>,
    pub tx_hash: Option<String>,
    pub confirmation_polls: Option<u32>,
    pub confirmation_latency_us: Option<u64>,
    /// Nonce seen on chain when a nonce jump was detected.
    pub observed_nonce: Option<u64>,
    pub error: Option<String>,
}

fn micros(d: Duration) -> u64 {
    d.as_micros() as u64
}

impl From<&JobReport> for ResultRow {
    fn from(report: &JobReport) -> Self {
        let (cause, error, observed_nonce) = match &report.outcome {
            JobOutcome::Failed(kind) => {
                let observed = match kind {
                    FailureKind::NonceJump { observed, .. } => Some(*observed),
                    _ => None,
                };
                (Some(kind.label().to_owned()), Some(kind.to_string()), observed)
            }
            JobOutcome::TimedOut(cause) => (Some(cause.to_string()), None, None),
            _ => (None, None, None),
        };
        Self {
            job_id: report.job.id,
            account: report.job.account.to_string(),
            nonce: report.job.nonce,
            target: report.job.target.clone(),
            amount: report.job.amount.to_string(),
            node_index: report.node_index,
            node_url: report.node_url.clone(),
            submitted_at_ms: report.submitted_at_ms,
            responded_at_ms: report.responded_at_ms,
            submit_latency_us: report.submit_latency.map(micros),
            success: report.outcome.is_success(),
            outcome: report.outcome.kind().to_string(),
            cause,
            tx_hash: report.handle.as_ref().map(ToString::to_string),
            confirmation_polls: report.confirmation.as_ref().map(|c| c.polls),
            confirmation_latency_us: report.confirmation.as_ref().map(|c| micros(c.latency)),
            observed_nonce,
            error,
        }
    }
}

impl ResultRow {
    /// Rebuilds a report. Free-form node messages survive only as text.
    pub fn into_report(self) -> Result<JobReport, CliError> {
        let bad_row = |what: String| CliError::BadRow(format!("job {}: {what}", self.job_id));
        let kind = OutcomeKind::from_str(&self.outcome)
            .map_err(|_| bad_row(format!("unknown outcome '{}'", self.outcome)))?;
        let detail = self.error.clone().unwrap_or_default();
        let outcome = match kind {
            OutcomeKind::Submitted => JobOutcome::Submitted,
            OutcomeKind::Confirmed => JobOutcome::Confirmed,
            OutcomeKind::Cancelled => JobOutcome::Cancelled,
            OutcomeKind::Aborted => JobOutcome::Aborted,
            OutcomeKind::TimedOut => JobOutcome::TimedOut(match self.cause.as_deref() {
                Some("cancelled") => TimeoutCause::Cancelled,
                Some("submit_deadline") => TimeoutCause::SubmitDeadline,
                _ => TimeoutCause::Deadline,
            }),
            OutcomeKind::Failed => JobOutcome::Failed(match self.cause.as_deref() {
                Some("signing") => FailureKind::Signing(ClientError::Signing(detail)),
                Some("panicked") => FailureKind::Panicked(detail),
                Some("reverted") => FailureKind::Reverted,
                Some("nonce_jump") => FailureKind::NonceJump {
                    expected: self.nonce + 1,
                    observed: self.observed_nonce.unwrap_or_default(),
                },
                Some("nonce_lookup") => FailureKind::NonceLookup(detail),
                Some("unknown_node") => {
                    FailureKind::UnknownNode(self.node_index.unwrap_or_default())
                }
                _ => FailureKind::Submission(ClientError::Rejected(detail)),
            }),
        };
        let confirmation = self.confirmation_latency_us.map(|us| ConfirmationRecord {
            outcome: match &outcome {
                JobOutcome::Failed(kind) => ConfirmationOutcome::Failed(kind.clone()),
                JobOutcome::TimedOut(cause) => ConfirmationOutcome::TimedOut(*cause),
                _ => ConfirmationOutcome::Confirmed,
            },
            polls: self.confirmation_polls.unwrap_or_default(),
            latency: Duration::from_micros(us),
        });
        let amount = self
            .amount
            .parse()
            .map_err(|e| bad_row(format!("amount '{}': {e}", self.amount)))?;

        Ok(JobReport {
            job: DispatchJob {
                id: self.job_id,
                account: AccountId::new(self.account),
                target: self.target,
                amount,
                nonce: self.nonce,
                node_hint: None,
            },
            node_index: self.node_index,
            node_url: self.node_url,
            submitted_at_ms: self.submitted_at_ms,
            responded_at_ms: self.responded_at_ms,
            submit_latency: self.submit_latency_us.map(Duration::from_micros),
            handle: self.tx_hash.map(ReceiptHandle),
            confirmation,
            outcome,
        })
    }
}

pub fn write_results(path: impl AsRef<Path>, reports: &[JobReport]) -> Result<(), CliError> {
    let path = path.as_ref();
    info!("writing {} results to {}", reports.len(), path.display());
    let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
    for report in reports {
        writer.serialize(ResultRow::from(report))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_results(path: impl AsRef<Path>) -> Result<Vec<JobReport>, CliError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    reader
        .deserialize::<ResultRow>()
        .map(|row| row.map_err(CliError::from).and_then(ResultRow::into_report))
        .collect()
}

/// Summary of a reloaded run; wall clock spans first submission to last response.
pub fn summarize(reports: &[JobReport]) -> RunReport {
    let first = reports.iter().filter_map(|r| r.submitted_at_ms).min();
    let last = reports.iter().filter_map(|r| r.responded_at_ms).max();
    let wall_clock = match (first, last) {
        (Some(first), Some(last)) => Duration::from_millis(last.saturating_sub(first)),
        _ => Duration::ZERO,
    };
    RunReport::from_reports(reports, wall_clock)
}
