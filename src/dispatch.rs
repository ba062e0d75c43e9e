use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ledger::{LedgerError, Outcome, RecipientLedger};
use crate::planner::{self, PlannedBatch, DEFAULT_BATCH_SIZE};
use crate::recipient::RecipientTable;
use crate::template::{MessageTemplate, DEFAULT_NAME};

const PACING_SLICE: Duration = Duration::from_millis(100);

/// Result of handing one message to the provider.
///
/// Ordinary delivery problems (bounces, quota errors, network trouble) are a
/// `Failed` value, not an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { message_id: Option<String> },
    Failed { detail: String },
}

/// The single outbound collaborator of the dispatch loop.
pub trait Sender {
    fn send(&mut self, to: &str, subject: &str, body: &str) -> SendOutcome;
}

impl<F> Sender for F
where
    F: FnMut(&str, &str, &str) -> SendOutcome,
{
    fn send(&mut self, to: &str, subject: &str, body: &str) -> SendOutcome {
        self(to, subject, body)
    }
}

/// Cooperative cancellation shared between the caller and running loops.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A provider send cap of `limit` messages per rolling `window`.
///
/// The cap covers the sending account, so every campaign and follow-up
/// recorded in the ledger counts against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: NonZeroUsize,
    pub window: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub batch_size: NonZeroUsize,
    pub pacing_delay: Duration,
    pub quota: Option<Quota>,
    pub default_name: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
            pacing_delay: Duration::from_secs(1),
            quota: None,
            default_name: DEFAULT_NAME.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to record outcome for {email} in campaign '{campaign}': {source}")]
    Ledger {
        campaign: String,
        email: String,
        #[source]
        source: LedgerError,
    },

    #[error("Campaign '{0}' has no recipients")]
    EmptyCampaign(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Completed,
    /// Every recipient was attempted but some sends failed.
    Partial,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_index: usize,
    pub sent: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Recipients skipped because the run was cancelled.
    pub not_attempted: Vec<String>,
    pub state: BatchState,
}

impl BatchReport {
    fn new(batch_index: usize) -> Self {
        Self {
            batch_index,
            sent: Vec::new(),
            failed: Vec::new(),
            not_attempted: Vec::new(),
            state: BatchState::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing left to send this run.
    Finished,
    /// The quota is spent; re-invoke at or after `resume_after`.
    QuotaBlocked { resume_after: DateTime<Utc> },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignRun {
    pub batches: Vec<BatchReport>,
    pub outcome: RunOutcome,
}

impl CampaignRun {
    pub fn sent_count(&self) -> usize {
        self.batches.iter().map(|b| b.sent.len()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.batches.iter().map(|b| b.failed.len()).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &(String, String)> {
        self.batches.iter().flat_map(|b| b.failed.iter())
    }
}

struct QuotaWindow {
    used: usize,
    resets_at: DateTime<Utc>,
}

/// Drives paced, send-once delivery for a campaign against a ledger.
pub struct Dispatcher<L> {
    ledger: L,
    settings: DispatchSettings,
    cancel: CancelFlag,
}

impl<L: RecipientLedger> Dispatcher<L> {
    pub fn new(ledger: L, settings: DispatchSettings) -> Self {
        Self {
            ledger,
            settings,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn next_batch(&self, campaign: &str, table: &RecipientTable) -> Option<PlannedBatch> {
        planner::next_batch(&self.ledger, campaign, table, self.settings.batch_size)
    }

    /// Sends one batch in order, recording each outcome before moving on.
    ///
    /// A failed send is recorded and the loop continues. A ledger write
    /// failure stops the run immediately.
    pub fn run_batch<S: Sender + ?Sized>(
        &self,
        campaign: &str,
        batch: &PlannedBatch,
        template: &MessageTemplate,
        sender: &mut S,
    ) -> Result<BatchReport, DispatchError> {
        let mut report = BatchReport::new(batch.index);
        log::info!(
            "Sending batch {} of '{}' ({} recipients)",
            batch.index,
            campaign,
            batch.len()
        );

        for (position, recipient) in batch.recipients.iter().enumerate() {
            if position > 0 {
                self.pace();
            }
            if self.cancel.is_cancelled() {
                report.not_attempted = batch.recipients[position..]
                    .iter()
                    .map(|r| r.email.clone())
                    .collect();
                report.state = BatchState::Cancelled;
                log::info!(
                    "Batch {} of '{}' cancelled with {} recipients left",
                    batch.index,
                    campaign,
                    report.not_attempted.len()
                );
                return Ok(report);
            }

            let message = template.render(recipient, &self.settings.default_name);
            match sender.send(&recipient.email, &message.subject, &message.body) {
                SendOutcome::Delivered { message_id } => {
                    self.record(campaign, &recipient.email, Outcome::Sent, None)?;
                    log::debug!(
                        "Sent to {} ({})",
                        recipient.email,
                        message_id.as_deref().unwrap_or("no message id")
                    );
                    report.sent.push(recipient.email.clone());
                }
                SendOutcome::Failed { detail } => {
                    self.record(campaign, &recipient.email, Outcome::Failed, Some(&detail))?;
                    log::warn!("Failed to send to {}: {}", recipient.email, detail);
                    report.failed.push((recipient.email.clone(), detail));
                }
            }
        }

        if !report.failed.is_empty() {
            report.state = BatchState::Partial;
        }
        log::info!(
            "Batch {} of '{}' complete: {} sent, {} failed",
            batch.index,
            campaign,
            report.sent.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Works through the campaign batch by batch.
    ///
    /// Recipients that fail are not retried within the same run. With a quota
    /// configured, at most one batch is sent per run and the caller is told
    /// when the window reopens instead of waiting for it here.
    pub fn run_campaign<S: Sender + ?Sized>(
        &self,
        campaign: &str,
        table: &RecipientTable,
        template: &MessageTemplate,
        sender: &mut S,
    ) -> Result<CampaignRun, DispatchError> {
        if table.is_empty() {
            return Err(DispatchError::EmptyCampaign(campaign.to_string()));
        }

        match self.settings.quota {
            Some(quota) => self.run_quota_limited(campaign, table, template, sender, quota),
            None => self.run_to_completion(campaign, table, template, sender),
        }
    }

    fn run_to_completion<S: Sender + ?Sized>(
        &self,
        campaign: &str,
        table: &RecipientTable,
        template: &MessageTemplate,
        sender: &mut S,
    ) -> Result<CampaignRun, DispatchError> {
        let mut attempted = self.ledger.sent_emails(campaign);
        let mut batches = Vec::new();

        while let Some(batch) =
            planner::next_batch_excluding(table, self.settings.batch_size, &attempted)
        {
            if !batches.is_empty() {
                self.pace();
            }

            let report = self.run_batch(campaign, &batch, template, sender)?;
            let cancelled = report.state == BatchState::Cancelled;
            attempted.extend(batch.recipients.into_iter().map(|r| r.email));
            batches.push(report);

            if cancelled {
                return Ok(CampaignRun {
                    batches,
                    outcome: RunOutcome::Cancelled,
                });
            }
        }

        Ok(CampaignRun {
            batches,
            outcome: RunOutcome::Finished,
        })
    }

    fn run_quota_limited<S: Sender + ?Sized>(
        &self,
        campaign: &str,
        table: &RecipientTable,
        template: &MessageTemplate,
        sender: &mut S,
        quota: Quota,
    ) -> Result<CampaignRun, DispatchError> {
        let window = self.quota_window(quota, Utc::now());
        let remaining = quota.limit.get().saturating_sub(window.used);

        if remaining == 0 {
            let resume_after = window.resets_at;
            log::info!(
                "Send quota used up ({} in window), '{}' can resume after {}",
                window.used,
                campaign,
                resume_after
            );
            return Ok(CampaignRun {
                batches: Vec::new(),
                outcome: RunOutcome::QuotaBlocked { resume_after },
            });
        }

        let sent = self.ledger.sent_emails(campaign);
        let Some(mut batch) = planner::next_batch_excluding(table, self.settings.batch_size, &sent)
        else {
            return Ok(CampaignRun {
                batches: Vec::new(),
                outcome: RunOutcome::Finished,
            });
        };
        batch.recipients.truncate(remaining);

        let report = self.run_batch(campaign, &batch, template, sender)?;
        let cancelled = report.state == BatchState::Cancelled;
        let batches = vec![report];
        if cancelled {
            return Ok(CampaignRun {
                batches,
                outcome: RunOutcome::Cancelled,
            });
        }

        let sent = self.ledger.sent_emails(campaign);
        let outcome = if table.iter().any(|r| !sent.contains(&r.email)) {
            RunOutcome::QuotaBlocked {
                resume_after: self.quota_window(quota, Utc::now()).resets_at,
            }
        } else {
            RunOutcome::Finished
        };

        Ok(CampaignRun { batches, outcome })
    }

    /// Sends made by the whole account inside the current window, and when
    /// the oldest of them ages out.
    fn quota_window(&self, quota: Quota, now: DateTime<Utc>) -> QuotaWindow {
        let sends = self.ledger.account_sends_since(now - quota.window);
        QuotaWindow {
            used: sends.len(),
            resets_at: sends
                .iter()
                .min()
                .map(|oldest| *oldest + quota.window)
                .unwrap_or(now + quota.window),
        }
    }

    fn record(
        &self,
        campaign: &str,
        email: &str,
        outcome: Outcome,
        error_detail: Option<&str>,
    ) -> Result<(), DispatchError> {
        self.ledger
            .record(campaign, email, outcome, error_detail)
            .map_err(|source| {
                log::error!("Ledger write failed for {} in '{}': {}", email, campaign, source);
                DispatchError::Ledger {
                    campaign: campaign.to_string(),
                    email: email.to_string(),
                    source,
                }
            })
    }

    /// Waits out the pacing delay, returning early on cancellation.
    fn pace(&self) {
        let deadline = Instant::now() + self.settings.pacing_delay;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(std::cmp::min(deadline - now, PACING_SLICE));
        }
    }
}
