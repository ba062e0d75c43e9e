use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Sent,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Sent => "sent",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Outcome::Sent),
            "failed" => Ok(Outcome::Failed),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub email: String,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    pub error_detail: Option<String>,
}

/// Append-only record of delivery outcomes, namespaced by campaign.
///
/// Once an email has a `Sent` entry for a campaign it must never be handed to
/// a sender again for that campaign. `load` never fails: an unreadable store
/// reads as empty. Writes must be durable before `record` returns.
pub trait RecipientLedger {
    /// All entries for `campaign`, in the order they were appended.
    fn load(&self, campaign: &str) -> Vec<LedgerEntry>;

    fn record_at(
        &self,
        campaign: &str,
        email: &str,
        outcome: Outcome,
        error_detail: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    fn record(
        &self,
        campaign: &str,
        email: &str,
        outcome: Outcome,
        error_detail: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.record_at(campaign, email, outcome, error_detail, Utc::now())
    }

    fn sent_emails(&self, campaign: &str) -> HashSet<String> {
        self.load(campaign)
            .into_iter()
            .filter(|e| e.outcome == Outcome::Sent)
            .map(|e| e.email)
            .collect()
    }

    /// Number of `Sent` entries recorded at or after `since`.
    fn sent_since(&self, campaign: &str, since: DateTime<Utc>) -> usize {
        self.load(campaign)
            .iter()
            .filter(|e| e.outcome == Outcome::Sent && e.timestamp >= since)
            .count()
    }

    /// Times of every `Sent` entry at or after `since` in any campaign,
    /// follow-up namespaces included, oldest first. Never fails.
    fn account_sends_since(&self, since: DateTime<Utc>) -> Vec<DateTime<Utc>>;
}

impl<L: RecipientLedger + ?Sized> RecipientLedger for &L {
    fn load(&self, campaign: &str) -> Vec<LedgerEntry> {
        (**self).load(campaign)
    }

    fn record_at(
        &self,
        campaign: &str,
        email: &str,
        outcome: Outcome,
        error_detail: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        (**self).record_at(campaign, email, outcome, error_detail, at)
    }

    fn sent_emails(&self, campaign: &str) -> HashSet<String> {
        (**self).sent_emails(campaign)
    }

    fn sent_since(&self, campaign: &str, since: DateTime<Utc>) -> usize {
        (**self).sent_since(campaign, since)
    }

    fn account_sends_since(&self, since: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        (**self).account_sends_since(since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_round_trips_through_text() {
        for outcome in [Outcome::Sent, Outcome::Failed] {
            assert_eq!(outcome.as_str().parse::<Outcome>(), Ok(outcome));
        }
        assert!("bounced".parse::<Outcome>().is_err());
    }
}
