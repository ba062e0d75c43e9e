use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::{LedgerEntry, Outcome, RecipientLedger};
use crate::recipient::RecipientTable;

/// Progress counts for one campaign. `pending` still includes failed
/// recipients, since they remain eligible for a later run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CampaignSummary {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub pending: usize,
}

impl CampaignSummary {
    pub fn progress(&self) -> f64 {
        self.sent as f64 / std::cmp::max(1, self.total) as f64
    }
}

impl fmt::Display for CampaignSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} sent, {} failed, {} pending ({:.0}%)",
            self.total,
            self.sent,
            self.failed,
            self.pending,
            self.progress() * 100.0
        )
    }
}

/// Latest failure of a recipient that has not been delivered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub email: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentRecipient {
    pub email: String,
    pub name: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRecipient {
    pub email: String,
    pub name: Option<String>,
    pub last_error: Option<String>,
}

/// Everything `ghostbot export` writes for one campaign.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignReport {
    pub campaign: String,
    pub generated_at: DateTime<Utc>,
    pub summary: CampaignSummary,
    pub sent: Vec<SentRecipient>,
    pub pending: Vec<PendingRecipient>,
}

/// Per-email view of a campaign's ledger.
struct Tally {
    first_sent: HashMap<String, DateTime<Utc>>,
    last_failure: HashMap<String, LedgerEntry>,
    failures: HashMap<String, usize>,
}

impl Tally {
    fn new(entries: Vec<LedgerEntry>) -> Self {
        let mut tally = Tally {
            first_sent: HashMap::new(),
            last_failure: HashMap::new(),
            failures: HashMap::new(),
        };

        // entries arrive in append order
        for entry in entries {
            match entry.outcome {
                Outcome::Sent => {
                    tally.first_sent.entry(entry.email).or_insert(entry.timestamp);
                }
                Outcome::Failed => {
                    *tally.failures.entry(entry.email.clone()).or_default() += 1;
                    tally.last_failure.insert(entry.email.clone(), entry);
                }
            }
        }
        tally
    }

    fn failure_of(&self, email: &str) -> Option<&LedgerEntry> {
        if self.first_sent.contains_key(email) {
            return None;
        }
        self.last_failure.get(email)
    }
}

pub fn summarize<L: RecipientLedger + ?Sized>(
    ledger: &L,
    campaign: &str,
    table: &RecipientTable,
) -> CampaignSummary {
    summary_from(&Tally::new(ledger.load(campaign)), table)
}

fn summary_from(tally: &Tally, table: &RecipientTable) -> CampaignSummary {
    let sent: HashSet<&str> = table
        .iter()
        .map(|r| r.email.as_str())
        .filter(|email| tally.first_sent.contains_key(*email))
        .collect();
    let failed = table
        .iter()
        .filter(|r| tally.failure_of(&r.email).is_some())
        .count();

    CampaignSummary {
        total: table.len(),
        sent: sent.len(),
        failed,
        pending: table.len() - sent.len(),
    }
}

/// Undelivered table members with their most recent error, in table order.
pub fn failure_details<L: RecipientLedger + ?Sized>(
    ledger: &L,
    campaign: &str,
    table: &RecipientTable,
) -> Vec<FailureDetail> {
    let tally = Tally::new(ledger.load(campaign));
    table
        .iter()
        .filter_map(|r| {
            let entry = tally.failure_of(&r.email)?;
            Some(FailureDetail {
                email: r.email.clone(),
                error: entry.error_detail.clone().unwrap_or_default(),
                failed_at: entry.timestamp,
                attempts: tally.failures.get(&r.email).copied().unwrap_or(0),
            })
        })
        .collect()
}

/// Sent and pending recipients of a campaign, in table order.
pub fn campaign_report<L: RecipientLedger + ?Sized>(
    ledger: &L,
    campaign: &str,
    table: &RecipientTable,
) -> CampaignReport {
    let tally = Tally::new(ledger.load(campaign));
    let mut sent = Vec::new();
    let mut pending = Vec::new();

    for recipient in table {
        match tally.first_sent.get(&recipient.email) {
            Some(sent_at) => sent.push(SentRecipient {
                email: recipient.email.clone(),
                name: recipient.name.clone(),
                sent_at: *sent_at,
            }),
            None => pending.push(PendingRecipient {
                email: recipient.email.clone(),
                name: recipient.name.clone(),
                last_error: tally
                    .failure_of(&recipient.email)
                    .and_then(|e| e.error_detail.clone()),
            }),
        }
    }

    CampaignReport {
        campaign: campaign.to_string(),
        generated_at: Utc::now(),
        summary: summary_from(&tally, table),
        sent,
        pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::CampaignDatabase;
    use crate::recipient::Recipient;

    #[test]
    fn test_summary_counts() {
        let db = CampaignDatabase::open_in_memory().unwrap();
        let table: RecipientTable = ["a@x.com", "b@x.com", "c@x.com", "d@x.com"]
            .iter()
            .map(|e| Recipient::new(e, None).unwrap())
            .collect();
        db.record("launch", "a@x.com", Outcome::Sent, None).unwrap();
        db.record("launch", "b@x.com", Outcome::Failed, Some("timeout")).unwrap();
        // failed once, then delivered on retry
        db.record("launch", "c@x.com", Outcome::Failed, Some("timeout")).unwrap();
        db.record("launch", "c@x.com", Outcome::Sent, None).unwrap();
        // not in the table
        db.record("launch", "gone@x.com", Outcome::Sent, None).unwrap();

        let summary = summarize(&db, "launch", &table);

        assert_eq!(
            summary,
            CampaignSummary {
                total: 4,
                sent: 2,
                failed: 1,
                pending: 2,
            }
        );
        assert_eq!(summary.progress(), 0.5);
        assert!(summary.to_string().starts_with("4 total, 2 sent"));
    }

    #[test]
    fn test_failure_details_keep_latest_error() {
        let db = CampaignDatabase::open_in_memory().unwrap();
        let table: RecipientTable = ["a@x.com", "b@x.com", "c@x.com"]
            .iter()
            .map(|e| Recipient::new(e, None).unwrap())
            .collect();
        db.record("launch", "b@x.com", Outcome::Failed, Some("timeout")).unwrap();
        db.record("launch", "b@x.com", Outcome::Failed, Some("550 mailbox full")).unwrap();
        // delivered on retry, no longer a failure
        db.record("launch", "c@x.com", Outcome::Failed, Some("timeout")).unwrap();
        db.record("launch", "c@x.com", Outcome::Sent, None).unwrap();

        let details = failure_details(&db, "launch", &table);

        assert_eq!(details.len(), 1);
        assert_eq!(details[0].email, "b@x.com");
        assert_eq!(details[0].error, "550 mailbox full");
        assert_eq!(details[0].attempts, 2);
    }

    #[test]
    fn test_report_splits_sent_and_pending() {
        let db = CampaignDatabase::open_in_memory().unwrap();
        let mut table = RecipientTable::new();
        table.push(Recipient::new("ann@x.com", Some("Ann")).unwrap());
        table.push(Recipient::new("bob@x.com", None).unwrap());
        table.push(Recipient::new("cy@x.com", None).unwrap());
        db.record("launch", "ann@x.com", Outcome::Sent, None).unwrap();
        db.record("launch", "ann@x.com", Outcome::Sent, None).unwrap();
        db.record("launch", "bob@x.com", Outcome::Failed, Some("timeout")).unwrap();

        let report = campaign_report(&db, "launch", &table);

        assert_eq!(report.summary.sent, 1);
        assert_eq!(report.sent.len(), 1);
        assert_eq!(report.sent[0].name.as_deref(), Some("Ann"));
        let pending: Vec<(&str, Option<&str>)> = report
            .pending
            .iter()
            .map(|p| (p.email.as_str(), p.last_error.as_deref()))
            .collect();
        assert_eq!(pending, vec![("bob@x.com", Some("timeout")), ("cy@x.com", None)]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["summary"]["pending"], 2);
    }

    #[test]
    fn test_empty_campaign_progress() {
        let db = CampaignDatabase::open_in_memory().unwrap();
        let summary = summarize(&db, "launch", &RecipientTable::new());
        assert_eq!(summary.pending, 0);
        assert_eq!(summary.progress(), 0.0);
    }
}
