use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::dispatch::{CampaignRun, DispatchError, Dispatcher, Sender};
use crate::ledger::{Outcome, RecipientLedger};
use crate::recipient::{Recipient, RecipientTable};
use crate::store::FOLLOW_UP_SUFFIX;
use crate::template::MessageTemplate;

/// Tells whether a recipient has answered since the first message went out.
pub trait ReplyCheck {
    fn has_replied(&mut self, recipient: &Recipient, since: DateTime<Utc>) -> anyhow::Result<bool>;
}

impl<F> ReplyCheck for F
where
    F: FnMut(&Recipient, DateTime<Utc>) -> anyhow::Result<bool>,
{
    fn has_replied(&mut self, recipient: &Recipient, since: DateTime<Utc>) -> anyhow::Result<bool> {
        self(recipient, since)
    }
}

/// Ledger namespace holding follow-up outcomes for `campaign`.
pub fn follow_up_campaign(campaign: &str) -> String {
    format!("{}{}", campaign, FOLLOW_UP_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueFollowUp {
    pub recipient: Recipient,
    pub first_sent: DateTime<Utc>,
}

/// Recipients, in table order, whose first message is at least `delay` old
/// and who have not had a follow-up delivered yet.
pub fn due_follow_ups<L: RecipientLedger + ?Sized>(
    ledger: &L,
    campaign: &str,
    table: &RecipientTable,
    delay: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<DueFollowUp> {
    let mut first_sent: HashMap<String, DateTime<Utc>> = HashMap::new();
    for entry in ledger.load(campaign) {
        if entry.outcome != Outcome::Sent {
            continue;
        }
        first_sent
            .entry(entry.email)
            .and_modify(|t| *t = std::cmp::min(*t, entry.timestamp))
            .or_insert(entry.timestamp);
    }

    let followed_up = ledger.sent_emails(&follow_up_campaign(campaign));
    let cutoff = now - delay;

    table
        .iter()
        .filter(|r| !followed_up.contains(&r.email))
        .filter_map(|r| {
            first_sent
                .get(&r.email)
                .filter(|sent_at| **sent_at <= cutoff)
                .map(|sent_at| DueFollowUp {
                    recipient: r.clone(),
                    first_sent: *sent_at,
                })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUpReport {
    /// Recipients skipped because they already answered.
    pub replied: Vec<String>,
    /// Recipients skipped because the reply check itself failed.
    pub unchecked: Vec<(String, String)>,
    /// `None` when nobody needed a follow-up.
    pub run: Option<CampaignRun>,
}

/// Sends the follow-up message to every due recipient without a reply.
///
/// Follow-ups are batched and paced like the campaign itself and count
/// against the same send quota.
pub fn run_follow_ups<L, S, R>(
    dispatcher: &Dispatcher<L>,
    campaign: &str,
    table: &RecipientTable,
    template: &MessageTemplate,
    delay: chrono::Duration,
    sender: &mut S,
    replies: &mut R,
) -> Result<FollowUpReport, DispatchError>
where
    L: RecipientLedger,
    S: Sender + ?Sized,
    R: ReplyCheck + ?Sized,
{
    let due = due_follow_ups(dispatcher.ledger(), campaign, table, delay, Utc::now());
    log::info!("{} follow-ups due for '{}'", due.len(), campaign);

    let mut report = FollowUpReport {
        replied: Vec::new(),
        unchecked: Vec::new(),
        run: None,
    };
    let mut recipients = RecipientTable::new();

    for DueFollowUp { recipient, first_sent } in due {
        match replies.has_replied(&recipient, first_sent) {
            Ok(true) => {
                log::debug!("{} already replied, no follow-up", recipient.email);
                report.replied.push(recipient.email);
            }
            Ok(false) => {
                recipients.push(recipient);
            }
            Err(e) => {
                log::warn!("Could not check replies from {}: {:#}", recipient.email, e);
                report.unchecked.push((recipient.email, format!("{:#}", e)));
            }
        }
    }

    if !recipients.is_empty() {
        report.run = Some(dispatcher.run_campaign(
            &follow_up_campaign(campaign),
            &recipients,
            template,
            sender,
        )?);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use crate::database::CampaignDatabase;
    use crate::dispatch::{DispatchSettings, Quota, RunOutcome, SendOutcome};

    fn table(emails: &[&str]) -> RecipientTable {
        emails
            .iter()
            .map(|e| Recipient::new(e, None).unwrap())
            .collect()
    }

    fn dispatcher(db: &CampaignDatabase) -> Dispatcher<&CampaignDatabase> {
        Dispatcher::new(
            db,
            DispatchSettings {
                batch_size: NonZeroUsize::new(10).unwrap(),
                pacing_delay: Duration::ZERO,
                ..DispatchSettings::default()
            },
        )
    }

    #[test]
    fn test_due_after_delay_only() {
        let db = CampaignDatabase::open_in_memory().unwrap();
        let now = Utc::now();
        let table = table(&["old@x.com", "new@x.com", "never@x.com", "failed@x.com"]);
        db.record_at("launch", "old@x.com", Outcome::Sent, None, now - chrono::Duration::days(4))
            .unwrap();
        db.record_at("launch", "new@x.com", Outcome::Sent, None, now - chrono::Duration::hours(1))
            .unwrap();
        db.record_at("launch", "failed@x.com", Outcome::Failed, Some("550"), now - chrono::Duration::days(4))
            .unwrap();

        let due = due_follow_ups(&db, "launch", &table, chrono::Duration::days(3), now);

        assert_eq!(due.len(), 1);
        assert_eq!(due[0].recipient.email, "old@x.com");
        assert_eq!(
            due[0].first_sent.timestamp_millis(),
            (now - chrono::Duration::days(4)).timestamp_millis()
        );
    }

    #[test]
    fn test_follow_up_sent_once_and_skips_replies() {
        let db = CampaignDatabase::open_in_memory().unwrap();
        let long_ago = Utc::now() - chrono::Duration::days(5);
        let table = table(&["quiet@x.com", "chatty@x.com", "flaky@x.com"]);
        for email in ["quiet@x.com", "chatty@x.com", "flaky@x.com"] {
            db.record_at("launch", email, Outcome::Sent, None, long_ago).unwrap();
        }
        let dispatcher = dispatcher(&db);
        let template = MessageTemplate::new("Following up", "Hi {name}, circling back.");
        let mut sent_to = Vec::new();
        let mut sender = |to: &str, _subject: &str, body: &str| {
            assert_eq!(body, "Hi there, circling back.");
            sent_to.push(to.to_string());
            SendOutcome::Delivered { message_id: None }
        };
        let mut replies = |recipient: &Recipient, _since: DateTime<Utc>| -> anyhow::Result<bool> {
            match recipient.email.as_str() {
                "chatty@x.com" => Ok(true),
                "flaky@x.com" => Err(anyhow::anyhow!("IMAP timeout")),
                _ => Ok(false),
            }
        };

        let report = run_follow_ups(
            &dispatcher,
            "launch",
            &table,
            &template,
            chrono::Duration::days(3),
            &mut sender,
            &mut replies,
        )
        .unwrap();

        assert_eq!(report.replied, vec!["chatty@x.com"]);
        assert_eq!(report.unchecked.len(), 1);
        let run = report.run.as_ref().unwrap();
        assert_eq!(run.batches[0].sent, vec!["quiet@x.com"]);

        let again = run_follow_ups(
            &dispatcher,
            "launch",
            &table,
            &template,
            chrono::Duration::days(3),
            &mut sender,
            &mut replies,
        )
        .unwrap();
        assert!(again.run.is_none());
        assert_eq!(sent_to, vec!["quiet@x.com"]);

        // follow-ups are kept out of the campaign's own ledger
        assert_eq!(RecipientLedger::load(&db, "launch").len(), 3);
        assert!(db.sent_emails(&follow_up_campaign("launch")).contains("quiet@x.com"));
    }

    #[test]
    fn test_follow_ups_respect_quota_and_batches() {
        let db = CampaignDatabase::open_in_memory().unwrap();
        let long_ago = Utc::now() - chrono::Duration::days(5);
        let emails = ["a@x.com", "b@x.com", "c@x.com", "d@x.com", "e@x.com"];
        for email in emails {
            db.record_at("launch", email, Outcome::Sent, None, long_ago).unwrap();
        }
        let table = table(&emails);
        let dispatcher = Dispatcher::new(
            &db,
            DispatchSettings {
                batch_size: NonZeroUsize::new(2).unwrap(),
                pacing_delay: Duration::ZERO,
                quota: Some(Quota {
                    limit: NonZeroUsize::new(2).unwrap(),
                    window: chrono::Duration::hours(24),
                }),
                ..DispatchSettings::default()
            },
        );
        let template = MessageTemplate::new("Following up", "Hi {name}");
        let mut sends = 0;
        let mut sender = |_to: &str, _subject: &str, _body: &str| {
            sends += 1;
            SendOutcome::Delivered { message_id: None }
        };
        let mut no_replies = |_: &Recipient, _: DateTime<Utc>| -> anyhow::Result<bool> { Ok(false) };

        let report = run_follow_ups(
            &dispatcher,
            "launch",
            &table,
            &template,
            chrono::Duration::days(3),
            &mut sender,
            &mut no_replies,
        )
        .unwrap();

        let run = report.run.unwrap();
        assert_eq!(run.sent_count(), 2);
        assert_eq!(run.batches.len(), 1);
        assert!(matches!(run.outcome, RunOutcome::QuotaBlocked { .. }));

        // the follow-ups used the window, so the next pass sends nothing
        let again = run_follow_ups(
            &dispatcher,
            "launch",
            &table,
            &template,
            chrono::Duration::days(3),
            &mut sender,
            &mut no_replies,
        )
        .unwrap();
        assert_eq!(again.run.unwrap().sent_count(), 0);
        assert_eq!(sends, 2);
    }

    #[test]
    fn test_follow_ups_batched_without_quota() {
        let db = CampaignDatabase::open_in_memory().unwrap();
        let long_ago = Utc::now() - chrono::Duration::days(5);
        let emails = ["a@x.com", "b@x.com", "c@x.com"];
        for email in emails {
            db.record_at("launch", email, Outcome::Sent, None, long_ago).unwrap();
        }
        let dispatcher = Dispatcher::new(
            &db,
            DispatchSettings {
                batch_size: NonZeroUsize::new(2).unwrap(),
                pacing_delay: Duration::ZERO,
                ..DispatchSettings::default()
            },
        );
        let mut sender = |_to: &str, _subject: &str, _body: &str| SendOutcome::Delivered {
            message_id: None,
        };
        let mut no_replies = |_: &Recipient, _: DateTime<Utc>| -> anyhow::Result<bool> { Ok(false) };

        let report = run_follow_ups(
            &dispatcher,
            "launch",
            &table(&emails),
            &MessageTemplate::new("Following up", "Hi"),
            chrono::Duration::days(3),
            &mut sender,
            &mut no_replies,
        )
        .unwrap();

        let run = report.run.unwrap();
        assert_eq!(run.outcome, RunOutcome::Finished);
        let sizes: Vec<usize> = run.batches.iter().map(|b| b.sent.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }
}
