use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::ledger::{LedgerEntry, LedgerError, Outcome, RecipientLedger};
use crate::recipient::{Recipient, RecipientTable};
use crate::store::{validate_campaign_name, CampaignStore, StoreError};

/// SQLite-backed campaign store and recipient ledger.
///
/// A connection is owned by one worker; workers for different campaigns open
/// their own `CampaignDatabase` on the same file.
pub struct CampaignDatabase {
    conn: Connection,
    db_path: Option<PathBuf>,
}

impl CampaignDatabase {
    pub fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {:?}", db_path))?;

        // Concurrent campaign workers share the file
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal")?;

        let db = CampaignDatabase {
            conn,
            db_path: Some(db_path.to_path_buf()),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = CampaignDatabase { conn, db_path: None };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn initialize_schema(&self) -> Result<()> {
        // A recorded send must survive a crash right after `record` returns
        self.conn.pragma_update(None, "synchronous", "FULL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS campaigns (
                name TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL -- Unix timestamp (ms)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS recipients (
                campaign TEXT NOT NULL,
                position INTEGER NOT NULL,
                email TEXT NOT NULL,
                name TEXT,
                extra TEXT NOT NULL, -- JSON object
                PRIMARY KEY(campaign, email),
                FOREIGN KEY(campaign) REFERENCES campaigns(name) ON DELETE CASCADE
            )",
            [],
        )?;

        // Not keyed to `campaigns`: follow-up namespaces live here too
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign TEXT NOT NULL,
                email TEXT NOT NULL,
                outcome TEXT NOT NULL,
                recorded_at INTEGER NOT NULL, -- Unix timestamp (ms)
                error_detail TEXT
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_recipients_position
             ON recipients(campaign, position)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ledger_campaign
             ON ledger(campaign, outcome, email)",
            [],
        )?;

        Ok(())
    }

    fn try_load_entries(&self, campaign: &str) -> rusqlite::Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT email, outcome, recorded_at, error_detail
             FROM ledger
             WHERE campaign = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![campaign], |row| {
            Ok((
                row.get::<_, String>(0)?,         // email
                row.get::<_, String>(1)?,         // outcome
                row.get::<_, i64>(2)?,            // recorded_at
                row.get::<_, Option<String>>(3)?, // error_detail
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (email, outcome, recorded_at, error_detail) = row?;

            let outcome = match outcome.parse::<Outcome>() {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::warn!("Skipping ledger row for {} in '{}': {}", email, campaign, e);
                    continue;
                }
            };
            let Some(timestamp) = DateTime::<Utc>::from_timestamp_millis(recorded_at) else {
                log::warn!(
                    "Skipping ledger row for {} in '{}': bad timestamp {}",
                    email,
                    campaign,
                    recorded_at
                );
                continue;
            };

            entries.push(LedgerEntry {
                email,
                outcome,
                timestamp,
                error_detail,
            });
        }

        Ok(entries)
    }

    fn try_sent_emails(&self, campaign: &str) -> rusqlite::Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT email FROM ledger WHERE campaign = ?1 AND outcome = ?2",
        )?;
        let rows = stmt.query_map(params![campaign, Outcome::Sent.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        rows.collect()
    }

    fn try_account_sends_since(&self, since: DateTime<Utc>) -> rusqlite::Result<Vec<DateTime<Utc>>> {
        let mut stmt = self.conn.prepare(
            "SELECT recorded_at FROM ledger
             WHERE outcome = ?1 AND recorded_at >= ?2
             ORDER BY recorded_at ASC",
        )?;
        let rows = stmt.query_map(params![Outcome::Sent.as_str(), since.timestamp_millis()], |row| {
            row.get::<_, i64>(0)
        })?;

        let mut times = Vec::new();
        for millis in rows {
            if let Some(at) = DateTime::<Utc>::from_timestamp_millis(millis?) {
                times.push(at);
            }
        }
        Ok(times)
    }
}

impl RecipientLedger for CampaignDatabase {
    fn load(&self, campaign: &str) -> Vec<LedgerEntry> {
        match self.try_load_entries(campaign) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Could not read ledger for '{}', treating as empty: {}", campaign, e);
                Vec::new()
            }
        }
    }

    fn record_at(
        &self,
        campaign: &str,
        email: &str,
        outcome: Outcome,
        error_detail: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT INTO ledger (campaign, email, outcome, recorded_at, error_detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![campaign, email, outcome.as_str(), at.timestamp_millis(), error_detail],
        )?;
        Ok(())
    }

    fn sent_emails(&self, campaign: &str) -> HashSet<String> {
        match self.try_sent_emails(campaign) {
            Ok(sent) => sent,
            Err(e) => {
                log::warn!("Could not read sent set for '{}', treating as empty: {}", campaign, e);
                HashSet::new()
            }
        }
    }

    fn sent_since(&self, campaign: &str, since: DateTime<Utc>) -> usize {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM ledger
             WHERE campaign = ?1 AND outcome = ?2 AND recorded_at >= ?3",
            params![campaign, Outcome::Sent.as_str(), since.timestamp_millis()],
            |row| row.get::<_, i64>(0),
        );

        match count {
            Ok(count) => count as usize,
            Err(e) => {
                log::warn!("Could not count recent sends for '{}': {}", campaign, e);
                0
            }
        }
    }

    fn account_sends_since(&self, since: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        match self.try_account_sends_since(since) {
            Ok(times) => times,
            Err(e) => {
                log::warn!("Could not read recent sends for the account: {}", e);
                Vec::new()
            }
        }
    }
}

impl CampaignStore for CampaignDatabase {
    fn save(&self, campaign: &str, table: &RecipientTable) -> Result<(), StoreError> {
        let campaign = validate_campaign_name(campaign)?;
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO campaigns (name, created_at) VALUES (?1, ?2)",
            params![campaign, Utc::now().timestamp_millis()],
        )?;
        tx.execute(
            "DELETE FROM recipients WHERE campaign = ?1",
            params![campaign],
        )?;

        for (position, recipient) in table.iter().enumerate() {
            tx.execute(
                "INSERT INTO recipients (campaign, position, email, name, extra)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    campaign,
                    position as i64,
                    recipient.email,
                    recipient.name.as_deref(),
                    serde_json::to_string(&recipient.extra)?,
                ],
            )?;
        }

        tx.commit()?;
        log::debug!("Saved {} recipients for campaign '{}'", table.len(), campaign);
        Ok(())
    }

    fn load(&self, campaign: &str) -> Result<Option<RecipientTable>, StoreError> {
        let campaign = validate_campaign_name(campaign)?;

        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM campaigns WHERE name = ?1",
                params![campaign],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }

        let mut stmt = self.conn.prepare(
            "SELECT email, name, extra FROM recipients
             WHERE campaign = ?1
             ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![campaign], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut table = RecipientTable::new();
        for row in rows {
            let (email, name, extra_json) = row?;
            let extra: BTreeMap<String, String> = serde_json::from_str(&extra_json)?;
            table.push(Recipient { email, name, extra });
        }

        Ok(Some(table))
    }

    fn campaigns(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM campaigns ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
