use std::net::TcpStream;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use imap::Session;
use native_tls::{TlsConnector, TlsStream};

use crate::config::{ImapSecurity, InboxAccount};
use crate::credentials::{require_secret, Credentials, SecretKind};
use crate::followup::ReplyCheck;
use crate::recipient::Recipient;

enum ImapSession {
    Secure(Session<TlsStream<TcpStream>>),
    Plain(Session<TcpStream>),
}

impl ImapSession {
    fn select(&mut self, folder: &str) -> imap::error::Result<()> {
        match self {
            ImapSession::Secure(session) => session.select(folder).map(|_| ()),
            ImapSession::Plain(session) => session.select(folder).map(|_| ()),
        }
    }

    fn search(&mut self, query: &str) -> imap::error::Result<usize> {
        match self {
            ImapSession::Secure(session) => session.search(query).map(|hits| hits.len()),
            ImapSession::Plain(session) => session.search(query).map(|hits| hits.len()),
        }
    }

    fn logout(&mut self) -> imap::error::Result<()> {
        match self {
            ImapSession::Secure(session) => session.logout(),
            ImapSession::Plain(session) => session.logout(),
        }
    }
}

/// Looks for mail from a recipient in the configured inbox.
///
/// The connection is opened on first use and reused for the rest of the
/// follow-up pass.
pub struct ImapReplyChecker {
    account: InboxAccount,
    password: String,
    session: Option<ImapSession>,
}

impl ImapReplyChecker {
    pub fn new(account: InboxAccount, credentials: &dyn Credentials) -> Result<Self> {
        let password = require_secret(credentials, &account.imap_username, SecretKind::Imap)?;
        Ok(Self {
            account,
            password,
            session: None,
        })
    }

    fn connect(&self) -> Result<ImapSession> {
        let domain = self.account.imap_server.as_str();
        let port = self.account.imap_port;
        let username = &self.account.imap_username;

        let mut session = match self.account.imap_security {
            ImapSecurity::SSL => {
                let tls = TlsConnector::builder().build()?;
                let client = imap::connect((domain, port), domain, &tls)
                    .with_context(|| format!("Failed to connect to {}:{}", domain, port))?;
                let session = client
                    .login(username, &self.password)
                    .map_err(|e| anyhow::anyhow!("IMAP login failed: {}", e.0))?;
                ImapSession::Secure(session)
            }
            ImapSecurity::StartTLS => {
                let tls = TlsConnector::builder().build()?;
                let client = imap::connect_starttls((domain, port), domain, &tls)
                    .with_context(|| format!("Failed to connect to {}:{}", domain, port))?;
                let session = client
                    .login(username, &self.password)
                    .map_err(|e| anyhow::anyhow!("IMAP login failed: {}", e.0))?;
                ImapSession::Secure(session)
            }
            ImapSecurity::None => {
                let tcp_stream = TcpStream::connect((domain, port))
                    .with_context(|| format!("Failed to connect to {}:{}", domain, port))?;
                let client = imap::Client::new(tcp_stream);
                let session = client
                    .login(username, &self.password)
                    .map_err(|e| anyhow::anyhow!("IMAP login failed: {}", e.0))?;
                ImapSession::Plain(session)
            }
        };

        session
            .select(&self.account.folder)
            .with_context(|| format!("Failed to select {}", self.account.folder))?;
        log::debug!("IMAP session open on {} ({})", domain, self.account.folder);
        Ok(session)
    }
}

/// IMAP SEARCH criteria for mail from `email` on or after the day of `since`.
pub fn reply_query(email: &str, since: DateTime<Utc>) -> String {
    let sanitized: String = email.chars().filter(|c| *c != '"' && *c != '\\').collect();
    format!("FROM \"{}\" SINCE {}", sanitized, since.format("%d-%b-%Y"))
}

impl ReplyCheck for ImapReplyChecker {
    fn has_replied(&mut self, recipient: &Recipient, since: DateTime<Utc>) -> Result<bool> {
        if self.session.is_none() {
            self.session = Some(self.connect()?);
        }
        let query = reply_query(&recipient.email, since);

        let result = match self.session.as_mut() {
            Some(session) => session.search(&query),
            None => return Ok(false),
        };

        match result {
            Ok(hits) => Ok(hits > 0),
            Err(e) => {
                // the next check reconnects
                self.session = None;
                Err(anyhow::anyhow!("IMAP search failed: {}", e))
            }
        }
    }
}

impl Drop for ImapReplyChecker {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout() {
                log::debug!("IMAP logout failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_reply_query_format() {
        let since = Utc.with_ymd_and_hms(2024, 3, 7, 18, 30, 0).unwrap();
        assert_eq!(
            reply_query("fan@example.com", since),
            "FROM \"fan@example.com\" SINCE 07-Mar-2024"
        );
    }

    #[test]
    fn test_reply_query_strips_quotes() {
        let since = Utc.with_ymd_and_hms(2024, 12, 25, 0, 0, 0).unwrap();
        assert_eq!(
            reply_query("a\"b@example.com", since),
            "FROM \"ab@example.com\" SINCE 25-Dec-2024"
        );
    }
}
