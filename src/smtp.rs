use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, Message, SmtpTransport, Transport};

use crate::config::{SenderAccount, SmtpSecurity};
use crate::credentials::{require_secret, Credentials, SecretKind};
use crate::dispatch::{SendOutcome, Sender};

/// Delivers campaign messages through the configured SMTP relay.
pub struct SmtpSender {
    from: Mailbox,
    mailer: SmtpTransport,
}

impl SmtpSender {
    pub fn new(account: &SenderAccount, credentials: &dyn Credentials) -> Result<Self> {
        let password = require_secret(credentials, &account.smtp_username, SecretKind::Smtp)?;
        let creds = SmtpCredentials::new(account.smtp_username.clone(), password);

        let relay = SmtpTransport::relay(&account.smtp_server)
            .with_context(|| format!("Invalid SMTP server {}", account.smtp_server))?
            .credentials(creds)
            .port(account.smtp_port);

        let mailer = match account.smtp_security {
            SmtpSecurity::SSL => {
                let tls_params = TlsParameters::new(account.smtp_server.clone())?;
                relay.tls(Tls::Wrapper(tls_params)).build()
            }
            SmtpSecurity::StartTLS => {
                let tls_params = TlsParameters::new(account.smtp_server.clone())?;
                relay.tls(Tls::Required(tls_params)).build()
            }
            SmtpSecurity::None => relay.tls(Tls::None).build(),
        };

        Ok(Self {
            from: sender_mailbox(account)?,
            mailer,
        })
    }
}

fn sender_mailbox(account: &SenderAccount) -> Result<Mailbox> {
    let address: Address = account
        .email
        .parse()
        .with_context(|| format!("Invalid sender address {}", account.email))?;
    let name = Some(account.name.clone()).filter(|n| !n.trim().is_empty());
    Ok(Mailbox::new(name, address))
}

/// Builds the HTML message for one recipient.
pub fn build_message(from: &Mailbox, to: &str, subject: &str, body: &str) -> Result<Message> {
    let to: Mailbox = to
        .parse()
        .with_context(|| format!("Invalid recipient address {}", to))?;

    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(subject)
        .header(ContentType::TEXT_HTML)
        .body(body.to_string())
        .context("Failed to build message")
}

impl Sender for SmtpSender {
    fn send(&mut self, to: &str, subject: &str, body: &str) -> SendOutcome {
        let message = match build_message(&self.from, to, subject, body) {
            Ok(message) => message,
            Err(e) => {
                return SendOutcome::Failed {
                    detail: format!("{:#}", e),
                }
            }
        };

        match self.mailer.send(&message) {
            Ok(response) => {
                let message_id = response
                    .message()
                    .map(|line| line.to_string())
                    .collect::<Vec<String>>()
                    .join(" ");
                log::debug!("SMTP accepted message to {}: {}", to, message_id);
                SendOutcome::Delivered {
                    message_id: Some(message_id).filter(|id| !id.is_empty()),
                }
            }
            Err(e) => SendOutcome::Failed {
                detail: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> SenderAccount {
        SenderAccount {
            name: "Ghost Band".to_string(),
            email: "band@example.com".to_string(),
            ..SenderAccount::default()
        }
    }

    #[test]
    fn test_sender_mailbox_uses_display_name() {
        let mailbox = sender_mailbox(&account()).unwrap();
        assert_eq!(mailbox.name.as_deref(), Some("Ghost Band"));
        assert_eq!(mailbox.email.to_string(), "band@example.com");

        let anonymous = SenderAccount {
            name: "  ".to_string(),
            ..account()
        };
        assert!(sender_mailbox(&anonymous).unwrap().name.is_none());
    }

    #[test]
    fn test_build_message_rejects_bad_recipient() {
        let from = sender_mailbox(&account()).unwrap();

        let err = build_message(&from, "not an address", "Hi", "<p>Hi</p>").unwrap_err();
        assert!(err.to_string().contains("not an address"));

        let message = build_message(&from, "fan@example.com", "New single", "<p>Hi</p>").unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: New single"));
        assert!(raw.contains("text/html"));
    }

    struct NoSecrets;

    impl Credentials for NoSecrets {
        fn secret(&self, _account: &str, _kind: SecretKind) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn test_missing_password_fails_construction() {
        let result = SmtpSender::new(&account(), &NoSecrets);
        assert!(result.is_err());
    }
}
