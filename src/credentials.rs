use anyhow::{Context, Result};
use keyring::{Entry, Error as KeyringError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Smtp,
    Imap,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::Smtp => "smtp",
            SecretKind::Imap => "imap",
        }
    }

    /// Environment variable consulted when no keyring entry exists.
    pub fn env_var(&self) -> &'static str {
        match self {
            SecretKind::Smtp => "GHOSTBOT_SMTP_PASSWORD",
            SecretKind::Imap => "GHOSTBOT_IMAP_PASSWORD",
        }
    }
}

/// Read access to account secrets, handed to whatever owns a provider connection.
pub trait Credentials {
    fn secret(&self, account: &str, kind: SecretKind) -> Result<Option<String>>;
}

/// Looks up a secret and fails with a hint when none is stored.
pub fn require_secret(credentials: &dyn Credentials, account: &str, kind: SecretKind) -> Result<String> {
    credentials.secret(account, kind)?.with_context(|| {
        format!(
            "No {} password for {}; run `ghostbot set-password --kind {}` or set {}",
            kind.as_str(),
            account,
            kind.as_str(),
            kind.env_var()
        )
    })
}

/// Secure credential manager using system keyring
#[derive(Clone)]
pub struct KeyringCredentials {
    app_name: String,
}

impl KeyringCredentials {
    pub fn new() -> Self {
        Self {
            app_name: "ghostbot".to_string(),
        }
    }

    fn entry(&self, account: &str, kind: SecretKind) -> Result<Entry> {
        let service = format!("{}-{}", self.app_name, kind.as_str());
        Entry::new(&service, account).context("Failed to create keyring entry")
    }

    /// Store a password securely in the system keyring
    pub fn store_password(&self, account: &str, kind: SecretKind, password: &str) -> Result<()> {
        self.entry(account, kind)?
            .set_password(password)
            .context("Failed to store password in keyring")?;

        log::debug!("Password stored securely for {} ({})", account, kind.as_str());
        Ok(())
    }

    pub fn get_password(&self, account: &str, kind: SecretKind) -> Result<Option<String>> {
        match self.entry(account, kind)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to retrieve password: {}", e)),
        }
    }

    /// Check if the system keyring is available
    pub fn is_available() -> bool {
        if let Ok(entry) = Entry::new("ghostbot-availability", "check") {
            if entry.set_password("check").is_ok() {
                let _ = entry.delete_password();
                return true;
            }
        }
        false
    }
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self::new()
    }
}

/// Secrets read from `GHOSTBOT_*_PASSWORD` environment variables.
#[derive(Clone, Default)]
pub struct EnvCredentials;

impl Credentials for EnvCredentials {
    fn secret(&self, _account: &str, kind: SecretKind) -> Result<Option<String>> {
        Ok(std::env::var(kind.env_var()).ok().filter(|v| !v.is_empty()))
    }
}

/// Tries the system keyring first, then falls back to the environment.
#[derive(Clone)]
pub enum SecureCredentials {
    SystemKeyring(KeyringCredentials),
    Environment(EnvCredentials),
}

impl SecureCredentials {
    pub fn new() -> Self {
        if KeyringCredentials::is_available() {
            Self::SystemKeyring(KeyringCredentials::new())
        } else {
            log::warn!("System keyring unavailable, reading passwords from the environment");
            Self::Environment(EnvCredentials)
        }
    }

    pub fn store_password(&self, account: &str, kind: SecretKind, password: &str) -> Result<()> {
        match self {
            Self::SystemKeyring(manager) => manager.store_password(account, kind, password),
            Self::Environment(_) => anyhow::bail!(
                "No system keyring available; export {} instead",
                kind.env_var()
            ),
        }
    }
}

impl Credentials for SecureCredentials {
    fn secret(&self, account: &str, kind: SecretKind) -> Result<Option<String>> {
        match self {
            Self::SystemKeyring(manager) => match manager.get_password(account, kind)? {
                Some(password) => Ok(Some(password)),
                None => EnvCredentials.secret(account, kind),
            },
            Self::Environment(env) => env.secret(account, kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<&'static str>);

    impl Credentials for Fixed {
        fn secret(&self, _account: &str, _kind: SecretKind) -> Result<Option<String>> {
            Ok(self.0.map(str::to_string))
        }
    }

    #[test]
    fn test_require_secret_explains_missing_password() {
        let err = require_secret(&Fixed(None), "me@x.com", SecretKind::Smtp).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("me@x.com"));
        assert!(message.contains("GHOSTBOT_SMTP_PASSWORD"));

        let found = require_secret(&Fixed(Some("hunter2")), "me@x.com", SecretKind::Smtp).unwrap();
        assert_eq!(found, "hunter2");
    }

    #[test]
    fn test_env_credentials_read_variable() {
        std::env::set_var(SecretKind::Imap.env_var(), "imap-secret");
        let secret = EnvCredentials.secret("me@x.com", SecretKind::Imap).unwrap();
        std::env::remove_var(SecretKind::Imap.env_var());

        assert_eq!(secret.as_deref(), Some("imap-secret"));
    }
}
