use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{DispatchSettings, Quota};
use crate::planner::DEFAULT_BATCH_SIZE;
use crate::template::{MessageTemplate, DEFAULT_NAME};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Failed to create config directory {path}: {source}")]
    CreateDirError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid setting '{field}': {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmtpSecurity {
    None,
    StartTLS,
    SSL,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImapSecurity {
    None,
    StartTLS,
    SSL,
}

/// The outbound account campaigns are sent from. Passwords live in the keyring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderAccount {
    pub name: String,
    pub email: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_security: SmtpSecurity,
    pub smtp_username: String,
}

impl Default for SenderAccount {
    fn default() -> Self {
        Self {
            name: "GhostBot".to_string(),
            email: "user@example.com".to_string(),
            smtp_server: "smtp.example.com".to_string(),
            smtp_port: 587,
            smtp_security: SmtpSecurity::StartTLS,
            smtp_username: "user@example.com".to_string(),
        }
    }
}

/// Mailbox searched for replies before follow-ups go out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxAccount {
    pub imap_server: String,
    pub imap_port: u16,
    pub imap_security: ImapSecurity,
    pub imap_username: String,
    #[serde(default = "default_inbox_folder")]
    pub folder: String,
}

fn default_inbox_folder() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub pacing_delay_ms: u64,
    /// Provider send cap per window. When set it also becomes the batch size.
    pub daily_quota: Option<usize>,
    pub quota_window_hours: u64,
    pub default_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            pacing_delay_ms: 1000,
            daily_quota: None,
            quota_window_hours: 24,
            default_name: DEFAULT_NAME.to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn to_settings(&self) -> Result<DispatchSettings, ConfigError> {
        let quota = match self.daily_quota {
            Some(limit) => {
                let limit = NonZeroUsize::new(limit).ok_or(ConfigError::InvalidSetting {
                    field: "dispatch.daily_quota",
                    reason: "must be greater than zero".to_string(),
                })?;
                if self.quota_window_hours == 0 {
                    return Err(ConfigError::InvalidSetting {
                        field: "dispatch.quota_window_hours",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Some(Quota {
                    limit,
                    window: chrono::Duration::hours(self.quota_window_hours as i64),
                })
            }
            None => None,
        };

        let batch_size = match quota {
            Some(quota) => quota.limit,
            None => NonZeroUsize::new(self.batch_size).ok_or(ConfigError::InvalidSetting {
                field: "dispatch.batch_size",
                reason: "must be greater than zero".to_string(),
            })?,
        };

        Ok(DispatchSettings {
            batch_size,
            pacing_delay: Duration::from_millis(self.pacing_delay_ms),
            quota,
            default_name: self.default_name.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowUpConfig {
    pub delay_hours: u64,
    pub subject: String,
    pub body: String,
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            delay_hours: 72,
            subject: "Following up".to_string(),
            body: "Hi {name}, just checking in as promised.<br><br>GhostBot".to_string(),
        }
    }
}

impl FollowUpConfig {
    pub fn delay(&self) -> chrono::Duration {
        chrono::Duration::hours(self.delay_hours as i64)
    }

    pub fn template(&self) -> MessageTemplate {
        MessageTemplate::new(self.subject.clone(), self.body.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sender: SenderAccount,
    #[serde(default)]
    pub inbox: Option<InboxAccount>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub follow_up: FollowUpConfig,
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ghostbot")
        .join("campaigns.db")
        .to_string_lossy()
        .into_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sender: SenderAccount::default(),
            inbox: None,
            dispatch: DispatchConfig::default(),
            follow_up: FollowUpConfig::default(),
            database_path: default_database_path(),
        }
    }
}

impl Config {
    /// Reads the config at `path`, falling back to defaults when there is no file yet.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let path = Path::new(path);
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDirError {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let config = Config::load(path.to_str().unwrap()).unwrap();

        assert_eq!(config.dispatch.batch_size, 500);
        assert_eq!(config.dispatch.pacing_delay_ms, 1000);
        assert!(config.inbox.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let path = path.to_str().unwrap();
        let mut config = Config::default();
        config.sender.email = "me@band.com".to_string();
        config.dispatch.daily_quota = Some(100);

        config.save(path).unwrap();
        let loaded = Config::load(path).unwrap();

        assert_eq!(loaded.sender.email, "me@band.com");
        assert_eq!(loaded.dispatch.daily_quota, Some(100));
    }

    #[test]
    fn test_save_reports_directory_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();
        let path = blocker.join("config.json");

        let err = Config::default().save(path.to_str().unwrap()).unwrap_err();

        match &err {
            ConfigError::CreateDirError { path, .. } => assert_eq!(path, &blocker),
            other => panic!("expected directory error, got {:?}", other),
        }
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{
            "sender": {
                "name": "Me", "email": "me@x.com",
                "smtp_server": "smtp.x.com", "smtp_port": 465,
                "smtp_security": "SSL", "smtp_username": "me"
            },
            "dispatch": { "batch_size": 50 }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.sender.smtp_security, SmtpSecurity::SSL);
        assert_eq!(config.dispatch.batch_size, 50);
        assert_eq!(config.dispatch.quota_window_hours, 24);
        assert_eq!(config.follow_up.delay_hours, 72);
    }

    #[test]
    fn test_quota_sets_batch_size() {
        let config = DispatchConfig {
            daily_quota: Some(100),
            ..DispatchConfig::default()
        };

        let settings = config.to_settings().unwrap();

        assert_eq!(settings.batch_size.get(), 100);
        let quota = settings.quota.unwrap();
        assert_eq!(quota.limit.get(), 100);
        assert_eq!(quota.window, chrono::Duration::hours(24));
    }

    #[test]
    fn test_zero_sizes_are_rejected() {
        let zero_batch = DispatchConfig {
            batch_size: 0,
            ..DispatchConfig::default()
        };
        assert!(matches!(
            zero_batch.to_settings(),
            Err(ConfigError::InvalidSetting { field: "dispatch.batch_size", .. })
        ));

        let zero_quota = DispatchConfig {
            daily_quota: Some(0),
            ..DispatchConfig::default()
        };
        assert!(zero_quota.to_settings().is_err());
    }
}
