//! Configuration types.
//!
//! Values are read from `MAIL_INFLOW_*` environment variables. Everything
//! except the host has a default.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default interval between poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default folder polled on the server.
pub const DEFAULT_FOLDER: &str = "INBOX";

/// Mail store protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Delete-on-consume.
    Pop3,
    /// Flag-on-consume with UID dedup.
    Imap,
}

impl Protocol {
    /// Store provider name handed to the mail connector.
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Pop3 => "pop3",
            Self::Imap => "imap",
        }
    }

    /// Well-known plaintext/STARTTLS port.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Pop3 => 110,
            Self::Imap => 143,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.provider_name())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pop3" | "pop" => Ok(Self::Pop3),
            "imap" => Ok(Self::Imap),
            other => Err(ConfigError::InvalidValue {
                key: "MAIL_INFLOW_PROTOCOL".into(),
                message: format!("unsupported protocol '{other}' (expected pop3 or imap)"),
            }),
        }
    }
}

/// Connection settings for one mailbox.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub protocol: Protocol,
    pub folder: String,
    /// Expunge consumed messages when a cycle completes successfully.
    pub flush: bool,
    pub starttls: bool,
}

impl SessionConfig {
    /// Session with protocol defaults for everything but host and credentials.
    pub fn new(
        protocol: Protocol,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: protocol.default_port(),
            username: username.into(),
            password: SecretString::from(password.into()),
            protocol,
            folder: DEFAULT_FOLDER.to_string(),
            flush: true,
            starttls: false,
        }
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn with_flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Scope string for persistent dedup state: `imap://user@host:port/INBOX`.
    pub fn scope(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.protocol, self.username, self.host, self.port, self.folder
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "MAIL_INFLOW_HOST".into(),
                hint: "Set it to the mail server hostname.".into(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_INFLOW_PORT".into(),
                message: "port must be non-zero".into(),
            });
        }
        if self.folder.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_INFLOW_FOLDER".into(),
                message: "folder name must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Full poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub session: SessionConfig,
    pub poll_interval: Duration,
    /// Upper bound on messages handled per cycle. `None` handles all.
    pub max_messages: Option<usize>,
    /// Deliveries running longer than this count as transient failures.
    pub delivery_timeout: Option<Duration>,
    /// Path of the libsql database backing the seen set.
    pub seen_db_path: Option<PathBuf>,
}

impl PollerConfig {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_messages: None,
            delivery_timeout: None,
            seen_db_path: None,
        }
    }

    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("MAIL_INFLOW_HOST")
            .ok_or_else(|| ConfigError::MissingEnvVar("MAIL_INFLOW_HOST".into()))?;

        let protocol = match lookup("MAIL_INFLOW_PROTOCOL") {
            Some(s) => s.parse()?,
            None => Protocol::Pop3,
        };

        let port = parse_opt::<u16>(&lookup, "MAIL_INFLOW_PORT")?
            .unwrap_or_else(|| protocol.default_port());

        let username = lookup("MAIL_INFLOW_USERNAME").unwrap_or_default();
        let password = lookup("MAIL_INFLOW_PASSWORD").unwrap_or_default();
        let folder = lookup("MAIL_INFLOW_FOLDER").unwrap_or_else(|| DEFAULT_FOLDER.to_string());
        let flush = parse_bool(&lookup, "MAIL_INFLOW_FLUSH")?.unwrap_or(true);
        let starttls = parse_bool(&lookup, "MAIL_INFLOW_STARTTLS")?.unwrap_or(false);

        let poll_interval = parse_opt::<u64>(&lookup, "MAIL_INFLOW_POLL_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);

        let max_messages = parse_opt::<usize>(&lookup, "MAIL_INFLOW_MAX_MESSAGES")?;
        let delivery_timeout = parse_opt::<u64>(&lookup, "MAIL_INFLOW_DELIVERY_TIMEOUT_SECS")?
            .map(Duration::from_secs);
        let seen_db_path = lookup("MAIL_INFLOW_SEEN_DB").map(PathBuf::from);

        let config = Self {
            session: SessionConfig {
                host,
                port,
                username,
                password: SecretString::from(password),
                protocol,
                folder,
                flush,
                starttls,
            },
            poll_interval,
            max_messages,
            delivery_timeout,
            seen_db_path,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_INFLOW_POLL_INTERVAL_SECS".into(),
                message: "poll interval must be at least one second".into(),
            });
        }
        if self.max_messages == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_INFLOW_MAX_MESSAGES".into(),
                message: "max messages must be positive when set".into(),
            });
        }
        Ok(())
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}' is not a boolean"),
            }),
        },
    }
}
