//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_NAME: &str = "less-shapes";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LIVE_POLL_TIMEOUT_MS: u64 = 90_000;
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

/// Configuration shared by the RPC client and the sync core it spawns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Shared-context name. Also the database file stem for the file-backed
    /// store. Tabs connecting with the same name share one sync core.
    #[serde(default = "default_name")]
    pub name: String,
    /// Endpoint returning the server's current schema version.
    pub schema_version_url: String,
    /// Directory for the file-backed store. `None` means no file system is
    /// available and the key-value-backed store is used.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// How long an RPC call waits for its response.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Timeout for a single live long-poll request. Must exceed the server's
    /// long-poll hold time.
    #[serde(default = "default_live_poll_timeout_ms")]
    pub live_poll_timeout_ms: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

fn default_live_poll_timeout_ms() -> u64 {
    DEFAULT_LIVE_POLL_TIMEOUT_MS
}

fn default_retry_base_ms() -> u64 {
    DEFAULT_RETRY_BASE_MS
}

fn default_retry_max_ms() -> u64 {
    DEFAULT_RETRY_MAX_MS
}

impl EngineConfig {
    pub fn new(schema_version_url: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            schema_version_url: schema_version_url.into(),
            data_dir: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            live_poll_timeout_ms: DEFAULT_LIVE_POLL_TIMEOUT_MS,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_max_ms: DEFAULT_RETRY_MAX_MS,
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_ms = base.as_millis() as u64;
        self.retry_max_ms = max.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        // The name ends up in a file path, so keep it to a safe alphabet.
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::config(
                "name must be non-empty and contain only alphanumeric, underscore, or hyphen characters",
            ));
        }
        if self.schema_version_url.trim().is_empty() {
            return Err(Error::config("schema_version_url must not be empty"));
        }
        for (field, value) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("http_timeout_ms", self.http_timeout_ms),
            ("live_poll_timeout_ms", self.live_poll_timeout_ms),
            ("retry_base_ms", self.retry_base_ms),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{field} must be greater than zero")));
            }
        }
        if self.retry_base_ms > self.retry_max_ms {
            return Err(Error::config("retry_base_ms must not exceed retry_max_ms"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn live_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.live_poll_timeout_ms)
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.sqlite3", self.name)))
    }

    /// Database file for a private core: `instance` keeps it apart from the
    /// shared database and from other private cores under the same name.
    pub fn private_database_path(&self, instance: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{instance}.sqlite3", self.name)))
    }
}
