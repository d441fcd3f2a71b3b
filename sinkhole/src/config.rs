//! Configuration knobs consumed by the telemetry core.
//!
//! Configuration is supplied once at start-up and is read-only afterwards.
//! Loading from disk is limited to a JSON document mirroring
//! [`TelemetryConfig`]; every field has a default so partial documents are
//! accepted.
//!
//! # Example
//!
//! ```rust
//! use sinkhole::config::{PrivacyLevel, TelemetryConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config: TelemetryConfig = serde_json::from_str(
//!     r#"{ "privacy_level": 1, "max_db_days": 30, "exclude_clients": ["10.0.0.9"] }"#,
//! )?;
//! config.validate()?;
//!
//! assert_eq!(config.privacy_level, PrivacyLevel::HideDomains);
//! assert_eq!(config.db_interval, 60);
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Seconds in a day, used to turn `max_db_days` into a cutoff timestamp.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Sentinel for `max_db_days` meaning "keep rows forever".
pub const UNLIMITED_RETENTION: i32 = -1;

/// How much identifying data the read path is allowed to return.
///
/// Levels are ordered: every level hides at least what the previous one hides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PrivacyLevel {
    /// Everything is shown.
    #[default]
    ShowAll,
    /// Domains are replaced by a hidden placeholder.
    HideDomains,
    /// Domains and clients are replaced by hidden placeholders.
    HideDomainsClients,
    /// Nothing identifying is recorded at all.
    Maximum,
}

impl PrivacyLevel {
    /// Returns true if domain names must be suppressed.
    pub fn hides_domains(self) -> bool {
        self >= Self::HideDomains
    }

    /// Returns true if client identities must be suppressed.
    pub fn hides_clients(self) -> bool {
        self >= Self::HideDomainsClients
    }
}

impl TryFrom<u8> for PrivacyLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ShowAll),
            1 => Ok(Self::HideDomains),
            2 => Ok(Self::HideDomainsClients),
            3 => Ok(Self::Maximum),
            other => Err(format!("privacy level {other} is out of range (0-3)")),
        }
    }
}

impl From<PrivacyLevel> for u8 {
    fn from(level: PrivacyLevel) -> Self {
        match level {
            PrivacyLevel::ShowAll => 0,
            PrivacyLevel::HideDomains => 1,
            PrivacyLevel::HideDomainsClients => 2,
            PrivacyLevel::Maximum => 3,
        }
    }
}

/// Complete configuration for the telemetry core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// How far back (seconds from now) history endpoints look.
    pub max_history: i64,

    /// Privacy threshold applied at ingest and on the read path.
    pub privacy_level: PrivacyLevel,

    /// Clients hidden from client-level read endpoints, by IP or by name.
    pub exclude_clients: Vec<String>,

    /// Domains hidden from the top-domains endpoint.
    pub exclude_domains: Vec<String>,

    /// Seconds between exports of pending queries to durable storage.
    pub db_interval: i64,

    /// Days of raw queries kept in durable storage; `-1` keeps everything.
    pub max_db_days: i32,

    /// Whether queries are exported to durable storage at all.
    pub db_export: bool,

    /// Number of buckets in the OverTime ring.
    pub overtime_slots: usize,

    /// Width of one OverTime bucket in seconds.
    pub overtime_interval: i64,

    /// Log every retention pass, not only those that deleted rows.
    pub debug_database: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            max_history: SECONDS_PER_DAY,
            privacy_level: PrivacyLevel::ShowAll,
            exclude_clients: Vec::new(),
            exclude_domains: Vec::new(),
            db_interval: 60,
            max_db_days: 91,
            db_export: true,
            overtime_slots: 144,
            overtime_interval: 600,
            debug_database: false,
        }
    }
}

impl TelemetryConfig {
    /// Loads a configuration from a JSON file and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON for this schema, and
    /// [`ConfigError::Invalid`] if a value fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if:
    /// - `max_history`, `db_interval` or `overtime_interval` is not positive
    /// - `overtime_slots` is zero
    /// - `max_db_days` is below `-1`
    pub fn validate(&self) -> Result<()> {
        if self.max_history <= 0 {
            return Err(invalid("max_history", format!("{} must be > 0", self.max_history)));
        }
        if self.db_interval <= 0 {
            return Err(invalid("db_interval", format!("{} must be > 0", self.db_interval)));
        }
        if self.overtime_interval <= 0 {
            return Err(invalid(
                "overtime_interval",
                format!("{} must be > 0", self.overtime_interval),
            ));
        }
        if self.overtime_slots == 0 {
            return Err(invalid("overtime_slots", "at least one slot is required".to_string()));
        }
        if self.max_db_days < UNLIMITED_RETENTION {
            return Err(invalid(
                "max_db_days",
                format!("{} must be -1 (unlimited) or >= 0", self.max_db_days),
            ));
        }
        Ok(())
    }

    /// Returns true if durable retention is enabled.
    pub fn retention_enabled(&self) -> bool {
        self.max_db_days != UNLIMITED_RETENTION
    }

    /// Returns true if `ip` or `name` is on the client exclude list.
    pub fn excludes_client(&self, ip: &str, name: Option<&str>) -> bool {
        self.exclude_clients
            .iter()
            .any(|item| item == ip || name.is_some_and(|n| item == n))
    }

    /// Returns true if `domain` is on the domain exclude list.
    pub fn excludes_domain(&self, domain: &str) -> bool {
        self.exclude_domains.iter().any(|item| item == domain)
    }
}

fn invalid(field: &'static str, reason: String) -> crate::error::SinkholeError {
    ConfigError::Invalid { field, reason }.into()
}
