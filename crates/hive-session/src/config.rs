//! Configuration for cluster session managers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default name of the attribute that toggles keep-alive.
pub const DEFAULT_STICKY_SESSION_KEY: &str = "_hive.stickySession";

/// Default delay between idle sweeps, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 120;

/// Default idle window handed to newly created sessions, in seconds.
pub const DEFAULT_MAX_IDLE_SECS: i64 = 1800;

/// Default retry budget for versioned metadata updates.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// How metadata read-modify-write cycles behave under concurrent writers.
///
/// ```toml
/// [session]
/// consistency = { mode = "versioned", max_retries = 8 }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Plain get, mutate, put. The later writer's full record wins and a
    /// concurrent change to the same record may be lost.
    #[default]
    LastWriterWins,

    /// Compare-and-replace against the record's version, retrying on conflict.
    Versioned {
        /// Conflicts tolerated before the update fails.
        #[serde(default = "default_max_retries")]
        max_retries: u32,
    },
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Configuration for a session manager.
///
/// ```toml
/// [session]
/// sticky_session_key = "_hive.stickySession"
/// sweep_interval_ms = 120000
/// invalidate_on_redeploy = false
/// default_max_idle_secs = 1800
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Attribute whose boolean value exempts a session from idle eviction.
    pub sticky_session_key: String,

    /// Delay between the end of one idle sweep and the start of the next,
    /// in milliseconds. Must be positive.
    pub sweep_interval_ms: u64,

    /// Remove every session on manager stop instead of leaving them for
    /// other nodes.
    pub invalidate_on_redeploy: bool,

    /// Idle window for new sessions. Zero or negative disables eviction.
    pub default_max_idle_secs: i64,

    /// Metadata update policy.
    pub consistency: ConsistencyMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sticky_session_key: DEFAULT_STICKY_SESSION_KEY.to_string(),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_SECS * 1000,
            invalidate_on_redeploy: false,
            default_max_idle_secs: DEFAULT_MAX_IDLE_SECS,
            consistency: ConsistencyMode::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    session: SessionConfig,
}

impl SessionConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `[session]` table of a TOML document.
    ///
    /// A document without the table yields the defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let doc: ConfigDocument = toml::from_str(source)?;
        doc.session.validate()?;
        Ok(doc.session)
    }

    /// Check values the reaper cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the sticky-session attribute name.
    pub fn with_sticky_session_key(mut self, key: impl Into<String>) -> Self {
        self.sticky_session_key = key.into();
        self
    }

    /// Set the delay between idle sweeps. Sub-millisecond precision is dropped.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enable or disable removing all sessions on stop.
    pub fn with_invalidate_on_redeploy(mut self, enabled: bool) -> Self {
        self.invalidate_on_redeploy = enabled;
        self
    }

    /// Set the idle window for new sessions.
    pub fn with_default_max_idle_secs(mut self, secs: i64) -> Self {
        self.default_max_idle_secs = secs;
        self
    }

    /// Set the metadata update policy.
    pub fn with_consistency(mut self, mode: ConsistencyMode) -> Self {
        self.consistency = mode;
        self
    }

    /// Delay between idle sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Idle window for new sessions in milliseconds.
    pub fn default_max_idle_ms(&self) -> i64 {
        self.default_max_idle_secs.saturating_mul(1000)
    }
}
