//! Shared configuration for the Joinery plugin host.
//!
//! Configuration is layered by `ortho_config`: built-in defaults, then a
//! `joinery.toml` file (located via `--config-path` or `JOINERY_CONFIG_PATH`),
//! then `JOINERY_*` environment variables, then command-line flags. Hosts
//! embedding `joinery-host` load a [`Config`] once and hand it to the
//! telemetry initialiser and to the plugin host builder.

mod defaults;
mod logging;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use self::defaults::{
    DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_LOG_FILTER, DEFAULT_WORKSPACE,
    default_fetch_timeout_secs, default_log_filter, default_log_filter_string,
    default_log_format, default_workspace,
};
pub use self::logging::{LogFormat, LogFormatParseError};

/// Resolved host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "JOINERY")]
pub struct Config {
    /// Tracing filter expression, e.g. `info,joinery_host::lifecycle=debug`.
    #[serde(default = "default_log_filter_string")]
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Output format of the tracing subscriber.
    #[serde(default = "default_log_format")]
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Workspace opened at start-up.
    #[serde(default = "default_workspace")]
    #[ortho_config(default = default_workspace())]
    pub workspace: String,
    /// Timeout applied to each manifest and plugin source fetch.
    #[serde(default = "default_fetch_timeout_secs")]
    #[ortho_config(default = default_fetch_timeout_secs())]
    pub fetch_timeout_secs: u64,
    /// Skip native-kind plugins during the start-up bulk reload.
    #[serde(default)]
    #[ortho_config(default = false)]
    pub skip_native_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            workspace: default_workspace(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            skip_native_on_start: false,
        }
    }
}

impl Config {
    /// Tracing filter expression.
    #[must_use]
    pub const fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Output format of the tracing subscriber.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Workspace opened at start-up.
    #[must_use]
    pub const fn workspace(&self) -> &str {
        self.workspace.as_str()
    }

    /// Timeout applied to each fetch.
    #[must_use]
    pub const fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Whether native-kind plugins are skipped by the start-up reload.
    #[must_use]
    pub const fn skip_native_on_start(&self) -> bool {
        self.skip_native_on_start
    }
}
