/// Default log filter expression used by hosts embedding the plugin core.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Workspace opened when no other workspace has been selected.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Upper bound for a single manifest or plugin source fetch.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default log filter expression.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub const fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

/// Owned default workspace name.
#[must_use]
pub fn default_workspace() -> String {
    DEFAULT_WORKSPACE.to_owned()
}

/// Default fetch timeout in seconds.
#[must_use]
pub const fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}
