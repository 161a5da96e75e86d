//! User-facing message channel.

use std::time::Duration;

use tracing::info;

const MESSAGE_TARGET: &str = "joinery_host::messages";

/// Receives short, human-readable notices meant for the end user.
pub trait MessageSink: Send + Sync {
    /// Shows `text`, optionally for `duration`.
    fn show_message(&self, text: &str, duration: Option<Duration>);
}

/// Sink that forwards messages to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMessageSink;

impl MessageSink for TracingMessageSink {
    fn show_message(&self, text: &str, duration: Option<Duration>) {
        info!(
            target: MESSAGE_TARGET,
            duration_secs = duration.map(|value| value.as_secs()),
            "PLUGIN MESSAGE: {text}"
        );
    }
}
