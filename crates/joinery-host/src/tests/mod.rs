//! Behavioural suites and shared test support for the plugin host.

pub(crate) mod support;
