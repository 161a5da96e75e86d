//! Runtime identifier helpers.

/// Returns a fresh random suffix used for instance, window and workflow ids.
pub(crate) fn rand_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Replaces spaces with underscores, the durable-key form of a plugin name.
pub(crate) fn durable_key(name: &str) -> String {
    name.replace(' ', "_")
}

/// Builds a runtime instance id from a plugin name.
pub(crate) fn instance_id(name: &str) -> String {
    format!("{}_{}", durable_key(name.trim()), rand_id())
}
