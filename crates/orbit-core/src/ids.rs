use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of random bytes drawn for every generated identifier.
pub const ID_BYTES: usize = 8;

/// Draw random hex identifiers until `taken` reports one as unused.
pub fn generate_id<F>(taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = [0u8; ID_BYTES];
        rng.fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        if !taken(&id) {
            return id;
        }
    }
}

/// Generate a deployment ID that does not collide with any of `existing`.
///
/// The check runs against a possibly stale local view, so the state machine
/// still rejects a colliding `Deployment.New` when it is applied.
pub fn generate_deployment_id<S: AsRef<str>>(existing: &[S]) -> String {
    generate_id(|candidate| existing.iter().any(|id| id.as_ref() == candidate))
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Nanoseconds since the epoch, strictly increasing across calls in this
/// process even when the wall clock does not advance.
fn next_timestamp() -> u64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
    let mut prev = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(prev + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(
            prev,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

/// Names one build attempt's log stream: `commit/timestamp/subpath`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildKey {
    commit: String,
    timestamp: u64,
    path: String,
}

impl BuildKey {
    /// Build key for a fresh build attempt of `commit` at `path`.
    pub fn new(commit: impl Into<String>, path: impl AsRef<str>) -> Self {
        Self::at(commit, next_timestamp(), path)
    }

    pub fn at(commit: impl Into<String>, timestamp: u64, path: impl AsRef<str>) -> Self {
        BuildKey {
            commit: commit.into(),
            timestamp,
            path: clean_path(path.as_ref()),
        }
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The normalised subpath, empty for the repository root.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit, self.timestamp)?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

impl From<BuildKey> for String {
    fn from(key: BuildKey) -> Self {
        key.to_string()
    }
}

/// Lexically clean a relative path the way a filesystem join would.
fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_shape() {
        let id = generate_id(|_| false);
        assert_eq!(id.len(), ID_BYTES * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_id_retries_on_collision() {
        use std::cell::Cell;

        let attempts = Cell::new(0);
        let id = generate_id(|_| {
            attempts.set(attempts.get() + 1);
            attempts.get() < 4
        });
        assert_eq!(attempts.get(), 4);
        assert_eq!(id.len(), 16);
    }

    #[test]
    fn test_deployment_id_with_empty_list() {
        let existing: Vec<String> = vec![];
        assert_eq!(generate_deployment_id(&existing).len(), 16);
    }

    #[test]
    fn test_build_key_format() {
        let key = BuildKey::at("abc123", 42, "services/api");
        assert_eq!(key.to_string(), "abc123/42/services/api");

        let root = BuildKey::at("abc123", 42, "");
        assert_eq!(root.to_string(), "abc123/42");
    }

    #[test]
    fn test_build_key_path_is_cleaned() {
        assert_eq!(BuildKey::at("c", 1, "/web/").to_string(), "c/1/web");
        assert_eq!(BuildKey::at("c", 1, "./a//b/../d").to_string(), "c/1/a/d");
        assert_eq!(BuildKey::at("c", 1, ".").to_string(), "c/1");
    }

    #[test]
    fn test_build_keys_for_same_commit_differ() {
        let first = BuildKey::new("deadbeef", "app");
        let second = BuildKey::new("deadbeef", "app");
        assert_ne!(first, second);
        assert_ne!(first.to_string(), second.to_string());
        assert!(second.timestamp() > first.timestamp());
    }
}
