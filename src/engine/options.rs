//! Session and per-run configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::memory::ArenaConfig;

/// Overrides `num_threads` when set.
pub const ENV_NUM_THREADS: &str = "STRATA_NUM_THREADS";
/// Overrides `enable_mem_pattern` when set (`1`/`true` or `0`/`false`).
pub const ENV_MEM_PATTERN: &str = "STRATA_MEM_PATTERN";

/// Session-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Worker threads in the session pool; 0 picks the machine default.
    pub num_threads: usize,
    /// Backend names in placement preference order. The host backend is appended when
    /// missing.
    pub backends: Vec<String>,
    /// Record and replay per-shape memory patterns on sequential runs.
    pub enable_mem_pattern: bool,
    /// Let `run` initialize a loaded session instead of failing.
    pub initialize_on_first_run: bool,
    pub arena: ArenaConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            num_threads: 0,
            backends: vec!["cpu".to_string()],
            enable_mem_pattern: true,
            initialize_on_first_run: false,
            arena: ArenaConfig::default(),
        }
    }
}

impl SessionOptions {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        options.apply_env();
        options
    }

    /// Load options from a JSON file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path)?;
        let mut options: SessionOptions = serde_json::from_str(&text).map_err(|e| {
            RuntimeError::ParseFailure(format!("session options '{}': {}", path.display(), e))
        })?;
        options.apply_env();
        debug!(path = %path.display(), ?options, "Loaded session options");
        Ok(options)
    }

    /// Apply `STRATA_NUM_THREADS` and `STRATA_MEM_PATTERN`. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(ENV_NUM_THREADS) {
            match value.trim().parse::<usize>() {
                Ok(n) => self.num_threads = n,
                Err(_) => warn!(var = ENV_NUM_THREADS, value = %value, "Ignoring invalid value"),
            }
        }
        if let Ok(value) = std::env::var(ENV_MEM_PATTERN) {
            match value.trim() {
                "1" | "true" => self.enable_mem_pattern = true,
                "0" | "false" => self.enable_mem_pattern = false,
                _ => warn!(var = ENV_MEM_PATTERN, value = %value, "Ignoring invalid value"),
            }
        }
    }
}

/// Per-run configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Run nodes one at a time in topological order instead of in parallel.
    pub sequential: bool,
    /// Give up waiting after this many milliseconds; 0 waits forever.
    pub timeout_ms: u64,
    /// Free-form label echoed in logs.
    pub tag: String,
}

impl RunOptions {
    pub fn sequential() -> Self {
        Self {
            sequential: true,
            ..Default::default()
        }
    }

    pub fn parallel() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: SessionOptions =
            serde_json::from_str(r#"{"num_threads": 3, "arena": {"max_mem": 4096}}"#).unwrap();
        assert_eq!(options.num_threads, 3);
        assert_eq!(options.backends, vec!["cpu"]);
        assert!(options.enable_mem_pattern);
        assert_eq!(options.arena.max_mem, 4096);
        assert_eq!(options.arena.initial_chunk_bytes, ArenaConfig::default().initial_chunk_bytes);
    }

    #[test]
    fn test_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"backends": ["emulated", "cpu"], "enable_mem_pattern": false}"#)
            .unwrap();
        std::env::remove_var(ENV_MEM_PATTERN);
        let options = SessionOptions::from_file(&path).unwrap();
        assert_eq!(options.backends, vec!["emulated", "cpu"]);
        assert!(!options.enable_mem_pattern);
    }

    #[test]
    fn test_from_file_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            SessionOptions::from_file(&path),
            Err(RuntimeError::ParseFailure(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SessionOptions::from_file(&dir.path().join("absent.json")),
            Err(RuntimeError::Io(_))
        ));
    }

    #[test]
    fn test_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original_threads = std::env::var(ENV_NUM_THREADS).ok();
        let original_pattern = std::env::var(ENV_MEM_PATTERN).ok();

        std::env::set_var(ENV_NUM_THREADS, "7");
        std::env::set_var(ENV_MEM_PATTERN, "0");
        let options = SessionOptions::from_env();
        assert_eq!(options.num_threads, 7);
        assert!(!options.enable_mem_pattern);

        std::env::set_var(ENV_NUM_THREADS, "many");
        let options = SessionOptions::from_env();
        assert_eq!(options.num_threads, 0);

        // Restore
        match original_threads {
            Some(val) => std::env::set_var(ENV_NUM_THREADS, val),
            None => std::env::remove_var(ENV_NUM_THREADS),
        }
        match original_pattern {
            Some(val) => std::env::set_var(ENV_MEM_PATTERN, val),
            None => std::env::remove_var(ENV_MEM_PATTERN),
        }
    }

    #[test]
    fn test_run_options_builders() {
        let opts = RunOptions::sequential().with_timeout(50).with_tag("warmup");
        assert!(opts.sequential);
        assert_eq!(opts.timeout_ms, 50);
        assert_eq!(opts.tag, "warmup");
        assert!(!RunOptions::parallel().sequential);
    }
}
