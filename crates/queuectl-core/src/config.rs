use std::path::PathBuf;

/// Process-wide paths the engine needs but never hardcodes.
///
/// These are the only pieces of configuration that live outside the
/// database; everything else (`max_retries`, `backoff_base`) is a row in
/// the `config` table and is read through [`crate::jobs::store::Store`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub pid_file: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("queue.db"),
            log_dir: PathBuf::from("logs"),
            pid_file: PathBuf::from("queuectl.pid"),
        }
    }
}

impl EngineConfig {
    pub fn new(db_path: PathBuf, log_dir: PathBuf, pid_file: PathBuf) -> Self {
        Self {
            db_path,
            log_dir,
            pid_file,
        }
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.db_path.display())
    }
}

/// Recognized `config` table keys and their defaults. Any other key is
/// rejected by the `config set` writer but silently ignored if it somehow
/// ends up in the table (the engine only ever reads these two).
pub const CONFIG_KEY_MAX_RETRIES: &str = "max_retries";
pub const CONFIG_KEY_BACKOFF_BASE: &str = "backoff_base";
pub const DEFAULT_MAX_RETRIES: &str = "3";
pub const DEFAULT_BACKOFF_BASE: &str = "2";
pub const DEFAULT_TIMEOUT_SECS: i64 = 300;

pub fn is_recognized_key(key: &str) -> bool {
    matches!(key, CONFIG_KEY_MAX_RETRIES | CONFIG_KEY_BACKOFF_BASE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_keys() {
        assert!(!is_recognized_key("retries_max"));
        assert!(is_recognized_key(CONFIG_KEY_MAX_RETRIES));
        assert!(is_recognized_key(CONFIG_KEY_BACKOFF_BASE));
    }

    #[test]
    fn database_url_prefixes_sqlite() {
        let cfg = EngineConfig::new("foo.db".into(), "logs".into(), "foo.pid".into());
        assert_eq!(cfg.database_url(), "sqlite:foo.db");
    }
}
