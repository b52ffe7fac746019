//! Configuration for objbd volumes
//!
//! Defaults live in the `Default` impls; every field can be overridden from
//! the environment with an `OBJBD_`-prefixed variable (`OBJBD_BATCH_SIZE`,
//! `OBJBD_CACHE_DIR`, ...). Config-file loading is left to the embedding
//! application.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Object-store driver selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One file per object under a local directory
    File,
    /// RADOS pool (driver provided by the embedding application)
    Rados,
}

/// Volume configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Maximum bytes per backend DATA object (translation batch capacity)
    pub batch_size: usize,
    /// Sub-writes queued before a journal flush is forced under load
    pub wcache_batch: usize,
    /// Directory holding the volume's local cache device file
    pub cache_dir: PathBuf,
    /// Translation worker thread count
    pub xlate_threads: usize,
    /// Maximum in-flight backend objects
    pub xlate_window: usize,
    /// Object-store driver
    pub backend: BackendKind,
    /// Local device footprint for read + write caches combined, in bytes
    pub cache_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 8 * 1024 * 1024,
            wcache_batch: 8,
            cache_dir: PathBuf::from("/tmp"),
            xlate_threads: 2,
            xlate_window: 8,
            backend: BackendKind::File,
            cache_size: 32 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Overlay `OBJBD_*` environment variables onto this config
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_var("OBJBD_BATCH_SIZE") {
            self.batch_size = parse_num(&v, "OBJBD_BATCH_SIZE")?;
        }
        if let Some(v) = env_var("OBJBD_WCACHE_BATCH") {
            self.wcache_batch = parse_num(&v, "OBJBD_WCACHE_BATCH")?;
        }
        if let Some(v) = env_var("OBJBD_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("OBJBD_XLATE_THREADS") {
            self.xlate_threads = parse_num(&v, "OBJBD_XLATE_THREADS")?;
        }
        if let Some(v) = env_var("OBJBD_XLATE_WINDOW") {
            self.xlate_window = parse_num(&v, "OBJBD_XLATE_WINDOW")?;
        }
        if let Some(v) = env_var("OBJBD_BACKEND") {
            self.backend = match v.as_str() {
                "file" => BackendKind::File,
                "rados" => BackendKind::Rados,
                other => {
                    return Err(Error::Configuration(format!(
                        "unknown backend '{}' (expected file or rados)",
                        other
                    )))
                }
            };
        }
        if let Some(v) = env_var("OBJBD_CACHE_SIZE") {
            self.cache_size = parse_num(&v, "OBJBD_CACHE_SIZE")?;
        }
        self.validate()
    }

    /// Reject configurations the volume cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size < 4096 {
            return Err(Error::Configuration(
                "batch_size must be at least one page".into(),
            ));
        }
        if self.xlate_threads == 0 || self.xlate_window == 0 {
            return Err(Error::Configuration(
                "xlate_threads and xlate_window must be non-zero".into(),
            ));
        }
        if self.cache_size < 1024 * 1024 {
            return Err(Error::Configuration(
                "cache_size must be at least 1 MiB".into(),
            ));
        }
        Ok(())
    }

    /// Path of the local cache device file for `volume`
    pub fn cache_path(&self, volume: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.cache", volume))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_num<T: std::str::FromStr>(v: &str, name: &str) -> Result<T> {
    v.parse()
        .map_err(|_| Error::Configuration(format!("{}: invalid value '{}'", name, v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.batch_size, 8 * 1024 * 1024);
        assert_eq!(cfg.wcache_batch, 8);
        assert_eq!(cfg.xlate_threads, 2);
        assert_eq!(cfg.xlate_window, 8);
        assert_eq!(cfg.backend, BackendKind::File);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_cache_path() {
        let cfg = Config::default();
        assert_eq!(cfg.cache_path("vol0"), PathBuf::from("/tmp/vol0.cache"));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let cfg = Config {
            xlate_window: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
