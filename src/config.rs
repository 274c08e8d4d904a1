//! `shard-merge` configuration (`shard-merge.toml`).
//!
//! Every field has a default; a missing file means all defaults. Unknown
//! fields are rejected so typos surface instead of being ignored.
//!
//! ```toml
//! [merge]
//! journal = true     # persist merge progress for `shard-merge recover`
//! fsync_dir = true   # fsync the shard directory after activation
//!
//! [index]
//! meta_suffix = ".meta"
//! fsync = true       # fsync shard files before they are renamed into place
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardMergeConfig {
    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub index: IndexConfig,
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// Merge orchestrator settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Keep a journal of the in-flight merge in the destination directory.
    #[serde(default = "default_true")]
    pub journal: bool,

    /// fsync the destination directory after the compound shard is renamed
    /// into place.
    #[serde(default = "default_true")]
    pub fsync_dir: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            journal: true,
            fsync_dir: true,
        }
    }
}

// ---------------------------------------------------------------------------
// IndexConfig
// ---------------------------------------------------------------------------

/// Settings for the on-disk shard format.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Suffix appended to a shard's primary path to name its metadata
    /// companion file.
    #[serde(default = "default_meta_suffix")]
    pub meta_suffix: String,

    /// fsync shard files (and the directory, after explode) before they are
    /// considered written.
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            meta_suffix: default_meta_suffix(),
            fsync: true,
        }
    }
}

fn default_meta_suffix() -> String {
    ".meta".to_owned()
}

const fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// A configuration file could not be read or parsed.
#[derive(Debug)]
pub struct ConfigError {
    /// The file being loaded, if any.
    pub path: Option<PathBuf>,
    /// What went wrong, with the line number when known.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl ShardMergeConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on I/O errors other than not-found, invalid
    /// TOML, unknown fields, or an empty `meta_suffix`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on invalid TOML, unknown fields, or an empty
    /// `meta_suffix`.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;

        // An empty suffix would make a shard its own companion.
        if config.index.meta_suffix.is_empty() {
            return Err(ConfigError {
                path: None,
                message: "index.meta_suffix must not be empty".to_owned(),
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ShardMergeConfig::default();
        assert!(cfg.merge.journal);
        assert!(cfg.merge.fsync_dir);
        assert_eq!(cfg.index.meta_suffix, ".meta");
        assert!(cfg.index.fsync);
    }

    #[test]
    fn parse_empty_string() {
        assert_eq!(ShardMergeConfig::parse("").unwrap(), ShardMergeConfig::default());
    }

    #[test]
    fn parse_partial_sections() {
        let cfg = ShardMergeConfig::parse("[merge]\njournal = false\n").unwrap();
        assert!(!cfg.merge.journal);
        assert!(cfg.merge.fsync_dir);
        assert_eq!(cfg.index, IndexConfig::default());
    }

    #[test]
    fn parse_full() {
        let cfg = ShardMergeConfig::parse(
            r#"
[merge]
journal = false
fsync_dir = false

[index]
meta_suffix = ".json"
fsync = false
"#,
        )
        .unwrap();
        assert!(!cfg.merge.journal);
        assert!(!cfg.merge.fsync_dir);
        assert_eq!(cfg.index.meta_suffix, ".json");
        assert!(!cfg.index.fsync);
    }

    #[test]
    fn unknown_field_reports_line() {
        let err = ShardMergeConfig::parse("[merge]\njournal = true\nretries = 3\n").unwrap_err();
        assert!(err.message.starts_with("line "), "got: {}", err.message);
        assert!(err.message.contains("retries"), "got: {}", err.message);
    }

    #[test]
    fn empty_meta_suffix_rejected() {
        let err = ShardMergeConfig::parse("[index]\nmeta_suffix = \"\"\n").unwrap_err();
        assert!(err.message.contains("meta_suffix"));
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ShardMergeConfig::load(&dir.path().join("shard-merge.toml")).unwrap();
        assert_eq!(cfg, ShardMergeConfig::default());
    }

    #[test]
    fn load_attaches_path_to_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard-merge.toml");
        std::fs::write(&path, "[merge\n").unwrap();
        let err = ShardMergeConfig::load(&path).unwrap_err();
        assert_eq!(err.path.as_deref(), Some(path.as_path()));
        assert!(err.to_string().starts_with(&path.display().to_string()));
    }
}
