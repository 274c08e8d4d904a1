//! Shard-set resolution.
//!
//! Turns the argument list of `shard-merge merge` into the ordered list of
//! shard paths to operate on. The sole argument `-` switches to reading one
//! path per line from standard input.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Argument that selects the stdin path list.
pub const STDIN_SENTINEL: &str = "-";

/// Errors raised while resolving a shard set. No filesystem mutation has
/// happened when one of these is returned.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Standard input could not be read to completion.
    #[error("failed to read shard paths from stdin after {read} line(s): {source}")]
    Stdin {
        /// Lines successfully read before the failure.
        read: usize,
        /// The underlying read error.
        #[source]
        source: std::io::Error,
    },

    /// The argument list (or the stdin list) named no shards at all.
    #[error("no shard paths given (pass paths as arguments, or `-` to read them from stdin)")]
    Empty,
}

/// An ordered, non-empty list of shard paths.
///
/// The order is caller-supplied precedence and is never changed here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardSet {
    paths: Vec<PathBuf>,
}

impl ShardSet {
    /// Build a shard set from paths, rejecting an empty list.
    ///
    /// # Errors
    /// Returns [`ResolveError::Empty`] if `paths` is empty.
    pub fn new(paths: Vec<PathBuf>) -> Result<Self, ResolveError> {
        if paths.is_empty() {
            return Err(ResolveError::Empty);
        }
        Ok(Self { paths })
    }

    /// The shard paths, in precedence order.
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Number of shards in the set (always at least one).
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Always `false`; present for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Directory the compound shard is written to: the parent of the first
    /// input. A bare file name resolves to the current directory.
    #[must_use]
    pub fn destination_dir(&self) -> PathBuf {
        match self.paths[0].parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Resolve the shard set named by `args`.
///
/// If `args` is exactly `["-"]`, paths are read from `stdin` one per line.
/// Each line is trimmed and blank lines are skipped. Otherwise `args` is
/// used as-is, in order.
pub fn resolve_shard_set<R: BufRead>(args: &[String], stdin: R) -> Result<ShardSet, ResolveError> {
    if let [only] = args
        && only == STDIN_SENTINEL
    {
        let paths = read_path_list(stdin)?;
        tracing::info!(count = paths.len(), "merging {} paths from stdin", paths.len());
        return ShardSet::new(paths);
    }

    ShardSet::new(args.iter().map(PathBuf::from).collect())
}

fn read_path_list<R: BufRead>(stdin: R) -> Result<Vec<PathBuf>, ResolveError> {
    let mut paths = Vec::new();
    for (read, line) in stdin.lines().enumerate() {
        let line = line.map_err(|source| ResolveError::Stdin { read, source })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        paths.push(Path::new(trimmed).to_path_buf());
    }
    Ok(paths)
}
