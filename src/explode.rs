//! Explode orchestrator: split a compound shard back into simple shards.
//!
//! All of the work (and the no-duplication ordering) lives in the
//! collaborator's explode primitive. This layer only names the shard in the
//! error and logs the result.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

use crate::index::{IndexError, ShardIndex};

/// The explode primitive failed. The collaborator's error is kept verbatim.
#[derive(Debug, Error)]
#[error("explode {}: {source}", path.display())]
pub struct ExplodeError {
    /// The compound shard being split.
    pub path: PathBuf,
    #[source]
    pub source: IndexError,
}

/// Split `compound` into simple shards inside `dst_dir` and return their
/// canonical paths.
#[instrument(skip_all, fields(compound = %compound.display(), dst = %dst_dir.display()))]
pub fn explode_shard<I: ShardIndex + ?Sized>(
    index: &I,
    dst_dir: &Path,
    compound: &Path,
) -> Result<Vec<PathBuf>, ExplodeError> {
    let produced = index
        .explode(dst_dir, compound)
        .map_err(|source| ExplodeError {
            path: compound.to_path_buf(),
            source,
        })?;
    tracing::info!(shards = produced.len(), "explode complete");
    Ok(produced)
}

/// The directory explode writes into: the compound shard's own directory.
#[must_use]
pub fn destination_of(compound: &Path) -> PathBuf {
    match compound.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
