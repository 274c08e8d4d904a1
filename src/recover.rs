//! Crash recovery for interrupted merges.
//!
//! A merge that dies leaves its journal behind. What recovery does depends
//! on how far the journal says it got:
//!
//! | phase        | action                                              |
//! |--------------|-----------------------------------------------------|
//! | `opening`    | unwind: drop the journal                            |
//! | `merging`    | unwind: drop the temporary output and the journal   |
//! | `deleting`   | roll forward: finish deleting inputs, then activate |
//! | `activating` | roll forward: rename the output into place          |
//!
//! Every step tolerates having already happened, so running recovery again
//! after it was itself interrupted is safe.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

use crate::index::{IndexError, ShardIndex, file::sync_dir, sweep_merge_temporaries};
use crate::merge_state::{MergeJournal, MergePhase, MergeStateError, remove_journal};

/// What [`recover`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// There was no journal in the directory.
    NoMergeInProgress,
    /// A merge that never deleted anything was discarded. The inputs are
    /// intact.
    Unwound { from: MergePhase },
    /// A merge that had started deleting inputs was finished.
    RolledForward { from: MergePhase, canonical: PathBuf },
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMergeInProgress => write!(f, "no merge in progress"),
            Self::Unwound { from } => {
                write!(f, "unwound merge interrupted while {from}; inputs untouched")
            }
            Self::RolledForward { from, canonical } => write!(
                f,
                "finished merge interrupted while {from}: {}",
                canonical.display()
            ),
        }
    }
}

/// Why recovery stopped. The journal is kept in every case so recovery can
/// be retried.
#[derive(Debug, Error)]
pub enum RecoverError {
    /// The journal could not be read, or could not be removed at the end.
    #[error("merge journal in {}: {source}", dir.display())]
    Journal {
        dir: PathBuf,
        #[source]
        source: MergeStateError,
    },

    /// The journal is past deletion but does not name the compound shard.
    #[error(
        "merge journal in {} is in phase '{phase}' but does not record the compound shard paths",
        dir.display()
    )]
    Incomplete { dir: PathBuf, phase: MergePhase },

    /// The temporary compound shard is gone and nothing was activated under
    /// the canonical name.
    #[error(
        "compound shard is missing: {} does not exist and {} does not hold the merged output.\n  The journal at {} was kept; the inputs it lists may already be gone",
        temporary.display(),
        canonical.display(),
        journal.display()
    )]
    MissingOutput {
        temporary: PathBuf,
        canonical: PathBuf,
        journal: PathBuf,
    },

    /// The files of an input shard could not be listed.
    #[error("list files of input shard {}: {source}", path.display())]
    Enumerate {
        path: PathBuf,
        #[source]
        source: IndexError,
    },

    /// Abandoned merge outputs in the directory could not be cleared.
    #[error("clear abandoned compound shards in {}: {source}", dir.display())]
    Sweep {
        dir: PathBuf,
        #[source]
        source: IndexError,
    },

    /// A leftover file could not be removed.
    #[error("remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The compound shard could not be renamed into place.
    #[error("rename compound shard {} → {}: {source}", temporary.display(), canonical.display())]
    Activate {
        temporary: PathBuf,
        canonical: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Finish or discard the merge recorded in `dst_dir`'s journal.
#[instrument(skip_all, fields(dir = %dst_dir.display()))]
pub fn recover<I: ShardIndex + ?Sized>(
    index: &I,
    dst_dir: &Path,
) -> Result<RecoveryOutcome, RecoverError> {
    let journal_path = MergeJournal::path_in(dst_dir);
    let journal_err = |source| RecoverError::Journal {
        dir: dst_dir.to_path_buf(),
        source,
    };

    let Some(journal) = MergeJournal::read_optional(&journal_path).map_err(journal_err)? else {
        tracing::info!("no merge journal; nothing to recover");
        return Ok(RecoveryOutcome::NoMergeInProgress);
    };
    tracing::info!(
        phase = %journal.phase,
        inputs = journal.inputs.len(),
        failure = journal.failure.as_deref().unwrap_or(""),
        "found merge journal"
    );

    if !journal.phase.inputs_at_risk() {
        if let Some(temporary) = &journal.temporary {
            remove_if_present(temporary)?;
        }
        // The journal only learns the output's name after the primitive
        // returns, so a crash in between leaves an unrecorded one.
        sweep_merge_temporaries(index, dst_dir).map_err(|source| RecoverError::Sweep {
            dir: dst_dir.to_path_buf(),
            source,
        })?;
        remove_journal(&journal_path).map_err(journal_err)?;
        tracing::info!(from = %journal.phase, "merge unwound");
        return Ok(RecoveryOutcome::Unwound {
            from: journal.phase,
        });
    }

    let (Some(temporary), Some(canonical)) = (&journal.temporary, &journal.canonical) else {
        return Err(RecoverError::Incomplete {
            dir: dst_dir.to_path_buf(),
            phase: journal.phase,
        });
    };

    // Never finish deleting inputs unless the output survived. Before
    // activation the canonical name may still belong to an input.
    let temporary_present = exists(temporary)?;
    let output_present = match journal.phase {
        MergePhase::Activating => temporary_present || exists(canonical)?,
        _ => temporary_present,
    };
    if !output_present {
        return Err(RecoverError::MissingOutput {
            temporary: temporary.clone(),
            canonical: canonical.clone(),
            journal: journal_path,
        });
    }

    if journal.phase == MergePhase::Deleting {
        for input in &journal.inputs {
            let files = index
                .paths_of(input)
                .map_err(|source| RecoverError::Enumerate {
                    path: input.clone(),
                    source,
                })?;
            for file in &files {
                remove_if_present(file)?;
            }
        }
    }

    if temporary_present {
        fs::rename(temporary, canonical).map_err(|source| RecoverError::Activate {
            temporary: temporary.clone(),
            canonical: canonical.clone(),
            source,
        })?;
        if let Err(e) = sync_dir(dst_dir) {
            tracing::warn!(error = %e, "fsync of shard directory failed after activation");
        }
    } else {
        tracing::debug!(canonical = %canonical.display(), "compound shard already activated");
    }

    remove_journal(&journal_path).map_err(journal_err)?;
    tracing::info!(from = %journal.phase, compound = %canonical.display(), "merge rolled forward");
    Ok(RecoveryOutcome::RolledForward {
        from: journal.phase,
        canonical: canonical.clone(),
    })
}

fn exists(path: &Path) -> Result<bool, RecoverError> {
    path.try_exists().map_err(|source| RecoverError::Remove {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_if_present(path: &Path) -> Result<(), RecoverError> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RecoverError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
