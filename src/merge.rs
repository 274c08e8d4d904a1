//! Merge orchestrator: replace N input shards with one compound shard.
//!
//! The protocol is
//!
//! 1. **opening**: open every input; any failure leaves the directory
//!    untouched.
//! 2. **merging**: the merge primitive writes the compound shard under a
//!    temporary name.
//! 3. **deleting**: every file of every input is removed.
//! 4. **activating**: the compound shard is renamed to its canonical name.
//!
//! Deleting before activating means no content is ever visible twice under
//! canonical names. A crash before deleting leaves the pre-merge state
//! (re-running the merge is safe); a crash after it is finished by
//! `shard-merge recover`, driven by the journal written at each phase.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

use crate::config::MergeConfig;
use crate::failpoints::InjectedFault;
use crate::fp;
use crate::index::{
    IndexError, MergeOutput, OpenShards, ShardIndex, file::sync_dir, sweep_merge_temporaries,
};
use crate::merge_state::{
    MergeJournal, MergePhase, MergeStateError, PhaseMachine, remove_journal, unix_now,
};
use crate::resolve::ShardSet;

/// Knobs for one merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeOptions {
    /// Persist progress to the journal in the destination directory.
    pub journal: bool,
    /// fsync the destination directory after activation.
    pub fsync_dir: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self::from(&MergeConfig::default())
    }
}

impl From<&MergeConfig> for MergeOptions {
    fn from(config: &MergeConfig) -> Self {
        Self {
            journal: config.journal,
            fsync_dir: config.fsync_dir,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a merge stopped.
///
/// [`MergeError::Remove`], [`MergeError::Enumerate`] and
/// [`MergeError::Activate`] leave residual state: some or all inputs are
/// gone and the compound shard sits under its temporary name. Their messages
/// name the paths involved and how to finish the merge.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The same path appears more than once in the shard set.
    #[error("shard {} is listed more than once", path.display())]
    DuplicateInput { path: PathBuf },

    /// An earlier merge in the directory stopped after it began deleting
    /// inputs.
    #[error(
        "a previous merge in {} stopped in phase '{phase}' after input shards were touched.\n  To fix: shard-merge recover {}",
        dir.display(),
        dir.display()
    )]
    InProgress { dir: PathBuf, phase: MergePhase },

    /// An input shard could not be opened. Nothing was changed.
    #[error("open shard {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: IndexError,
    },

    /// The merge primitive failed. Nothing was changed.
    #[error("merge {count} shard(s) into {}: {source}", dir.display())]
    Merge {
        dir: PathBuf,
        count: usize,
        #[source]
        source: IndexError,
    },

    /// The files of an input shard could not be listed mid-deletion.
    #[error(
        "list files of input shard {}: {source}\n  {} file(s) already removed; the compound shard is at {}.\n  To fix: shard-merge recover {}",
        path.display(),
        removed.len(),
        temporary.display(),
        dir.display()
    )]
    Enumerate {
        path: PathBuf,
        #[source]
        source: IndexError,
        removed: Vec<PathBuf>,
        temporary: PathBuf,
        dir: PathBuf,
    },

    /// An input shard file could not be removed mid-deletion.
    #[error(
        "remove input shard file {}: {source}\n  {} file(s) already removed; the compound shard is at {}.\n  To fix: shard-merge recover {}",
        path.display(),
        removed.len(),
        temporary.display(),
        dir.display()
    )]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        removed: Vec<PathBuf>,
        temporary: PathBuf,
        dir: PathBuf,
    },

    /// The compound shard could not be renamed into place. All inputs are
    /// already gone; the compound shard is intact under its temporary name.
    #[error(
        "rename compound shard {} → {}: {source}\n  All input shards are removed; the compound shard is intact at {}.\n  To fix: shard-merge recover {}  (or: mv {} {})",
        temporary.display(),
        canonical.display(),
        temporary.display(),
        canonical.parent().unwrap_or(Path::new(".")).display(),
        temporary.display(),
        canonical.display()
    )]
    Activate {
        temporary: PathBuf,
        canonical: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The journal could not be read or written.
    #[error("merge journal ({phase}): {source}")]
    Journal {
        phase: MergePhase,
        #[source]
        source: MergeStateError,
    },

    /// The orchestrator attempted an illegal phase transition.
    #[error("merge protocol violation: {source}")]
    Transition {
        #[source]
        source: MergeStateError,
    },

    /// A failpoint fired.
    #[error("{phase}: {source}")]
    Injected {
        phase: MergePhase,
        #[source]
        source: InjectedFault,
    },
}

impl MergeError {
    /// The phase the merge was in when it stopped.
    #[must_use]
    pub const fn phase(&self) -> MergePhase {
        match self {
            Self::DuplicateInput { .. } | Self::InProgress { .. } | Self::Open { .. } => {
                MergePhase::Opening
            }
            Self::Merge { .. } => MergePhase::Merging,
            Self::Enumerate { .. } | Self::Remove { .. } => MergePhase::Deleting,
            Self::Activate { .. } => MergePhase::Activating,
            Self::Journal { phase, .. } | Self::Injected { phase, .. } => *phase,
            Self::Transition { source } => match source {
                MergeStateError::InvalidTransition { from, .. } => *from,
                _ => MergePhase::Failed,
            },
        }
    }

    /// `true` if input shards may already have been removed.
    #[must_use]
    pub const fn leaves_residual_state(&self) -> bool {
        self.phase().inputs_at_risk()
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Merge `shards` into one compound shard in `dst_dir` and return its
/// canonical path. On success none of the inputs remain on disk.
#[instrument(skip_all, fields(dst = %dst_dir.display(), shards = shards.len()))]
pub fn merge_shards<I: ShardIndex + ?Sized>(
    index: &I,
    dst_dir: &Path,
    shards: &ShardSet,
    options: &MergeOptions,
) -> Result<PathBuf, MergeError> {
    reject_duplicates(shards)?;

    let journal_path = MergeJournal::path_in(dst_dir);
    let mut journal = if options.journal {
        Some(begin_journal(index, &journal_path, dst_dir, shards)?)
    } else {
        None
    };

    let mut run = Run {
        index,
        dst_dir,
        options,
        machine: PhaseMachine::default(),
        journal: journal.as_mut(),
        journal_path: &journal_path,
        output: None,
    };

    match run.execute(shards) {
        Ok(canonical) => Ok(canonical),
        Err(err) => {
            run.settle_failure(&err);
            Err(err)
        }
    }
}

fn reject_duplicates(shards: &ShardSet) -> Result<(), MergeError> {
    let mut seen = HashSet::with_capacity(shards.len());
    for path in shards.paths() {
        if !seen.insert(path) {
            return Err(MergeError::DuplicateInput { path: path.clone() });
        }
    }
    Ok(())
}

/// Start a journal for a new merge, superseding one left by a merge that
/// stopped before deleting anything.
fn begin_journal<I: ShardIndex + ?Sized>(
    index: &I,
    journal_path: &Path,
    dst_dir: &Path,
    shards: &ShardSet,
) -> Result<MergeJournal, MergeError> {
    let journal_err = |source| MergeError::Journal {
        phase: MergePhase::Opening,
        source,
    };

    if let Some(stale) = MergeJournal::read_optional(journal_path).map_err(journal_err)? {
        if stale.phase.inputs_at_risk() {
            return Err(MergeError::InProgress {
                dir: dst_dir.to_path_buf(),
                phase: stale.phase,
            });
        }
        tracing::warn!(
            phase = %stale.phase,
            started_at = stale.started_at,
            inputs = stale.inputs.len(),
            "superseding journal of a merge that stopped before deleting inputs"
        );
        if let Some(temporary) = &stale.temporary
            && let Err(e) = fs::remove_file(temporary)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %temporary.display(), error = %e, "could not remove abandoned compound shard");
        }
        // Outputs the stale journal never got to record.
        if let Err(e) = sweep_merge_temporaries(index, dst_dir) {
            tracing::warn!(error = %e, "could not clear abandoned compound shards");
        }
    }

    let journal = MergeJournal::new(shards.paths().to_vec(), unix_now());
    journal.write_atomic(journal_path).map_err(journal_err)?;
    Ok(journal)
}

struct Run<'a, I: ShardIndex + ?Sized> {
    index: &'a I,
    dst_dir: &'a Path,
    options: &'a MergeOptions,
    machine: PhaseMachine,
    journal: Option<&'a mut MergeJournal>,
    journal_path: &'a Path,
    output: Option<MergeOutput>,
}

impl<I: ShardIndex + ?Sized> Run<'_, I> {
    fn execute(&mut self, shards: &ShardSet) -> Result<PathBuf, MergeError> {
        // -- opening --
        let mut open = OpenShards::new(self.index);
        for path in shards.paths() {
            open.open(path).map_err(|source| MergeError::Open {
                path: path.clone(),
                source,
            })?;
        }
        tracing::debug!(count = open.len(), "input shards open");
        self.failpoint("FP_MERGE_AFTER_OPEN")?;

        // -- merging --
        self.enter(MergePhase::Merging)?;
        let output = self
            .index
            .merge(self.dst_dir, open.handles())
            .map_err(|source| MergeError::Merge {
                dir: self.dst_dir.to_path_buf(),
                count: shards.len(),
                source,
            })?;
        open.close_all();
        tracing::info!(
            temporary = %output.temporary.display(),
            canonical = %output.canonical.display(),
            "compound shard written"
        );
        let MergeOutput {
            temporary,
            canonical,
        } = self.output.insert(output).clone();
        self.record_output(&temporary, &canonical)?;
        self.failpoint("FP_MERGE_AFTER_PRIMITIVE")?;

        // -- deleting --
        self.enter(MergePhase::Deleting)?;
        self.delete_inputs(shards, &temporary)?;

        // -- activating --
        self.enter(MergePhase::Activating)?;
        self.failpoint("FP_MERGE_BEFORE_ACTIVATE")?;
        fs::rename(&temporary, &canonical).map_err(|source| MergeError::Activate {
            temporary: temporary.clone(),
            canonical: canonical.clone(),
            source,
        })?;
        if self.options.fsync_dir
            && let Err(e) = sync_dir(self.dst_dir)
        {
            tracing::warn!(dir = %self.dst_dir.display(), error = %e, "fsync of shard directory failed after activation");
        }

        // -- done --
        self.machine
            .advance(MergePhase::Done)
            .map_err(|source| MergeError::Transition { source })?;
        if self.journal.is_some()
            && let Err(e) = remove_journal(self.journal_path)
        {
            tracing::warn!(error = %e, "merge complete but its journal could not be removed");
        }
        tracing::info!(compound = %canonical.display(), inputs = shards.len(), "merge complete");
        Ok(canonical)
    }

    fn delete_inputs(&self, shards: &ShardSet, temporary: &Path) -> Result<(), MergeError> {
        let mut removed: Vec<PathBuf> = Vec::new();
        for (i, shard) in shards.paths().iter().enumerate() {
            let files = match self.index.paths_of(shard) {
                Ok(files) => files,
                Err(source) => {
                    return Err(MergeError::Enumerate {
                        path: shard.clone(),
                        source,
                        removed,
                        temporary: temporary.to_path_buf(),
                        dir: self.dst_dir.to_path_buf(),
                    });
                }
            };
            for file in files {
                if let Err(source) = fs::remove_file(&file) {
                    return Err(MergeError::Remove {
                        path: file,
                        source,
                        removed,
                        temporary: temporary.to_path_buf(),
                        dir: self.dst_dir.to_path_buf(),
                    });
                }
                tracing::debug!(path = %file.display(), "removed input shard file");
                removed.push(file);
            }
            if i == 0 {
                self.failpoint_in(MergePhase::Deleting, "FP_MERGE_AFTER_FIRST_DELETE")?;
            }
        }
        Ok(())
    }

    /// Persist `next` to the journal, then move the in-memory machine. The
    /// journal is written first so that it never lags behind what has been
    /// done on disk.
    fn enter(&mut self, next: MergePhase) -> Result<(), MergeError> {
        let phase = self.machine.phase();
        if let Some(journal) = self.journal.as_deref_mut() {
            journal
                .advance(next, unix_now())
                .map_err(|source| MergeError::Transition { source })?;
            journal
                .write_atomic(self.journal_path)
                .map_err(|source| MergeError::Journal { phase, source })?;
        }
        self.machine
            .advance(next)
            .map_err(|source| MergeError::Transition { source })
    }

    /// Note the compound shard's names in the journal so an interrupted
    /// merge can find its output.
    fn record_output(&mut self, temporary: &Path, canonical: &Path) -> Result<(), MergeError> {
        let phase = self.machine.phase();
        if let Some(journal) = self.journal.as_deref_mut() {
            journal.temporary = Some(temporary.to_path_buf());
            journal.canonical = Some(canonical.to_path_buf());
            journal
                .write_atomic(self.journal_path)
                .map_err(|source| MergeError::Journal { phase, source })?;
        }
        Ok(())
    }

    fn failpoint(&self, name: &'static str) -> Result<(), MergeError> {
        self.failpoint_in(self.machine.phase(), name)
    }

    #[allow(clippy::unused_self)]
    fn failpoint_in(&self, phase: MergePhase, name: &'static str) -> Result<(), MergeError> {
        fp!(name).map_err(|source| MergeError::Injected { phase, source })
    }

    /// Bring the directory and journal to the documented state for a merge
    /// that stopped with `err`.
    fn settle_failure(&mut self, err: &MergeError) {
        let at = self.machine.fail();
        tracing::error!(phase = %at, error = %err, "merge failed");

        if at.inputs_at_risk() {
            if let Some(journal) = self.journal.as_deref_mut() {
                journal.record_failure(err.to_string(), unix_now());
                if let Err(e) = journal.write_atomic(self.journal_path) {
                    tracing::warn!(error = %e, "could not record failure in merge journal");
                }
            }
            return;
        }

        if let Some(output) = self.output.take()
            && let Err(e) = fs::remove_file(&output.temporary)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %output.temporary.display(), error = %e, "could not remove temporary compound shard");
        }
        if self.journal.is_some()
            && let Err(e) = remove_journal(self.journal_path)
        {
            tracing::warn!(error = %e, "could not remove merge journal");
        }
    }
}
