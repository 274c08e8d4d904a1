//! Merge phase machine and the persisted merge journal.
//!
//! The journal lives at `<shard dir>/.shard-merge.journal.json` as
//! human-readable JSON. Every write is atomic (write-to-temp + fsync +
//! rename) so a crash never leaves a torn journal behind.
//!
//! # Lifecycle
//!
//! ```text
//! Opening → Merging → Deleting → Activating → Done
//!    │         │          │           │
//!    └─────────┴──────────┴───────────┴──→ Failed
//! ```
//!
//! `Deleting` is the point of no easy return: from there on the input
//! shards are being removed and only rolling forward (see
//! [`crate::recover`]) restores a consistent directory.

#![allow(clippy::missing_errors_doc)]

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// File name of the journal inside a shard directory.
pub const JOURNAL_FILE_NAME: &str = ".shard-merge.journal.json";

const JOURNAL_TMP_NAME: &str = ".shard-merge.journal.tmp";

// ---------------------------------------------------------------------------
// MergePhase
// ---------------------------------------------------------------------------

/// The phase a merge is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    /// Opening every input shard.
    Opening,
    /// The merge primitive is producing the temporary compound shard.
    Merging,
    /// Removing every file of every input shard.
    Deleting,
    /// Renaming the compound shard to its canonical name.
    Activating,
    /// The compound shard is live.
    Done,
    /// The merge stopped on an error.
    Failed,
}

impl MergePhase {
    /// Returns `true` for `Done` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns `true` once input shards may have been touched.
    #[must_use]
    pub const fn inputs_at_risk(self) -> bool {
        matches!(self, Self::Deleting | Self::Activating)
    }

    /// The phases reachable from this one.
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Opening => &[Self::Merging, Self::Failed],
            Self::Merging => &[Self::Deleting, Self::Failed],
            Self::Deleting => &[Self::Activating, Self::Failed],
            Self::Activating => &[Self::Done, Self::Failed],
            Self::Done | Self::Failed => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening => write!(f, "opening"),
            Self::Merging => write!(f, "merging"),
            Self::Deleting => write!(f, "deleting"),
            Self::Activating => write!(f, "activating"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Tracks the phase of one in-memory merge and rejects illegal moves.
#[derive(Debug)]
pub struct PhaseMachine {
    phase: MergePhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self {
            phase: MergePhase::Opening,
        }
    }
}

impl PhaseMachine {
    #[must_use]
    pub const fn phase(&self) -> MergePhase {
        self.phase
    }

    /// Move to `next`.
    pub fn advance(&mut self, next: MergePhase) -> Result<(), MergeStateError> {
        if !self.phase.can_transition_to(next) {
            return Err(MergeStateError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(from = %self.phase, to = %next, "merge phase");
        self.phase = next;
        Ok(())
    }

    /// Enter `Failed`, returning the phase the failure happened in.
    /// Already-terminal machines keep their phase.
    pub fn fail(&mut self) -> MergePhase {
        let at = self.phase;
        if !at.is_terminal() {
            self.phase = MergePhase::Failed;
        }
        at
    }
}

// ---------------------------------------------------------------------------
// MergeJournal
// ---------------------------------------------------------------------------

/// The persisted record of one in-flight merge.
///
/// Only non-terminal phases are ever written; a finished merge removes its
/// journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeJournal {
    /// Phase the merge had reached.
    pub phase: MergePhase,

    /// Input shard primary paths, in merge order.
    pub inputs: Vec<PathBuf>,

    /// Temporary compound shard path (known from `Deleting` on).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary: Option<PathBuf>,

    /// Canonical compound shard path (known from `Deleting` on).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical: Option<PathBuf>,

    /// Unix timestamp (seconds) when the merge started.
    pub started_at: u64,

    /// Unix timestamp (seconds) of the last journal update.
    pub updated_at: u64,

    /// Error that stopped the merge, if it stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl MergeJournal {
    /// A journal in the `Opening` phase.
    #[must_use]
    pub const fn new(inputs: Vec<PathBuf>, now: u64) -> Self {
        Self {
            phase: MergePhase::Opening,
            inputs,
            temporary: None,
            canonical: None,
            started_at: now,
            updated_at: now,
            failure: None,
        }
    }

    /// Advance to `next`, updating the timestamp.
    ///
    /// # Errors
    /// [`MergeStateError::InvalidTransition`] if the move is not allowed or
    /// targets a terminal phase (terminal journals are never persisted).
    pub fn advance(&mut self, next: MergePhase, now: u64) -> Result<(), MergeStateError> {
        if next.is_terminal() || !self.phase.can_transition_to(next) {
            return Err(MergeStateError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.updated_at = now;
        Ok(())
    }

    /// Record the error that stopped the merge. The phase is left as-is so
    /// recovery knows where it stopped.
    pub fn record_failure(&mut self, reason: impl Into<String>, now: u64) {
        self.failure = Some(reason.into());
        self.updated_at = now;
    }

    pub fn to_json(&self) -> Result<String, MergeStateError> {
        serde_json::to_string_pretty(self).map_err(|e| MergeStateError::Serialize(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, MergeStateError> {
        let journal: Self =
            serde_json::from_str(json).map_err(|e| MergeStateError::Deserialize(e.to_string()))?;
        if journal.phase.is_terminal() {
            return Err(MergeStateError::Deserialize(format!(
                "journal records terminal phase '{}'",
                journal.phase
            )));
        }
        Ok(journal)
    }

    /// Journal path for a shard directory.
    #[must_use]
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(JOURNAL_FILE_NAME)
    }

    /// Write the journal atomically with fsync.
    ///
    /// 1. Serialize to pretty JSON.
    /// 2. Write to a temporary file in the same directory.
    /// 3. fsync the temporary file.
    /// 4. Rename over the target path.
    pub fn write_atomic(&self, path: &Path) -> Result<(), MergeStateError> {
        let json = self.to_json()?;

        let dir = path.parent().ok_or_else(|| {
            MergeStateError::Io(format!("no parent directory for {}", path.display()))
        })?;

        let tmp_path = dir.join(JOURNAL_TMP_NAME);
        let mut file = fs::File::create(&tmp_path)
            .map_err(|e| MergeStateError::Io(format!("create {}: {e}", tmp_path.display())))?;
        file.write_all(json.as_bytes())
            .map_err(|e| MergeStateError::Io(format!("write {}: {e}", tmp_path.display())))?;
        file.sync_all()
            .map_err(|e| MergeStateError::Io(format!("fsync {}: {e}", tmp_path.display())))?;
        drop(file);

        fs::rename(&tmp_path, path).map_err(|e| {
            MergeStateError::Io(format!(
                "rename {} → {}: {e}",
                tmp_path.display(),
                path.display()
            ))
        })?;

        Ok(())
    }

    /// Read a journal from disk.
    ///
    /// # Errors
    /// [`MergeStateError::NotFound`] if there is no journal,
    /// [`MergeStateError::Deserialize`] if it is malformed.
    pub fn read(path: &Path) -> Result<Self, MergeStateError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MergeStateError::NotFound(path.to_owned())
            } else {
                MergeStateError::Io(format!("read {}: {e}", path.display()))
            }
        })?;
        Self::from_json(&contents)
    }

    /// Read the journal if there is one.
    pub fn read_optional(path: &Path) -> Result<Option<Self>, MergeStateError> {
        match Self::read(path) {
            Ok(journal) => Ok(Some(journal)),
            Err(MergeStateError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Remove the journal at `path`. Missing is fine.
pub fn remove_journal(path: &Path) -> Result<(), MergeStateError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MergeStateError::Io(format!(
            "remove {}: {e}",
            path.display()
        ))),
    }
}

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors related to the phase machine and the journal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeStateError {
    /// Invalid phase transition.
    InvalidTransition {
        /// The current phase.
        from: MergePhase,
        /// The attempted target phase.
        to: MergePhase,
    },
    /// No journal at the given path.
    NotFound(PathBuf),
    /// Serialization error.
    Serialize(String),
    /// Deserialization error.
    Deserialize(String),
    /// I/O error (not "not found").
    Io(String),
}

impl fmt::Display for MergeStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid merge phase transition: {from} → {to}")
            }
            Self::NotFound(path) => {
                write!(f, "merge journal not found: {}", path.display())
            }
            Self::Serialize(msg) => write!(f, "merge journal serialize error: {msg}"),
            Self::Deserialize(msg) => write!(f, "merge journal deserialize error: {msg}"),
            Self::Io(msg) => write!(f, "merge journal I/O error: {msg}"),
        }
    }
}

impl std::error::Error for MergeStateError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
