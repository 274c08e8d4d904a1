//! The shard index primitives the orchestrators are built on.
//!
//! [`ShardIndex`] is the narrow contract (open, merge, explode, enumerate
//! paths, close) through which merge and explode reach the on-disk shard
//! format. The orchestrators never look inside a shard; they only sequence
//! these calls and the filesystem mutations between them.
//!
//! [`FileIndex`] is the implementation used by the binary.

pub mod file;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use file::{Document, FileIndex, Repository};

/// Names returned by [`ShardIndex::merge`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutput {
    /// Where the compound shard currently lives. Not a valid shard name.
    pub temporary: PathBuf,
    /// The name the compound shard takes once activated.
    pub canonical: PathBuf,
}

/// The shard primitive set.
///
/// Implementations must uphold:
/// - `merge` leaves no output under a canonical name, and on failure no
///   output at all.
/// - `explode` leaves the compound shard intact if it fails before removing
///   it, reports every output still under a temporary name if it fails
///   after ([`IndexError::Stranded`]), and never produces a simple shard
///   that duplicates one already present in the destination.
/// - `paths_of` lists every file that belongs to the shard so deleting
///   them removes it completely.
pub trait ShardIndex {
    /// An open, read-ready shard.
    type Handle;

    /// Open one shard for reading.
    fn open(&self, path: &Path) -> Result<Self::Handle, IndexError>;

    /// Combine `shards`, in order, into one compound shard written under a
    /// temporary name inside `dst_dir`.
    fn merge(&self, dst_dir: &Path, shards: &[Self::Handle]) -> Result<MergeOutput, IndexError>;

    /// Split the compound shard at `compound` into simple shards inside
    /// `dst_dir`, returning their canonical paths.
    fn explode(&self, dst_dir: &Path, compound: &Path) -> Result<Vec<PathBuf>, IndexError>;

    /// Every on-disk file belonging to the shard whose primary file is
    /// `primary`, primary first.
    fn paths_of(&self, primary: &Path) -> Result<Vec<PathBuf>, IndexError>;

    /// Release an open handle.
    fn close(&self, handle: Self::Handle);

    /// `true` if `path` is an output `merge` wrote under a temporary name.
    /// Files matching this are removed when an interrupted merge is
    /// discarded, so it must never match a file that is the only copy of
    /// anything.
    fn is_merge_temporary(&self, _path: &Path) -> bool {
        false
    }
}

/// Remove every file in `dir` that `index` recognizes as an abandoned merge
/// output, returning the removed paths.
///
/// # Errors
/// The directory cannot be listed or a matching file cannot be removed.
pub fn sweep_merge_temporaries<I: ShardIndex + ?Sized>(
    index: &I,
    dir: &Path,
) -> Result<Vec<PathBuf>, IndexError> {
    let mut removed = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| IndexError::io("list", dir, e))? {
        let path = entry.map_err(|e| IndexError::io("list", dir, e))?.path();
        if !index.is_merge_temporary(&path) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "removed abandoned compound shard");
                removed.push(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(IndexError::io("remove", &path, e)),
        }
    }
    Ok(removed)
}

/// Errors returned by [`ShardIndex`] primitives.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A filesystem operation failed.
    #[error("{op} {}: {source}", path.display())]
    Io {
        /// Short name of the operation (`"open"`, `"write"`, `"rename"`, ...).
        op: &'static str,
        /// The path the operation was applied to.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a valid shard.
    #[error("corrupt shard {}: {detail}", path.display())]
    Corrupt {
        /// The shard path.
        path: PathBuf,
        /// What failed validation.
        detail: String,
    },

    /// Shard contents could not be serialized.
    #[error("encode shard {}: {source}", path.display())]
    Encode {
        /// The shard being written.
        path: PathBuf,
        /// The serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// Explode was asked to split a shard holding a single repository.
    #[error("{} is not a compound shard (it holds a single repository)", path.display())]
    NotCompound {
        /// The shard path.
        path: PathBuf,
    },

    /// A shard that would be produced already exists under its canonical name.
    #[error("refusing to overwrite existing shard {}", path.display())]
    AlreadyExists {
        /// The conflicting canonical path.
        path: PathBuf,
    },

    /// Explode removed the compound shard but could not put every
    /// repository in place. The pending temporaries hold the only copy of
    /// those repositories.
    #[error(
        "explode of {} stopped after the compound shard was removed: {reason}\n  move these into place by hand:{}",
        compound.display(),
        pending_list(pending)
    )]
    Stranded {
        /// The compound shard being exploded.
        compound: PathBuf,
        /// Every failure that stopped the explode.
        reason: String,
        /// `(temporary, canonical)` pairs not yet renamed.
        pending: Vec<(PathBuf, PathBuf)>,
    },

    /// Merge was called with no shards.
    #[error("nothing to merge: no shards were given")]
    NoInputs,
}

fn pending_list(pending: &[(PathBuf, PathBuf)]) -> String {
    pending
        .iter()
        .map(|(tmp, canonical)| format!("\n    {} → {}", tmp.display(), canonical.display()))
        .collect()
}

impl IndexError {
    pub(crate) fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Handles opened through a [`ShardIndex`], closed when the guard drops.
///
/// Every exit path of an orchestrator (early return, `?`, panic unwinding,
/// normal completion) releases the handles it opened.
pub struct OpenShards<'a, I: ShardIndex + ?Sized> {
    index: &'a I,
    handles: Vec<I::Handle>,
}

impl<'a, I: ShardIndex + ?Sized> OpenShards<'a, I> {
    /// An empty guard bound to `index`.
    pub fn new(index: &'a I) -> Self {
        Self {
            index,
            handles: Vec::new(),
        }
    }

    /// Open `path` and keep the handle in the guard.
    pub fn open(&mut self, path: &Path) -> Result<(), IndexError> {
        let handle = self.index.open(path)?;
        self.handles.push(handle);
        Ok(())
    }

    /// The handles opened so far, in open order.
    #[must_use]
    pub fn handles(&self) -> &[I::Handle] {
        &self.handles
    }

    /// Number of handles held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// `true` if nothing has been opened yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Close every handle now instead of at drop.
    pub fn close_all(&mut self) {
        for handle in self.handles.drain(..) {
            self.index.close(handle);
        }
    }
}

impl<I: ShardIndex + ?Sized> Drop for OpenShards<'_, I> {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Counting {
        closed: RefCell<Vec<PathBuf>>,
    }

    impl ShardIndex for Counting {
        type Handle = PathBuf;

        fn open(&self, path: &Path) -> Result<PathBuf, IndexError> {
            if path.ends_with("bad.shard") {
                return Err(IndexError::Corrupt {
                    path: path.to_path_buf(),
                    detail: "bad magic".into(),
                });
            }
            Ok(path.to_path_buf())
        }

        fn merge(&self, _: &Path, _: &[PathBuf]) -> Result<MergeOutput, IndexError> {
            Err(IndexError::NoInputs)
        }

        fn explode(&self, _: &Path, _: &Path) -> Result<Vec<PathBuf>, IndexError> {
            Ok(Vec::new())
        }

        fn paths_of(&self, primary: &Path) -> Result<Vec<PathBuf>, IndexError> {
            Ok(vec![primary.to_path_buf()])
        }

        fn close(&self, handle: PathBuf) {
            self.closed.borrow_mut().push(handle);
        }
    }

    #[test]
    fn guard_closes_on_drop() {
        let index = Counting::default();
        {
            let mut open = OpenShards::new(&index);
            open.open(Path::new("a.shard")).unwrap();
            open.open(Path::new("b.shard")).unwrap();
            assert_eq!(open.len(), 2);
        }
        assert_eq!(
            *index.closed.borrow(),
            vec![PathBuf::from("a.shard"), PathBuf::from("b.shard")]
        );
    }

    #[test]
    fn guard_closes_already_opened_after_failed_open() {
        let index = Counting::default();
        let result = (|| {
            let mut open = OpenShards::new(&index);
            open.open(Path::new("a.shard"))?;
            open.open(Path::new("bad.shard"))?;
            Ok::<_, IndexError>(open.len())
        })();
        assert!(matches!(result, Err(IndexError::Corrupt { .. })));
        assert_eq!(*index.closed.borrow(), vec![PathBuf::from("a.shard")]);
    }

    struct Sweeping;

    impl ShardIndex for Sweeping {
        type Handle = ();

        fn open(&self, _: &Path) -> Result<(), IndexError> {
            Ok(())
        }

        fn merge(&self, _: &Path, _: &[()]) -> Result<MergeOutput, IndexError> {
            Err(IndexError::NoInputs)
        }

        fn explode(&self, _: &Path, _: &Path) -> Result<Vec<PathBuf>, IndexError> {
            Ok(Vec::new())
        }

        fn paths_of(&self, primary: &Path) -> Result<Vec<PathBuf>, IndexError> {
            Ok(vec![primary.to_path_buf()])
        }

        fn close(&self, _: ()) {}

        fn is_merge_temporary(&self, path: &Path) -> bool {
            path.extension().is_some_and(|ext| ext == "tmp")
        }
    }

    #[test]
    fn sweep_removes_only_merge_temporaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.shard"), "a").unwrap();
        std::fs::write(dir.path().join("c.shard.tmp"), "c").unwrap();

        let removed = sweep_merge_temporaries(&Sweeping, dir.path()).unwrap();
        assert_eq!(removed, vec![dir.path().join("c.shard.tmp")]);
        assert!(dir.path().join("a.shard").exists());

        // The default recognizes nothing.
        std::fs::write(dir.path().join("d.shard.tmp"), "d").unwrap();
        assert!(sweep_merge_temporaries(&Counting::default(), dir.path()).unwrap().is_empty());
    }

    #[test]
    fn stranded_error_lists_every_pending_rename() {
        let err = IndexError::Stranded {
            compound: PathBuf::from("/idx/c.shard"),
            reason: "rename failed".into(),
            pending: vec![
                (PathBuf::from("/idx/a.tmp"), PathBuf::from("/idx/a.shard")),
                (PathBuf::from("/idx/b.tmp"), PathBuf::from("/idx/b.shard")),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("/idx/a.tmp → /idx/a.shard"), "got {msg}");
        assert!(msg.contains("/idx/b.tmp → /idx/b.shard"), "got {msg}");
    }

    #[test]
    fn close_all_is_not_repeated_on_drop() {
        let index = Counting::default();
        {
            let mut open = OpenShards::new(&index);
            open.open(Path::new("a.shard")).unwrap();
            open.close_all();
            assert!(open.is_empty());
        }
        assert_eq!(index.closed.borrow().len(), 1);
    }
}
