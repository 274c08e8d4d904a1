//! On-disk shard format used by the `shard-merge` binary.
//!
//! Layout of a primary shard file:
//!
//! ```text
//! [magic: 8 bytes "SHRDMRG\0"] [version: u32 LE] [sha256(body): 32 bytes] [body: JSON]
//! ```
//!
//! The body is `{"repositories": [...]}`. A shard with one repository is a
//! simple shard, one with several is a compound shard. An optional companion
//! file `<primary><meta_suffix>` holds JSON metadata overrides keyed by
//! repository name; it is applied when the shard is opened and belongs to
//! the shard for deletion purposes.
//!
//! New shards are always written under a temporary name
//! (`<canonical>.<random hex>.tmp`) with create-new + fsync, and only renamed
//! to their canonical name once complete.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{IndexError, MergeOutput, ShardIndex};
use crate::config::IndexConfig;

const MAGIC: &[u8; 8] = b"SHRDMRG\0";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = MAGIC.len() + 4 + 32;

/// Suffix shared by every canonical shard name.
pub const SHARD_SUFFIX: &str = "_v1.00000.shard";

/// Prefix of compound shard names.
pub const COMPOUND_PREFIX: &str = "compound-";

const TEMP_SUFFIX: &str = ".tmp";

// ---------------------------------------------------------------------------
// Shard contents
// ---------------------------------------------------------------------------

/// One indexed file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Document {
    /// Path of the file inside its repository.
    pub path: String,
    /// File contents.
    pub content: String,
}

impl Document {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// A repository's worth of documents. The unit a simple shard holds and
/// the unit explode splits a compound shard into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Repository name; unique within a shard directory.
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub documents: Vec<Document>,
}

impl Repository {
    pub fn new(name: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            name: name.into(),
            metadata: BTreeMap::new(),
            documents,
        }
    }
}

#[derive(Serialize)]
struct ShardBodyRef<'a> {
    repositories: &'a [Repository],
}

#[derive(Deserialize)]
struct ShardBody {
    repositories: Vec<Repository>,
}

/// An open shard file.
#[derive(Debug)]
pub struct ShardHandle {
    path: PathBuf,
    repositories: Vec<Repository>,
    // Held until the handle is closed.
    _file: File,
}

impl ShardHandle {
    /// Primary path the shard was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Repositories in the shard, metadata overrides applied.
    #[must_use]
    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    /// `true` if the shard holds more than one repository.
    #[must_use]
    pub fn is_compound(&self) -> bool {
        self.repositories.len() > 1
    }
}

// ---------------------------------------------------------------------------
// FileIndex
// ---------------------------------------------------------------------------

/// [`ShardIndex`] over checksummed shard files.
#[derive(Clone, Debug)]
pub struct FileIndex {
    meta_suffix: String,
    fsync: bool,
}

impl Default for FileIndex {
    fn default() -> Self {
        Self::new(&IndexConfig::default())
    }
}

impl FileIndex {
    #[must_use]
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            meta_suffix: config.meta_suffix.clone(),
            fsync: config.fsync,
        }
    }

    /// Path of the metadata companion of `primary`.
    #[must_use]
    pub fn meta_path(&self, primary: &Path) -> PathBuf {
        let mut name = primary.as_os_str().to_owned();
        name.push(&self.meta_suffix);
        PathBuf::from(name)
    }

    /// Write `repositories` as one shard in `dir` under its canonical name.
    ///
    /// # Errors
    /// [`IndexError::AlreadyExists`] if a shard with that name is present,
    /// otherwise any I/O or encoding failure.
    pub fn write_shard(&self, dir: &Path, repositories: &[Repository]) -> Result<PathBuf, IndexError> {
        if repositories.is_empty() {
            return Err(IndexError::NoInputs);
        }
        let canonical = dir.join(canonical_name(repositories));
        if let Some(name) = duplicate_name(repositories) {
            return Err(IndexError::Corrupt {
                path: canonical,
                detail: format!("repository {name:?} appears more than once"),
            });
        }
        if exists(&canonical)? {
            return Err(IndexError::AlreadyExists { path: canonical });
        }
        let tmp = self.write_temp(&canonical, repositories)?;
        if let Err(e) = fs::rename(&tmp, &canonical) {
            remove_quietly(&tmp);
            return Err(IndexError::io("rename", &tmp, e));
        }
        Ok(canonical)
    }

    fn write_temp(&self, canonical: &Path, repositories: &[Repository]) -> Result<PathBuf, IndexError> {
        let bytes = encode(repositories).map_err(|source| IndexError::Encode {
            path: canonical.to_path_buf(),
            source,
        })?;

        let tmp = temp_path(canonical);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(|e| IndexError::io("create", &tmp, e))?;

        let written = file
            .write_all(&bytes)
            .map_err(|e| IndexError::io("write", &tmp, e))
            .and_then(|()| {
                if self.fsync {
                    file.sync_all().map_err(|e| IndexError::io("fsync", &tmp, e))
                } else {
                    Ok(())
                }
            });
        drop(file);

        if let Err(err) = written {
            remove_quietly(&tmp);
            return Err(err);
        }
        Ok(tmp)
    }

    fn read_meta(&self, primary: &Path) -> Result<BTreeMap<String, BTreeMap<String, String>>, IndexError> {
        let meta = self.meta_path(primary);
        let contents = match fs::read_to_string(&meta) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(IndexError::io("read", &meta, e)),
        };
        serde_json::from_str(&contents).map_err(|e| IndexError::Corrupt {
            path: meta,
            detail: format!("metadata is not a JSON object of repository overrides: {e}"),
        })
    }

    /// Remove the compound shard's files. On error no output is visible yet:
    /// the temporaries are discarded if the compound is still intact, and
    /// reported as pending otherwise.
    fn retire_compound(&self, compound: &Path, written: &[(PathBuf, PathBuf)]) -> Result<(), IndexError> {
        let discard = || {
            for (tmp, _) in written {
                remove_quietly(tmp);
            }
        };
        let mut files = match self.paths_of(compound) {
            Ok(files) => files.into_iter(),
            Err(err) => {
                discard();
                return Err(err);
            }
        };
        if let Some(primary) = files.next()
            && let Err(e) = fs::remove_file(&primary)
        {
            discard();
            return Err(IndexError::io("remove", &primary, e));
        }
        for companion in files {
            if let Err(e) = fs::remove_file(&companion)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(IndexError::Stranded {
                    compound: compound.to_path_buf(),
                    reason: format!("remove {}: {e}", companion.display()),
                    pending: written.to_vec(),
                });
            }
        }
        Ok(())
    }

    fn sync_dir(&self, dir: &Path) -> Result<(), IndexError> {
        if self.fsync {
            sync_dir(dir).map_err(|e| IndexError::io("fsync", dir, e))?;
        }
        Ok(())
    }
}

impl ShardIndex for FileIndex {
    type Handle = ShardHandle;

    fn open(&self, path: &Path) -> Result<ShardHandle, IndexError> {
        let mut file = File::open(path).map_err(|e| IndexError::io("open", path, e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| IndexError::io("read", path, e))?;

        let mut repositories = decode(path, &bytes)?;
        let overrides = self.read_meta(path)?;
        for repo in &mut repositories {
            if let Some(meta) = overrides.get(&repo.name) {
                repo.metadata
                    .extend(meta.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        Ok(ShardHandle {
            path: path.to_path_buf(),
            repositories,
            _file: file,
        })
    }

    fn merge(&self, dst_dir: &Path, shards: &[ShardHandle]) -> Result<MergeOutput, IndexError> {
        if shards.is_empty() {
            return Err(IndexError::NoInputs);
        }

        let mut merged: Vec<Repository> = Vec::new();
        let mut position: BTreeMap<String, usize> = BTreeMap::new();
        for shard in shards {
            for repo in shard.repositories() {
                if let Some(&at) = position.get(&repo.name) {
                    tracing::warn!(
                        repository = %repo.name,
                        shard = %shard.path().display(),
                        "repository present in more than one input; later shard wins"
                    );
                    merged[at] = repo.clone();
                } else {
                    position.insert(repo.name.clone(), merged.len());
                    merged.push(repo.clone());
                }
            }
        }

        let canonical = dst_dir.join(compound_name(&merged));
        let temporary = self.write_temp(&canonical, &merged)?;
        Ok(MergeOutput {
            temporary,
            canonical,
        })
    }

    fn explode(&self, dst_dir: &Path, compound: &Path) -> Result<Vec<PathBuf>, IndexError> {
        let shard = self.open(compound)?;
        if !shard.is_compound() {
            return Err(IndexError::NotCompound {
                path: compound.to_path_buf(),
            });
        }

        let mut targets = Vec::with_capacity(shard.repositories().len());
        for repo in shard.repositories() {
            let canonical = dst_dir.join(simple_name(&repo.name));
            if canonical != compound && exists(&canonical)? {
                return Err(IndexError::AlreadyExists { path: canonical });
            }
            targets.push((repo, canonical));
        }

        let mut written: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(targets.len());
        for (repo, canonical) in targets {
            match self.write_temp(&canonical, std::slice::from_ref(repo)) {
                Ok(tmp) => written.push((tmp, canonical)),
                Err(err) => {
                    for (tmp, _) in &written {
                        remove_quietly(tmp);
                    }
                    return Err(err);
                }
            }
        }
        drop(shard);

        // The compound shard goes away before any simple shard becomes
        // visible, so no repository is ever present twice.
        self.retire_compound(compound, &written)?;
        let produced = activate_outputs(compound, written)?;
        self.sync_dir(dst_dir)?;
        Ok(produced)
    }

    fn paths_of(&self, primary: &Path) -> Result<Vec<PathBuf>, IndexError> {
        let mut paths = vec![primary.to_path_buf()];
        let meta = self.meta_path(primary);
        if exists(&meta)? {
            paths.push(meta);
        }
        Ok(paths)
    }

    fn close(&self, handle: ShardHandle) {
        drop(handle);
    }

    fn is_merge_temporary(&self, path: &Path) -> bool {
        is_temp_path(path)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(COMPOUND_PREFIX))
                .map(str::as_bytes)
                .is_some_and(|rest| {
                    rest.len() > 16
                        && rest[..16].iter().all(u8::is_ascii_hexdigit)
                        && rest[16..].starts_with(SHARD_SUFFIX.as_bytes())
                })
    }
}

/// Rename every `(temporary, canonical)` pair, carrying on past failures so
/// that everything that can become visible does.
fn activate_outputs(compound: &Path, written: Vec<(PathBuf, PathBuf)>) -> Result<Vec<PathBuf>, IndexError> {
    let mut produced = Vec::with_capacity(written.len());
    let mut pending = Vec::new();
    let mut failures = Vec::new();
    for (tmp, canonical) in written {
        match fs::rename(&tmp, &canonical) {
            Ok(()) => produced.push(canonical),
            Err(e) => {
                tracing::error!(temporary = %tmp.display(), canonical = %canonical.display(), error = %e, "could not activate exploded shard");
                failures.push(format!("rename {}: {e}", tmp.display()));
                pending.push((tmp, canonical));
            }
        }
    }
    if pending.is_empty() {
        return Ok(produced);
    }
    Err(IndexError::Stranded {
        compound: compound.to_path_buf(),
        reason: failures.join("; "),
        pending,
    })
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Canonical file name for a shard holding `repositories`.
#[must_use]
pub fn canonical_name(repositories: &[Repository]) -> String {
    match repositories {
        [only] => simple_name(&only.name),
        _ => compound_name(repositories),
    }
}

/// Canonical file name of the simple shard for `repository`.
#[must_use]
pub fn simple_name(repository: &str) -> String {
    format!("{}{SHARD_SUFFIX}", escape_name(repository))
}

/// Canonical file name of a compound shard. Derived from the sorted
/// repository names, so the same set always maps to the same name.
#[must_use]
pub fn compound_name(repositories: &[Repository]) -> String {
    let mut names: Vec<&str> = repositories.iter().map(|r| r.name.as_str()).collect();
    names.sort_unstable();
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{COMPOUND_PREFIX}{}{SHARD_SUFFIX}", &digest[..16])
}

/// `true` if `path` looks like a temporary shard written by this module.
#[must_use]
pub fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(TEMP_SUFFIX) && n.contains(SHARD_SUFFIX))
}

fn temp_path(canonical: &Path) -> PathBuf {
    let mut name: OsString = canonical.as_os_str().to_owned();
    name.push(format!(".{:016x}{TEMP_SUFFIX}", rand::random::<u64>()));
    PathBuf::from(name)
}

fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn encode(repositories: &[Repository]) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(&ShardBodyRef { repositories })?;
    let digest = Sha256::digest(&body);

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&digest);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Vec<Repository>, IndexError> {
    let corrupt = |detail: String| IndexError::Corrupt {
        path: path.to_path_buf(),
        detail,
    };

    if bytes.len() < HEADER_LEN {
        return Err(corrupt(format!(
            "{} bytes is shorter than the {HEADER_LEN}-byte header",
            bytes.len()
        )));
    }
    let (header, body) = bytes.split_at(HEADER_LEN);
    if &header[..MAGIC.len()] != MAGIC {
        return Err(corrupt("bad magic".to_owned()));
    }

    let version_bytes: [u8; 4] = header[MAGIC.len()..MAGIC.len() + 4]
        .try_into()
        .map_err(|_| corrupt("truncated version".to_owned()))?;
    let version = u32::from_le_bytes(version_bytes);
    if version != FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported format version {version} (expected {FORMAT_VERSION})"
        )));
    }

    if Sha256::digest(body).as_slice() != &header[MAGIC.len() + 4..] {
        return Err(corrupt("checksum mismatch".to_owned()));
    }

    let parsed: ShardBody =
        serde_json::from_slice(body).map_err(|e| corrupt(format!("body: {e}")))?;
    if parsed.repositories.is_empty() {
        return Err(corrupt("shard holds no repositories".to_owned()));
    }
    if let Some(name) = duplicate_name(&parsed.repositories) {
        return Err(corrupt(format!("repository {name:?} appears more than once")));
    }
    Ok(parsed.repositories)
}

fn duplicate_name(repositories: &[Repository]) -> Option<&str> {
    let mut seen = BTreeSet::new();
    repositories
        .iter()
        .map(|r| r.name.as_str())
        .find(|name| !seen.insert(*name))
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

fn exists(path: &Path) -> Result<bool, IndexError> {
    path.try_exists().map_err(|e| IndexError::io("stat", path, e))
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary shard");
    }
}

/// Flush directory entries (renames, unlinks) of `dir` to disk.
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
