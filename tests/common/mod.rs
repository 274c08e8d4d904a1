//! Shared test helpers for shard-merge integration tests.
//!
//! [`FakeIndex`] is a [`ShardIndex`] over plain text files (one document per
//! line) that can be told to fail at any phase boundary and records every
//! open, close and directory listing it sees. All tests use temp
//! directories.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use shard_merge::index::{IndexError, MergeOutput, ShardIndex};

/// File name the fake gives every compound shard.
pub const COMPOUND: &str = "compound.shard";

#[derive(Debug)]
pub struct FakeHandle {
    pub path: PathBuf,
    pub docs: Vec<String>,
}

/// Where a [`FakeIndex`] should fail.
#[derive(Default)]
pub struct Faults {
    /// `open` fails for these file names.
    pub open: BTreeSet<String>,
    /// `merge` fails without writing anything.
    pub merge: bool,
    /// `paths_of` fails for these file names.
    pub paths_of: BTreeSet<String>,
    /// `paths_of` reports a companion file that does not exist for these
    /// file names, so removing it fails.
    pub ghost_companion: BTreeSet<String>,
    /// `explode` fails without touching anything.
    pub explode: bool,
}

#[derive(Default)]
pub struct FakeIndex {
    pub faults: Faults,
    pub opened: RefCell<Vec<PathBuf>>,
    pub closed: RefCell<Vec<PathBuf>>,
    /// Directory listing taken at every `paths_of` call (the deleting phase).
    pub listings: RefCell<Vec<Vec<String>>>,
}

impl FakeIndex {
    pub fn new(faults: Faults) -> Self {
        Self {
            faults,
            ..Self::default()
        }
    }

    /// Every handle opened has been closed exactly once.
    pub fn assert_balanced(&self) {
        let mut opened = self.opened.borrow().clone();
        let mut closed = self.closed.borrow().clone();
        opened.sort();
        closed.sort();
        assert_eq!(opened, closed, "every opened handle must be closed once");
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn injected(path: &Path, what: &str) -> IndexError {
    IndexError::Corrupt {
        path: path.to_path_buf(),
        detail: format!("injected {what} failure"),
    }
}

impl ShardIndex for FakeIndex {
    type Handle = FakeHandle;

    fn open(&self, path: &Path) -> Result<FakeHandle, IndexError> {
        if self.faults.open.contains(&file_name(path)) {
            return Err(injected(path, "open"));
        }
        let text = fs::read_to_string(path).map_err(|e| IndexError::Io {
            op: "open",
            path: path.to_path_buf(),
            source: e,
        })?;
        self.opened.borrow_mut().push(path.to_path_buf());
        Ok(FakeHandle {
            path: path.to_path_buf(),
            docs: text.lines().map(str::to_owned).collect(),
        })
    }

    fn merge(&self, dst_dir: &Path, shards: &[FakeHandle]) -> Result<MergeOutput, IndexError> {
        if self.faults.merge {
            return Err(injected(dst_dir, "merge"));
        }
        let canonical = dst_dir.join(COMPOUND);
        let temporary = dst_dir.join(format!("{COMPOUND}.tmp"));
        let body: String = shards
            .iter()
            .flat_map(|s| s.docs.iter())
            .map(|d| format!("{d}\n"))
            .collect();
        fs::write(&temporary, body).map_err(|e| IndexError::Io {
            op: "write",
            path: temporary.clone(),
            source: e,
        })?;
        Ok(MergeOutput {
            temporary,
            canonical,
        })
    }

    fn explode(&self, dst_dir: &Path, compound: &Path) -> Result<Vec<PathBuf>, IndexError> {
        if self.faults.explode {
            return Err(injected(compound, "explode"));
        }
        let text = fs::read_to_string(compound).map_err(|e| IndexError::Io {
            op: "open",
            path: compound.to_path_buf(),
            source: e,
        })?;
        fs::remove_file(compound).map_err(|e| IndexError::Io {
            op: "remove",
            path: compound.to_path_buf(),
            source: e,
        })?;
        let mut produced = Vec::new();
        for doc in text.lines() {
            let path = dst_dir.join(format!("{doc}.shard"));
            fs::write(&path, format!("{doc}\n")).map_err(|e| IndexError::Io {
                op: "write",
                path: path.clone(),
                source: e,
            })?;
            produced.push(path);
        }
        Ok(produced)
    }

    fn paths_of(&self, primary: &Path) -> Result<Vec<PathBuf>, IndexError> {
        if let Some(dir) = primary.parent() {
            self.listings.borrow_mut().push(listing(dir));
        }
        let name = file_name(primary);
        if self.faults.paths_of.contains(&name) {
            return Err(injected(primary, "paths_of"));
        }
        let mut paths = vec![primary.to_path_buf()];
        let companion = primary.with_file_name(format!("{name}.meta"));
        if self.faults.ghost_companion.contains(&name) || companion.exists() {
            paths.push(companion);
        }
        Ok(paths)
    }

    fn close(&self, handle: FakeHandle) {
        self.closed.borrow_mut().push(handle.path);
    }

    fn is_merge_temporary(&self, path: &Path) -> bool {
        file_name(path).ends_with(".tmp")
    }
}

/// Write a fake shard holding `docs`, returning its path.
pub fn fake_shard(dir: &Path, name: &str, docs: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let body: String = docs.iter().map(|d| format!("{d}\n")).collect();
    fs::write(&path, body).expect("write fake shard");
    path
}

/// Sorted file names in `dir`.
pub fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Run the `shard-merge` binary with `args`, feeding `stdin`.
pub fn run_cli(args: &[&str], stdin: &str) -> Output {
    use std::io::Write as _;
    use std::process::Stdio;

    let mut child = Command::new(env!("CARGO_BIN_EXE_shard-merge"))
        .args(args)
        .env_remove("SHARD_MERGE_CONFIG")
        .env("SHARD_MERGE_LOG", "off")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn shard-merge");
    let mut pipe = child.stdin.take().expect("stdin piped");
    // The child may exit without reading (help, parse errors).
    let _ = pipe.write_all(stdin.as_bytes());
    drop(pipe);
    child.wait_with_output().expect("wait for shard-merge")
}
