//! Integration tests: the `shard-merge` binary.

mod common;

use common::{listing, run_cli};
use shard_merge::index::{Document, FileIndex, Repository};

fn write(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    FileIndex::default()
        .write_shard(dir, &[Repository::new(name, vec![Document::new("README", name)])])
        .expect("write shard")
}

fn stdout(out: &std::process::Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &std::process::Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn merge_paths_from_arguments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = write(dir.path(), "a");
    let b = write(dir.path(), "b");

    let out = run_cli(
        &["merge", a.to_str().expect("utf-8"), b.to_str().expect("utf-8")],
        "",
    );
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let compound = stdout(&out).trim_end().to_owned();
    assert!(compound.contains("compound-"), "got {compound}");
    assert!(std::path::Path::new(&compound).exists());
    assert_eq!(listing(dir.path()).len(), 1);
}

#[test]
fn merge_paths_from_stdin() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = write(dir.path(), "a");
    let b = write(dir.path(), "b");
    let input = format!("{}\n{}\n", a.display(), b.display());

    let out = run_cli(&["merge", "-"], &input);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(!a.exists() && !b.exists());
}

#[test]
fn unknown_subcommand_exits_nonzero_and_changes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = write(dir.path(), "a");
    let before = listing(dir.path());

    let out = run_cli(&["squash", a.to_str().expect("utf-8")], "");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("unknown subcommand"), "stderr: {}", stderr(&out));
    assert!(stdout(&out).is_empty());
    assert_eq!(listing(dir.path()), before);
}

#[test]
fn missing_input_exits_nonzero_and_changes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = write(dir.path(), "a");
    let missing = dir.path().join("missing_v1.00000.shard");
    let before = listing(dir.path());

    let out = run_cli(
        &["merge", a.to_str().expect("utf-8"), missing.to_str().expect("utf-8")],
        "",
    );
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("missing_v1.00000.shard"), "stderr: {}", stderr(&out));
    assert_eq!(listing(dir.path()), before);
}

#[test]
fn explode_prints_simple_shards() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = write(dir.path(), "a");
    let b = write(dir.path(), "b");
    let out = run_cli(
        &["merge", a.to_str().expect("utf-8"), b.to_str().expect("utf-8")],
        "",
    );
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let compound = stdout(&out).trim_end().to_owned();

    let out = run_cli(&["explode", &compound], "");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let mut printed: Vec<String> = stdout(&out).lines().map(str::to_owned).collect();
    printed.sort();
    assert_eq!(printed, vec![a.display().to_string(), b.display().to_string()]);
}

#[test]
fn explode_of_simple_shard_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = write(dir.path(), "a");

    let out = run_cli(&["explode", a.to_str().expect("utf-8")], "");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("not a compound shard"), "stderr: {}", stderr(&out));
    assert!(a.exists());
}

#[test]
fn recover_without_journal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = run_cli(&["recover", dir.path().to_str().expect("utf-8")], "");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim_end(), "no merge in progress");
}

#[test]
fn help_exits_zero_on_stdout() {
    let out = run_cli(&["--help"], "");
    assert!(out.status.success());
    assert!(stdout(&out).contains("recover"));
}
