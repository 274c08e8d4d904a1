//! Command-line surface: argument parsing and dispatch.
//!
//! `main` builds an [`Invocation`] from the process globals and hands it to
//! [`dispatch`]; nothing below this point reads `std::env` or the real
//! stdin/stdout, so tests drive the whole command layer with in-memory
//! buffers.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{Parser, Subcommand};

use crate::config::ShardMergeConfig;
use crate::explode::{destination_of, explode_shard};
use crate::index::FileIndex;
use crate::merge::{MergeOptions, merge_shards};
use crate::recover::recover;
use crate::resolve::resolve_shard_set;

/// Merge search-index shards into compound shards, and split them again
///
/// A merge replaces N shards in a directory with one compound shard. Inputs
/// are removed before the compound shard takes its final name, so no
/// content is ever served twice. A merge interrupted after it started
/// removing inputs is finished with 'shard-merge recover <dir>'.
///
/// EXAMPLES:
///
///   shard-merge merge /idx/a_v1.00000.shard /idx/b_v1.00000.shard
///
///   ls /idx/*.shard | shard-merge merge -
///
///   shard-merge explode /idx/compound-0123abcd_v1.00000.shard
#[derive(Parser, Debug)]
#[command(name = "shard-merge")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'shard-merge <command> --help' for more information on a specific command.")]
pub struct Cli {
    /// Configuration file (TOML). Defaults apply when absent.
    #[arg(long, global = true, env = "SHARD_MERGE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Merge shards into one compound shard
    ///
    /// The compound shard is written to the directory of the first shard.
    /// Pass a single '-' to read shard paths from stdin, one per line.
    /// Prints the path of the compound shard.
    Merge {
        /// Shard paths, or '-' to read them from stdin
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<String>,
    },

    /// Split a compound shard into one simple shard per repository
    ///
    /// Simple shards are written next to the compound shard, which is
    /// removed. Prints the path of each simple shard.
    Explode {
        /// Compound shard path
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Finish or discard a merge that was interrupted
    ///
    /// Reads the merge journal in DIR. A merge that never removed inputs is
    /// discarded; one that did is completed.
    Recover {
        /// Shard directory holding the merge journal
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

/// Everything one command run may touch besides the filesystem.
pub struct Invocation<R, W> {
    /// Full argument vector, program name first.
    pub args: Vec<String>,
    pub stdin: R,
    pub stdout: W,
}

/// Parse `inv.args` and run the selected command.
///
/// `--help` and `--version` are written to `inv.stdout` and succeed.
pub fn dispatch<R: BufRead, W: Write>(inv: Invocation<R, W>) -> Result<()> {
    let Invocation {
        args,
        stdin,
        mut stdout,
    } = inv;

    let cli = match Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(err) => return parse_failure(&err, &mut stdout),
    };

    let config = load_config(cli.config.as_deref())?;
    let index = FileIndex::new(&config.index);

    match cli.command {
        Commands::Merge { paths } => {
            let shards = resolve_shard_set(&paths, stdin).context("resolve shard paths")?;
            let dst_dir = shards.destination_dir();
            let compound = merge_shards(
                &index,
                &dst_dir,
                &shards,
                &MergeOptions::from(&config.merge),
            )
            .with_context(|| format!("merge {} shard(s) in {}", shards.len(), dst_dir.display()))?;
            writeln!(stdout, "{}", compound.display()).context("write output")?;
        }
        Commands::Explode { path } => {
            let dst_dir = destination_of(&path);
            let produced = explode_shard(&index, &dst_dir, &path)?;
            for shard in produced {
                writeln!(stdout, "{}", shard.display()).context("write output")?;
            }
        }
        Commands::Recover { dir } => {
            let outcome = recover(&index, &dir)
                .with_context(|| format!("recover merge in {}", dir.display()))?;
            writeln!(stdout, "{outcome}").context("write output")?;
        }
    }
    stdout.flush().context("flush output")?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ShardMergeConfig> {
    match path {
        Some(path) => Ok(ShardMergeConfig::load(path)?),
        None => Ok(ShardMergeConfig::default()),
    }
}

fn parse_failure<W: Write>(err: &clap::Error, stdout: &mut W) -> Result<()> {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            write!(stdout, "{}", err.render()).context("write output")?;
            stdout.flush().context("flush output")?;
            Ok(())
        }
        ErrorKind::InvalidSubcommand => {
            let name = match err.get(ContextKind::InvalidSubcommand) {
                Some(ContextValue::String(name)) => name.clone(),
                _ => String::from("(unknown)"),
            };
            bail!("unknown subcommand {name:?}; expected one of: merge, explode, recover")
        }
        _ => {
            let rendered = err.render().to_string();
            bail!(
                "{}",
                rendered
                    .trim_start_matches("error: ")
                    .trim_end()
            )
        }
    }
}
