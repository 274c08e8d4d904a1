use std::io;

use anyhow::Result;

use shard_merge::cli::{Invocation, dispatch};
use shard_merge::telemetry;

fn main() -> Result<()> {
    telemetry::init();

    let stdin = io::stdin();
    let result = dispatch(Invocation {
        args: std::env::args().collect(),
        stdin: stdin.lock(),
        stdout: io::stdout().lock(),
    });
    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "shard-merge failed");
    }
    result
}
