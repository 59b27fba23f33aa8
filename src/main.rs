//! Command-line entry point.

use std::process::ExitCode;

use clap::Parser;
use log::error;

use ptmx_resolve::error::CliError;
use ptmx_resolve::inspector::{ptsname_by_fd, ptsname_list_all};
use ptmx_resolve::logging;

const USAGE: &str = "Usage: ptmx_resolve $PID [<optional> target file descriptor ID]";

/// Resolve the /dev/pts subordinate behind a process's open /dev/ptmx
/// descriptor.
#[derive(Parser, Debug)]
struct Cli {
    /// target process id
    pid: Option<String>,
    /// target file descriptor; omit to list every discovered pty
    fd: Option<String>,
    /// increase logging verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if logging::init(logging::level_for_verbosity(cli.verbose)).is_err() {
        eprintln!("warning: logger was already initialized");
    }

    let result = parse_args(cli).and_then(|(pid, fd)| match fd {
        Some(fd) => run_single(pid, fd),
        None => run_list(pid),
    });

    match result {
        Ok(code) => code,
        Err(CliError::UsageError) => {
            println!("{USAGE}");
            ExitCode::from(1)
        }
        Err(CliError::Inspector(e)) => {
            error!("{e}");
            // ptmx_resolve.c's main() returns the inspector's own result,
            // and a C `return -1;` from main becomes exit status 255 once
            // the kernel truncates it to a byte.
            ExitCode::from(255)
        }
    }
}

/// Both a missing pid and a non-numeric pid/fd are usage errors: clap's
/// own typed-value parsing would otherwise reject a malformed number
/// before this function ever runs, taking its own stderr+exit(2) path
/// instead of the usage message required here. Parsing `pid`/`fd` as
/// plain strings and validating them here keeps every malformed-argument
/// case on one path.
fn parse_args(cli: Cli) -> Result<(i64, Option<i32>), CliError> {
    let pid = cli
        .pid
        .as_deref()
        .ok_or(CliError::UsageError)?
        .parse::<i64>()
        .map_err(|_| CliError::UsageError)?;

    let fd = match cli.fd {
        None => None,
        Some(s) => Some(s.parse::<i32>().map_err(|_| CliError::UsageError)?),
    };

    Ok((pid, fd))
}

fn run_single(pid: i64, fd: i32) -> Result<ExitCode, CliError> {
    match ptsname_by_fd(pid as i32, fd) {
        Ok(result) => {
            println!(
                "target_pid={} target_fd={} pts=/dev/pts/{}",
                pid, result.fd, result.pts_index
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("target_pid={pid} target_fd={fd} pts=/dev/pts/-1");
            Err(e.into())
        }
    }
}

fn run_list(pid: i64) -> Result<ExitCode, CliError> {
    let entries = ptsname_list_all(pid as i32)?;
    println!(
        "There were {} /dev/pts devices discovered for pid={pid}",
        entries.len()
    );
    for entry in &entries {
        println!("target_pid={pid} pts=/dev/pts/{}", entry.pts_index);
    }
    Ok(ExitCode::SUCCESS)
}
