//! # Forest Consistency Check CLI
//!
//! Opens a tamarack forest read-only, verifies every structural
//! invariant, and prints one line per problem found.
//!
//! ## Usage
//!
//! ```bash
//! # check a forest
//! fsck-tamarack ./mydb
//!
//! # check and drop index entries whose child node is missing
//! fsck-tamarack --fix ./mydb
//! ```
//!
//! Exit code 0 means the forest is clean, 1 means problems were
//! reported, 2 means the check could not run at all. Set `RUST_LOG` for
//! tracing output.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use eyre::{bail, Result, WrapErr};
use tracing_subscriber::EnvFilter;

use tamarack::{fsck, DiskNodeStore, Forest, OpenMode};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<bool> {
    let args: Vec<String> = env::args().collect();

    let mut fix = false;
    let mut dir: Option<PathBuf> = None;
    for arg in &args[1..] {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(true);
            }
            "--version" | "-v" => {
                println!("fsck-tamarack {}", env!("CARGO_PKG_VERSION"));
                return Ok(true);
            }
            "--fix" => {
                fix = true;
            }
            other if other.starts_with('-') => {
                bail!("unknown option: {other}");
            }
            other => {
                if dir.is_some() {
                    bail!("exactly one forest directory expected");
                }
                dir = Some(PathBuf::from(other));
            }
        }
    }
    let Some(dir) = dir else {
        print_usage();
        bail!("no forest directory given");
    };

    if fix {
        let store = DiskNodeStore::open_existing(&dir, OpenMode::ReadWrite)
            .wrap_err_with(|| format!("cannot open forest at '{}'", dir.display()))?;
        let mut forest = Forest::open(store).wrap_err("cannot read forest metadata")?;
        let fixed = fsck::fix_dangling(&mut forest).wrap_err("repair pass failed")?;
        for problem in &fixed {
            println!("fixed: {problem}");
        }
        if !fixed.is_empty() {
            forest.commit().wrap_err("cannot commit repairs")?;
        }
    }

    let store = DiskNodeStore::open_existing(&dir, OpenMode::ReadOnly)
        .wrap_err_with(|| format!("cannot open forest at '{}'", dir.display()))?;
    let mut forest = Forest::open(store).wrap_err("cannot read forest metadata")?;
    let problems = fsck::check(&mut forest).wrap_err("check aborted")?;

    for problem in &problems {
        println!("{problem}");
    }
    if problems.is_empty() {
        println!("{}: clean", dir.display());
        Ok(true)
    } else {
        println!("{}: {} problem(s)", dir.display(), problems.len());
        Ok(false)
    }
}

fn print_usage() {
    println!("Usage: fsck-tamarack [OPTIONS] <FOREST_DIR>");
    println!();
    println!("Check a tamarack forest for structural problems.");
    println!();
    println!("Options:");
    println!("  --fix        drop references to missing nodes (opens writable)");
    println!("  -h, --help       show this help");
    println!("  -v, --version    show version");
}
