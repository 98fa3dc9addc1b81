//! # Thoughtsig CLI
//!
//! Offline inspection and maintenance of signature day files. Run it against a
//! data directory the service is not writing to, except for read-only commands.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use thoughtsig_core::{decode_entry, SignatureCacheConfig};
use thoughtsig_storage::format::{data_path, format_day, index_path, list_days, parse_day, scan_index};
use thoughtsig_storage::{Manager, PoolConfig, Reader, ReaderPool};

#[derive(Parser)]
#[command(name = "thoughtsig")]
#[command(about = "Inspect and maintain thought-signature day files")]
struct Cli {
    /// Service data directory (day files live under <data-dir>/signatures)
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List days with entry counts and sizes
    Days,
    /// List the records of one day
    Dump {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        /// Decode and print each entry as JSON
        #[arg(long)]
        payload: bool,
    },
    /// Print one entry as JSON
    Get {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        /// Record key, "<requestID>:<toolCallID>"
        #[arg(long)]
        key: String,
    },
    /// Read back every record and report corruption
    Verify {
        /// Only this day
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
    /// Delete all but the newest N days
    Prune {
        #[arg(long)]
        keep: usize,
    },
    /// Rebuild the index like the service does on startup and print cache stats
    Stats {
        #[arg(long, default_value_t = 3)]
        recovery_days: usize,
    },
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    parse_day(s).ok_or_else(|| format!("expected YYYY-MM-DD, got {s:?}"))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = SignatureCacheConfig::with_data_dir(&cli.data_dir);
    let dir = config.signatures_dir();

    match cli.command {
        Commands::Days => list(&dir)?,
        Commands::Dump { date, payload } => dump(&dir, date, payload)?,
        Commands::Get { date, key } => get(&dir, date, &key)?,
        Commands::Verify { date } => {
            let corrupt = verify(&dir, date)?;
            if corrupt > 0 {
                warn!("{} corrupt record(s) found", corrupt);
                return Ok(ExitCode::FAILURE);
            }
            info!("All records verified");
        }
        Commands::Prune { keep } => {
            let removed = prune(&dir, keep)?;
            info!("Pruned {} day(s)", removed.len());
        }
        Commands::Stats { recovery_days } => {
            let manager = Manager::open(SignatureCacheConfig {
                recovery_days,
                ..config
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&manager.stats())?);
            manager.close().await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn list(dir: &Path) -> Result<()> {
    for date in list_days(dir)? {
        let scan = scan_index(&index_path(dir, date))
            .with_context(|| format!("reading index for {}", format_day(date)))?;
        let data_bytes = std::fs::metadata(data_path(dir, date))
            .map(|m| m.len())
            .unwrap_or(0);
        println!(
            "{}  entries={}  header={}  data_bytes={}{}",
            format_day(date),
            scan.valid,
            scan.declared,
            data_bytes,
            if scan.trailing_bytes > 0 { "  (torn tail)" } else { "" }
        );
    }
    Ok(())
}

fn dump(dir: &Path, date: NaiveDate, payload: bool) -> Result<()> {
    let scan = scan_index(&index_path(dir, date))?;
    let reader = if payload {
        Some(Reader::open(dir, date)?)
    } else {
        None
    };

    for (id, entry) in scan.entries {
        match &reader {
            None => println!("{id}\toffset={}\tlen={}", entry.offset, entry.length.get()),
            Some(reader) => match reader.load(&id).and_then(|bytes| decode_entry(&bytes)) {
                Ok(decoded) => println!("{}", serde_json::to_string(&decoded)?),
                Err(e) => warn!("{}: {}", id, e),
            },
        }
    }
    Ok(())
}

fn get(dir: &Path, date: NaiveDate, key: &str) -> Result<()> {
    let reader = Reader::open(dir, date)?;
    let entry = decode_entry(&reader.load(key)?)?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

/// Returns the number of unreadable records.
fn verify(dir: &Path, only: Option<NaiveDate>) -> Result<usize> {
    let days = match only {
        Some(date) => vec![date],
        None => list_days(dir)?,
    };

    let mut corrupt = 0;
    for date in days {
        let reader = match Reader::open(dir, date) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("{}: cannot open: {}", format_day(date), e);
                corrupt += 1;
                continue;
            }
        };
        let mut bad = 0;
        for id in reader.record_ids() {
            let result = reader.load(id).and_then(|bytes| decode_entry(&bytes));
            match result {
                Ok(entry) if entry.key() == id => {}
                Ok(entry) => {
                    warn!("{}: record {} holds entry {}", format_day(date), id, entry.key());
                    bad += 1;
                }
                Err(e) => {
                    warn!("{}: record {}: {}", format_day(date), id, e);
                    bad += 1;
                }
            }
        }
        println!("{}  records={}  bad={}", format_day(date), reader.len(), bad);
        corrupt += bad;
    }
    Ok(corrupt)
}

/// Delete every day except the newest `keep`. Returns the removed days.
fn prune(dir: &Path, keep: usize) -> Result<Vec<NaiveDate>> {
    if keep == 0 {
        bail!("--keep must be at least 1");
    }
    let days = list_days(dir)?;
    let cutoff = days.len().saturating_sub(keep);
    let pool = ReaderPool::new(dir, PoolConfig::default());

    let removed = days[..cutoff].to_vec();
    for &date in &removed {
        pool.delete_date(date)?;
        info!("Removed {}", format_day(date));
    }
    pool.close();
    Ok(removed)
}
