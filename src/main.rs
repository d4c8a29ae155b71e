//! NexScan CLI
//!
//! Command-line front end for the indexing core: bulk scans, searches, and
//! change monitoring over live volumes (Windows) or raw volume images
//! (any platform).

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use nexscan::index::{parse_query, IndexStore, QueryEngine};
use nexscan::ntfs::mft::{MftReader, ScanOptions, ScanStats};
use nexscan::volume::{ImageVolume, VolumeRead};
use nexscan::{NexScanError, Result};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// NexScan - NTFS volume indexer
///
/// Seeds an index from a direct MFT scan, keeps it fresh from the USN
/// journal, and answers ranked name/metadata searches.
#[derive(Parser)]
#[command(name = "nexscan")]
#[command(version)]
#[command(about = "NTFS volume indexer and search", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a volume and print index statistics
    Scan {
        /// Raw NTFS volume image to scan
        #[arg(long, conflicts_with = "drive")]
        image: Option<PathBuf>,

        /// Drive letter to scan (Windows, requires elevation)
        #[arg(short, long)]
        drive: Option<char>,

        /// MFT records per read batch
        #[arg(long, default_value = "1024")]
        batch: usize,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Search an indexed volume
    Search {
        /// Raw NTFS volume image to search
        #[arg(long, conflicts_with = "drive")]
        image: Option<PathBuf>,

        /// Drive letter (Windows, requires elevation)
        #[arg(short, long)]
        drive: Option<char>,

        /// Query: text plus ext:/size:/after:/before:/attr: clauses
        #[arg(allow_hyphen_values = true)]
        query: String,

        /// Maximum results
        #[arg(short, long, default_value = "100")]
        max: usize,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the largest files on a volume
    Largest {
        #[arg(long, conflicts_with = "drive")]
        image: Option<PathBuf>,

        #[arg(short, long)]
        drive: Option<char>,

        /// Number of files to show
        #[arg(short, long, default_value = "20")]
        count: usize,
    },

    /// Stream file system change events (Windows)
    Monitor {
        /// Drive letter to monitor
        #[arg(short, long)]
        drive: char,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "500")]
        interval: u64,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Scan {
            image,
            drive,
            batch,
            json,
        } => dispatch(image, drive, batch, move |store, stats| cmd_scan_report(store, stats, json)),

        Commands::Search {
            image,
            drive,
            query,
            max,
            json,
        } => dispatch(image, drive, 1024, move |store, _| {
            cmd_search(store, &query, max, json)
        }),

        Commands::Largest { image, drive, count } => {
            dispatch(image, drive, 1024, move |store, _| cmd_largest(store, count))
        }

        Commands::Monitor { drive, interval } => cmd_monitor(drive, interval),
    };

    if let Err(e) = result {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
}

/// Open the requested volume source, run a bulk scan, hand the index to `f`
fn dispatch<F>(image: Option<PathBuf>, drive: Option<char>, batch: usize, f: F) -> Result<()>
where
    F: FnOnce(Arc<IndexStore>, ScanStats) -> Result<()>,
{
    match (image, drive) {
        (Some(path), _) => {
            let volume = ImageVolume::open(path)?;
            let (store, stats) = build_index(volume, batch)?;
            f(store, stats)
        }
        (None, Some(drive)) => run_on_drive(drive, batch, f),
        (None, None) => Err(NexScanError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "pass --image <file> or --drive <letter>",
        ))),
    }
}

#[cfg(windows)]
fn run_on_drive<F>(drive: char, batch: usize, f: F) -> Result<()>
where
    F: FnOnce(Arc<IndexStore>, ScanStats) -> Result<()>,
{
    let volume = nexscan::ntfs::winapi::LiveVolume::open(drive)?;
    let (store, stats) = build_index(volume, batch)?;
    f(store, stats)
}

#[cfg(not(windows))]
fn run_on_drive<F>(_drive: char, _batch: usize, _f: F) -> Result<()>
where
    F: FnOnce(Arc<IndexStore>, ScanStats) -> Result<()>,
{
    Err(NexScanError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "live volume access requires Windows; use --image with a raw volume image",
    )))
}

fn build_index<V: VolumeRead>(volume: V, batch: usize) -> Result<(Arc<IndexStore>, ScanStats)> {
    let options = ScanOptions {
        batch_size: batch,
        ..Default::default()
    };
    let mut reader = MftReader::new(volume, options)?;
    let store = Arc::new(IndexStore::new(reader.volume_id()));

    let pb = ProgressBar::new(reader.total_records());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_message("Reading MFT...");

    let cancel = Arc::new(AtomicBool::new(false));
    let sink_store = store.clone();
    let stats = reader.scan(
        &cancel,
        |processed, _total| pb.set_position(processed),
        |entry| sink_store.upsert(entry),
    )?;

    pb.finish_with_message(format!(
        "{} entries in {:.2}s",
        stats.entries_emitted,
        stats.elapsed.as_secs_f64()
    ));

    Ok((store, stats))
}

fn cmd_scan_report(store: Arc<IndexStore>, stats: ScanStats, json: bool) -> Result<()> {
    let entries = store.snapshot_entries();
    let files = entries.iter().filter(|e| !e.is_directory).count();
    let dirs = entries.len() - files;
    let total_size: u64 = entries.iter().map(|e| e.size).sum();

    if json {
        let report = serde_json::json!({
            "volume_id": store.volume_id(),
            "files": files,
            "directories": dirs,
            "total_size": total_size,
            "records_processed": stats.records_processed,
            "decode_errors": stats.decode_errors,
            "elapsed_ms": stats.elapsed.as_millis() as u64,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("  Volume:       {}", style(store.volume_id()).cyan());
    println!("  Files:        {}", style(files).green());
    println!("  Directories:  {}", style(dirs).green());
    println!(
        "  Total size:   {}",
        style(humansize::format_size(total_size, humansize::BINARY)).green()
    );
    println!("  MFT records:  {}", stats.records_processed);
    if stats.decode_errors > 0 {
        println!("  Skipped:      {} undecodable records", style(stats.decode_errors).yellow());
    }

    Ok(())
}

fn cmd_search(store: Arc<IndexStore>, query: &str, max: usize, json: bool) -> Result<()> {
    let engine = QueryEngine::new(store);
    let parsed = parse_query(query);
    let hits = engine.search(&parsed, max);

    if json {
        let rows: Vec<_> = hits
            .iter()
            .map(|h| {
                serde_json::json!({
                    "path": h.path,
                    "name": h.entry.name,
                    "size": h.entry.size,
                    "is_directory": h.entry.is_directory,
                    "modified": h.entry.modified_at().to_rfc3339(),
                    "score": h.score,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("{}", style("No matches.").dim());
        return Ok(());
    }

    for hit in &hits {
        let size = if hit.entry.is_directory {
            style("<dir>".to_string()).dim()
        } else {
            style(humansize::format_size(hit.entry.size, humansize::BINARY)).green()
        };
        println!("{:>12}  {}", size, hit.path);
    }
    println!("{}", style(format!("{} result(s)", hits.len())).dim());

    Ok(())
}

fn cmd_largest(store: Arc<IndexStore>, count: usize) -> Result<()> {
    let mut files: Vec<_> = store
        .snapshot_entries()
        .into_iter()
        .filter(|e| !e.is_directory)
        .collect();
    files.sort_by(|a, b| b.size.cmp(&a.size));
    files.truncate(count);

    for entry in &files {
        let path = store
            .resolve_path_string(entry.id)
            .unwrap_or_else(|_| format!("<unresolved> {}", entry.name));
        println!(
            "{:>12}  {}",
            style(humansize::format_size(entry.size, humansize::BINARY)).green(),
            path
        );
    }

    Ok(())
}

#[cfg(windows)]
fn cmd_monitor(drive: char, interval: u64) -> Result<()> {
    use nexscan::journal::JournalMonitor;
    use nexscan::ntfs::usn::ChangeKind;
    use nexscan::ntfs::winapi::LiveJournal;
    use std::time::Duration;

    let journal = LiveJournal::open(drive)?;
    let mut monitor = JournalMonitor::new(journal);
    let data = monitor.attach(None)?;

    println!(
        "Monitoring {}: (journal {:#x}, next usn {})",
        drive, data.usn_journal_id, data.next_usn
    );

    loop {
        match monitor.poll() {
            Ok(events) => {
                for event in &events {
                    let kind = match &event.kind {
                        ChangeKind::Created => style("created ").green(),
                        ChangeKind::Deleted => style("deleted ").red(),
                        ChangeKind::Renamed { .. } => style("renamed ").yellow(),
                        ChangeKind::DataModified => style("modified").cyan(),
                        ChangeKind::AttributesChanged => style("attrib  ").magenta(),
                    };
                    match &event.kind {
                        ChangeKind::Renamed { old_name, .. } => {
                            println!("{}  {} -> {}  (usn {})", kind, old_name, event.name, event.usn);
                        }
                        _ => println!("{}  {}  (usn {})", kind, event.name, event.usn),
                    }
                }
                if events.is_empty() {
                    std::thread::sleep(Duration::from_millis(interval));
                }
            }
            Err(e @ NexScanError::JournalGap { .. }) => {
                eprintln!(
                    "{} {} (a full re-seed would be required to trust an index)",
                    style("journal gap:").yellow().bold(),
                    e
                );
                monitor.attach(None)?;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(not(windows))]
fn cmd_monitor(_drive: char, _interval: u64) -> Result<()> {
    Err(NexScanError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "change journal monitoring requires Windows",
    )))
}
