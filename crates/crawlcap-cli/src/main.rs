//! crawlcap CLI
//!
//! Command-line tool for the capture, archive and queue layers.
//!
//! ## Quick Start
//!
//! ```bash
//! # List the members of a concatenated gzip archive
//! crawlcap members crawl-00001.warc.gz
//!
//! # Decompress the single member starting at byte 48213
//! crawlcap cat crawl-00001.warc.gz --offset 48213
//!
//! # Record stdin the way a fetcher records a response, capped at 1 MiB
//! curl -s https://example.com/ | crawlcap capture - --max-length 1048576 --digest
//!
//! # Push items through a hybrid queue with a small memory head
//! crawlcap queue-smoke --head-max 16 --items 100000
//! ```
//!
//! ## Configuration
//!
//! - `--config` / `CRAWLCAP_CONFIG`: TOML file with `[recorder]`, `[queue]`
//!   and `[gzip]` sections. A missing file means defaults.
//! - `RUST_LOG`: log filter (default `info`)

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crawlcap_core::{CaptureConfig, Error};
use crawlcap_io::gzip::GzipMembers;
use crawlcap_io::RecordingReader;
use crawlcap_observability::{logging, metrics};
use crawlcap_queue::HybridQueue;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "crawlcap")]
#[command(about = "Inspect crawl captures, gzip archives and queues", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CRAWLCAP_CONFIG", default_value = "crawlcap.toml")]
    config: PathBuf,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the members of a gzip archive
    Members {
        /// Archive path
        file: PathBuf,
    },
    /// Decompress one member to stdout
    Cat {
        /// Archive path
        file: PathBuf,
        /// Byte offset of the member's header
        #[arg(short, long, default_value = "0")]
        offset: u64,
    },
    /// Record a stream and report what was captured
    Capture {
        /// Input file, or `-` for stdin
        input: String,
        /// Stop after this many bytes (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_length: u64,
        /// Stop after this many milliseconds (0 = unlimited)
        #[arg(long, default_value = "0")]
        timeout_ms: u64,
        /// Treat the first N bytes as headers; the rest is content
        #[arg(long)]
        header_bytes: Option<u64>,
        /// Compute a SHA-256 digest of the content
        #[arg(long)]
        digest: bool,
        /// Write the content body to this file
        #[arg(long)]
        body_out: Option<PathBuf>,
    },
    /// Enqueue and drain N items through a hybrid queue
    QueueSmoke {
        /// Items kept in memory (defaults to the configured value)
        #[arg(long)]
        head_max: Option<usize>,
        /// Number of items
        #[arg(long, default_value = "10000")]
        items: u64,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    logging::init();
    metrics::init();

    let cli = Cli::parse();
    let config = CaptureConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    match cli.command {
        Commands::Members { file } => handle_members(&config, file)?,
        Commands::Cat { file, offset } => handle_cat(&config, file, offset)?,
        Commands::Capture {
            input,
            max_length,
            timeout_ms,
            header_bytes,
            digest,
            body_out,
        } => handle_capture(
            &config,
            &input,
            max_length,
            Duration::from_millis(timeout_ms),
            header_bytes,
            digest,
            body_out,
        )?,
        Commands::QueueSmoke { head_max, items } => handle_queue_smoke(&config, head_max, items)?,
        Commands::Config => print!("{}", config.to_toml_string()?),
    }

    if cli.metrics {
        eprint!("{}", metrics::gather_text());
    }
    Ok(())
}

/// Walks every member and prints offset, sizes and the stored filename.
fn handle_members(config: &CaptureConfig, file: PathBuf) -> Result<()> {
    let source =
        File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?;
    let mut members = GzipMembers::with_config(source, &config.gzip)?;

    println!("{:>12} {:>12} {:>12}  name", "offset", "compressed", "size");
    let mut count = 0u64;
    while members.has_next()? {
        let offset = members.position()?;
        let name = members
            .next_member()
            .with_context(|| format!("Bad member header at offset {}", offset))?
            .filename_lossy()
            .unwrap_or_default();
        let size = members
            .goto_end_of_member()
            .with_context(|| format!("Bad member at offset {}", offset))?;
        let compressed = members.position()? - offset;
        println!("{:>12} {:>12} {:>12}  {}", offset, compressed, size, name);
        count += 1;
    }

    println!("{} member(s)", count);
    Ok(())
}

fn handle_cat(config: &CaptureConfig, file: PathBuf, offset: u64) -> Result<()> {
    let source =
        File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?;
    let mut members = GzipMembers::with_config(source, &config.gzip)?;
    members
        .seek_to_member(offset)
        .with_context(|| format!("No gzip member at offset {}", offset))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    io::copy(&mut members, &mut out).context("Failed to decompress member")?;
    out.flush()?;
    Ok(())
}

/// Records `input` through a [`RecordingReader`] and prints a summary.
///
/// Hitting `--max-length` or `--timeout-ms` is reported and the partial
/// capture is kept.
fn handle_capture(
    config: &CaptureConfig,
    input: &str,
    max_length: u64,
    timeout: Duration,
    header_bytes: Option<u64>,
    digest: bool,
    body_out: Option<PathBuf>,
) -> Result<()> {
    let source: Box<dyn Read> = if input == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(input).with_context(|| format!("Failed to open {}", input))?)
    };

    let name = format!("capture-{}", std::process::id());
    let mut reader = RecordingReader::from_config(&config.recorder, &name);
    if digest {
        reader.set_sha256_digest();
    }
    reader.open(source)?;

    if let Some(header_len) = header_bytes {
        let copied = io::copy(&mut (&mut reader).take(header_len), &mut io::sink())?;
        if copied < header_len {
            bail!("input ended after {} of {} header bytes", copied, header_len);
        }
        reader.mark_content_start();
    }
    if digest {
        reader.start_digest();
    }

    let started = Instant::now();
    match reader.read_fully_or_until(max_length, timeout) {
        Ok(()) => {}
        Err(e @ (Error::LengthExceeded { .. } | Error::Timeout { .. })) => {
            warn!(error = %e, size = reader.size(), "Capture truncated");
        }
        Err(e) => return Err(e).context("Failed to record input"),
    }
    reader.close()?;

    let recording = reader.recording()?;
    info!(
        size = recording.size(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Capture complete"
    );

    println!("size:           {}", recording.size());
    println!("content start:  {}", recording.content_start());
    println!("content length: {}", recording.response_content_length());
    println!(
        "spilled to disk: {}",
        recording.size() > config.recorder.buffer_size as u64
    );
    if let Some(value) = reader.digest_value() {
        let hex: String = value.iter().map(|b| format!("{:02x}", b)).collect();
        println!("sha256:         {}", hex);
    }
    if let Some(path) = body_out {
        let written = recording
            .copy_content_body_to(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("body written:   {} bytes to {}", written, path.display());
    }
    Ok(())
}

/// Pushes `items` sequence numbers through a hybrid queue and checks they
/// come back in order.
fn handle_queue_smoke(config: &CaptureConfig, head_max: Option<usize>, items: u64) -> Result<()> {
    let dir = tempfile::Builder::new()
        .prefix("crawlcap-queue-")
        .tempdir_in(std::env::temp_dir())?;
    let head_max = head_max.unwrap_or(config.queue.head_max);
    let mut queue: HybridQueue<u64> = HybridQueue::open(dir.path(), "smoke", head_max)?;

    let started = Instant::now();
    for i in 0..items {
        queue.enqueue(i)?;
    }
    println!(
        "enqueued {} (head {}, tail {})",
        queue.len(),
        queue.head_len(),
        queue.tail_len()
    );

    let mut expected = 0u64;
    while let Some(item) = queue.dequeue()? {
        if item != expected {
            bail!("queue returned {} where {} was expected", item, expected);
        }
        expected += 1;
    }
    if expected != items {
        bail!("queue returned {} of {} items", expected, items);
    }

    let elapsed = started.elapsed();
    println!(
        "drained {} in order in {:.1?} ({:.0} items/s)",
        expected,
        elapsed,
        items as f64 / elapsed.as_secs_f64().max(1e-9)
    );
    queue.release()?;
    Ok(())
}
