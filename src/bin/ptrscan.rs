use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use ptrscan_core::core::globals::TOKIO_RUNTIME;
use ptrscan_core::pointer_scan::{OperationOutcome, ScanConfig, ScanSession};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ptrscan")]
#[command(about = "Find pointer chains to an address in a 32-bit memory dump")]
struct Args {
    /// Raw memory dump
    dump: PathBuf,

    /// Address of the first byte of the dump
    #[arg(short, long, value_parser = parse_u32, default_value = "0")]
    base: u32,

    /// Words in the dump are little-endian
    #[arg(long)]
    little_endian: bool,

    /// JSON scan configuration; command line values override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address the chains should reach
    #[arg(short, long, value_parser = parse_u32)]
    target: Option<u32>,

    /// Lowest value a pointer may have (defaults to the dump base)
    #[arg(long, value_parser = parse_u32)]
    range_base: Option<u32>,

    /// Bytes above the range base a pointer may point into (defaults to the dump length)
    #[arg(long, value_parser = parse_u32)]
    range_length: Option<u32>,

    #[arg(short, long)]
    depth: Option<u8>,

    #[arg(long, value_parser = parse_i32, allow_hyphen_values = true)]
    min_offset: Option<i32>,

    /// Largest offset for the hop nearest the target
    #[arg(long, value_parser = parse_i32)]
    primary_max_offset: Option<i32>,

    /// Largest offset for every other hop
    #[arg(long, value_parser = parse_i32)]
    secondary_max_offset: Option<i32>,

    #[arg(short, long)]
    align: Option<u32>,

    /// Stop after printing this many chains
    #[arg(short, long)]
    limit: Option<usize>,
}

impl Args {
    fn scan_config(&self) -> Result<ScanConfig> {
        let mut config = match &self.config {
            Some(path) => ScanConfig::from_json_file(path).with_context(|| format!("loading {:?}", path))?,
            None => ScanConfig::default(),
        };

        if let Some(target) = self.target {
            config.search_address = target;
        }
        if let Some(base) = self.range_base {
            config.addressable_base = base;
        }
        if let Some(length) = self.range_length {
            config.addressable_length = length;
        }
        if let Some(depth) = self.depth {
            config.max_depth = depth;
        }
        if let Some(offset) = self.min_offset {
            config.minimum_offset = offset;
        }
        if let Some(offset) = self.primary_max_offset {
            config.primary_maximum_offset = offset;
        }
        if let Some(offset) = self.secondary_max_offset {
            config.secondary_maximum_offset = offset;
        }
        if let Some(align) = self.align {
            config.alignment = align;
        }
        Ok(config)
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_i32(s: &str) -> Result<i32, String> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let magnitude = parse_u32(digits)? as i64;
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).map_err(|_| format!("offset '{}' out of range", s))
}

/// Fill in an unset addressable range from the dump.
///
/// A base the user chose is kept; the length then runs to the end of the dump.
fn default_addressable_range(config: &mut ScanConfig, base_given: bool, dump_base: u32, dump_length: u32) {
    if config.addressable_length != 0 {
        return;
    }
    if !base_given {
        config.addressable_base = dump_base;
    }
    let dump_end = dump_base as u64 + dump_length as u64;
    config.addressable_length = dump_end
        .saturating_sub(config.addressable_base as u64)
        .min(u32::MAX as u64) as u32;
}

/// Log progress until the running operation finishes, then collect its outcome.
fn wait_with_progress(session: &mut ScanSession, what: &str) -> Result<OperationOutcome> {
    let mut last_progress = None;
    while session.is_scan_running() {
        let report = session.progress();
        if last_progress != Some(report.progress) {
            match report.fraction() {
                Some(fraction) => info!("{}: {:.0}% ({} pointers)", what, fraction * 100.0, report.pointers_found),
                None => info!("{}...", what),
            }
            last_progress = Some(report.progress);
        }
        thread::sleep(Duration::from_millis(250));
    }
    Ok(TOKIO_RUNTIME.block_on(session.wait())?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ptrscan=info".parse()?)
                .add_directive("ptrscan_core=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut config = args.scan_config()?;
    if args.target.is_none() && args.config.is_none() {
        warn!("No target given, searching for pointers to 0x{:08X}", config.search_address);
    }

    let mut session = ScanSession::new();
    session.load_snapshot(&args.dump, args.base, args.little_endian)?;
    wait_with_progress(&mut session, "Loading dump")?;

    let snapshot = session.snapshot().context("memory dump did not load")?;
    let base_given = args.range_base.is_some() || config.addressable_base != 0;
    default_addressable_range(&mut config, base_given, snapshot.base_address(), snapshot.length());
    config.validate()?;

    session.generate_index(&config)?;
    wait_with_progress(&mut session, "Indexing pointers")?;
    info!("{}", session.status_text());

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let limit = args.limit.unwrap_or(usize::MAX);
    for chain in session.run(&config)?.take(limit) {
        writeln!(out, "{}", chain)?;
    }
    out.flush()?;

    match TOKIO_RUNTIME.block_on(session.wait())? {
        OperationOutcome::Cancelled => info!("Stopped after {} chains", limit),
        OperationOutcome::Searched { truncated: true, .. } => {
            warn!("{} (candidate cap reached, some deeper chains were skipped)", session.status_text())
        },
        _ => info!("{}", session.status_text()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u32("0x8262AA00"), Ok(0x8262_AA00));
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert!(parse_u32("0xZZ").is_err());
        assert_eq!(parse_i32("-0x10"), Ok(-0x10));
        assert_eq!(parse_i32("+0x4000"), Ok(0x4000));
        assert!(parse_i32("0x80000000").is_err());
    }

    #[test]
    fn test_range_defaults_to_whole_dump() {
        let mut config = ScanConfig::new(0x8000_0100);
        default_addressable_range(&mut config, false, 0x8000_0000, 0x1000);
        assert_eq!(config.addressable_base, 0x8000_0000);
        assert_eq!(config.addressable_length, 0x1000);
    }

    #[test]
    fn test_range_keeps_given_base() {
        let mut config = ScanConfig::new(0x8000_0900).with_addressable_range(0x8000_0800, 0);
        default_addressable_range(&mut config, true, 0x8000_0000, 0x1000);
        assert_eq!(config.addressable_base, 0x8000_0800);
        assert_eq!(config.addressable_length, 0x800);
    }

    #[test]
    fn test_range_with_length_is_untouched() {
        let mut config = ScanConfig::new(0x10).with_addressable_range(0, 0x100);
        default_addressable_range(&mut config, false, 0x8000_0000, 0x1000);
        assert_eq!((config.addressable_base, config.addressable_length), (0, 0x100));
    }
}
