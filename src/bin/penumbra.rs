//! Binary entry point for the Penumbra administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use penumbra::{
    admin::{
        checkpoint, info, open_database, verify, AdminOpenOptions, CheckpointReport, InfoReport,
        RangeReport, VerifyLevel, VerifyReport,
    },
    LoadStatus,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "penumbra",
    version,
    about = "Administrative CLI for Penumbra database files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "PENUMBRA_CONFIG",
        help = "TOML file with engine settings"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Open the database without writing to it")]
    read_only: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Show header ranges, page counts, file sizes, tables and indexes")]
    Info {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Replay the WAL and write all changes into the main file")]
    Checkpoint {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Check page ownership, free-list bounds and index definitions")]
    Verify {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Fast)]
        level: VerifyLevelArg,
    },

    #[command(about = "Materialize every unloaded similarity index and report the outcome")]
    LoadIndexes {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, default_value_t = 60_000, help = "Give up waiting after this many ms")]
        timeout_ms: u64,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

#[derive(Debug, Serialize)]
struct LoadIndexesReport {
    indexes: usize,
    duration_ms: f64,
    status: LoadStatus,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PENUMBRA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let open_opts = build_open_options(&cli)?;

    match cli.command {
        Command::Info { db_path } => {
            let report = info(&db_path, &open_opts)?;
            emit(&cli.format, &report, |fmt| print_info_text(fmt, &report))?;
        }
        Command::Checkpoint { db_path } => {
            if open_opts.config.read_only {
                return Err("checkpoint cannot run under --read-only".into());
            }
            let report = checkpoint(&db_path, &open_opts)?;
            emit(&cli.format, &report, |fmt| {
                print_checkpoint_text(fmt, &report)
            })?;
        }
        Command::Verify { db_path, level } => {
            let report = verify(&db_path, &open_opts, level.into())?;
            emit(&cli.format, &report, |fmt| print_verify_text(fmt, &report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::LoadIndexes {
            db_path,
            timeout_ms,
        } => {
            let report = load_indexes(&db_path, &open_opts, Duration::from_millis(timeout_ms))?;
            emit(&cli.format, &report, |fmt| {
                print_load_indexes_text(fmt, &report)
            })?;
            if matches!(report.status, LoadStatus::Failed(_)) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn build_open_options(cli: &Cli) -> Result<AdminOpenOptions, Box<dyn Error>> {
    let opts = match &cli.config {
        Some(path) => AdminOpenOptions::from_config_file(path)?,
        None => AdminOpenOptions::default(),
    };
    let read_only = cli.read_only || opts.config.read_only;
    Ok(opts.read_only(read_only))
}

fn load_indexes(
    db_path: &Path,
    open_opts: &AdminOpenOptions,
    timeout: Duration,
) -> Result<LoadIndexesReport, Box<dyn Error>> {
    let db = open_database(db_path, open_opts)?;
    let indexes = db.catalog().indexes().count();
    let start = Instant::now();
    db.start_index_load()?;
    let status = db.wait_for_index_load(timeout);
    let elapsed = start.elapsed();
    db.close()?;
    if status == LoadStatus::Loading {
        return Err(format!("index load still running after {} ms", timeout.as_millis()).into());
    }
    Ok(LoadIndexesReport {
        indexes,
        duration_ms: elapsed.as_secs_f64() * 1_000.0,
        status,
    })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

struct Range<'a>(&'a RangeReport);

impl fmt::Display for Range<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.start {
            Some(start) => write!(f, "{start}+{}", self.0.num_pages),
            None => f.write_str("none"),
        }
    }
}

fn print_info_text(_: OutputFormat, report: &InfoReport) {
    println!(
        "Header: database_id={} page_size={} logically_empty={}",
        report.header.database_id, report.header.page_size, report.header.logically_empty
    );
    println!(
        "        catalog={} metadata={}",
        Range(&report.header.catalog_range),
        Range(&report.header.metadata_range)
    );
    println!();
    println!(
        "Pages: num_pages={} free_pages={} free_ranges={}",
        report.pages.num_pages,
        report.pages.free_pages,
        report.pages.free_ranges.len()
    );
    println!();
    println!(
        "Files: main={} wal={} shadow={}",
        report.files.main_bytes, report.files.wal_bytes, report.files.shadow_bytes
    );
    if !report.tables.is_empty() {
        println!();
        println!("Tables:");
        for table in &report.tables {
            println!(
                "  {} (id={}): rows={} persisted={} rows_range={} overflow={}",
                table.name,
                table.id,
                table.rows,
                table.persisted_rows,
                Range(&table.rows_range),
                Range(&table.overflow_range)
            );
            println!("    columns: {}", table.columns.join(", "));
        }
    }
    if !report.indexes.is_empty() {
        println!();
        println!("Indexes:");
        for index in &report.indexes {
            println!(
                "  {} (id={}) on {}: {}",
                index.name, index.id, index.table, index.definition
            );
        }
    }
}

fn print_checkpoint_text(_: OutputFormat, report: &CheckpointReport) {
    println!(
        "Checkpoint ({}) finished in {:.2} ms: catalog_written={} metadata_written={} storage_written={}",
        report.outcome,
        report.duration_ms,
        report.catalog_written,
        report.metadata_written,
        report.storage_written
    );
    println!(
        "  pages_applied={} pages_freed={} catalog={} metadata={} wal_bytes={}->{}",
        report.pages_applied,
        report.pages_freed,
        Range(&report.catalog_range),
        Range(&report.metadata_range),
        report.wal_bytes_before,
        report.wal_bytes_after
    );
}

fn print_verify_text(_: OutputFormat, report: &VerifyReport) {
    println!(
        "Verify ({:?}) => success={} tables={} indexes={} owned_ranges={} rows_read={} indexes_built={}",
        report.level,
        report.success,
        report.counts.tables,
        report.counts.indexes,
        report.counts.owned_ranges,
        report.counts.rows_read,
        report.counts.indexes_built,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}

fn print_load_indexes_text(_: OutputFormat, report: &LoadIndexesReport) {
    match &report.status {
        LoadStatus::Failed(reason) => println!(
            "Index load failed after {:.2} ms ({} indexes):\n{reason}",
            report.duration_ms, report.indexes
        ),
        status => println!(
            "Index load {:?} after {:.2} ms ({} indexes)",
            status, report.duration_ms, report.indexes
        ),
    }
}
