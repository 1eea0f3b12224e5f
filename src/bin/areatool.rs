//! areatool
//!
//! Inspection and maintenance of area files.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use areastore::area::AreaHeader;
use areastore::{Config, ConfigAreaFile, RestructureMode};

/// Area file maintenance tool
#[derive(Parser, Debug)]
#[command(name = "areatool")]
#[command(about = "Inspect, restructure and back up configuration area files")]
#[command(version)]
struct Args {
    /// I/O buffer size in KB
    #[arg(short, long, default_value = "64")]
    buffer_kb: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the header and object counts of an area file
    Inspect {
        /// The area file
        path: PathBuf,
    },

    /// Compact an area file
    Restructure {
        /// The area file
        path: PathBuf,

        /// What to do with gaps and pending deletions
        #[arg(short, long, value_enum, default_value = "remove-gaps")]
        mode: Mode,
    },

    /// Copy an area file and its deletion indices into a directory
    Backup {
        /// The area file
        path: PathBuf,

        /// Target directory
        target: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    PreserveGaps,
    RemoveGaps,
    DeletePermanently,
}

impl From<Mode> for RestructureMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::PreserveGaps => RestructureMode::PreserveGaps,
            Mode::RemoveGaps => RestructureMode::RemoveGaps,
            Mode::DeletePermanently => RestructureMode::DeleteObjectsPermanently,
        }
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,areastore=info"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    let config = Config::builder().io_buffer_size(args.buffer_kb * 1024).build();

    let result = match args.command {
        Commands::Inspect { path } => inspect(config, path),
        Commands::Restructure { path, mode } => restructure(config, path, mode.into()),
        Commands::Backup { path, target } => backup(config, path, target),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Open at the stored active version
fn open(config: Config, path: PathBuf) -> areastore::Result<ConfigAreaFile> {
    let stored = {
        let mut reader = BufReader::new(File::open(&path)?);
        AreaHeader::decode(&mut reader)?.active_version
    };
    ConfigAreaFile::open_with(config, path, stored, &BTreeMap::new())
}

fn inspect(config: Config, path: PathBuf) -> areastore::Result<()> {
    let area = open(config, path)?;
    let header = area.header();

    println!("area pid:           {}", header.area_pid);
    println!("active version:     {}", header.active_version);
    println!("next version:       {}", header.next_active_version);
    println!("serializer version: {}", header.serializer_version);
    println!("file size:          {}", area.file_len());
    println!("NGA blocks:         {}", header.nga_blocks.len());
    for block in &header.nga_blocks {
        match block.offset {
            Some(offset) => println!("  v{:<5} @ {:<10} activated {}", block.version, offset, block.activation_time),
            None => println!("  v{:<5} (empty)      activated {}", block.version, block.activation_time),
        }
    }
    println!("NGDyn bytes:        {}", header.id_index_start - header.ngdyn_start);
    println!("indexed ids:        {}", header.id_index_len());
    println!("indexed pids:       {}", header.pid_index_len());
    println!("current objects:    {}", area.get_current_objects().len());
    println!("future objects:     {}", area.get_new_objects().len());
    println!("invalid in memory:  {}", area.get_invalid_objects().len());
    println!("greatest running #: {}", area.greatest_running_number());

    area.close()
}

fn restructure(config: Config, path: PathBuf, mode: RestructureMode) -> areastore::Result<()> {
    let area = open(config, path)?;
    let report = area.restructure(mode)?;

    println!("historized:   {}", report.records_historized);
    println!("dropped:      {}", report.records_dropped);
    println!("gaps removed: {}", report.gaps_removed);
    println!("size:         {} -> {}", report.file_size_before, report.file_size_after);

    area.close()
}

fn backup(config: Config, path: PathBuf, target: PathBuf) -> areastore::Result<()> {
    let area = open(config, path)?;
    let report = area.backup_to(&target)?;

    println!("{} ({} bytes, crc32 {:08x})", report.path.display(), report.bytes, report.crc32);

    area.close()
}
