//! Drift - chunk backup images into a deduplicated, sync-friendly tree.
//!
//! Provides:
//! - `sync`: chunk every file under the source root into the target root
//! - `restore`: rebuild one file from the target root
//! - `list`: show the files the manifest records
//! - `gc`: delete chunks the manifest no longer references

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use walkdir::WalkDir;

use drift_cdc::{defaults, CdcParams, ChunkingStrategy, DEFAULT_WINDOW_SIZE};
use drift_engine::{Engine, EngineConfig, SourceFile};
use drift_store::{restore_file, ChunkStore, GarbageCollector, ManifestStore, StoreConfig};

/// Drift command line.
#[derive(Parser)]
#[command(name = "drift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.drift/config.toml")]
    config: PathBuf,

    /// Target root (overrides [paths] target)
    #[arg(short, long, global = true)]
    target: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk the source tree into the target root
    Sync {
        /// Source root (overrides [paths] source)
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Chunking strategy
        #[arg(long, value_enum)]
        strategy: Option<StrategyKind>,

        /// Minimum chunk size in bytes
        #[arg(long)]
        min_size: Option<usize>,

        /// Average chunk size in bytes
        #[arg(long)]
        avg_size: Option<usize>,

        /// Maximum chunk size in bytes
        #[arg(long)]
        max_size: Option<usize>,

        /// Chunk size for the fixed strategy
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Hashing workers (0 = one per core)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Stop starting new files after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Rebuild a file from the target root
    Restore {
        /// File identity as shown by `list`
        identity: String,

        /// Output path
        output: PathBuf,
    },

    /// List files recorded in the manifest
    List,

    /// Delete chunks the manifest does not reference
    Gc {
        /// Report without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyKind {
    /// Constant-length chunks
    Fixed,
    /// Rolling-hash boundaries
    ContentDefined,
}

/// Chunking settings before validation.
#[derive(Debug, Clone)]
struct ChunkingSettings {
    kind: StrategyKind,
    min_size: usize,
    avg_size: usize,
    max_size: usize,
    chunk_size: usize,
    window: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            kind: StrategyKind::ContentDefined,
            min_size: defaults::CHUNK_MIN_SIZE,
            avg_size: defaults::CHUNK_AVG_SIZE,
            max_size: defaults::CHUNK_MAX_SIZE,
            chunk_size: defaults::FIXED_CHUNK_SIZE,
            window: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl ChunkingSettings {
    fn strategy(&self) -> ChunkingStrategy {
        match self.kind {
            StrategyKind::Fixed => ChunkingStrategy::Fixed {
                chunk_size: self.chunk_size,
            },
            StrategyKind::ContentDefined => ChunkingStrategy::ContentDefined(CdcParams {
                min_size: self.min_size,
                avg_size: self.avg_size,
                max_size: self.max_size,
                window_size: self.window,
            }),
        }
    }
}

/// Drift configuration.
#[derive(Debug, Clone, Default)]
struct DriftConfig {
    /// Directory holding the files to chunk
    source_root: Option<PathBuf>,
    /// Directory receiving chunks and the manifest
    target_root: Option<PathBuf>,
    /// Chunking strategy and bounds
    chunking: ChunkingSettings,
    /// Hashing workers
    workers: usize,
    /// Chunks held between reading and committing
    max_in_flight: usize,
}

impl DriftConfig {
    fn target_root(&self) -> Result<PathBuf> {
        match &self.target_root {
            Some(path) => Ok(expand_tilde(path)),
            None => bail!("No target root: pass --target or set [paths] target"),
        }
    }

    fn store_config(&self) -> Result<StoreConfig> {
        Ok(StoreConfig::new(self.target_root()?))
    }
}

/// Load configuration from TOML file.
fn load_config(path: &Path) -> Result<DriftConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        debug!("No config file found at {:?}, using defaults", path);
        return Ok(DriftConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    let toml: toml::Value = content.parse().context("Failed to parse config file")?;

    let mut config = DriftConfig::default();

    if let Some(paths) = toml.get("paths") {
        if let Some(source) = paths.get("source").and_then(|v| v.as_str()) {
            config.source_root = Some(PathBuf::from(source));
        }
        if let Some(target) = paths.get("target").and_then(|v| v.as_str()) {
            config.target_root = Some(PathBuf::from(target));
        }
    }

    if let Some(chunking) = toml.get("chunking") {
        if let Some(strategy) = chunking.get("strategy").and_then(|v| v.as_str()) {
            config.chunking.kind = StrategyKind::from_str(strategy, true)
                .map_err(|e| anyhow::anyhow!("Invalid chunking strategy {strategy:?}: {e}"))?;
        }
        let size = |key: &str| -> Result<Option<usize>> {
            chunking
                .get(key)
                .and_then(|v| v.as_integer())
                .map(|n| usize::try_from(n).with_context(|| format!("Invalid [chunking] {key}")))
                .transpose()
        };
        if let Some(n) = size("min_size")? {
            config.chunking.min_size = n;
        }
        if let Some(n) = size("avg_size")? {
            config.chunking.avg_size = n;
        }
        if let Some(n) = size("max_size")? {
            config.chunking.max_size = n;
        }
        if let Some(n) = size("chunk_size")? {
            config.chunking.chunk_size = n;
        }
        if let Some(n) = size("window")? {
            config.chunking.window = n;
        }
    }

    if let Some(engine) = toml.get("engine") {
        if let Some(workers) = engine.get("workers").and_then(|v| v.as_integer()) {
            config.workers = usize::try_from(workers).context("Invalid [engine] workers")?;
        }
        if let Some(n) = engine.get("max_in_flight").and_then(|v| v.as_integer()) {
            config.max_in_flight = usize::try_from(n).context("Invalid [engine] max_in_flight")?;
        }
    }

    Ok(config)
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Lists regular files under `root`, skipping anything under `exclude`.
///
/// Identities are paths relative to `root` with `/` separators. Any walk
/// error fails discovery: a subtree that could not be listed would look
/// deleted to the sync and lose its entries and chunks.
fn discover(root: &Path, exclude: &Path) -> Result<Vec<SourceFile>> {
    let mut sources = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.path() != exclude);

    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(root).display().to_string();
            anyhow::Error::new(err).context(format!("Failed to scan {path}"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .context("Failed to relativize path")?;
        let identity = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        sources.push(SourceFile::new(identity, entry.path()));
    }

    Ok(sources)
}

fn sync(config: &DriftConfig, source: &Path, timeout: Option<u64>) -> Result<()> {
    let store_config = config.store_config()?;
    let engine_config = EngineConfig::new(config.chunking.strategy())
        .with_workers(config.workers)
        .with_max_in_flight(config.max_in_flight);

    info!("Source root: {:?}", source);
    info!("Target root: {:?}", store_config.target_root);
    info!("Strategy: {}", engine_config.strategy);

    let engine = Engine::open(&store_config, engine_config).context("Failed to open target root")?;
    let sources = discover(source, &store_config.target_root)
        .context("Source discovery failed, nothing was changed")?;
    let deadline = timeout.map(|secs| Instant::now() + Duration::from_secs(secs));

    let (_, summary) = engine.run(&sources, deadline).context("Sync failed")?;
    println!("{summary}");

    if summary.has_skipped() {
        bail!("{} file(s) skipped", summary.skipped.len());
    }
    Ok(())
}

fn restore(config: &DriftConfig, identity: &str, output: &Path) -> Result<()> {
    let store_config = config.store_config()?;
    let manifest = ManifestStore::open(&store_config)
        .load()
        .context("Failed to load manifest")?;
    let store = ChunkStore::open(&store_config).context("Failed to open chunk store")?;

    let file = File::create(output).with_context(|| format!("Failed to create {output:?}"))?;
    let mut writer = BufWriter::new(file);
    let bytes = restore_file(&manifest, &store, identity, &mut writer)
        .with_context(|| format!("Failed to restore {identity}"))?;

    println!("Restored {identity} ({bytes} bytes) to {}", output.display());
    Ok(())
}

fn list(config: &DriftConfig) -> Result<()> {
    let manifest = ManifestStore::open(&config.store_config()?)
        .load()
        .context("Failed to load manifest")?;

    for entry in manifest.iter() {
        println!(
            "{:>14}  {:>6}  {}",
            entry.size(),
            entry.chunks().len(),
            entry.identity()
        );
    }
    println!("{} file(s), {} distinct chunk(s)", manifest.len(), manifest.reachable().len());
    Ok(())
}

fn gc(config: &DriftConfig, dry_run: bool) -> Result<()> {
    let store_config = config.store_config()?;
    let manifest = ManifestStore::open(&store_config)
        .load_committed()
        .context("Failed to load manifest")?;
    let store = ChunkStore::open(&store_config).context("Failed to open chunk store")?;

    let collector = GarbageCollector::new(&store);
    let report = if dry_run {
        collector.dry_run(&manifest)?
    } else {
        collector.collect(&manifest)?
    };

    let verb = if dry_run { "Would delete" } else { "Deleted" };
    println!(
        "{verb} {} of {} chunk(s), {} bytes",
        report.deleted.len(),
        report.scanned,
        report.bytes_freed
    );
    if report.missing > 0 {
        warn!(missing = report.missing, "Manifest references chunks absent from the store");
        println!("{} referenced chunk(s) missing from the store", report.missing);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    // Load configuration
    let mut config = load_config(&cli.config)?;
    if let Some(target) = cli.target {
        config.target_root = Some(target);
    }

    match cli.command {
        Commands::Sync {
            source,
            strategy,
            min_size,
            avg_size,
            max_size,
            chunk_size,
            workers,
            timeout,
        } => {
            if let Some(kind) = strategy {
                config.chunking.kind = kind;
            }
            if let Some(n) = min_size {
                config.chunking.min_size = n;
            }
            if let Some(n) = avg_size {
                config.chunking.avg_size = n;
            }
            if let Some(n) = max_size {
                config.chunking.max_size = n;
            }
            if let Some(n) = chunk_size {
                config.chunking.chunk_size = n;
            }
            if let Some(n) = workers {
                config.workers = n;
            }

            let source = match source.or_else(|| config.source_root.clone()) {
                Some(path) => expand_tilde(&path),
                None => bail!("No source root: pass --source or set [paths] source"),
            };
            sync(&config, &source, timeout)
        }
        Commands::Restore { identity, output } => restore(&config, &identity, &output),
        Commands::List => list(&config),
        Commands::Gc { dry_run } => gc(&config, dry_run),
    }
}
