//! Cairn operator CLI - inspect, edit and back up cache storage

mod backup;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cairncache::config::DEFAULT_BUCKETS;
use cairncache::{
    Backend, BackendConfig, CacheConfig, EvictionConfig, StrategyKind, TypeRegistry, Value,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::backup::{BackupConfig, Layout};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    target: Target,

    #[command(subcommand)]
    command: Command,
}

/// Which cache to operate on
#[derive(Args, Debug, Default)]
struct Target {
    /// JSON cache configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Single-document cache file
    #[arg(long, value_name = "FILE", conflicts_with_all = ["config", "sharded", "bucket"])]
    document: Option<PathBuf>,

    /// Sharded cache directory
    #[arg(long, value_name = "DIR", conflicts_with_all = ["config", "bucket"])]
    sharded: Option<PathBuf>,

    /// Bucketed block file
    #[arg(long, value_name = "FILE", conflicts_with = "config")]
    bucket: Option<PathBuf>,

    /// Sharded cache stores strings and bytes as raw files
    #[arg(long, requires = "sharded")]
    native: bool,

    /// Bucket count for --bucket
    #[arg(long, default_value_t = DEFAULT_BUCKETS)]
    buckets: u32,

    /// Apply a capacity limit
    #[arg(long)]
    capacity: Option<usize>,

    /// Fraction of capacity evicted per pass
    #[arg(long, default_value_t = 0.1, requires = "capacity")]
    ratio: f64,

    /// Eviction strategy (random, oldest)
    #[arg(long, default_value = "random", requires = "capacity")]
    strategy: String,

    /// Hide entries older than this many milliseconds
    #[arg(long)]
    max_age_ms: Option<u64>,
}

impl Target {
    fn resolve(&self) -> Result<CacheConfig> {
        let mut config = if let Some(path) = &self.config {
            CacheConfig::load(path)
                .with_context(|| format!("Failed to load config {:?}", path))?
        } else if let Some(path) = &self.document {
            CacheConfig::new(BackendConfig::Document { path: path.clone() })
        } else if let Some(dir) = &self.sharded {
            CacheConfig::new(BackendConfig::Sharded {
                dir: dir.clone(),
                native: self.native,
            })
        } else if let Some(path) = &self.bucket {
            CacheConfig::new(BackendConfig::Bucket {
                path: path.clone(),
                buckets: self.buckets,
            })
        } else {
            bail!("No cache selected: pass --config, --document, --sharded or --bucket");
        };

        if let Some(capacity) = self.capacity {
            let strategy: StrategyKind = self.strategy.parse()?;
            config.eviction = Some(
                EvictionConfig::new(capacity)
                    .ratio(self.ratio)
                    .strategy(strategy),
            );
        }
        if self.max_age_ms.is_some() {
            config.max_age_ms = self.max_age_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a value as JSON
    Get {
        key: String,
        /// Also print the stored type name
        #[arg(long)]
        with_type: bool,
    },
    /// Store a value
    Put {
        key: String,
        value: String,
        /// How to interpret VALUE
        #[arg(long, value_enum, default_value_t = ValueKind::String)]
        kind: ValueKind,
    },
    /// Delete one or more keys
    Remove {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// List keys
    Keys,
    /// Count keys
    Size,
    /// Print the age of an entry in milliseconds
    Age { key: String },
    /// Delete every entry
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
    /// Print the effective configuration
    Config,
    /// Archive the cache storage as tar.gz
    Backup {
        /// Backup directory
        #[arg(long)]
        out: Option<PathBuf>,
        /// Label included in the archive name
        #[arg(long)]
        name: Option<String>,
        /// Keep only the N newest archives afterwards
        #[arg(long)]
        keep: Option<usize>,
    },
    /// List archives
    Backups {
        /// Backup directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Replace the cache storage with an archive
    Restore { archive: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ValueKind {
    String,
    Json,
    I64,
    U64,
    F64,
    Bool,
}

fn parse_value(kind: ValueKind, raw: &str) -> Result<Value> {
    let value = match kind {
        ValueKind::String => Value::new(raw.to_string()),
        ValueKind::Json => Value::new(
            serde_json::from_str::<serde_json::Value>(raw).context("VALUE is not valid JSON")?,
        ),
        ValueKind::I64 => Value::new(raw.parse::<i64>().context("VALUE is not an i64")?),
        ValueKind::U64 => Value::new(raw.parse::<u64>().context("VALUE is not a u64")?),
        ValueKind::F64 => Value::new(raw.parse::<f64>().context("VALUE is not an f64")?),
        ValueKind::Bool => Value::new(raw.parse::<bool>().context("VALUE is not a bool")?),
    };
    Ok(value)
}

fn open(config: &CacheConfig) -> Result<Box<dyn Backend>> {
    if config.backend == BackendConfig::Memory {
        bail!("A memory cache has nothing to inspect");
    }
    Ok(config.build(Arc::new(TypeRegistry::default()))?)
}

fn backups(config: &CacheConfig, out: Option<PathBuf>) -> Result<BackupConfig> {
    let layout = match config.backend {
        BackendConfig::Sharded { .. } => Layout::Directory,
        _ => Layout::File,
    };
    let source = config
        .backend
        .location()
        .context("A memory cache has no storage to back up")?;
    Ok(BackupConfig::new(source, layout, out))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.target.resolve()?;

    match cli.command {
        Command::Get { key, with_type } => {
            let cache = open(&config)?;
            let value = cache
                .get(&key)?
                .with_context(|| format!("Key not found: {}", key))?;
            if with_type {
                println!("{}", value.type_name());
            }
            println!("{}", serde_json::to_string_pretty(&value.to_json()?)?);
        }
        Command::Put { key, value, kind } => {
            let cache = open(&config)?;
            cache.put(&key, parse_value(kind, &value)?)?;
            info!("Stored {}", key);
        }
        Command::Remove { keys } => {
            let cache = open(&config)?;
            cache.remove_all(&keys)?;
            info!("Removed {} key(s)", keys.len());
        }
        Command::Keys => {
            let cache = open(&config)?;
            let mut keys: Vec<_> = cache.key_set()?.into_iter().collect();
            keys.sort();
            for key in keys {
                println!("{}", key);
            }
        }
        Command::Size => {
            let cache = open(&config)?;
            println!("{}", cache.size()?);
        }
        Command::Age { key } => {
            let cache = open(&config)?;
            let age = cache
                .age(&key)?
                .with_context(|| format!("Key not found: {}", key))?;
            println!("{}", age.as_millis());
        }
        Command::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear without --yes");
            }
            let cache = open(&config)?;
            cache.clear()?;
            info!("Cache cleared");
        }
        Command::Config => {
            println!("{}", config.to_json()?);
        }
        Command::Backup { out, name, keep } => {
            let backup = backups(&config, out)?;
            let path = backup.create_backup(name.as_deref())?;
            println!("{}", path.display());
            if let Some(keep) = keep {
                backup.cleanup_old_backups(keep)?;
            }
        }
        Command::Backups { out } => {
            for info in backups(&config, out)?.list_backups()? {
                println!("{}\t{} bytes", info.filename, info.size);
            }
        }
        Command::Restore { archive } => {
            let previous = backups(&config, None)?.restore_backup(&archive)?;
            println!("Restored; previous data kept at {}", previous.display());
        }
    }

    Ok(())
}
