//! Backup and restore of persisted cache storage

use anyhow::{bail, Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::info;

/// Shape of the storage being archived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// A single file (document root or bucket block file)
    File,
    /// A directory of files (sharded backend)
    Directory,
}

/// Where a cache lives and where its archives go
pub struct BackupConfig {
    pub source: PathBuf,
    pub layout: Layout,
    pub backup_dir: PathBuf,
}

impl BackupConfig {
    /// Archives default to a `backups` directory next to `source`
    pub fn new<P1: AsRef<Path>, P2: AsRef<Path>>(
        source: P1,
        layout: Layout,
        backup_dir: Option<P2>,
    ) -> Self {
        let source = source.as_ref().to_path_buf();
        let backup_dir = backup_dir
            .map(|p| p.as_ref().to_path_buf())
            .unwrap_or_else(|| parent_of(&source).join("backups"));

        Self {
            source,
            layout,
            backup_dir,
        }
    }

    fn source_name(&self) -> Result<OsString> {
        self.source
            .file_name()
            .map(|n| n.to_os_string())
            .with_context(|| format!("Cache path has no file name: {:?}", self.source))
    }

    /// Archive the cache storage into `<backup_dir>/cairn_<name>_<timestamp>.tar.gz`
    pub fn create_backup(&self, name: Option<&str>) -> Result<PathBuf> {
        if !self.source.exists() {
            bail!("Nothing to back up at {:?}", self.source);
        }
        fs::create_dir_all(&self.backup_dir).context("Failed to create backup directory")?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup_name = name.unwrap_or("backup");
        let backup_filename = format!("cairn_{}_{}.tar.gz", backup_name, timestamp);
        let backup_path = self.backup_dir.join(&backup_filename);

        info!("Creating backup: {:?}", backup_path);

        let tar_gz = File::create(&backup_path).context("Failed to create backup file")?;
        let enc = GzEncoder::new(tar_gz, Compression::default());
        let mut tar = Builder::new(enc);

        match self.layout {
            Layout::File => {
                let mut file = File::open(&self.source)
                    .with_context(|| format!("Failed to open file: {:?}", self.source))?;
                tar.append_file(self.source_name()?, &mut file)
                    .context("Failed to add file to archive")?;
            }
            Layout::Directory => {
                for entry in fs::read_dir(&self.source).context("Failed to read cache directory")? {
                    let entry = entry.context("Failed to read directory entry")?;
                    let path = entry.path();

                    if path.starts_with(&self.backup_dir) || !path.is_file() {
                        continue;
                    }

                    let mut file = File::open(&path)
                        .with_context(|| format!("Failed to open file: {:?}", path))?;
                    tar.append_file(entry.file_name(), &mut file)
                        .with_context(|| format!("Failed to add file to archive: {:?}", path))?;
                }
            }
        }

        tar.into_inner()
            .context("Failed to finalize backup archive")?
            .finish()
            .context("Failed to finish compression")?;

        let metadata = fs::metadata(&backup_path)?;
        info!(
            "Backup created successfully: {:?} ({} bytes)",
            backup_path,
            metadata.len()
        );

        Ok(backup_path)
    }

    /// Replace the cache storage with the content of an archive.
    ///
    /// The current storage is moved aside to `.<name>.previous` first. The
    /// cache must not be open in any process while restoring.
    pub fn restore_backup<P: AsRef<Path>>(&self, backup_path: P) -> Result<PathBuf> {
        let backup_path = backup_path.as_ref();
        if !backup_path.exists() {
            bail!("Backup file not found: {:?}", backup_path);
        }

        info!("Restoring backup from: {:?}", backup_path);

        let name = self.source_name()?.to_string_lossy().into_owned();
        let parent = parent_of(&self.source);
        fs::create_dir_all(&parent).context("Failed to create cache parent directory")?;

        let temp_dir = parent.join(format!(".{}.restore", name));
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir)
                .context("Failed to clean up temporary restore directory")?;
        }
        fs::create_dir_all(&temp_dir).context("Failed to create temporary restore directory")?;

        let tar_gz = File::open(backup_path).context("Failed to open backup file")?;
        let mut archive = Archive::new(GzDecoder::new(tar_gz));
        archive
            .unpack(&temp_dir)
            .context("Failed to extract backup archive")?;

        let restored = match self.layout {
            Layout::File => temp_dir.join(&name),
            Layout::Directory => temp_dir.clone(),
        };
        if !restored.exists() {
            fs::remove_dir_all(&temp_dir).ok();
            bail!("Archive does not contain {:?}", name);
        }

        let previous = parent.join(format!(".{}.previous", name));
        if previous.is_dir() {
            fs::remove_dir_all(&previous).context("Failed to remove previous copy")?;
        } else if previous.exists() {
            fs::remove_file(&previous).context("Failed to remove previous copy")?;
        }
        if self.source.exists() {
            fs::rename(&self.source, &previous)
                .with_context(|| format!("Failed to move aside {:?}", self.source))?;
        }

        fs::rename(&restored, &self.source)
            .with_context(|| format!("Failed to restore {:?}", self.source))?;
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir).context("Failed to remove temporary directory")?;
        }

        info!("Backup restored successfully");
        info!("Previous data moved to: {:?}", previous);

        Ok(previous)
    }

    /// List available backups, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        let entries = fs::read_dir(&self.backup_dir).context("Failed to read backup directory")?;

        for entry in entries {
            let entry = entry.context("Failed to read directory entry")?;
            let path = entry.path();

            if path.is_file() && path.extension().is_some_and(|ext| ext == "gz") {
                let metadata = fs::metadata(&path)?;
                backups.push(BackupInfo {
                    filename: entry.file_name().to_string_lossy().into_owned(),
                    path,
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                });
            }
        }

        backups.sort_by(|a, b| b.modified.cmp(&a.modified));

        Ok(backups)
    }

    /// Delete old backups, keeping only the N most recent
    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<usize> {
        let backups = self.list_backups()?;

        let mut deleted = 0;
        for backup in backups.iter().skip(keep_count) {
            info!("Deleting old backup: {:?}", backup.path);
            fs::remove_file(&backup.path)
                .with_context(|| format!("Failed to delete backup: {:?}", backup.path))?;
            deleted += 1;
        }

        if deleted > 0 {
            info!("Deleted {} old backup(s)", deleted);
        }
        Ok(deleted)
    }
}

fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Information about a backup file
#[derive(Debug)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub modified: Option<std::time::SystemTime>,
}
