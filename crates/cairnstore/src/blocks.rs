//! Block storage engine
//!
//! A block file holds a fixed number of rows, each addressed by index and
//! holding variable-length UTF-8 content. Every row owns one fixed-width
//! slot (see [`crate::parser`] for the layout). When a write does not fit its
//! slot, all slots are widened by doubling and the file is rebuilt next to
//! the original and renamed into place.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::parser::{
    create_header, parse_header, parse_slot, BlockHeader, BLOCK_VERSION, HEADER_LEN,
    SLOT_PREFIX_LEN,
};

/// Maximum content size of a single row (16 MB)
pub const MAX_ROW_SIZE: usize = 16 * 1024 * 1024;

/// Initial slot width for new block files
pub const DEFAULT_SLOT_SIZE: u32 = 256;

/// Row-addressed storage of variable-length string content.
///
/// Rows that were never written read back as the empty string.
pub trait BlockStorage: Send + Sync {
    /// Number of addressable rows
    fn rows(&self) -> u32;

    /// Read the full content of a row
    fn read(&self, row: u32) -> Result<String>;

    /// Replace the full content of a row
    fn write(&self, row: u32, content: &str) -> Result<()>;

    /// Reset every row to empty content
    fn clear(&self) -> Result<()> {
        for row in 0..self.rows() {
            self.write(row, "")?;
        }
        Ok(())
    }

    /// Push pending writes to durable storage
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct Mapped {
    file: File,
    map: MmapMut,
    header: BlockHeader,
}

fn map_file(file: &File) -> Result<MmapMut> {
    // SAFETY: the mapping is only reached through `BlockFile`, which serializes
    // access with its lock. Concurrent modification of the file by another
    // process is unsupported.
    let map = unsafe { MmapMut::map_mut(file)? };
    Ok(map)
}

impl Mapped {
    fn check(&self, row: u32) -> Result<()> {
        if row >= self.header.row_count {
            return Err(Error::RowOutOfRange {
                row,
                rows: self.header.row_count,
            });
        }
        Ok(())
    }

    fn slot(&self, row: u32) -> &[u8] {
        let offset = self.header.slot_offset(row);
        &self.map[offset..offset + self.header.slot_size as usize]
    }

    fn write_slot(&mut self, row: u32, content: &[u8]) {
        let offset = self.header.slot_offset(row);
        let slot = &mut self.map[offset..offset + self.header.slot_size as usize];
        let end = SLOT_PREFIX_LEN + content.len();

        slot[..SLOT_PREFIX_LEN].copy_from_slice(&(content.len() as u32).to_le_bytes());
        slot[SLOT_PREFIX_LEN..end].copy_from_slice(content);
        slot[end..].fill(0);
    }

    fn grow(&mut self, path: &Path, needed: usize) -> Result<()> {
        let mut slot_size = self.header.slot_size as usize;
        while slot_size < needed {
            slot_size *= 2;
        }
        let slot_size = slot_size.min(MAX_ROW_SIZE + SLOT_PREFIX_LEN);

        let rows = (0..self.header.row_count)
            .map(|row| parse_slot(self.slot(row)).map(|content| content.to_vec()))
            .collect::<Result<Vec<_>>>()?;

        let header = BlockHeader {
            slot_size: slot_size as u32,
            ..self.header
        };

        let tmp_path = path.with_extension("grow");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.set_len(header.file_len())?;

        let mut grown = Mapped {
            map: map_file(&file)?,
            file,
            header,
        };
        grown.map[..HEADER_LEN].copy_from_slice(&create_header(&header));
        for (row, content) in rows.iter().enumerate() {
            grown.write_slot(row as u32, content);
        }
        grown.map.flush()?;
        fs::rename(&tmp_path, path)?;

        debug!(
            path = %path.display(),
            from = self.header.slot_size,
            to = header.slot_size,
            "widened block slots"
        );
        *self = grown;
        Ok(())
    }
}

/// Memory-mapped block file
pub struct BlockFile {
    path: PathBuf,
    inner: RwLock<Option<Mapped>>,
}

impl BlockFile {
    /// Open or create a block file with the given number of rows
    ///
    /// # Arguments
    /// * `path` - Location of the block file
    /// * `row_count` - Rows the file must expose; an existing file must match
    pub fn open<P: AsRef<Path>>(path: P, row_count: u32) -> Result<Self> {
        Self::with_slot_size(path, row_count, DEFAULT_SLOT_SIZE)
    }

    /// Open or create a block file, using `slot_size` for new files
    pub fn with_slot_size<P: AsRef<Path>>(path: P, row_count: u32, slot_size: u32) -> Result<Self> {
        let path = path.as_ref();
        if row_count == 0 {
            return Err(Error::Parse("Row count must be greater than 0".to_string()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let existing = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mapped = if existing {
            let mut buf = [0u8; HEADER_LEN];
            file.read_exact(&mut buf)?;
            let header = parse_header(&buf)?;
            if header.row_count != row_count {
                return Err(Error::RowCountMismatch {
                    expected: row_count,
                    found: header.row_count,
                });
            }
            if file.metadata()?.len() < header.file_len() {
                file.set_len(header.file_len())?;
            }
            Mapped {
                map: map_file(&file)?,
                file,
                header,
            }
        } else {
            let header = BlockHeader {
                version: BLOCK_VERSION,
                row_count,
                slot_size: slot_size.max(SLOT_PREFIX_LEN as u32),
            };
            file.set_len(header.file_len())?;
            let mut mapped = Mapped {
                map: map_file(&file)?,
                file,
                header,
            };
            mapped.map[..HEADER_LEN].copy_from_slice(&create_header(&header));
            mapped.map.flush()?;
            mapped
        };

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(Some(mapped)),
        })
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current slot width in bytes
    pub fn slot_size(&self) -> Result<u32> {
        let guard = self.inner.read();
        let mapped = guard.as_ref().ok_or(Error::Closed)?;
        Ok(mapped.header.slot_size)
    }

    /// Flush and unmap the file. Further access returns [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.write();
        if let Some(mapped) = guard.take() {
            mapped.map.flush()?;
            mapped.file.sync_all()?;
        }
        Ok(())
    }
}

impl BlockStorage for BlockFile {
    fn rows(&self) -> u32 {
        self.inner
            .read()
            .as_ref()
            .map(|mapped| mapped.header.row_count)
            .unwrap_or(0)
    }

    fn read(&self, row: u32) -> Result<String> {
        let guard = self.inner.read();
        let mapped = guard.as_ref().ok_or(Error::Closed)?;
        mapped.check(row)?;

        let content = parse_slot(mapped.slot(row))?;
        String::from_utf8(content.to_vec())
            .map_err(|e| Error::Parse(format!("Row {} is not valid UTF-8: {}", row, e)))
    }

    fn write(&self, row: u32, content: &str) -> Result<()> {
        let bytes = content.as_bytes();
        if bytes.len() > MAX_ROW_SIZE {
            return Err(Error::ValueTooLarge(bytes.len()));
        }

        let mut guard = self.inner.write();
        let mapped = guard.as_mut().ok_or(Error::Closed)?;
        mapped.check(row)?;

        let needed = SLOT_PREFIX_LEN + bytes.len();
        if needed > mapped.header.slot_size as usize {
            mapped.grow(&self.path, needed)?;
        }
        mapped.write_slot(row, bytes);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let mapped = guard.as_mut().ok_or(Error::Closed)?;
        mapped.map[HEADER_LEN..].fill(0);
        mapped.map.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let guard = self.inner.read();
        let mapped = guard.as_ref().ok_or(Error::Closed)?;
        mapped.map.flush()?;
        Ok(())
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// In-memory block storage, mainly for tests and ephemeral caches
pub struct MemoryBlocks {
    rows: RwLock<Vec<String>>,
}

impl MemoryBlocks {
    /// Create storage with `row_count` empty rows
    pub fn new(row_count: u32) -> Self {
        Self {
            rows: RwLock::new(vec![String::new(); row_count as usize]),
        }
    }
}

impl BlockStorage for MemoryBlocks {
    fn rows(&self) -> u32 {
        self.rows.read().len() as u32
    }

    fn read(&self, row: u32) -> Result<String> {
        let rows = self.rows.read();
        rows.get(row as usize).cloned().ok_or(Error::RowOutOfRange {
            row,
            rows: rows.len() as u32,
        })
    }

    fn write(&self, row: u32, content: &str) -> Result<()> {
        if content.len() > MAX_ROW_SIZE {
            return Err(Error::ValueTooLarge(content.len()));
        }
        let mut rows = self.rows.write();
        let count = rows.len() as u32;
        let slot = rows
            .get_mut(row as usize)
            .ok_or(Error::RowOutOfRange { row, rows: count })?;
        *slot = content.to_string();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.rows.write().iter_mut().for_each(String::clear);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buckets.blk");

        {
            let blocks = BlockFile::open(&path, 8).unwrap();
            assert_eq!(blocks.rows(), 8);
            assert_eq!(blocks.read(3).unwrap(), "");
            blocks.write(3, "{\"a\":1}").unwrap();
            blocks.close().unwrap();
        }

        let blocks = BlockFile::open(&path, 8).unwrap();
        assert_eq!(blocks.read(3).unwrap(), "{\"a\":1}");
        assert_eq!(blocks.read(4).unwrap(), "");
    }

    #[test]
    fn test_overwrite_shorter() {
        let dir = TempDir::new().unwrap();
        let blocks = BlockFile::open(dir.path().join("b.blk"), 2).unwrap();

        blocks.write(0, "a much longer row").unwrap();
        blocks.write(0, "short").unwrap();

        assert_eq!(blocks.read(0).unwrap(), "short");
    }

    #[test]
    fn test_growth_preserves_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grow.blk");
        let blocks = BlockFile::with_slot_size(&path, 4, 16).unwrap();

        blocks.write(0, "first").unwrap();
        blocks.write(2, "third").unwrap();

        let big = "x".repeat(100);
        blocks.write(1, &big).unwrap();

        assert!(blocks.slot_size().unwrap() >= 104);
        assert_eq!(blocks.read(0).unwrap(), "first");
        assert_eq!(blocks.read(1).unwrap(), big);
        assert_eq!(blocks.read(2).unwrap(), "third");
        assert!(!path.with_extension("grow").exists());

        blocks.close().unwrap();
        let reopened = BlockFile::open(&path, 4).unwrap();
        assert_eq!(reopened.read(1).unwrap(), big);
    }

    #[test]
    fn test_row_out_of_range() {
        let dir = TempDir::new().unwrap();
        let blocks = BlockFile::open(dir.path().join("b.blk"), 2).unwrap();

        assert!(matches!(
            blocks.read(2),
            Err(Error::RowOutOfRange { row: 2, rows: 2 })
        ));
        assert!(blocks.write(5, "x").is_err());
    }

    #[test]
    fn test_row_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.blk");
        BlockFile::open(&path, 4).unwrap().close().unwrap();

        let result = BlockFile::open(&path, 8);
        assert!(matches!(
            result,
            Err(Error::RowCountMismatch {
                expected: 8,
                found: 4
            })
        ));
    }

    #[test]
    fn test_value_too_large() {
        let blocks = MemoryBlocks::new(1);
        let large = "x".repeat(MAX_ROW_SIZE + 1);
        assert!(matches!(blocks.write(0, &large), Err(Error::ValueTooLarge(_))));
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let blocks = BlockFile::open(dir.path().join("b.blk"), 3).unwrap();
        blocks.write(0, "a").unwrap();
        blocks.write(2, "c").unwrap();

        blocks.clear().unwrap();

        for row in 0..3 {
            assert_eq!(blocks.read(row).unwrap(), "");
        }
    }

    #[test]
    fn test_access_after_close() {
        let dir = TempDir::new().unwrap();
        let blocks = BlockFile::open(dir.path().join("b.blk"), 1).unwrap();

        blocks.close().unwrap();
        blocks.close().unwrap();

        assert!(matches!(blocks.read(0), Err(Error::Closed)));
        assert!(matches!(blocks.write(0, "x"), Err(Error::Closed)));
    }

    #[test]
    fn test_memory_blocks() {
        let blocks = MemoryBlocks::new(2);
        blocks.write(1, "row one").unwrap();

        assert_eq!(blocks.read(0).unwrap(), "");
        assert_eq!(blocks.read(1).unwrap(), "row one");
        assert!(blocks.read(2).is_err());

        blocks.clear().unwrap();
        assert_eq!(blocks.read(1).unwrap(), "");
    }
}
