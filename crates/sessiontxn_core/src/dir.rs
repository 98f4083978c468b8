//! Data directory management.
//!
//! ```text
//! <data_path>/
//! ├─ MANIFEST          # Format version
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ oplog.log         # Operation log
//! └─ transactions.log  # Session transaction table
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TEMP: &str = "MANIFEST.tmp";
const LOCK_FILE: &str = "LOCK";
const OPLOG_FILE: &str = "oplog.log";
const TABLE_FILE: &str = "transactions.log";

const MANIFEST_MAGIC: [u8; 4] = *b"SMFN";
const MANIFEST_VERSION: u16 = 1;
const MANIFEST_SIZE: usize = 10;

/// Persistent metadata of a data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Manifest {
    /// Format version (major, minor).
    pub format_version: (u16, u16),
}

impl Manifest {
    /// Creates a manifest for `format_version`.
    #[must_use]
    pub const fn new(format_version: (u16, u16)) -> Self {
        Self { format_version }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MANIFEST_SIZE);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.format_version.0.to_le_bytes());
        buf.extend_from_slice(&self.format_version.1.to_le_bytes());
        buf
    }

    fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() != MANIFEST_SIZE || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version {version}"
            )));
        }
        Ok(Self::new((
            u16::from_le_bytes([data[6], data[7]]),
            u16::from_le_bytes([data[8], data[9]]),
        )))
    }
}

/// An exclusively locked data directory.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Opens or creates a data directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing and `create_if_missing`
    /// is false, if another process holds the lock, or on I/O failure.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "data directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DataDirLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Oplog file.
    #[must_use]
    pub fn oplog_path(&self) -> PathBuf {
        self.path.join(OPLOG_FILE)
    }

    /// Session transaction table file.
    #[must_use]
    pub fn table_path(&self) -> PathBuf {
        self.path.join(TABLE_FILE)
    }

    fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Loads the manifest; `None` for a fresh directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be parsed.
    pub fn load_manifest(&self) -> CoreResult<Option<Manifest>> {
        let manifest_path = self.manifest_path();
        if !manifest_path.exists() {
            return Ok(None);
        }
        let data = fs::read(&manifest_path)?;
        if data.is_empty() {
            return Ok(None);
        }
        Manifest::decode(&data).map(Some)
    }

    /// Writes the manifest with write-then-rename.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        let temp_path = self.path.join(MANIFEST_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&manifest.encode())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, self.manifest_path())?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}
