//! Backing stores a [`FileSystem`](super::FileSystem) mounts.
//!
//! A mount sees paths already sanitised and relative to its own root;
//! it never receives a path that escapes it.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use super::{FsError, OUT_OF_SPACE};

/// A store of files and directories.
///
/// Read-only stores only implement the query and read methods; the
/// write methods default to "Access denied".
pub trait Mount: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool, FsError>;

    fn is_dir(&self, path: &str) -> Result<bool, FsError>;

    /// Entry names directly under `path`.
    fn list(&self, path: &str) -> Result<Vec<String>, FsError>;

    /// File size in bytes; directories report 0.
    fn size(&self, path: &str) -> Result<u64, FsError>;

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, FsError>;

    fn is_read_only(&self, _path: &str) -> bool {
        true
    }

    fn make_dir(&self, path: &str) -> Result<(), FsError> {
        Err(FsError::AccessDenied(path.to_string()))
    }

    fn delete(&self, path: &str) -> Result<(), FsError> {
        Err(FsError::AccessDenied(path.to_string()))
    }

    fn open_write(&self, path: &str, _append: bool) -> Result<Box<dyn Write + Send>, FsError> {
        Err(FsError::AccessDenied(path.to_string()))
    }

    /// Bytes left, or `None` when the store imposes no limit.
    fn remaining_space(&self) -> Result<Option<u64>, FsError> {
        Ok(Some(0))
    }
}

/// A mount backed by a host directory.
pub struct DirMount {
    root: PathBuf,
    capacity: Option<u64>,
    read_only: bool,
    used: Arc<AtomicU64>,
}

impl DirMount {
    /// Writable mount over `root`, created if missing. `capacity` caps
    /// the total bytes of file content.
    pub fn new(root: impl Into<PathBuf>, capacity: Option<u64>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating mount root {}", root.display()))?;
        let used = dir_size(&root)?;
        info!(
            "Mounted {} ({} bytes used, capacity {})",
            root.display(),
            used,
            capacity.map_or_else(|| "unlimited".to_string(), |c| c.to_string())
        );
        Ok(Self {
            root,
            capacity,
            read_only: false,
            used: Arc::new(AtomicU64::new(used)),
        })
    }

    /// Read-only mount over an existing directory.
    pub fn read_only(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(anyhow!("Read-only mount root {} is not a directory", root.display()));
        }
        Ok(Self {
            root,
            capacity: None,
            read_only: true,
            used: Arc::new(AtomicU64::new(0)),
        })
    }

    fn real(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn writable(&self, path: &str) -> Result<(), FsError> {
        if self.read_only {
            Err(FsError::AccessDenied(path.to_string()))
        } else {
            Ok(())
        }
    }

    fn release_space(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| Some(u.saturating_sub(bytes)));
    }
}

impl Mount for DirMount {
    fn exists(&self, path: &str) -> Result<bool, FsError> {
        Ok(self.real(path).exists())
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        Ok(self.real(path).is_dir())
    }

    fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let real = self.real(path);
        if !real.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        let entries = fs::read_dir(&real).map_err(|e| FsError::from_io(path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FsError::from_io(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn size(&self, path: &str) -> Result<u64, FsError> {
        let meta = fs::metadata(self.real(path)).map_err(|e| FsError::from_io(path, e))?;
        Ok(if meta.is_dir() { 0 } else { meta.len() })
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, FsError> {
        let real = self.real(path);
        if !real.is_file() {
            return Err(FsError::NotFound(path.to_string()));
        }
        let file = File::open(&real).map_err(|e| FsError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    fn is_read_only(&self, _path: &str) -> bool {
        self.read_only
    }

    fn make_dir(&self, path: &str) -> Result<(), FsError> {
        self.writable(path)?;
        let real = self.real(path);
        if real.is_file() {
            return Err(FsError::Exists(path.to_string()));
        }
        fs::create_dir_all(&real).map_err(|e| FsError::from_io(path, e))
    }

    fn delete(&self, path: &str) -> Result<(), FsError> {
        self.writable(path)?;
        if path.is_empty() {
            return Err(FsError::AccessDenied(path.to_string()));
        }
        let real = self.real(path);
        if real.is_dir() {
            let freed = dir_size(&real).unwrap_or(0);
            fs::remove_dir_all(&real).map_err(|e| FsError::from_io(path, e))?;
            self.release_space(freed);
        } else if real.exists() {
            let freed = fs::metadata(&real).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&real).map_err(|e| FsError::from_io(path, e))?;
            self.release_space(freed);
        }
        debug!("Deleted {}", real.display());
        Ok(())
    }

    fn open_write(&self, path: &str, append: bool) -> Result<Box<dyn Write + Send>, FsError> {
        self.writable(path)?;
        let real = self.real(path);
        if real.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::from_io(path, e))?;
        }
        if !append {
            if let Ok(meta) = fs::metadata(&real) {
                self.release_space(meta.len());
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&real)
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(Box::new(CountingWriter {
            file,
            used: self.used.clone(),
            capacity: self.capacity,
        }))
    }

    fn remaining_space(&self) -> Result<Option<u64>, FsError> {
        if self.read_only {
            return Ok(Some(0));
        }
        Ok(self
            .capacity
            .map(|c| c.saturating_sub(self.used.load(Ordering::SeqCst))))
    }
}

/// File writer that charges written bytes against the mount's capacity.
struct CountingWriter {
    file: File,
    used: Arc<AtomicU64>,
    capacity: Option<u64>,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(capacity) = self.capacity {
            let used = self.used.load(Ordering::SeqCst);
            if used.saturating_add(buf.len() as u64) > capacity {
                return Err(io::Error::new(io::ErrorKind::Other, OUT_OF_SPACE));
            }
        }
        let n = self.file.write(buf)?;
        self.used.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Total bytes of file content under `dir`.
fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}
