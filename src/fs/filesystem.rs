//! The mount table and sandbox enforcement.
//!
//! Every public operation takes a script path, sanitises it, rejects it
//! if it climbs above the root, then hands the mount-local remainder to
//! the deepest mount containing it.
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use tracing::{debug, info};

use super::mount::Mount;
use super::path;
use super::FsError;

struct MountEntry {
    label: String,
    location: String,
    mount: Arc<dyn Mount>,
}

impl MountEntry {
    fn local(&self, path: &str) -> String {
        path::to_local(path, &self.location)
    }

    fn exists(&self, path: &str) -> Result<bool, FsError> {
        self.mount.exists(&self.local(path)).map_err(|e| e.at(path))
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        self.mount.is_dir(&self.local(path)).map_err(|e| e.at(path))
    }

    fn is_read_only(&self, path: &str) -> bool {
        self.mount.is_read_only(&self.local(path))
    }

    fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        self.mount.list(&self.local(path)).map_err(|e| e.at(path))
    }

    fn size(&self, path: &str) -> Result<u64, FsError> {
        self.mount.size(&self.local(path)).map_err(|e| e.at(path))
    }
}

/// A sandboxed tree of mounts rooted at `""`.
pub struct FileSystem {
    mounts: BTreeMap<String, MountEntry>,
}

impl FileSystem {
    /// Creates a filesystem with `root` mounted at the sandbox root.
    pub fn new(label: &str, root: Arc<dyn Mount>) -> Self {
        let mut mounts = BTreeMap::new();
        mounts.insert(
            String::new(),
            MountEntry {
                label: label.to_string(),
                location: String::new(),
                mount: root,
            },
        );
        Self { mounts }
    }

    /// Mounts `mount` at `location`, replacing any mount already there.
    pub fn mount(&mut self, label: &str, location: &str, mount: Arc<dyn Mount>) -> Result<(), FsError> {
        let location = resolve(location)?;
        info!("Mounting '{label}' at /{location}");
        self.mounts.insert(
            location.clone(),
            MountEntry {
                label: label.to_string(),
                location,
                mount,
            },
        );
        Ok(())
    }

    /// Removes the mount at `location`. The root mount cannot be removed.
    pub fn unmount(&mut self, location: &str) {
        let location = path::sanitize(location, false);
        if !location.is_empty() && self.mounts.remove(&location).is_some() {
            info!("Unmounted /{location}");
        }
    }

    fn entry(&self, path: &str) -> Result<&MountEntry, FsError> {
        self.mounts
            .values()
            .filter(|m| path::contains(&m.location, path))
            .max_by_key(|m| m.location.len())
            .ok_or(FsError::InvalidPath)
    }

    pub fn exists(&self, path: &str) -> Result<bool, FsError> {
        let path = resolve(path)?;
        self.entry(&path)?.exists(&path)
    }

    pub fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        let path = resolve(path)?;
        self.entry(&path)?.is_dir(&path)
    }

    pub fn is_read_only(&self, path: &str) -> Result<bool, FsError> {
        let path = resolve(path)?;
        Ok(self.entry(&path)?.is_read_only(&path))
    }

    /// Sorted entry names under `path`, including mounts placed directly
    /// inside it.
    pub fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = resolve(path)?;
        let entry = self.entry(&path)?;
        if !entry.is_dir(&path)? {
            return Err(FsError::NotADirectory(path));
        }
        let mut names = entry.list(&path)?;
        for location in self.mounts.keys() {
            if !location.is_empty() && path::get_directory(location) == path {
                let name = path::get_name(location);
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn get_size(&self, path: &str) -> Result<u64, FsError> {
        let path = resolve(path)?;
        let entry = self.entry(&path)?;
        if !entry.exists(&path)? {
            return Err(FsError::NotFound(path));
        }
        entry.size(&path)
    }

    pub fn make_dir(&self, path: &str) -> Result<(), FsError> {
        let path = resolve(path)?;
        let entry = self.entry(&path)?;
        entry
            .mount
            .make_dir(&entry.local(&path))
            .map_err(|e| e.at(&path))
    }

    /// Deletes a file or directory tree. Missing paths are ignored; mount
    /// points cannot be deleted.
    pub fn delete(&self, path: &str) -> Result<(), FsError> {
        let path = resolve(path)?;
        if self.mounts.contains_key(&path) {
            return Err(FsError::AccessDenied(path));
        }
        let entry = self.entry(&path)?;
        if !entry.exists(&path)? {
            return Ok(());
        }
        debug!("Deleting /{path}");
        entry
            .mount
            .delete(&entry.local(&path))
            .map_err(|e| e.at(&path))
    }

    pub fn move_path(&self, source: &str, dest: &str) -> Result<(), FsError> {
        let (source, dest) = self.check_transfer(source, dest, "move")?;
        if self.entry(&source)?.is_read_only(&source) {
            return Err(FsError::AccessDenied(source));
        }
        self.copy_recursive(&source, &dest)?;
        self.delete(&source)
    }

    pub fn copy(&self, source: &str, dest: &str) -> Result<(), FsError> {
        let (source, dest) = self.check_transfer(source, dest, "copy")?;
        self.copy_recursive(&source, &dest)
    }

    fn check_transfer(
        &self,
        source: &str,
        dest: &str,
        verb: &'static str,
    ) -> Result<(String, String), FsError> {
        let source = resolve(source)?;
        let dest = resolve(dest)?;
        if !self.exists(&source)? {
            return Err(FsError::NotFound(source));
        }
        if self.exists(&dest)? {
            return Err(FsError::Exists(dest));
        }
        if path::contains(&source, &dest) {
            return Err(FsError::Recursive(verb));
        }
        Ok((source, dest))
    }

    fn copy_recursive(&self, source: &str, dest: &str) -> Result<(), FsError> {
        if self.is_dir(source)? {
            self.make_dir(dest)?;
            for name in self.list(source)? {
                self.copy_recursive(&path::combine(source, &name), &path::combine(dest, &name))?;
            }
            Ok(())
        } else {
            let mut reader = self.open_read(source)?;
            let mut writer = self.open_write(dest, false)?;
            io::copy(&mut reader, &mut writer).map_err(|e| FsError::from_io(dest, e))?;
            writer.flush().map_err(|e| FsError::from_io(dest, e))
        }
    }

    pub fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, FsError> {
        let path = resolve(path)?;
        let entry = self.entry(&path)?;
        if !entry.exists(&path)? || entry.is_dir(&path)? {
            return Err(FsError::NotFound(path));
        }
        entry
            .mount
            .open_read(&entry.local(&path))
            .map_err(|e| e.at(&path))
    }

    pub fn open_write(&self, path: &str, append: bool) -> Result<Box<dyn Write + Send>, FsError> {
        let path = resolve(path)?;
        let entry = self.entry(&path)?;
        if entry.is_dir(&path)? {
            return Err(FsError::IsDirectory(path));
        }
        if entry.is_read_only(&path) {
            return Err(FsError::AccessDenied(path));
        }
        entry
            .mount
            .open_write(&entry.local(&path), append)
            .map_err(|e| e.at(&path))
    }

    /// Label of the mount owning `path`.
    pub fn mount_label(&self, path: &str) -> Result<String, FsError> {
        let path = resolve(path)?;
        Ok(self.entry(&path)?.label.clone())
    }

    /// Free bytes on the mount owning `path`; `None` means unlimited.
    pub fn free_space(&self, path: &str) -> Result<Option<u64>, FsError> {
        let path = resolve(path)?;
        self.entry(&path)?.mount.remaining_space()
    }

    /// Sorted paths matching `pattern`, where `*` matches within a segment.
    pub fn find(&self, pattern: &str) -> Result<Vec<String>, FsError> {
        let pattern = path::sanitize(pattern, true);
        if path::escapes_root(&pattern) {
            return Err(FsError::InvalidPath);
        }
        let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        let mut found = Vec::new();
        self.find_in("", &segments, &mut found)?;
        found.sort();
        found.dedup();
        Ok(found)
    }

    fn find_in(&self, dir: &str, segments: &[&str], found: &mut Vec<String>) -> Result<(), FsError> {
        let Some((segment, rest)) = segments.split_first() else {
            found.push(dir.to_string());
            return Ok(());
        };
        let candidates = if segment.contains('*') {
            if !self.is_dir(dir)? {
                return Ok(());
            }
            let matcher = path::segment_matcher(segment).map_err(|_| FsError::InvalidPath)?;
            self.list(dir)?
                .into_iter()
                .filter(|name| matcher.is_match(name))
                .map(|name| path::combine(dir, &name))
                .collect()
        } else {
            let child = path::combine(dir, segment);
            if !self.exists(&child)? {
                return Ok(());
            }
            vec![child]
        };
        for child in candidates {
            if rest.is_empty() {
                found.push(child);
            } else if self.is_dir(&child)? {
                self.find_in(&child, rest, found)?;
            }
        }
        Ok(())
    }
}

/// Sanitises `path` and rejects anything outside the sandbox root.
fn resolve(path: &str) -> Result<String, FsError> {
    let path = path::sanitize(path, false);
    if path::escapes_root(&path) {
        Err(FsError::InvalidPath)
    } else {
        Ok(path)
    }
}
