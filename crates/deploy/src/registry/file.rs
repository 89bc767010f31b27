//! Registry backed by one JSON file per module.
//!
//! Layout under the registry root:
//! - `<name>.json`: the pretty-printed [`ProxyRecord`]
//! - `<name>.lock`: lock file taken for the duration of an operation

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use fs2::FileExt;

use super::{ProxyRegistry, RegistryError, check_transition, validate_name};
use crate::types::ProxyRecord;

#[derive(Debug, Clone)]
pub struct FileRegistry {
    root: PathBuf,
}

/// Exclusive lock on one module's lock file, released on drop.
#[derive(Debug)]
pub struct FileLease {
    file: File,
    path: PathBuf,
}

impl Drop for FileLease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release registry lock");
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RegistryError + '_ {
    move |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileRegistry {
    /// Open the registry rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(io_error(&root))?;
        tracing::debug!(root = %root.display(), "Opened file registry");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.lock"))
    }

    fn read(&self, name: &str) -> Result<Option<ProxyRecord>, RegistryError> {
        let path = self.record_path(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| RegistryError::Corrupt { path, source })
    }

    /// Write `record` next to its final location, then rename it into place so
    /// readers never observe a partial file.
    fn write_atomic(&self, name: &str, record: &ProxyRecord) -> Result<(), RegistryError> {
        let path = self.record_path(name);
        let tmp_path = self.root.join(format!("{name}.json.tmp"));

        let content = serde_json::to_string_pretty(record).map_err(|source| {
            RegistryError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;

        let mut file = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(io_error(&tmp_path))?;
        std::fs::rename(&tmp_path, &path).map_err(io_error(&path))?;
        Ok(())
    }
}

impl ProxyRegistry for FileRegistry {
    type Lease = FileLease;

    fn lease(&self, name: &str) -> Result<FileLease, RegistryError> {
        validate_name(name)?;
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_error(&path))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(FileLease { file, path }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(RegistryError::Busy(name.to_string()))
            }
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    fn lookup(&self, name: &str) -> Result<Option<ProxyRecord>, RegistryError> {
        validate_name(name)?;
        self.read(name)
    }

    fn record(&self, name: &str, record: ProxyRecord) -> Result<(), RegistryError> {
        validate_name(name)?;
        let previous = self.read(name)?;
        check_transition(name, previous.as_ref(), &record)?;
        self.write_atomic(name, &record)?;

        tracing::debug!(
            module = %name,
            version = %record.current_version,
            implementation = %record.current_implementation_address,
            history = record.history.len(),
            "Registry record written"
        );
        Ok(())
    }
}
