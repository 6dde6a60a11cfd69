//! Persistent storage backend.
//!
//! The engine reads and writes database files directly under a single mount
//! root. The root is chosen by the first successful [`Storage::mount`] and
//! stays fixed for the lifetime of the storage object; later mounts keep it
//! and log any different directory they asked for. Databases live at `<root>/<identifier>.db`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// File extension of database files under the mount root.
pub const DATABASE_EXTENSION: &str = "db";

/// Files the engine may leave next to a database.
const SIDECAR_SUFFIXES: &[&str] = &["-journal", "-wal", "-shm"];

/// Errors from the storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No directory was given and no default root is configured.
    #[error("a storage directory is required to mount the database")]
    DirRequired,

    /// The root has not been mounted yet.
    #[error("storage is not mounted")]
    NotMounted,

    /// The file to read or delete does not exist.
    #[error("no such file: {0}")]
    NotFound(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_path_buf())
        } else {
            StorageError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Mountable file storage under a single root.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Mount the root. The first call fixes the root (`dir`, else the
    /// configured default); every later call is a no-op.
    async fn mount(&self, dir: Option<&Path>) -> StorageResult<()>;

    fn is_mounted(&self) -> bool;

    /// The mounted root.
    fn root(&self) -> StorageResult<&Path>;

    /// Flush to persistent storage: `file` and its sidecars when given, then
    /// the root directory. With `populate`, refresh the mounted view from
    /// persistent storage instead.
    async fn sync(&self, populate: bool, file: Option<&Path>) -> StorageResult<()>;

    async fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>>;

    async fn unlink(&self, path: &Path) -> StorageResult<()>;

    /// Path of the database file for `identifier`.
    fn database_path(&self, identifier: &str) -> StorageResult<PathBuf> {
        Ok(self
            .root()?
            .join(format!("{}.{}", identifier, DATABASE_EXTENSION)))
    }
}

/// Storage on the local disk.
#[derive(Debug, Default)]
pub struct DiskStorage {
    default_root: Option<PathBuf>,
    root: OnceLock<PathBuf>,
}

impl DiskStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose root defaults to `root` when mount is given no directory.
    pub fn with_default_root(root: impl Into<PathBuf>) -> Self {
        Self {
            default_root: Some(root.into()),
            root: OnceLock::new(),
        }
    }

    fn keep_root(root: &Path, requested: Option<&Path>) {
        if let Some(requested) = requested.filter(|dir| *dir != root) {
            warn!(
                root = %root.display(),
                requested = %requested.display(),
                "storage already mounted elsewhere, keeping the existing root"
            );
        }
    }

    /// Remove journal and WAL files left next to `path`. Best effort.
    pub async fn remove_sidecars(path: &Path) {
        for sidecar in sidecars(path) {
            match tokio::fs::remove_file(&sidecar).await {
                Ok(()) => debug!(path = %sidecar.display(), "removed sidecar file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %sidecar.display(), error = %e, "could not remove sidecar file"),
            }
        }
    }
}

fn sidecars(path: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    SIDECAR_SUFFIXES.iter().map(move |suffix| {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        PathBuf::from(sidecar)
    })
}

// Read-only handles; the database may be opened read-only.
fn sync_files(root: &Path, file: Option<&Path>) -> std::io::Result<()> {
    if let Some(file) = file {
        for path in std::iter::once(file.to_path_buf()).chain(sidecars(file)) {
            match std::fs::File::open(&path) {
                Ok(handle) => handle.sync_all()?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }
    // Directory fsync is not supported everywhere.
    if let Err(e) = std::fs::File::open(root).and_then(|dir| dir.sync_all()) {
        debug!(root = %root.display(), error = %e, "directory sync skipped");
    }
    Ok(())
}

#[async_trait]
impl Storage for DiskStorage {
    async fn mount(&self, dir: Option<&Path>) -> StorageResult<()> {
        if let Some(root) = self.root.get() {
            Self::keep_root(root, dir);
            return Ok(());
        }
        let requested = dir
            .map(Path::to_path_buf)
            .or_else(|| self.default_root.clone())
            .ok_or(StorageError::DirRequired)?;

        tokio::fs::create_dir_all(&requested)
            .await
            .map_err(|e| StorageError::io(&requested, e))?;

        // A concurrent first mount may have won the race.
        let root = self.root.get_or_init(|| requested.clone());
        if root == &requested {
            debug!(root = %root.display(), "mounted storage");
        } else {
            Self::keep_root(root, Some(requested.as_path()));
        }
        self.sync(true, None).await
    }

    fn is_mounted(&self) -> bool {
        self.root.get().is_some()
    }

    fn root(&self) -> StorageResult<&Path> {
        self.root
            .get()
            .map(PathBuf::as_path)
            .ok_or(StorageError::NotMounted)
    }

    async fn sync(&self, populate: bool, file: Option<&Path>) -> StorageResult<()> {
        let root = self.root()?.to_path_buf();
        if populate {
            // Reads go straight to disk; only check the root is still there.
            return tokio::fs::metadata(&root)
                .await
                .map(|_| ())
                .map_err(|e| StorageError::io(&root, e));
        }
        let target = root.clone();
        let file = file.map(Path::to_path_buf);
        tokio::task::spawn_blocking(move || sync_files(&target, file.as_deref()))
            .await
            .map_err(|e| StorageError::Io {
                path: root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
            .map_err(|e| StorageError::io(&root, e))
    }

    async fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn unlink(&self, path: &Path) -> StorageResult<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        Self::remove_sidecars(path).await;
        Ok(())
    }
}
