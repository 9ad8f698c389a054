//! Per-container world directories, keyed by host port

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::Result;

pub struct WorldVolumeManager {
    root: PathBuf,
}

impl WorldVolumeManager {
    /// Create the manager, making sure the worlds root exists. The root is
    /// made absolute because it is handed to the runtime as a bind mount.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = std::path::absolute(root.as_ref())?;
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, port: u16) -> PathBuf {
        self.root.join(port.to_string())
    }

    /// Create the world directory for a port, returning its absolute path.
    /// An existing directory is reused as-is.
    pub fn create(&self, port: u16) -> Result<PathBuf> {
        let path = self.path_for(port);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Delete a world directory; a missing directory is not an error
    pub fn remove(&self, port: u16) -> Result<()> {
        let path = self.path_for(port);
        tracing::info!(path = %path.display(), "Deleting world");
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, port: u16) -> bool {
        self.path_for(port).is_dir()
    }
}
