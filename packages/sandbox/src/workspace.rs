// ABOUTME: Per-session workspace directories under a configured root
// ABOUTME: Allocation is exclusive and removal happens exactly once, with a drop fallback

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive scratch directory backing one session's source file and mount.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Create `root/<session_id>`. Fails if the directory already exists.
    pub async fn allocate(root: &Path, session_id: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;

        let path = root.join(session_id);
        tokio::fs::create_dir(&path).await?;
        debug!(workspace = %path.display(), "Allocated workspace");

        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the submitted code verbatim
    pub async fn write_source(&self, file_name: &str, contents: &[u8]) -> io::Result<PathBuf> {
        let file_path = self.path.join(file_name);
        tokio::fs::write(&file_path, contents).await?;
        Ok(file_path)
    }

    /// Remove the directory tree. Consumes the workspace so it cannot run twice.
    pub async fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!(workspace = %self.path.display(), "Removed workspace");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn remove_abandoned(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(workspace = %path.display(), "Failed to remove workspace on drop: {}", e);
        }
    }
}

/// Inside a runtime the tree is removed on the blocking pool so no worker
/// thread stalls on filesystem I/O.
impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_abandoned(&path));
            }
            Err(_) => remove_abandoned(&path),
        }
    }
}
