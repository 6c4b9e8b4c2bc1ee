//! Artifact detection — before/after snapshots of a task's output directory.
//!
//! Each task gets its own directory, which is also the agent's working
//! directory for that task. The executor snapshots it before a run and again
//! after; any file that is new or whose modification time changed is uploaded
//! to the task's thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use crate::channels::MessagingSurface;
use crate::error::ArtifactError;

/// Files present at one point in time, keyed by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactSnapshot {
    files: HashMap<PathBuf, SystemTime>,
}

impl ArtifactSnapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files in `after` that are new or modified relative to `self`, sorted.
    pub fn diff(&self, after: &ArtifactSnapshot) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = after
            .files
            .iter()
            .filter(|(path, modified)| self.files.get(*path) != Some(*modified))
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();
        changed
    }
}

impl FromIterator<(PathBuf, SystemTime)> for ArtifactSnapshot {
    fn from_iter<I: IntoIterator<Item = (PathBuf, SystemTime)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

/// Produces per-task snapshots and uploads new artifacts.
#[async_trait]
pub trait ArtifactSurface: Send + Sync {
    /// Directory a task's runs write into.
    fn task_dir(&self, task_id: Uuid) -> PathBuf;

    /// Files currently under the task's directory. Creates it if missing.
    async fn snapshot(&self, task_id: Uuid) -> Result<ArtifactSnapshot, ArtifactError>;

    /// Upload files to a thread. Returns how many were delivered.
    async fn upload(&self, thread_id: &str, artifacts: &[PathBuf]) -> Result<usize, ArtifactError>;
}

/// One subdirectory per task under `root`; uploads through the messaging surface.
pub struct DirArtifacts {
    root: PathBuf,
    surface: Arc<dyn MessagingSurface>,
}

impl DirArtifacts {
    pub fn new(root: impl Into<PathBuf>, surface: Arc<dyn MessagingSurface>) -> Self {
        Self {
            root: root.into(),
            surface,
        }
    }

    async fn scan(&self, dir: &Path, files: &mut HashMap<PathBuf, SystemTime>) -> Result<(), ArtifactError> {
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut entries = fs::read_dir(&current).await.map_err(|e| ArtifactError::Scan {
                path: current.display().to_string(),
                reason: e.to_string(),
            })?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| ArtifactError::Scan {
                path: current.display().to_string(),
                reason: e.to_string(),
            })? {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(path);
                } else if meta.is_file() {
                    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    files.insert(path, modified);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactSurface for DirArtifacts {
    fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    async fn snapshot(&self, task_id: Uuid) -> Result<ArtifactSnapshot, ArtifactError> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await.map_err(|e| ArtifactError::Scan {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut files = HashMap::new();
        self.scan(&dir, &mut files).await?;
        Ok(ArtifactSnapshot { files })
    }

    async fn upload(&self, thread_id: &str, artifacts: &[PathBuf]) -> Result<usize, ArtifactError> {
        let mut delivered = 0;
        for path in artifacts {
            match self.surface.upload(thread_id, path).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Artifact upload failed");
                }
            }
        }
        if delivered == 0 && !artifacts.is_empty() {
            return Err(ArtifactError::Upload {
                path: artifacts[0].display().to_string(),
                reason: "no artifacts could be delivered".to_string(),
            });
        }
        Ok(delivered)
    }
}
