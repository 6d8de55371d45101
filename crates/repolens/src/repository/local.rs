//! A repository backed by a folder on disk.

use super::{
    DEFAULT_FETCH_LIMIT, DEFAULT_IGNORED_DIRS, FetchError, FetchFuture, RepoFile, RepoFuture,
    RepositoryProvider,
};
use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Serves files from a local folder. The `reference` argument is ignored.
pub struct LocalRepository {
    root: PathBuf,
    name: String,
    fetch_limit: usize,
}

impl LocalRepository {
    /// Open a folder. Fails if it does not exist or is not a directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = root.canonicalize().map_err(|e| {
            Error::RepositoryUnavailable(format!("cannot open '{}': {e}", root.display()))
        })?;
        if !root.is_dir() {
            return Err(Error::RepositoryUnavailable(format!(
                "'{}' is not a directory",
                root.display()
            )));
        }
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        Ok(Self {
            root,
            name,
            fetch_limit: DEFAULT_FETCH_LIMIT,
        })
    }

    pub fn with_fetch_limit(mut self, bytes: usize) -> Self {
        self.fetch_limit = bytes;
        self
    }

    fn walk(root: &Path) -> Vec<RepoFile> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored_dir(e))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Skipping unreadable entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push(RepoFile { path, size });
        }
        files
    }

    /// Resolve a repository-relative path, refusing anything that leaves the
    /// root.
    async fn resolve(&self, path: &str) -> std::result::Result<PathBuf, FetchError> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(FetchError::AccessDenied);
        }
        let full = self.root.join(relative);
        let canonical = fs::canonicalize(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound,
            std::io::ErrorKind::PermissionDenied => FetchError::AccessDenied,
            _ => FetchError::Unavailable(e.to_string()),
        })?;
        // Symlinks may still point outside.
        if !canonical.starts_with(&self.root) {
            return Err(FetchError::AccessDenied);
        }
        Ok(canonical)
    }
}

fn is_ignored_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| DEFAULT_IGNORED_DIRS.contains(&name))
}

impl RepositoryProvider for LocalRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> String {
        self.root.display().to_string()
    }

    fn list_files<'a>(&'a self, _reference: Option<&'a str>) -> RepoFuture<'a, Vec<RepoFile>> {
        Box::pin(async move {
            let root = self.root.clone();
            let files = tokio::task::spawn_blocking(move || Self::walk(&root))
                .await
                .map_err(|e| Error::RepositoryUnavailable(format!("listing task failed: {e}")))?;
            debug!("Listed {} files under {}", files.len(), self.root.display());
            Ok(files)
        })
    }

    fn get_file_content<'a>(
        &'a self,
        path: &'a str,
        _reference: Option<&'a str>,
    ) -> FetchFuture<'a> {
        Box::pin(async move {
            let full = self.resolve(path).await?;
            let meta = fs::metadata(&full)
                .await
                .map_err(|e| FetchError::Unavailable(e.to_string()))?;
            if meta.is_dir() {
                return Err(FetchError::NotFound);
            }
            let size = meta.len() as usize;
            if size > self.fetch_limit {
                return Err(FetchError::TooLarge {
                    size,
                    limit: self.fetch_limit,
                });
            }
            let bytes = fs::read(&full).await.map_err(|e| {
                warn!("Failed to read '{}': {e}", full.display());
                FetchError::Unavailable(e.to_string())
            })?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        })
    }
}
