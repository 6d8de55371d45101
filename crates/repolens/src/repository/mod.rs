//! Repository providers: where file listings and file contents come from.
//!
//! Two implementations ship with the crate: [`LocalRepository`] for a folder
//! on disk and [`GitHubRepository`] for a repository behind the GitHub REST
//! API. Both skip the same set of ignored directories and enforce a size
//! ceiling on fetched content.

pub mod github;
pub mod local;

pub use github::GitHubRepository;
pub use local::LocalRepository;

use crate::error::FileFetchFailure;
use crate::{Error, Result};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`RepositoryProvider::list_files`].
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Boxed future returned by [`RepositoryProvider::get_file_content`].
pub type FetchFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<String, FetchError>> + Send + 'a>>;

/// Directories skipped when listing a repository.
pub const DEFAULT_IGNORED_DIRS: &[&str] = &[
    "venv",
    ".venv",
    "__pycache__",
    ".git",
    ".vscode",
    ".idea",
    "node_modules",
    "build",
    "dist",
    "target",
    "out",
    "bin",
    "obj",
    "docs",
    "examples",
    "tests",
    "test",
    "samples",
];

/// Default ceiling for a file fetched on the model's request.
pub const DEFAULT_FETCH_LIMIT: usize = 200 * 1024;

/// Default ceiling for a file to be considered during analysis.
pub const DEFAULT_LISTING_LIMIT: u64 = 512 * 1024;

/// One file in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    /// Repository-relative path with `/` separators.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
}

/// Why a fetch failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    TooLarge { size: usize, limit: usize },
    NotFound,
    AccessDenied,
    RateLimited(String),
    /// The backend itself could not be reached.
    Unavailable(String),
}

impl FetchError {
    /// Convert into the crate error for a request on `path`.
    pub fn into_error(self, path: &str) -> Error {
        let failure = match self {
            FetchError::TooLarge { size, limit } => FileFetchFailure::TooLarge { size, limit },
            FetchError::NotFound => FileFetchFailure::NotFound,
            FetchError::AccessDenied => FileFetchFailure::AccessDenied,
            FetchError::RateLimited(msg) => return Error::RateLimited(msg),
            FetchError::Unavailable(msg) => return Error::RepositoryUnavailable(msg),
        };
        Error::FileRequestFailed {
            path: path.to_string(),
            failure,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::TooLarge { size, limit } => {
                write!(f, "too large ({size} bytes, limit {limit})")
            }
            FetchError::NotFound => write!(f, "not found"),
            FetchError::AccessDenied => write!(f, "access denied"),
            FetchError::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            FetchError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
        }
    }
}

/// A source of files.
pub trait RepositoryProvider: Send + Sync {
    /// Short project name (last path or URL segment).
    fn name(&self) -> &str;

    /// Where the repository lives: a URL or a local path.
    fn source(&self) -> String;

    /// Every file outside the ignored directories, sorted by path.
    /// `reference` selects a branch or commit where the backend has them.
    fn list_files<'a>(&'a self, reference: Option<&'a str>) -> RepoFuture<'a, Vec<RepoFile>>;

    /// UTF-8 content of one file, rejected above the provider's ceiling.
    fn get_file_content<'a>(
        &'a self,
        path: &'a str,
        reference: Option<&'a str>,
    ) -> FetchFuture<'a>;
}

/// Whether any component of `path` is an ignored directory.
pub fn is_ignored_path(path: &str, ignored: &[&str]) -> bool {
    path.split('/').any(|part| ignored.contains(&part))
}

/// Files that are eligible for analysis: matching extension (case
/// insensitive; an empty filter accepts everything) and not above
/// `max_size`. Returns the selected files plus a note for each file skipped
/// for size.
pub fn select_files(
    files: &[RepoFile],
    extensions: &[String],
    max_size: u64,
) -> (Vec<RepoFile>, Vec<String>) {
    let mut selected = Vec::new();
    let mut skipped = Vec::new();
    for file in files {
        if !has_extension(&file.path, extensions) {
            continue;
        }
        if file.size > max_size {
            skipped.push(format!(
                "Skipped (larger than {} KiB): {}",
                max_size / 1024,
                file.path
            ));
            continue;
        }
        selected.push(file.clone());
    }
    (selected, skipped)
}

fn has_extension(path: &str, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let lower = path.to_lowercase();
    extensions.iter().any(|ext| {
        let ext = ext.to_lowercase();
        if ext.starts_with('.') {
            lower.ends_with(&ext)
        } else {
            lower.ends_with(&format!(".{ext}"))
        }
    })
}

/// Normalize a model-supplied path: strip a leading `./` or `/` and a
/// leading `<repo_name>/`.
pub fn normalize_request_path(path: &str, repo_name: &str) -> String {
    let mut p = path.trim();
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            break;
        }
    }
    if !repo_name.is_empty()
        && let Some(rest) = p.strip_prefix(repo_name)
        && let Some(rest) = rest.strip_prefix('/')
    {
        p = rest;
    }
    p.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64) -> RepoFile {
        RepoFile {
            path: path.into(),
            size,
        }
    }

    #[test]
    fn ignored_paths() {
        assert!(is_ignored_path("node_modules/x/index.js", DEFAULT_IGNORED_DIRS));
        assert!(is_ignored_path("src/__pycache__/a.pyc", DEFAULT_IGNORED_DIRS));
        assert!(!is_ignored_path("src/builder.rs", DEFAULT_IGNORED_DIRS));
    }

    #[test]
    fn select_filters_extension_and_size() {
        let files = vec![
            file("a.py", 10),
            file("B.PY", 10),
            file("c.md", 10),
            file("big.py", 600 * 1024),
        ];
        let (selected, skipped) = select_files(&files, &[".py".into()], DEFAULT_LISTING_LIMIT);
        let paths: Vec<_> = selected.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.py", "B.PY"]);
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].contains("big.py"));
    }

    #[test]
    fn empty_extension_filter_accepts_all() {
        let files = vec![file("Makefile", 1), file("a.rs", 1)];
        let (selected, _) = select_files(&files, &[], DEFAULT_LISTING_LIMIT);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn normalizes_request_paths() {
        assert_eq!(normalize_request_path("./src/a.py", "demo"), "src/a.py");
        assert_eq!(normalize_request_path("/src/a.py", "demo"), "src/a.py");
        assert_eq!(normalize_request_path("demo/src/a.py", "demo"), "src/a.py");
        assert_eq!(normalize_request_path("demosrc/a.py", "demo"), "demosrc/a.py");
    }

    #[test]
    fn fetch_errors_map_to_crate_errors() {
        assert!(matches!(
            FetchError::NotFound.into_error("a.py"),
            Error::FileRequestFailed {
                failure: FileFetchFailure::NotFound,
                ..
            }
        ));
        assert!(matches!(
            FetchError::Unavailable("down".into()).into_error("a.py"),
            Error::RepositoryUnavailable(_)
        ));
    }
}
