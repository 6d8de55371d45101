//! A repository behind the GitHub REST API.
//!
//! Listing uses `git/trees/{ref}?recursive=1`; content uses
//! `contents/{path}?ref=` and decodes the base64 payload. Without a token
//! only public repositories are reachable, with a low rate limit.

use super::{
    DEFAULT_FETCH_LIMIT, DEFAULT_IGNORED_DIRS, FetchError, FetchFuture, RepoFile, RepoFuture,
    RepositoryProvider, is_ignored_path,
};
use crate::api::classify::{error_for_status, is_quota_exhausted, is_transient_transport};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

pub const GITHUB_API_BASE: &str = "https://api.github.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize, Debug)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Deserialize, Debug)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize, Debug)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct ContentResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: usize,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// `owner/repo` plus an optional branch parsed from a GitHub URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    pub branch: Option<String>,
}

/// Parse `https://github.com/<owner>/<repo>[.git][/tree/<branch>]` (scheme
/// and `www.` optional).
pub fn parse_github_url(url: &str) -> Option<RepoRef> {
    let mut rest = url.trim().trim_end_matches('/');
    for prefix in ["https://", "http://"] {
        if let Some(r) = rest.strip_prefix(prefix) {
            rest = r;
        }
    }
    if let Some(r) = rest.strip_prefix("www.") {
        rest = r;
    }
    let rest = rest.strip_prefix("github.com/")?;
    let mut segments = rest.split('/');
    let owner = segments.next().filter(|s| !s.is_empty())?;
    let repo = segments.next().filter(|s| !s.is_empty())?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    let branch = match (segments.next(), segments.next()) {
        (Some("tree"), Some(branch)) if !branch.is_empty() => Some(branch.to_string()),
        _ => None,
    };
    Some(RepoRef {
        owner: owner.to_string(),
        repo: repo.to_string(),
        branch,
    })
}

/// Serves files from a GitHub repository.
pub struct GitHubRepository {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    owner: String,
    repo: String,
    url_branch: Option<String>,
    default_branch: OnceCell<String>,
    fetch_limit: usize,
}

impl GitHubRepository {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("repolens/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: GITHUB_API_BASE.to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            owner: owner.into(),
            repo: repo.into(),
            url_branch: None,
            default_branch: OnceCell::new(),
            fetch_limit: DEFAULT_FETCH_LIMIT,
        })
    }

    /// Build from a repository URL. A `/tree/<branch>` suffix becomes the
    /// branch used when no reference is given.
    pub fn from_url(url: &str, token: Option<String>) -> Result<Self> {
        let parsed = parse_github_url(url)
            .ok_or_else(|| Error::InvalidInput(format!("not a GitHub repository URL: {url}")))?;
        if token.is_none() {
            warn!("No GitHub token; only public repositories are reachable");
        }
        let mut repo = Self::new(parsed.owner, parsed.repo, token)?;
        repo.url_branch = parsed.branch;
        Ok(repo)
    }

    pub fn with_fetch_limit(mut self, bytes: usize) -> Self {
        self.fetch_limit = bytes;
        self
    }

    /// Branch named in the URL the repository was opened from, if any.
    pub fn url_branch(&self) -> Option<&str> {
        self.url_branch.as_deref()
    }

    /// `<base>/repos/<owner>/<repo>/<segments...>?<query>`. Every segment and
    /// query value is percent-encoded, so paths and refs may hold spaces,
    /// `#`, `?` or `/`.
    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            Error::Configuration(format!("invalid GitHub API URL '{}': {e}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|()| {
                Error::Configuration(format!("GitHub API URL '{}' cannot hold a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(["repos", self.owner.as_str(), self.repo.as_str()])
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn contents_url(&self, path: &str, branch: &str) -> Result<Url> {
        let mut segments = vec!["contents"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.endpoint(&segments, &[("ref", branch)])
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn resolve_ref(&self, reference: Option<&str>) -> Result<String> {
        if let Some(r) = reference.or(self.url_branch.as_deref()) {
            return Ok(r.to_string());
        }
        let branch = self
            .default_branch
            .get_or_try_init(|| async {
                let resp = self
                    .get(self.endpoint(&[], &[])?)
                    .send()
                    .await
                    .map_err(unavailable)?;
                let status = resp.status();
                let text = resp.text().await.map_err(unavailable)?;
                if !status.is_success() {
                    return Err(repo_error(status.as_u16(), &text));
                }
                let info: RepoInfo = serde_json::from_str(&text)?;
                info!(
                    "Repository {}/{} default branch: {}",
                    self.owner, self.repo, info.default_branch
                );
                Ok(info.default_branch)
            })
            .await?;
        Ok(branch.clone())
    }
}

fn unavailable(e: reqwest::Error) -> Error {
    if is_transient_transport(&e) {
        Error::RepositoryUnavailable(format!("GitHub unreachable: {e}"))
    } else {
        Error::Http(e)
    }
}

fn repo_error(status: u16, body: &str) -> Error {
    match status {
        404 => Error::RepositoryUnavailable("repository or branch not found".into()),
        403 if is_quota_exhausted(body) || body.contains("rate limit") => {
            Error::RateLimited("GitHub API".into())
        }
        _ => error_for_status("GitHub API", status, body),
    }
}

impl RepositoryProvider for GitHubRepository {
    fn name(&self) -> &str {
        &self.repo
    }

    fn source(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.repo)
    }

    fn list_files<'a>(&'a self, reference: Option<&'a str>) -> RepoFuture<'a, Vec<RepoFile>> {
        Box::pin(async move {
            let branch = self.resolve_ref(reference).await?;
            let url = self.endpoint(&["git", "trees", branch.as_str()], &[("recursive", "1")])?;
            let resp = self
                .get(url)
                .send()
                .await
                .map_err(unavailable)?;
            let status = resp.status();
            let text = resp.text().await.map_err(unavailable)?;
            if !status.is_success() {
                return Err(repo_error(status.as_u16(), &text));
            }
            let tree: TreeResponse = serde_json::from_str(&text)?;
            if tree.truncated {
                warn!("GitHub truncated the file tree for {}; listing is partial", self.repo);
            }
            let mut files: Vec<RepoFile> = tree
                .tree
                .into_iter()
                .filter(|e| e.kind == "blob" && !is_ignored_path(&e.path, DEFAULT_IGNORED_DIRS))
                .map(|e| RepoFile {
                    path: e.path,
                    size: e.size.unwrap_or(0),
                })
                .collect();
            files.sort_by(|a, b| a.path.cmp(&b.path));
            debug!("Listed {} files in {}@{branch}", files.len(), self.repo);
            Ok(files)
        })
    }

    fn get_file_content<'a>(
        &'a self,
        path: &'a str,
        reference: Option<&'a str>,
    ) -> FetchFuture<'a> {
        Box::pin(async move {
            let branch = self
                .resolve_ref(reference)
                .await
                .map_err(|e| FetchError::Unavailable(e.to_string()))?;
            let url = self
                .contents_url(path, &branch)
                .map_err(|e| FetchError::Unavailable(e.to_string()))?;
            let resp = self
                .get(url)
                .send()
                .await
                .map_err(|e| FetchError::Unavailable(e.to_string()))?;
            let status = resp.status().as_u16();
            let text = resp
                .text()
                .await
                .map_err(|e| FetchError::Unavailable(e.to_string()))?;
            match status {
                200..=299 => {}
                404 => return Err(FetchError::NotFound),
                429 => return Err(FetchError::RateLimited("GitHub API".into())),
                403 if is_quota_exhausted(&text) || text.contains("rate limit") => {
                    return Err(FetchError::RateLimited("GitHub API".into()));
                }
                401 | 403 => return Err(FetchError::AccessDenied),
                other => return Err(FetchError::Unavailable(format!("GitHub API HTTP {other}"))),
            }

            // A directory path answers with an array.
            let Ok(content) = serde_json::from_str::<ContentResponse>(&text) else {
                return Err(FetchError::NotFound);
            };
            if content.kind != "file" {
                return Err(FetchError::NotFound);
            }
            if content.size > self.fetch_limit {
                return Err(FetchError::TooLarge {
                    size: content.size,
                    limit: self.fetch_limit,
                });
            }
            decode_content(&content)
        })
    }
}

fn decode_content(content: &ContentResponse) -> std::result::Result<String, FetchError> {
    match (content.encoding.as_deref(), content.content.as_deref()) {
        (Some("base64"), Some(data)) => {
            let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = STANDARD
                .decode(cleaned)
                .map_err(|e| FetchError::Unavailable(format!("bad base64 payload: {e}")))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        (_, None) | (_, Some("")) => Ok(String::new()),
        (encoding, _) => Err(FetchError::Unavailable(format!(
            "unsupported content encoding: {}",
            encoding.unwrap_or("none")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repository_urls() {
        assert_eq!(
            parse_github_url("https://github.com/octo/demo"),
            Some(RepoRef {
                owner: "octo".into(),
                repo: "demo".into(),
                branch: None
            })
        );
        let with_branch = parse_github_url("github.com/octo/demo.git/tree/dev/").unwrap();
        assert_eq!(with_branch.repo, "demo");
        assert_eq!(with_branch.branch.as_deref(), Some("dev"));
        assert!(parse_github_url("https://gitlab.com/octo/demo").is_none());
        assert!(parse_github_url("https://github.com/octo").is_none());
    }

    #[test]
    fn decodes_base64_with_line_breaks() {
        let content = ContentResponse {
            kind: "file".into(),
            size: 6,
            encoding: Some("base64".into()),
            content: Some("aGVs\nbG8K\n".into()),
        };
        assert_eq!(decode_content(&content).unwrap(), "hello\n");
    }

    #[test]
    fn empty_content_decodes_to_empty_string() {
        let content = ContentResponse {
            kind: "file".into(),
            size: 0,
            encoding: Some("base64".into()),
            content: Some(String::new()),
        };
        assert_eq!(decode_content(&content).unwrap(), "");
    }

    #[test]
    fn from_url_keeps_branch_and_rejects_other_hosts() {
        let repo = GitHubRepository::from_url("https://github.com/octo/demo/tree/main", None).unwrap();
        assert_eq!(repo.name(), "demo");
        assert_eq!(repo.url_branch(), Some("main"));
        assert_eq!(repo.source(), "https://github.com/octo/demo");
        assert!(matches!(
            GitHubRepository::from_url("not a url", None),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn request_urls_encode_paths_and_refs() {
        let repo = GitHubRepository::new("octo", "demo", None).unwrap();
        assert_eq!(
            repo.contents_url("docs/a b#1.md", "feat/x?y").unwrap().as_str(),
            "https://api.github.com/repos/octo/demo/contents/docs/a%20b%231.md?ref=feat%2Fx%3Fy"
        );
        assert_eq!(
            repo.endpoint(&["git", "trees", "release/1.0"], &[("recursive", "1")])
                .unwrap()
                .as_str(),
            "https://api.github.com/repos/octo/demo/git/trees/release%2F1.0?recursive=1"
        );
        assert_eq!(
            repo.endpoint(&[], &[]).unwrap().as_str(),
            "https://api.github.com/repos/octo/demo"
        );
    }

    #[test]
    fn repo_errors_classify_rate_limits() {
        assert!(matches!(
            repo_error(403, "API rate limit exceeded"),
            Error::RateLimited(_)
        ));
        assert!(matches!(
            repo_error(404, ""),
            Error::RepositoryUnavailable(_)
        ));
    }
}
