//! Identity of a remote blob: where it is fetched from and where its cache
//! file lives.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::BlobCacheError;

const DEFAULT_REVISION: &str = "main";

/// Kind of repository a blob belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    #[default]
    Model,
    Dataset,
    Space,
}

impl RepoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoType::Model => "model",
            RepoType::Dataset => "dataset",
            RepoType::Space => "space",
        }
    }

    /// Path prefix on the hub; models live at the root.
    fn url_prefix(&self) -> Option<&'static str> {
        match self {
            RepoType::Model => None,
            RepoType::Dataset => Some("datasets"),
            RepoType::Space => Some("spaces"),
        }
    }

    fn cache_dir_name(&self) -> &'static str {
        match self {
            RepoType::Model => "models",
            RepoType::Dataset => "datasets",
            RepoType::Space => "spaces",
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoType {
    type Err = BlobCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "model" | "models" => Ok(RepoType::Model),
            "dataset" | "datasets" => Ok(RepoType::Dataset),
            "space" | "spaces" => Ok(RepoType::Space),
            other => Err(BlobCacheError::ConfigError(format!(
                "unknown repository type: {other}"
            ))),
        }
    }
}

/// Everything needed to name, locate and authorize one remote blob
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub repo_type: RepoType,
    pub org: String,
    pub repo: String,
    /// Path of the file inside the repository, may contain `/`
    pub file_name: String,
    /// Content tag; an empty etag falls back to the commit for cache naming
    pub etag: String,
    pub commit: String,
    /// Bearer token forwarded to the origin
    #[serde(skip_serializing)]
    pub auth: Option<String>,
}

impl FileIdentity {
    pub fn new(
        repo_type: RepoType,
        org: impl Into<String>,
        repo: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            repo_type,
            org: org.into(),
            repo: repo.into(),
            file_name: file_name.into(),
            etag: String::new(),
            commit: DEFAULT_REVISION.to_owned(),
            auth: None,
        }
    }

    /// Parse an `org/repo` pair.
    pub fn from_repo_id(
        repo_type: RepoType,
        repo_id: &str,
        file_name: impl Into<String>,
    ) -> Result<Self, BlobCacheError> {
        let (org, repo) = repo_id
            .split_once('/')
            .filter(|(org, repo)| is_path_component(org) && is_path_component(repo))
            .ok_or_else(|| {
                BlobCacheError::ConfigError(format!("repository must be ORG/REPO, got {repo_id}"))
            })?;
        Ok(Self::new(repo_type, org, repo, file_name))
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = etag.into();
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = commit.into();
        self
    }

    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(token.into());
        self
    }

    /// `{endpoint}/[datasets/|spaces/]{org}/{repo}/resolve/{commit}/{file_name}`
    pub fn resolve_url(&self, endpoint: &str) -> Result<Url, BlobCacheError> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| BlobCacheError::UrlError(format!("{endpoint}: {e}")))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                BlobCacheError::UrlError(format!("{endpoint}: cannot be a base URL"))
            })?;
            segments.pop_if_empty();
            if let Some(prefix) = self.repo_type.url_prefix() {
                segments.push(prefix);
            }
            segments.push(&self.org);
            segments.push(&self.repo);
            segments.push("resolve");
            segments.push(&self.commit);
            segments.extend(self.file_name.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    /// Hex SHA-256 over the file name and its content tag.
    pub fn content_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.file_name.as_bytes());
        hasher.update(b":");
        if self.etag.is_empty() {
            hasher.update(self.commit.as_bytes());
        } else {
            hasher.update(self.etag.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// `{cache_root}/{repo_type}s/{org}--{repo}/{content_key}.blk`
    ///
    /// Fails when `org` or `repo` would not stay a single directory name
    /// under `cache_root`.
    pub fn cache_path(&self, cache_root: &Path) -> Result<PathBuf, BlobCacheError> {
        for (what, value) in [("org", &self.org), ("repo", &self.repo)] {
            if !is_path_component(value) {
                return Err(BlobCacheError::ConfigError(format!(
                    "{what} {value:?} is not a valid repository name"
                )));
            }
        }
        Ok(cache_root
            .join(self.repo_type.cache_dir_name())
            .join(format!("{}--{}", self.org, self.repo))
            .join(format!("{}.blk", self.content_key())))
    }
}

/// Non-empty, no separators, and not a relative-directory marker.
fn is_path_component(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
        && name != "."
}

// Keeps the token out of logs.
impl fmt::Debug for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileIdentity")
            .field("repo_type", &self.repo_type)
            .field("org", &self.org)
            .field("repo", &self.repo)
            .field("file_name", &self.file_name)
            .field("etag", &self.etag)
            .field("commit", &self.commit)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}@{}",
            self.repo_type, self.org, self.repo, self.file_name, self.commit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url_per_repo_type() {
        let model = FileIdentity::new(RepoType::Model, "acme", "llm", "weights/model.safetensors")
            .with_commit("abc123");
        assert_eq!(
            model.resolve_url("https://hub.example.com").unwrap().as_str(),
            "https://hub.example.com/acme/llm/resolve/abc123/weights/model.safetensors"
        );

        let dataset = FileIdentity::new(RepoType::Dataset, "acme", "corpus", "train.parquet");
        assert_eq!(
            dataset
                .resolve_url("http://127.0.0.1:8080/mirror/")
                .unwrap()
                .as_str(),
            "http://127.0.0.1:8080/mirror/datasets/acme/corpus/resolve/main/train.parquet"
        );

        let space = FileIdentity::new(RepoType::Space, "acme", "demo", "app.py");
        assert!(
            space
                .resolve_url("https://hub.example.com")
                .unwrap()
                .path()
                .starts_with("/spaces/acme/demo/")
        );
    }

    #[test]
    fn test_cache_path_layout() {
        let id = FileIdentity::new(RepoType::Dataset, "acme", "corpus", "a.bin").with_etag("e1");
        let path = id.cache_path(Path::new("/cache")).unwrap();
        assert!(path.starts_with("/cache/datasets/acme--corpus"));
        assert_eq!(path.extension().unwrap(), "blk");

        let other = id.clone().with_etag("e2");
        assert_ne!(other.cache_path(Path::new("/cache")).unwrap(), path);
        // Auth never changes the cache location.
        assert_eq!(
            id.clone()
                .with_auth("secret")
                .cache_path(Path::new("/cache"))
                .unwrap(),
            path
        );
    }

    #[test]
    fn test_cache_path_stays_under_root() {
        let root = Path::new("/cache");
        for (org, repo) in [
            ("../..", "llm"),
            ("acme", ".."),
            ("acme", "."),
            ("a/b", "llm"),
            ("acme", "..\\etc"),
            ("", "llm"),
        ] {
            let id = FileIdentity::new(RepoType::Model, org, repo, "f.bin");
            assert!(
                matches!(id.cache_path(root), Err(BlobCacheError::ConfigError(_))),
                "{org:?}/{repo:?} accepted"
            );
        }

        assert!(FileIdentity::from_repo_id(RepoType::Model, "../llm", "f").is_err());
        assert!(FileIdentity::from_repo_id(RepoType::Model, "acme/..", "f").is_err());

        let dotted = FileIdentity::new(RepoType::Model, "acme.ai", "llm-7b.v2", "f.bin");
        assert!(dotted.cache_path(root).unwrap().starts_with(root));
    }

    #[test]
    fn test_repo_id_and_type_parsing() {
        let id = FileIdentity::from_repo_id(RepoType::Model, "acme/llm", "f").unwrap();
        assert_eq!((id.org.as_str(), id.repo.as_str()), ("acme", "llm"));
        assert!(FileIdentity::from_repo_id(RepoType::Model, "acme", "f").is_err());
        assert!(FileIdentity::from_repo_id(RepoType::Model, "a/b/c", "f").is_err());

        assert_eq!("datasets".parse::<RepoType>().unwrap(), RepoType::Dataset);
        assert!("bucket".parse::<RepoType>().is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let id = FileIdentity::new(RepoType::Model, "a", "b", "c").with_auth("hf_secret");
        let debug = format!("{id:?}");
        assert!(!debug.contains("hf_secret"));
        assert!(debug.contains("<redacted>"));
    }
}
