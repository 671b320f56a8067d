//! Mirror list and per-resource failover.
//!
//! Each resource is tried on every eligible mirror in order until one serves
//! bytes that pass the caller's verification. Trust is never relaxed when a
//! mirror fails: the next mirror's bytes go through the same checks.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TrustError};
use crate::fetch::{FetchError, Fetcher};

/// Remote location serving a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    /// Base URL, without a trailing slash.
    pub url_prefix: String,
    /// Path of the metadata directory below the prefix.
    pub metadata_path: String,
    /// Path of the targets directory below the prefix.
    pub targets_path: String,
    /// Target path prefixes this mirror serves; `None` serves every target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confined_target_dirs: Option<Vec<String>>,
}

impl Mirror {
    /// Mirror serving `metadata/` and `targets/` below `url_prefix`.
    pub fn new(url_prefix: impl Into<String>) -> Self {
        Self {
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
            metadata_path: "metadata".to_string(),
            targets_path: "targets".to_string(),
            confined_target_dirs: None,
        }
    }

    pub fn with_confined_target_dirs(mut self, dirs: Vec<String>) -> Self {
        self.confined_target_dirs = Some(dirs);
        self
    }

    pub fn metadata_url(&self, file: &str) -> String {
        join_url(&self.url_prefix, &self.metadata_path, file)
    }

    pub fn target_url(&self, remote_name: &str) -> String {
        join_url(&self.url_prefix, &self.targets_path, remote_name)
    }

    /// Whether this mirror may be asked for target `path`.
    pub fn serves_target(&self, path: &str) -> bool {
        match &self.confined_target_dirs {
            None => true,
            Some(dirs) => dirs
                .iter()
                .any(|dir| dir.is_empty() || path.starts_with(dir.as_str())),
        }
    }
}

fn join_url(prefix: &str, dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        format!("{prefix}/{name}")
    } else {
        format!("{prefix}/{dir}/{name}")
    }
}

/// File name of a role's metadata, version-prefixed when `version` is set.
///
/// Role names are percent-encoded so delegated names cannot escape the
/// metadata directory.
pub fn metadata_file(role: &str, version: Option<u64>) -> String {
    let encoded = urlencoding::encode(role);
    match version {
        Some(version) => format!("{version}.{encoded}.json"),
        None => format!("{encoded}.json"),
    }
}

/// Something to retrieve from the mirrors.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    /// A metadata file name, e.g. `3.snapshot.json`.
    Metadata(&'a str),
    /// A target: its logical path and the name it is stored under.
    Target { path: &'a str, remote_name: &'a str },
}

impl Resource<'_> {
    fn name(&self) -> &str {
        match self {
            Resource::Metadata(file) => file,
            Resource::Target { path, .. } => path,
        }
    }

    fn served_by(&self, mirror: &Mirror) -> bool {
        match self {
            Resource::Metadata(_) => true,
            Resource::Target { path, .. } => mirror.serves_target(path),
        }
    }

    fn url(&self, mirror: &Mirror) -> String {
        match self {
            Resource::Metadata(file) => mirror.metadata_url(file),
            Resource::Target { remote_name, .. } => mirror.target_url(remote_name),
        }
    }
}

/// Ordered mirrors reached through one [`Fetcher`].
#[derive(Debug)]
pub struct RemoteRepository<F> {
    fetcher: F,
    mirrors: Vec<Mirror>,
    timeout: Duration,
}

impl<F: Fetcher> RemoteRepository<F> {
    /// `timeout` bounds every single fetch.
    pub fn new(fetcher: F, mirrors: Vec<Mirror>, timeout: Duration) -> Self {
        Self {
            fetcher,
            mirrors,
            timeout,
        }
    }

    pub fn mirrors(&self) -> &[Mirror] {
        &self.mirrors
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Returns the first bytes, in mirror order, accepted by `verify`.
    ///
    /// When every mirror fails, a lone failure is returned as is and several
    /// are aggregated into [`TrustError::NoWorkingMirror`].
    pub async fn fetch_verified<V>(
        &self,
        resource: Resource<'_>,
        max_length: u64,
        mut verify: V,
    ) -> Result<Vec<u8>>
    where
        V: FnMut(&[u8]) -> Result<()> + Send,
    {
        let mut errors = Vec::new();
        for mirror in self.mirrors.iter().filter(|m| resource.served_by(m)) {
            let url = resource.url(mirror);
            let outcome = match self.fetch_one(&url, max_length).await {
                Ok(bytes) => verify(&bytes).map(|()| bytes),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_transport() => {
                    debug!(url = %url, error = %err, "tuf: mirror fetch failed");
                    errors.push((mirror.url_prefix.clone(), err));
                }
                Err(err) => {
                    warn!(
                        url = %url,
                        error = %err,
                        "tuf: mirror served content that failed verification"
                    );
                    errors.push((mirror.url_prefix.clone(), err));
                }
            }
        }

        if errors.len() == 1 {
            if let Some((_, err)) = errors.pop() {
                return Err(err);
            }
        }
        Err(TrustError::NoWorkingMirror {
            resource: resource.name().to_string(),
            errors,
        })
    }

    async fn fetch_one(&self, url: &str, max_length: u64) -> Result<Vec<u8>> {
        match tokio::time::timeout(self.timeout, self.fetcher.fetch(url, max_length)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(source)) => Err(TrustError::Fetch {
                resource: url.to_string(),
                source,
            }),
            Err(_) => Err(TrustError::Fetch {
                resource: url.to_string(),
                source: FetchError::Timeout(self.timeout),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[allow(dead_code)]
    mod fixtures {
        include!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/common/repo.rs"));
    }
    use fixtures::MemoryFetcher;

    const A: &str = "https://a.example";
    const B: &str = "https://b.example";

    fn repository(fetcher: MemoryFetcher, mirrors: &[&str]) -> RemoteRepository<MemoryFetcher> {
        RemoteRepository::new(
            fetcher,
            mirrors.iter().map(|url| Mirror::new(*url)).collect(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn urls_and_file_names() {
        let mirror = Mirror::new("https://cdn.example/repo/");
        assert_eq!(
            mirror.metadata_url(&metadata_file("snapshot", Some(3))),
            "https://cdn.example/repo/metadata/3.snapshot.json"
        );
        assert_eq!(metadata_file("team/a b", None), "team%2Fa%20b.json");
        assert_eq!(
            mirror.target_url("dir/abc.file.tar"),
            "https://cdn.example/repo/targets/dir/abc.file.tar"
        );
    }

    #[tokio::test]
    async fn falls_over_to_the_next_mirror() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert(&format!("{B}/metadata/timestamp.json"), b"ts".to_vec());
        let repo = repository(fetcher.clone(), &[A, B]);

        let bytes = repo
            .fetch_verified(Resource::Metadata("timestamp.json"), 64, |_| Ok(()))
            .await
            .expect("second mirror");
        assert_eq!(bytes, b"ts".to_vec());
        assert_eq!(
            fetcher.requests(),
            vec![
                format!("{A}/metadata/timestamp.json"),
                format!("{B}/metadata/timestamp.json")
            ]
        );
    }

    #[tokio::test]
    async fn content_failing_verification_moves_on() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert(&format!("{A}/metadata/timestamp.json"), b"bad".to_vec());
        fetcher.insert(&format!("{B}/metadata/timestamp.json"), b"good".to_vec());
        let repo = repository(fetcher, &[A, B]);

        let bytes = repo
            .fetch_verified(Resource::Metadata("timestamp.json"), 64, |bytes| {
                if bytes == b"good" {
                    Ok(())
                } else {
                    Err(TrustError::malformed("timestamp", "bad"))
                }
            })
            .await
            .expect("verified");
        assert_eq!(bytes, b"good".to_vec());
    }

    #[tokio::test]
    async fn lone_failures_are_returned_unwrapped() {
        let repo = repository(MemoryFetcher::new(), &[A]);
        let err = repo
            .fetch_verified(Resource::Metadata("2.root.json"), 64, |_| Ok(()))
            .await
            .expect_err("missing");
        assert!(matches!(err, TrustError::Fetch { source: FetchError::NotFound(_), .. }));

        let repo = repository(MemoryFetcher::new(), &[A, B]);
        let err = repo
            .fetch_verified(Resource::Metadata("2.root.json"), 64, |_| Ok(()))
            .await
            .expect_err("missing everywhere");
        assert!(matches!(err, TrustError::NoWorkingMirror { ref errors, .. } if errors.len() == 2));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn targets_only_go_to_mirrors_serving_their_directory() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert(&format!("{B}/targets/bin/tool"), b"tool".to_vec());
        let repo = RemoteRepository::new(
            fetcher.clone(),
            vec![
                Mirror::new(A).with_confined_target_dirs(vec!["docs/".to_string()]),
                Mirror::new(B),
            ],
            Duration::from_secs(5),
        );

        repo.fetch_verified(
            Resource::Target {
                path: "bin/tool",
                remote_name: "bin/tool",
            },
            64,
            |_| Ok(()),
        )
        .await
        .expect("served by b");
        assert_eq!(fetcher.requests(), vec![format!("{B}/targets/bin/tool")]);
    }

    struct StalledFetcher;

    #[async_trait]
    impl Fetcher for StalledFetcher {
        async fn fetch(
            &self,
            _resource: &str,
            _max_length: u64,
        ) -> std::result::Result<Vec<u8>, FetchError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn slow_mirrors_time_out() {
        let repo = RemoteRepository::new(
            StalledFetcher,
            vec![Mirror::new(A)],
            Duration::from_millis(20),
        );
        let err = repo
            .fetch_verified(Resource::Metadata("timestamp.json"), 64, |_| Ok(()))
            .await
            .expect_err("timeout");
        assert!(matches!(err, TrustError::Fetch { source: FetchError::Timeout(_), .. }));
        assert!(err.is_transport());
    }
}
