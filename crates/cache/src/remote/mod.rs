//! HTTP artifact store.
//!
//! Artifacts live at `{api_url}/v8/artifacts/{hash}`:
//!
//! - `PUT` uploads an archive with `x-artifact-duration` (ms) and, when
//!   signing is enabled, `x-artifact-tag`.
//! - `GET` downloads it; `404` is a miss.
//! - `HEAD` checks for it without downloading.
//!
//! Requests carry a bearer token and the `teamId`/`slug` query parameters
//! when configured.

mod retry;
mod signature;

pub use retry::retry_with_backoff;
pub use signature::ArtifactSigner;

use crate::archive::{CacheReader, CacheWriter};
use crate::config::RemoteCacheConfig;
use crate::local::validate_hash;
use crate::run_state::RunState;
use crate::{CacheHitMetadata, CacheSource, Error, Result};
use bytes::Bytes;
use cachet_events::register_secret;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::{Method, RequestBuilder, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Request header carrying the task's execution time in milliseconds.
pub const DURATION_HEADER: &str = "x-artifact-duration";
/// Request header carrying the artifact signature.
pub const TAG_HEADER: &str = "x-artifact-tag";

/// A downloaded, verified artifact body.
#[derive(Debug)]
pub struct RemoteArtifact {
    /// Archive bytes (zstd-compressed tar)
    pub body: Bytes,
    /// Execution time of the task that produced it, in milliseconds
    pub duration: u64,
}

/// Client for the remote artifact API.
#[derive(Debug)]
pub struct RemoteStore {
    client: reqwest::Client,
    config: RemoteCacheConfig,
    signer: Option<ArtifactSigner>,
    run_state: Arc<RunState>,
}

impl RemoteStore {
    /// Build a store for `config`, sharing the run's failure budget.
    ///
    /// The token and signature key are registered for redaction.
    pub fn new(config: &RemoteCacheConfig, run_state: Arc<RunState>) -> Result<Self> {
        if config.api_url.is_empty() {
            return Err(Error::configuration("remote cache API URL is empty"));
        }
        register_secret(config.token.as_str());

        let signer = match &config.signature {
            Some(signature) => {
                register_secret(signature.key.as_str());
                let team = config
                    .team_id
                    .as_deref()
                    .or(config.team_slug.as_deref())
                    .unwrap_or_default();
                Some(ArtifactSigner::new(signature.key.as_bytes(), team.as_bytes())?)
            }
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            client,
            config: config.clone(),
            signer,
            run_state,
        })
    }

    /// The run state this store reports failures to.
    #[must_use]
    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    fn artifact_url(&self, hash: &str) -> String {
        format!(
            "{}/v8/artifacts/{hash}",
            self.config.api_url.trim_end_matches('/')
        )
    }

    fn request(&self, method: Method, hash: &str) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, self.artifact_url(hash))
            .bearer_auth(&self.config.token);
        if let Some(team_id) = &self.config.team_id {
            request = request.query(&[("teamId", team_id)]);
        }
        if let Some(slug) = &self.config.team_slug {
            request = request.query(&[("slug", slug)]);
        }
        request
    }

    /// Upload an archive body.
    #[tracing::instrument(skip_all, fields(hash = %hash, bytes = body.len()))]
    pub async fn put(&self, hash: &str, body: Bytes, duration: u64) -> Result<()> {
        validate_hash(hash)?;
        let tag = self.signer.as_ref().map(|s| s.tag(hash, &body));

        retry_with_backoff(&self.config.retry, &self.run_state, "put", || {
            let mut request = self
                .request(Method::PUT, hash)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(DURATION_HEADER, duration.to_string())
                .body(body.clone());
            if let Some(tag) = &tag {
                request = request.header(TAG_HEADER, tag.as_str());
            }
            async move {
                let response = request.send().await?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(Error::unexpected_status(status.as_u16(), "put"))
                }
            }
        })
        .await?;
        debug!("Uploaded artifact");
        Ok(())
    }

    /// Download and verify an archive body. `Ok(None)` is a miss.
    #[tracing::instrument(skip_all, fields(hash = %hash))]
    pub async fn fetch(&self, hash: &str) -> Result<Option<RemoteArtifact>> {
        validate_hash(hash)?;
        let downloaded = retry_with_backoff(&self.config.retry, &self.run_state, "fetch", || {
            let request = self.request(Method::GET, hash);
            async move {
                let response = request.send().await?;
                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !status.is_success() {
                    return Err(Error::unexpected_status(status.as_u16(), "fetch"));
                }
                let headers = response.headers().clone();
                let body = response.bytes().await?;
                Ok(Some((headers, body)))
            }
        })
        .await?;

        let Some((headers, body)) = downloaded else {
            debug!("Remote cache miss");
            return Ok(None);
        };

        if let Some(signer) = &self.signer {
            let tag = header_str(&headers, TAG_HEADER).ok_or_else(|| Error::ArtifactTagMissing {
                hash: hash.to_string(),
            })?;
            signer.verify(hash, &body, tag)?;
        }

        let duration = parse_duration(&headers)?;
        debug!(bytes = body.len(), duration, "Remote cache hit");
        Ok(Some(RemoteArtifact { body, duration }))
    }

    /// Check for an artifact without downloading it.
    #[tracing::instrument(skip_all, fields(hash = %hash))]
    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>> {
        validate_hash(hash)?;
        let headers = retry_with_backoff(&self.config.retry, &self.run_state, "exists", || {
            let request = self.request(Method::HEAD, hash);
            async move {
                let response = request.send().await?;
                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !status.is_success() {
                    return Err(Error::unexpected_status(status.as_u16(), "exists"));
                }
                Ok(Some(response.headers().clone()))
            }
        })
        .await?;

        headers
            .map(|headers| {
                Ok(CacheHitMetadata {
                    source: CacheSource::Remote,
                    time_saved: parse_duration(&headers)?,
                })
            })
            .transpose()
    }

    /// Archive `files` in memory and upload them.
    pub async fn put_files(
        &self,
        anchor: &Path,
        hash: &str,
        files: Vec<String>,
        duration: u64,
    ) -> Result<()> {
        let anchor = anchor.to_path_buf();
        let body = tokio::task::spawn_blocking(move || archive_in_memory(&anchor, &files)).await??;
        self.put(hash, body, duration).await
    }

    /// Download an artifact and restore it below `anchor`.
    pub async fn fetch_files(
        &self,
        anchor: &Path,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<String>)>> {
        let Some(artifact) = self.fetch(hash).await? else {
            return Ok(None);
        };
        let anchor: PathBuf = anchor.to_path_buf();
        let body = artifact.body;
        let files = tokio::task::spawn_blocking(move || {
            CacheReader::from_reader(body.as_ref(), true)?.restore(&anchor)
        })
        .await??;

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved: artifact.duration,
            },
            files,
        )))
    }
}

pub(crate) fn archive_in_memory(anchor: &Path, files: &[String]) -> Result<Bytes> {
    let mut writer = CacheWriter::from_writer(Vec::new(), true)?;
    for file in files {
        match writer.add_file(anchor, file) {
            Ok(()) => {}
            Err(Error::UnsupportedFileType { path }) => {
                tracing::warn!(path = %path.display(), "Skipping output with unsupported file type");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Bytes::from(writer.finish()?))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_duration(headers: &HeaderMap) -> Result<u64> {
    let Some(value) = headers.get(DURATION_HEADER) else {
        return Ok(0);
    };
    let text = value.to_str().unwrap_or_default();
    text.trim().parse().map_err(|_| Error::InvalidDuration {
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn store(api_url: &str) -> RemoteStore {
        let mut config = RemoteCacheConfig::new(api_url, "token-abcdef");
        config.team_id = Some("team_1".into());
        RemoteStore::new(&config, Arc::new(RunState::default())).unwrap()
    }

    #[test]
    fn test_artifact_url_trims_trailing_slash() {
        assert_eq!(
            store("https://cache.example.com/").artifact_url("abc"),
            "https://cache.example.com/v8/artifacts/abc"
        );
    }

    #[test]
    fn test_empty_api_url_rejected() {
        let config = RemoteCacheConfig::new("", "token-abcdef");
        assert!(RemoteStore::new(&config, Arc::new(RunState::default())).is_err());
    }

    #[test]
    fn test_token_is_registered_for_redaction() {
        let _store = store("https://cache.example.com");
        assert!(!cachet_events::redact("Bearer token-abcdef").contains("token-abcdef"));
    }

    #[test]
    fn test_parse_duration() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_duration(&headers).unwrap(), 0);
        headers.insert(DURATION_HEADER, HeaderValue::from_static("1500"));
        assert_eq!(parse_duration(&headers).unwrap(), 1500);
        headers.insert(DURATION_HEADER, HeaderValue::from_static("soon"));
        assert!(matches!(
            parse_duration(&headers),
            Err(Error::InvalidDuration { .. })
        ));
    }

    #[test]
    fn test_archive_in_memory_round_trips() {
        let src = tempfile::TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), "alpha").unwrap();
        let body = archive_in_memory(src.path(), &["a.txt".to_string()]).unwrap();

        let dst = tempfile::TempDir::new().unwrap();
        let files = CacheReader::from_reader(body.as_ref(), true)
            .unwrap()
            .restore(dst.path())
            .unwrap();
        assert_eq!(files, vec!["a.txt"]);
        assert_eq!(
            std::fs::read_to_string(dst.path().join("a.txt")).unwrap(),
            "alpha"
        );
    }
}
