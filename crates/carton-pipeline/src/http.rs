//! HTTP downloads for release-artifact fetches.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{PipelineError, Result};

pub const DEFAULT_RELEASE_BASE_URL: &str = "https://github.com";

/// Downloads one artifact.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn download(&self, url: &str, token: Option<&str>) -> Result<Vec<u8>>;
}

/// URL of a release asset: `<base>/<owner>/<repo>/releases/download/<tag>/<asset>`.
pub fn release_asset_url(base_url: Option<&str>, slug: &str, tag: &str, asset: &str) -> String {
    let base = base_url.unwrap_or(DEFAULT_RELEASE_BASE_URL).trim_end_matches('/');
    format!("{base}/{slug}/releases/download/{tag}/{asset}")
}

/// `reqwest`-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("carton/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Http {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn download(&self, url: &str, token: Option<&str>) -> Result<Vec<u8>> {
        let http_err = |e: reqwest::Error| PipelineError::Http {
            url: url.to_string(),
            message: e.to_string(),
        };

        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(http_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Http {
                url: url.to_string(),
                message: format!("unexpected status {status}"),
            });
        }
        let bytes = response.bytes().await.map_err(http_err)?;
        debug!(url, bytes = bytes.len(), "downloaded artifact");
        Ok(bytes.to_vec())
    }
}
