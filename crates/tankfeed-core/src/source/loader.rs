//! Raw content loading for file and remote sources.

use super::remote::ensure_public_resolution;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Url;
use std::path::Path;
use std::time::Duration;

/// Reads raw bytes for an ingestion cycle.
///
/// The registry goes through this trait for every read so tests can gate or
/// fail reads deterministically.
#[async_trait]
pub trait ContentLoader: Send + Sync {
    /// Read a local file.
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Fetch a remote document with a per-request timeout.
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>>;
}

/// Loader backed by `tokio::fs` and a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct StandardLoader {
    client: reqwest::Client,
}

impl StandardLoader {
    pub fn new() -> Result<Self> {
        // Redirects are not followed: a public host could otherwise bounce
        // the request to an internal address.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("tankfeed/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContentLoader for StandardLoader {
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>> {
        ensure_public_resolution(url).await?;

        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                message: format!("GET {} returned {}", url, status),
                transient: status.is_server_error() || status.as_u16() == 429,
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}
