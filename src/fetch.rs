//! Getting the raw bytes of an uploaded asset onto the viewer.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, instrument};

use crate::decoder::RawAsset;
use crate::error::{AssetError, AssetResult};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Where an asset comes from. `Memory` is a blob the upload flow already holds.
#[derive(Clone, Debug, PartialEq)]
pub enum AssetSource {
    Url(String),
    Path(PathBuf),
    Memory { name: String, bytes: Vec<u8> },
}

impl AssetSource {
    /// `http(s)://` strings are URLs, everything else is a filesystem path.
    pub fn parse(source: &str) -> Self {
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            AssetSource::Url(source.to_string())
        } else {
            AssetSource::Path(PathBuf::from(source))
        }
    }

    /// File name used for format detection.
    pub fn name(&self) -> String {
        match self {
            AssetSource::Url(url) => {
                let path = url.split(['?', '#']).next().unwrap_or_default();
                let path = path.split_once("://").map_or(path, |(_, rest)| rest);
                match path.split_once('/') {
                    Some((_, tail)) => tail.rsplit('/').next().unwrap_or_default().to_string(),
                    None => String::new(),
                }
            }
            AssetSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            AssetSource::Memory { name, .. } => name.clone(),
        }
    }
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, source: &AssetSource) -> AssetResult<Vec<u8>>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> AssetResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn get(&self, url: &str) -> AssetResult<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}

pub struct FileFetcher;

impl FileFetcher {
    pub async fn read(&self, path: &std::path::Path) -> AssetResult<Vec<u8>> {
        let bytes = tokio::fs::read(path).await?;
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        Ok(bytes)
    }
}

/// Dispatches on the source kind.
pub struct SourceFetcher {
    http: HttpFetcher,
    file: FileFetcher,
}

impl SourceFetcher {
    pub fn new(timeout: Duration) -> AssetResult<Self> {
        Ok(Self {
            http: HttpFetcher::new(timeout)?,
            file: FileFetcher,
        })
    }
}

#[async_trait]
impl AssetFetcher for SourceFetcher {
    async fn fetch(&self, source: &AssetSource) -> AssetResult<Vec<u8>> {
        match source {
            AssetSource::Url(url) => self.http.get(url).await,
            AssetSource::Path(path) => self.file.read(path).await,
            AssetSource::Memory { bytes, .. } => Ok(bytes.clone()),
        }
    }
}

/// Fetches the whole asset within `timeout` and tags it with its format.
#[instrument(skip_all, fields(source = %source.name()))]
pub async fn fetch_raw(
    fetcher: &dyn AssetFetcher,
    source: &AssetSource,
    timeout: Duration,
) -> AssetResult<RawAsset> {
    let bytes = tokio::time::timeout(timeout, fetcher.fetch(source))
        .await
        .map_err(|_| AssetError::FetchTimeout(timeout))??;
    let raw = RawAsset::from_named(source.name(), bytes)?;
    info!("Fetched {} ({:?}, {} bytes)", raw.name, raw.format, raw.bytes.len());
    Ok(raw)
}
