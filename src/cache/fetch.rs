//! Byte sources for the resource cache.
//!
//! A [`Fetcher`] opens a streaming read of a URL starting at a byte offset.
//! The cache decides what to retry; the fetcher only classifies failures.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use tokio::io::AsyncSeekExt;

/// Stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, FetchError>> + Send>>;

/// Why a fetch failed, as far as retrying is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network hiccup or server-side error; worth another attempt.
    Transient(String),
    /// Will not get better by retrying (bad URL, 404, ...).
    Permanent(String),
    /// The server rejected the resume offset; the partial file is unusable.
    RangeNotSatisfiable,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transient(msg) | FetchError::Permanent(msg) => f.write_str(msg),
            FetchError::RangeNotSatisfiable => f.write_str("requested range not satisfiable"),
        }
    }
}

/// An opened body stream.
pub struct Fetched {
    /// True when the body starts at the requested offset; false when the
    /// source ignored the offset and sends the whole resource.
    pub resumed: bool,
    /// Full size of the resource, when known.
    pub total: Option<u64>,
    pub body: ByteStream,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, offset: u64) -> Result<Fetched, FetchError>;
}

/// Fetches `http(s)://` URLs with reqwest and `file://` URLs from disk.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_http(&self, url: &str, offset: u64) -> Result<Fetched, FetchError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                FetchError::Permanent(format!("invalid request for {url}: {e}"))
            } else {
                FetchError::Transient(format!("request to {url} failed: {e}"))
            }
        })?;

        let status = response.status();
        let resumed = match status {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::RANGE_NOT_SATISFIABLE => return Err(FetchError::RangeNotSatisfiable),
            s if s.is_success() => false,
            s if s.is_server_error()
                || s == StatusCode::REQUEST_TIMEOUT
                || s == StatusCode::TOO_MANY_REQUESTS =>
            {
                return Err(FetchError::Transient(format!("HTTP {s} from {url}")));
            }
            s => return Err(FetchError::Permanent(format!("HTTP {s} from {url}"))),
        };

        let total = response
            .content_length()
            .map(|len| if resumed { len + offset } else { len });

        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| FetchError::Transient(format!("error reading response body: {e}")))
            })
            .boxed();

        Ok(Fetched {
            resumed,
            total,
            body,
        })
    }

    async fn fetch_file(&self, path: &str, offset: u64) -> Result<Fetched, FetchError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| FetchError::Permanent(format!("opening {path}: {e}")))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| FetchError::Permanent(format!("reading metadata for {path}: {e}")))?
            .len();
        if offset > len {
            return Err(FetchError::RangeNotSatisfiable);
        }
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| FetchError::Transient(format!("seeking {path}: {e}")))?;

        let body = tokio_util::io::ReaderStream::new(file)
            .map_ok(|b| b.to_vec())
            .map_err(|e| FetchError::Transient(format!("reading local source: {e}")))
            .boxed();

        Ok(Fetched {
            resumed: true,
            total: Some(len),
            body,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, offset: u64) -> Result<Fetched, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            self.fetch_file(path, offset).await
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url, offset).await
        } else {
            Err(FetchError::Permanent(format!("unsupported URL scheme: {url}")))
        }
    }
}
