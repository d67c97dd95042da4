//! Local store of verified remote assets (VM images, firmware, ...).
//!
//! Entries live at `<cache>/<name>`. Downloads stream into `<name>.part`
//! and are renamed into place only after the checksum matches, so the
//! addressable path never holds unverified bytes.

pub mod checksum;
pub mod fetch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::config::validate_asset_name;
use crate::error::CfdevError;

pub use fetch::{FetchError, Fetcher, HttpFetcher};

/// A remote resource the cache knows how to obtain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub name: String,
    pub url: String,
    /// Lowercase hex SHA-256.
    pub sha256: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Nothing at the cache path yet.
    Unverified,
    Verified,
    /// Present but the checksum does not match; must be deleted before reuse.
    Corrupt,
}

/// What the cache currently holds for an item.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub name: String,
    pub url: String,
    pub path: PathBuf,
    pub size: u64,
    pub status: Verification,
}

/// Bookkeeping for one download attempt, used to drive the retry policy.
#[derive(Debug, Default)]
struct DownloadAttempt {
    attempt: u32,
    bytes: u64,
    last_error: Option<String>,
}

/// Receives download progress. Purely informational.
pub trait DownloadProgress: Send + Sync {
    fn on_progress(&self, name: &str, current: u64, total: Option<u64>);

    fn on_complete(&self, _name: &str) {}
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl DownloadProgress for NoProgress {
    fn on_progress(&self, _name: &str, _current: u64, _total: Option<u64>) {}
}

enum AttemptError {
    Retryable(String),
    Fatal(CfdevError),
    RangeRejected,
}

pub struct Cache {
    dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    max_attempts: u32,
    retry_wait: Duration,
}

impl Cache {
    pub fn new(
        dir: PathBuf,
        fetcher: Arc<dyn Fetcher>,
        max_attempts: u32,
        retry_wait: Duration,
    ) -> Self {
        Self {
            dir,
            fetcher,
            max_attempts: max_attempts.max(1),
            retry_wait,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.part"))
    }

    /// Inspect the local entry for `item` without touching the network.
    pub async fn inspect(&self, item: &CacheItem) -> Result<CacheEntry, CfdevError> {
        validate_asset_name(&item.name)?;
        let path = self.entry_path(&item.name);
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CacheEntry {
                    name: item.name.clone(),
                    url: item.url.clone(),
                    path,
                    size: 0,
                    status: Verification::Unverified,
                });
            }
            Err(e) => return Err(CfdevError::io(format!("reading {}", path.display()), e)),
        };

        let actual = checksum::sha256_file(&path).await?;
        let status = if actual.eq_ignore_ascii_case(&item.sha256) {
            Verification::Verified
        } else {
            Verification::Corrupt
        };
        Ok(CacheEntry {
            name: item.name.clone(),
            url: item.url.clone(),
            path,
            size,
            status,
        })
    }

    /// Make sure `item` is present and verified locally; returns its path.
    pub async fn ensure(
        &self,
        item: &CacheItem,
        progress: &dyn DownloadProgress,
    ) -> Result<PathBuf, CfdevError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CfdevError::io(format!("creating cache dir {}", self.dir.display()), e))?;

        let entry = self.inspect(item).await?;
        match entry.status {
            Verification::Verified => {
                tracing::debug!(asset = %item.name, "cache hit");
                return Ok(entry.path);
            }
            Verification::Corrupt => {
                tracing::warn!(asset = %item.name, "cached copy is corrupt, removing");
                tokio::fs::remove_file(&entry.path).await.map_err(|e| {
                    CfdevError::io(format!("removing corrupt {}", entry.path.display()), e)
                })?;
            }
            Verification::Unverified => {}
        }

        tracing::info!(asset = %item.name, url = %item.url, "downloading");
        let partial = self.partial_path(&item.name);
        self.download(item, &partial, progress).await?;

        let actual = checksum::sha256_file(&partial).await?;
        if !actual.eq_ignore_ascii_case(&item.sha256) {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(CfdevError::ChecksumMismatch {
                name: item.name.clone(),
                expected: item.sha256.clone(),
                actual,
            });
        }

        let dest = entry.path;
        tokio::fs::rename(&partial, &dest).await.map_err(|e| {
            CfdevError::io(
                format!("renaming {} to {}", partial.display(), dest.display()),
                e,
            )
        })?;
        progress.on_complete(&item.name);
        tracing::info!(asset = %item.name, path = %dest.display(), "asset cached");
        Ok(dest)
    }

    /// Ensure every item, in order. Stops at the first failure.
    pub async fn sync(
        &self,
        items: &[CacheItem],
        progress: &dyn DownloadProgress,
    ) -> Result<Vec<PathBuf>, CfdevError> {
        let mut paths = Vec::with_capacity(items.len());
        for item in items {
            paths.push(self.ensure(item, progress).await?);
        }
        Ok(paths)
    }

    /// Delete cache files not named by `keep`. Partial downloads of kept
    /// items survive so they can resume. Returns the removed file names.
    pub async fn prune(&self, keep: &[CacheItem]) -> Result<Vec<String>, CfdevError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CfdevError::io(
                    format!("reading cache dir {}", self.dir.display()),
                    e,
                ));
            }
        };

        let mut removed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CfdevError::io("listing cache dir", e))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let base = name.strip_suffix(".part").unwrap_or(name);
            if keep.iter().any(|item| item.name == base) {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            tokio::fs::remove_file(entry.path())
                .await
                .map_err(|e| CfdevError::io(format!("removing {}", entry.path().display()), e))?;
            removed.push(name.to_string());
        }
        removed.sort();
        Ok(removed)
    }

    /// Fetch `item` into `partial`, retrying transient failures with a
    /// fixed wait. Resumes from whatever `partial` already holds.
    async fn download(
        &self,
        item: &CacheItem,
        partial: &Path,
        progress: &dyn DownloadProgress,
    ) -> Result<(), CfdevError> {
        let mut state = DownloadAttempt::default();
        let mut range_reset = false;

        loop {
            state.attempt += 1;
            match self.attempt(item, partial, progress, &mut state).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::RangeRejected) if !range_reset => {
                    // Stale partial from an earlier run; start over without
                    // charging it against the retry budget.
                    range_reset = true;
                    state.attempt -= 1;
                    remove_partial(partial).await?;
                    continue;
                }
                Err(AttemptError::RangeRejected) => {
                    state.last_error = Some(FetchError::RangeNotSatisfiable.to_string());
                    remove_partial(partial).await?;
                }
                Err(AttemptError::Retryable(msg)) => {
                    state.last_error = Some(msg);
                }
            }

            tracing::warn!(
                asset = %item.name,
                attempt = state.attempt,
                bytes = state.bytes,
                error = state.last_error.as_deref().unwrap_or(""),
                "download attempt failed"
            );

            if state.attempt >= self.max_attempts {
                return Err(CfdevError::FetchFailed {
                    name: item.name.clone(),
                    attempts: state.attempt,
                    message: state.last_error.take().unwrap_or_default(),
                });
            }
            tokio::time::sleep(self.retry_wait).await;
        }
    }

    async fn attempt(
        &self,
        item: &CacheItem,
        partial: &Path,
        progress: &dyn DownloadProgress,
        state: &mut DownloadAttempt,
    ) -> Result<(), AttemptError> {
        let offset = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut fetched = match self.fetcher.fetch(&item.url, offset).await {
            Ok(f) => f,
            Err(FetchError::Transient(msg)) => return Err(AttemptError::Retryable(msg)),
            Err(FetchError::RangeNotSatisfiable) => return Err(AttemptError::RangeRejected),
            Err(FetchError::Permanent(msg)) => {
                return Err(AttemptError::Fatal(CfdevError::FetchFailed {
                    name: item.name.clone(),
                    attempts: state.attempt,
                    message: msg,
                }));
            }
        };

        let append = fetched.resumed && offset > 0;
        let mut file = if append {
            tokio::fs::OpenOptions::new().append(true).open(partial).await
        } else {
            tokio::fs::File::create(partial).await
        }
        .map_err(|e| {
            AttemptError::Fatal(CfdevError::io(format!("opening {}", partial.display()), e))
        })?;

        let mut written = if append { offset } else { 0 };
        let total = fetched.total.or(item.size);
        if offset > 0 {
            tracing::debug!(asset = %item.name, offset, resumed = append, "resuming download");
        }

        while let Some(chunk) = fetched.body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = file.flush().await;
                    return Err(AttemptError::Retryable(e.to_string()));
                }
            };
            file.write_all(&chunk).await.map_err(|e| {
                AttemptError::Fatal(CfdevError::io(format!("writing {}", partial.display()), e))
            })?;
            written += chunk.len() as u64;
            state.bytes = written;
            progress.on_progress(&item.name, written, total);
        }

        file.flush().await.map_err(|e| {
            AttemptError::Fatal(CfdevError::io(format!("flushing {}", partial.display()), e))
        })?;
        Ok(())
    }
}

async fn remove_partial(partial: &Path) -> Result<(), CfdevError> {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CfdevError::io(format!("removing {}", partial.display()), e)),
    }
}
