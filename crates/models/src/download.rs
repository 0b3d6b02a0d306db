use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::{ChatModel, ModelError, RequiredAsset, Result};

const USER_AGENT: &str = concat!("banter/", env!("CARGO_PKG_VERSION"));

/// Files a download attempt is allowed to skip: anything already present
/// with more than this many bytes is treated as a finished earlier transfer.
const SKIP_THRESHOLD_BYTES: u64 = 1024;

/// Transient transfer counters, recomputed on every callback.
///
/// `total_bytes` grows as later files report their content length; only the
/// per-file pair is meaningful for the displayed percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes written for the file currently transferring.
    pub file_bytes_read: u64,
    /// Content length of the current file, 0 when the server sent none.
    pub file_total_bytes: u64,
    /// Bytes written across the whole plan so far.
    pub bytes_read: u64,
    /// Sum of the content lengths known so far.
    pub total_bytes: u64,
}

impl DownloadProgress {
    /// Integer percentage for the current file. A zero or unknown total
    /// reports 0 rather than dividing by it.
    pub fn file_percent(&self) -> u8 {
        percent_of(self.file_bytes_read, self.file_total_bytes)
    }

    /// Integer percentage across the plan, against the totals known so far.
    pub fn overall_percent(&self) -> u8 {
        percent_of(self.bytes_read, self.total_bytes)
    }
}

fn percent_of(read: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((read.min(total) as f64 / total as f64) * 100.0).clamp(0.0, 100.0) as u8
}

/// Suppresses progress callbacks until the integer percentage moves.
#[derive(Debug, Default)]
struct PercentGate {
    last: Option<u8>,
}

impl PercentGate {
    fn pass(&mut self, percent: u8) -> bool {
        if self.last == Some(percent) {
            return false;
        }
        self.last = Some(percent);
        true
    }
}

/// Per-file retry policy for transfer errors. Cancellation is never retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per file, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per further attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// No retries, for callers that want one shot per file.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    /// Backoff to sleep after a failed `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff * (1u32 << exp)
    }
}

/// Progress stream of a running fetch.
///
/// Terminal completion is not an event: it is the `Ok` return of
/// [`AssetFetcher::fetch`] itself, produced once, after every file.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// A transfer attempt began for `file`. `index` is 1-based within the
    /// plan. Re-emitted when a retry restarts the file.
    Started {
        file: String,
        index: usize,
        count: usize,
        total_bytes: u64,
    },
    /// Counters moved enough for the file percentage to change.
    Progress {
        file: String,
        progress: DownloadProgress,
    },
    /// The file finished and was renamed into place.
    Completed { file: String, bytes: u64 },
}

/// One entry of a [`DownloadPlan`]: resolved URL, destination, and what to
/// verify after the transfer.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub url: String,
    pub dest: PathBuf,
    /// Local file name, used for events and error attribution.
    pub file: String,
    pub sha256: Option<String>,
}

/// Ordered transfer list built from exactly the missing manifest entries.
#[derive(Debug, Clone, Default)]
pub struct DownloadPlan {
    pub files: Vec<PlannedFile>,
}

impl DownloadPlan {
    pub fn for_missing(model: ChatModel, model_dir: &Path, missing: &[RequiredAsset]) -> Self {
        let files = missing
            .iter()
            .map(|asset| PlannedFile {
                url: model.asset_url(asset),
                dest: model_dir.join(asset.local_name),
                file: asset.local_name.to_string(),
                sha256: asset.sha256.map(str::to_string),
            })
            .collect();
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Result of a completed fetch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSummary {
    /// Files actually transferred (skipped files are not counted).
    pub files_fetched: usize,
    /// Bytes written across the sequence.
    pub bytes_fetched: u64,
}

/// Transfer boundary of the provisioning workflow.
///
/// The controller talks to this trait so tests can drive the workflow with
/// scripted outcomes instead of the network.
#[async_trait::async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Transfer every plan entry, in order, one at a time. Returns only
    /// after the last file (success) or the first file whose retries are
    /// exhausted (failure). Cancellation aborts between chunks.
    async fn fetch(
        &self,
        plan: &DownloadPlan,
        policy: RetryPolicy,
        cancel: &CancellationToken,
        on_event: &(dyn Fn(FetchEvent) + Send + Sync),
    ) -> Result<FetchSummary>;
}

/// Real fetcher over HTTP GET.
#[derive(Default)]
pub struct HttpAssetFetcher {
    client: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(
        &self,
        plan: &DownloadPlan,
        policy: RetryPolicy,
        cancel: &CancellationToken,
        on_event: &(dyn Fn(FetchEvent) + Send + Sync),
    ) -> Result<FetchSummary> {
        let count = plan.files.len();
        let mut known_totals: HashMap<String, u64> = HashMap::new();
        let mut bytes_fetched: u64 = 0;
        let mut files_fetched: usize = 0;

        for (position, planned) in plan.files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }

            // Skip if the file already exists and looks non-empty.
            if planned.dest.exists() {
                if let Ok(meta) = std::fs::metadata(&planned.dest) {
                    if meta.len() > SKIP_THRESHOLD_BYTES {
                        tracing::info!(file = %planned.file, "skipping, already present");
                        continue;
                    }
                }
            }

            let index = position + 1;
            let mut attempt: u32 = 1;
            let (written, total) = loop {
                let done_so_far = bytes_fetched;
                let mut gate = PercentGate::default();
                let mut announced = false;
                let result = download_file(
                    &self.client,
                    planned,
                    cancel,
                    &mut |file_read, file_total| {
                        if !announced {
                            announced = true;
                            on_event(FetchEvent::Started {
                                file: planned.file.clone(),
                                index,
                                count,
                                total_bytes: file_total,
                            });
                        }
                        if file_total > 0 {
                            known_totals.entry(planned.file.clone()).or_insert(file_total);
                        }
                        let progress = DownloadProgress {
                            file_bytes_read: file_read,
                            file_total_bytes: file_total,
                            bytes_read: done_so_far.saturating_add(file_read),
                            total_bytes: known_totals
                                .values()
                                .fold(0u64, |acc, v| acc.saturating_add(*v)),
                        };
                        if gate.pass(progress.file_percent()) {
                            on_event(FetchEvent::Progress {
                                file: planned.file.clone(),
                                progress,
                            });
                        }
                    },
                )
                .await;

                match result {
                    Ok(res) => break res,
                    Err(ModelError::Cancelled) => return Err(ModelError::Cancelled),
                    Err(err) if attempt < policy.max_attempts => {
                        let backoff = policy.backoff_for(attempt);
                        tracing::warn!(
                            file = %planned.file,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "transfer failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            };

            bytes_fetched = bytes_fetched.saturating_add(written);
            files_fetched += 1;
            if total > 0 {
                known_totals.entry(planned.file.clone()).or_insert(total);
            }
            on_event(FetchEvent::Completed {
                file: planned.file.clone(),
                bytes: written,
            });
        }

        Ok(FetchSummary {
            files_fetched,
            bytes_fetched,
        })
    }
}

/// Stream one file to `<dest>.part`, verify it, rename it into place.
///
/// `on_progress` receives cumulative `(bytes_read, total_bytes)`, primed once
/// with `(0, total)` as soon as the response headers arrive.
async fn download_file(
    client: &reqwest::Client,
    planned: &PlannedFile,
    cancel: &CancellationToken,
    on_progress: &mut (dyn FnMut(u64, u64) + Send),
) -> Result<(u64, u64)> {
    if cancel.is_cancelled() {
        return Err(ModelError::Cancelled);
    }

    let resp = client
        .get(&planned.url)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .send()
        .await
        .map_err(|e| ModelError::Http {
            file: planned.file.clone(),
            message: e.to_string(),
        })?;

    if !resp.status().is_success() {
        return Err(ModelError::Http {
            file: planned.file.clone(),
            message: format!("HTTP {}: {}", resp.status(), planned.url),
        });
    }

    let total = resp.content_length().unwrap_or(0);
    on_progress(0, total);

    if let Some(parent) = planned.dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = partial_path(&planned.dest);
    let mut file = tokio::fs::File::create(&tmp).await?;

    let mut hasher = planned.sha256.as_ref().map(|_| Sha256::new());
    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ModelError::Cancelled);
        }

        let chunk = chunk.map_err(|e| ModelError::Http {
            file: planned.file.clone(),
            message: e.to_string(),
        })?;
        file.write_all(&chunk).await?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&chunk);
        }
        downloaded += chunk.len() as u64;
        on_progress(downloaded, total);
    }

    file.flush().await?;

    // The server told us how big the file is; a short body is a failed
    // transfer even when the stream ended cleanly.
    if total > 0 && downloaded != total {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ModelError::SizeMismatch {
            file: planned.file.clone(),
            expected: total,
            actual: downloaded,
        });
    }

    if let (Some(hasher), Some(expected)) = (hasher, planned.sha256.as_ref()) {
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ModelError::ChecksumMismatch {
                file: planned.file.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    // Atomic-ish replace.
    tokio::fs::rename(&tmp, &planned.dest).await?;

    Ok((downloaded, total))
}

/// `<dest>.part` staging path. Appends to the full name so `tokenizer.json`
/// and `tokenizer.model` never share a staging file.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
