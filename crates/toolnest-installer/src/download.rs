use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use toolnest_security::verify_sha256_file;

use crate::chunks::{chunk_dir_for, chunk_file_name, plan_chunks, ChunkRange};
use crate::error::DownloadError;
use crate::fs_utils::{remove_dir_if_exists, remove_file_if_exists};

pub const DEFAULT_SEGMENTS: usize = 8;
pub const DEFAULT_MIN_SEGMENT_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_TRANSFER_BLOCK_BYTES: usize = 64 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;

/// Progress callback receiving `(downloaded_bytes, total_bytes)`. Called from
/// chunk worker threads.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Sync);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub segments: usize,
    pub min_segment_bytes: u64,
    pub transfer_block_bytes: usize,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            segments: DEFAULT_SEGMENTS,
            min_segment_bytes: DEFAULT_MIN_SEGMENT_BYTES,
            transfer_block_bytes: DEFAULT_TRANSFER_BLOCK_BYTES,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            user_agent: format!("toolnest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Shared flag tripped by an operator interrupt.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Destination already held a file with the expected hash.
    CacheHit { bytes: u64 },
    Downloaded {
        bytes: u64,
        chunks: usize,
        elapsed: Duration,
    },
}

impl DownloadOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::CacheHit { bytes } | Self::Downloaded { bytes, .. } => *bytes,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        matches!(self, Self::CacheHit { .. })
    }
}

#[derive(Debug)]
struct Chunk {
    range: ChunkRange,
    path: PathBuf,
}

/// Fetches a URL with concurrent byte-range requests and assembles the
/// chunks in index order.
pub struct SegmentedDownloader {
    client: Client,
    options: DownloadOptions,
    cancel: CancelToken,
}

impl SegmentedDownloader {
    pub fn new(options: DownloadOptions) -> Result<Self, DownloadError> {
        // The blocking client defaults to a 30s total timeout, which large
        // chunks routinely exceed.
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(None::<Duration>)
            .user_agent(options.user_agent.clone())
            .build()
            .map_err(|err| DownloadError::Client(err.to_string()))?;

        Ok(Self {
            client,
            options,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Downloads `url` into `destination`.
    ///
    /// An existing destination whose digest matches `expected_hash` is kept
    /// without touching the network. On any failure the partial destination
    /// and the chunk directory are removed before the error is returned.
    pub fn download(
        &self,
        url: &str,
        destination: &Path,
        expected_hash: Option<&str>,
        progress: ProgressFn<'_>,
    ) -> Result<DownloadOutcome, DownloadError> {
        if let Some(expected) = expected_hash {
            if destination.exists() && verify_sha256_file(destination, expected) {
                let bytes = fs::metadata(destination)
                    .map(|metadata| metadata.len())
                    .unwrap_or(0);
                tracing::info!(path = %destination.display(), bytes, "reusing verified download");
                progress(bytes, bytes);
                return Ok(DownloadOutcome::CacheHit { bytes });
            }
        }

        let started = Instant::now();
        let chunk_dir = chunk_dir_for(destination);
        match self.download_fresh(url, destination, &chunk_dir, expected_hash, progress) {
            Ok((bytes, chunks)) => {
                let elapsed = started.elapsed();
                tracing::info!(url, bytes, chunks, elapsed_ms = elapsed.as_millis() as u64, "download complete");
                Ok(DownloadOutcome::Downloaded {
                    bytes,
                    chunks,
                    elapsed,
                })
            }
            Err(err) => {
                tracing::debug!(url, error = %err, "download failed; cleaning up");
                cleanup_failed_download(destination, &chunk_dir);
                Err(err)
            }
        }
    }

    fn download_fresh(
        &self,
        url: &str,
        destination: &Path,
        chunk_dir: &Path,
        expected_hash: Option<&str>,
        progress: ProgressFn<'_>,
    ) -> Result<(u64, usize), DownloadError> {
        self.check_cancelled()?;
        remove_file_if_exists(destination).map_err(DownloadError::io(destination))?;

        let total_size = self.probe_size(url)?;
        let chunks = plan_chunks(
            total_size,
            self.options.segments,
            self.options.min_segment_bytes,
        )
        .into_iter()
        .map(|range| Chunk {
            path: chunk_dir.join(chunk_file_name(range.index)),
            range,
        })
        .collect::<Vec<_>>();
        tracing::debug!(url, total_size, chunks = chunks.len(), "planned segmented download");

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(DownloadError::io(parent))?;
        }
        remove_dir_if_exists(chunk_dir).map_err(DownloadError::io(chunk_dir))?;
        fs::create_dir_all(chunk_dir).map_err(DownloadError::io(chunk_dir))?;

        self.fetch_chunks(url, &chunks, total_size, progress)?;
        verify_chunks(&chunks)?;

        let assembled = concatenate_chunks(&chunks, destination);
        if let Err(err) = remove_dir_if_exists(chunk_dir) {
            tracing::warn!(path = %chunk_dir.display(), error = %err, "failed to remove chunk directory");
        }
        let assembled = assembled?;

        if assembled != total_size {
            return Err(DownloadError::SizeMismatch {
                expected: total_size,
                actual: assembled,
            });
        }
        if let Some(expected) = expected_hash {
            if !verify_sha256_file(destination, expected) {
                return Err(DownloadError::HashMismatch {
                    path: destination.to_path_buf(),
                    expected: expected.to_string(),
                });
            }
        }

        Ok((total_size, chunks.len()))
    }

    fn probe_size(&self, url: &str) -> Result<u64, DownloadError> {
        let response = self
            .client
            .head(url)
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .map_err(|err| network_error(url, &err))?;

        if !response.status().is_success() {
            return Err(DownloadError::Network {
                url: url.to_string(),
                reason: format!("HEAD request failed with status {}", response.status()),
            });
        }

        // Read the header directly: a HEAD response has no body, so the
        // client's own content length would report zero.
        let total_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(0);
        if total_size == 0 {
            return Err(DownloadError::SizeUnknown {
                url: url.to_string(),
            });
        }
        Ok(total_size)
    }

    fn fetch_chunks(
        &self,
        url: &str,
        chunks: &[Chunk],
        total_size: u64,
        progress: ProgressFn<'_>,
    ) -> Result<(), DownloadError> {
        let downloaded = AtomicU64::new(0);
        let abort = AtomicBool::new(false);
        let whole_file = chunks.len() == 1;

        let results = thread::scope(|scope| {
            let handles = chunks
                .iter()
                .map(|chunk| {
                    let downloaded = &downloaded;
                    let abort = &abort;
                    scope.spawn(move || {
                        let result = self.fetch_chunk(
                            url, chunk, whole_file, total_size, downloaded, abort, progress,
                        );
                        if result.is_err() {
                            abort.store(true, Ordering::SeqCst);
                        }
                        result
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(DownloadError::CorruptChunks {
                            detail: "chunk worker panicked".to_string(),
                        })
                    })
                })
                .collect::<Vec<_>>()
        });

        let mut first_cancelled = None;
        for result in results {
            match result {
                Ok(_) => {}
                Err(DownloadError::Cancelled) => first_cancelled = Some(DownloadError::Cancelled),
                Err(err) => return Err(err),
            }
        }
        match first_cancelled {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fetch_chunk(
        &self,
        url: &str,
        chunk: &Chunk,
        whole_file: bool,
        total_size: u64,
        downloaded: &AtomicU64,
        abort: &AtomicBool,
        progress: ProgressFn<'_>,
    ) -> Result<u64, DownloadError> {
        let index = chunk.range.index;
        let mut response = self
            .client
            .get(url)
            .header(RANGE, chunk.range.header_value())
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .map_err(|err| network_error(url, &err))?;

        let status = response.status();
        let accepted =
            status == StatusCode::PARTIAL_CONTENT || (whole_file && status == StatusCode::OK);
        if !accepted {
            return Err(DownloadError::Network {
                url: url.to_string(),
                reason: format!("chunk {index} request returned status {status}"),
            });
        }

        let file = File::create(&chunk.path).map_err(DownloadError::io(&chunk.path))?;
        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0_u8; self.options.transfer_block_bytes.max(1)];
        let mut written = 0_u64;

        loop {
            if abort.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let read = response
                .read(&mut buffer)
                .map_err(|err| DownloadError::Network {
                    url: url.to_string(),
                    reason: format!("read error in chunk {index}: {err}"),
                })?;
            if read == 0 {
                break;
            }

            writer
                .write_all(&buffer[..read])
                .map_err(DownloadError::io(&chunk.path))?;
            written += read as u64;
            let so_far = downloaded.fetch_add(read as u64, Ordering::Relaxed) + read as u64;
            progress(so_far, total_size);
        }

        writer.flush().map_err(DownloadError::io(&chunk.path))?;
        tracing::debug!(chunk = index, bytes = written, range = %chunk.range.header_value(), "chunk complete");
        Ok(written)
    }

    fn check_cancelled(&self) -> Result<(), DownloadError> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }
}

fn verify_chunks(chunks: &[Chunk]) -> Result<(), DownloadError> {
    for chunk in chunks {
        let actual = fs::metadata(&chunk.path)
            .map(|metadata| metadata.len())
            .map_err(|err| DownloadError::CorruptChunks {
                detail: format!("chunk {} is missing: {err}", chunk.range.index),
            })?;
        if actual != chunk.range.byte_count() {
            return Err(DownloadError::CorruptChunks {
                detail: format!(
                    "chunk {} has {actual} bytes, expected {}",
                    chunk.range.index,
                    chunk.range.byte_count()
                ),
            });
        }
    }
    Ok(())
}

fn concatenate_chunks(chunks: &[Chunk], destination: &Path) -> Result<u64, DownloadError> {
    let file = File::create(destination).map_err(DownloadError::io(destination))?;
    let mut writer = BufWriter::new(file);
    let mut total = 0_u64;

    for chunk in chunks {
        let mut reader = File::open(&chunk.path).map_err(DownloadError::io(&chunk.path))?;
        total += io::copy(&mut reader, &mut writer).map_err(DownloadError::io(destination))?;
    }

    writer.flush().map_err(DownloadError::io(destination))?;
    Ok(total)
}

fn cleanup_failed_download(destination: &Path, chunk_dir: &Path) {
    if let Err(err) = remove_file_if_exists(destination) {
        tracing::warn!(path = %destination.display(), error = %err, "failed to remove partial download");
    }
    if let Err(err) = remove_dir_if_exists(chunk_dir) {
        tracing::warn!(path = %chunk_dir.display(), error = %err, "failed to remove chunk directory");
    }
}

fn network_error(url: &str, err: &reqwest::Error) -> DownloadError {
    let reason = if err.is_timeout() {
        format!("timed out: {err}")
    } else {
        err.to_string()
    };
    DownloadError::Network {
        url: url.to_string(),
        reason,
    }
}
