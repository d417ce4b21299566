//! Download worker and range protocol (§4.3): ranged-GET and
//! `NotFound → None` handling, generalized to on-demand single-range
//! reads and parallel download-to-cache paths.

use std::os::unix::fs::FileExt;

use log::{info, warn};
use rusoto_s3::{GetObjectRequest, HeadObjectRequest, S3};

use crate::callbacks::{drain_body_into_vec, LivenessPinger, ProgressCallback};
use crate::config::Config;
use crate::error::{ErrorCode, Result, TransportError};
use crate::process_init::client_for;
use crate::retry::with_retry;
use crate::shared_record::{CacheDownloadProgress, SharedRecordHandle};

/// `HeadObject`, used both to learn an unknown object size at open and to
/// check existence for `object-must-exist` (§4.1's open operation).
pub async fn head_object_size(config: &Config, hostname: &str, bucket: &str, key: &str) -> Result<Option<u64>> {
    let client = client_for(config, hostname)?;
    let result = client
        .head_object(HeadObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            ..Default::default()
        })
        .await;

    match result {
        Ok(output) => Ok(output.content_length.map(|n| n as u64)),
        Err(rusoto_core::RusotoError::Unknown(resp)) if resp.status.as_u16() == 404 => Ok(None),
        Err(e) => Err(TransportError::S3Stat(format!("HeadObject failed: {e}"))),
    }
}

/// One-shot ranged read for streaming-mode `read()` (§4.3 "On-demand
/// ranged read"). `end` is clipped to `known_object_size` by the caller
/// before the range header is built.
pub async fn read_range(
    config: &Config,
    hostname: &str,
    bucket: &str,
    key: &str,
    start: u64,
    end: u64,
) -> Result<Vec<u8>> {
    if end <= start {
        return Ok(Vec::new());
    }
    let client = client_for(config, hostname)?;
    let range = format!("bytes={}-{}", start, end - 1);

    let output = with_retry(config, "GetObject", || {
        let client = client.clone();
        let range = range.clone();
        async move {
            client
                .get_object(GetObjectRequest {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    range: Some(range),
                    ..Default::default()
                })
                .await
        }
    })
    .await
    .map_err(|e| TransportError::S3Get(format!("GetObject range {start}-{end} failed: {e}")))?;

    let body = output
        .body
        .ok_or_else(|| TransportError::S3Get("GetObject response had no body".to_string()))?;
    drain_body_into_vec(body, Some(end - start)).await
}

/// Transitions `cache_file_download_progress` and, if this caller won the
/// race to start it, performs the parallel download to `cache_path`
/// (§4.3 "Parallel download to cache"). Callers that find the download
/// already `Success` return immediately; callers that find it `Started`
/// poll until it resolves.
pub async fn ensure_downloaded_to_cache(
    config: &Config,
    hostname: &str,
    bucket: &str,
    key: &str,
    object_size: u64,
    cache_path: &std::path::Path,
    record: &SharedRecordHandle,
    progress: Option<ProgressCallback>,
) -> Result<()> {
    let progress_state = record.atomic_exec(|r| r.cache_file_download_progress());

    match progress_state {
        CacheDownloadProgress::Success => return Ok(()),
        CacheDownloadProgress::Failed => {
            return Err(TransportError::S3Get("cache download previously failed".to_string()));
        }
        CacheDownloadProgress::Started => {
            // Another caller is already downloading; poll for completion.
            loop {
                match record.atomic_exec(|r| r.cache_file_download_progress()) {
                    CacheDownloadProgress::Success => return Ok(()),
                    CacheDownloadProgress::Failed => {
                        return Err(TransportError::S3Get("cache download failed in another thread".to_string()));
                    }
                    _ => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
                }
            }
        }
        CacheDownloadProgress::NotStarted => {
            let claimed = record.atomic_exec(|r| {
                if r.cache_file_download_progress() == CacheDownloadProgress::NotStarted {
                    r.set_cache_file_download_progress(CacheDownloadProgress::Started);
                    true
                } else {
                    false
                }
            });
            if !claimed {
                return Box::pin(ensure_downloaded_to_cache(
                    config, hostname, bucket, key, object_size, cache_path, record, progress,
                ))
                .await;
            }
        }
    }

    check_free_disk_space(cache_path, object_size)?;

    let file = std::fs::File::create(cache_path).map_err(TransportError::Io)?;
    file.set_len(object_size).map_err(TransportError::Io)?;

    let num_workers = pick_worker_count(config.number_of_cache_transfer_threads, object_size);
    let chunk = (object_size + num_workers as u64 - 1) / num_workers as u64;

    let pinger = progress.map(|cb| std::sync::Arc::new(LivenessPinger::new(4, cb)));
    let mut join_set = Vec::new();

    for worker in 0..num_workers {
        let start = worker as u64 * chunk;
        if start >= object_size {
            break;
        }
        let end = (start + chunk).min(object_size);
        let config = config.clone();
        let hostname = hostname.to_string();
        let bucket = bucket.to_string();
        let key = key.to_string();
        let cache_path = cache_path.to_path_buf();
        let pinger = pinger.clone();

        join_set.push(tokio::spawn(async move {
            let bytes = read_range(&config, &hostname, &bucket, &key, start, end).await?;
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&cache_path)
                .map_err(TransportError::Io)?;
            file.write_all_at(&bytes, start).map_err(TransportError::Io)?;
            if let Some(p) = &pinger {
                p.tick(bytes.len() as u64);
            }
            Ok::<u64, TransportError>(bytes.len() as u64)
        }));
    }

    let mut total_downloaded: u64 = 0;
    let mut failure: Option<TransportError> = None;
    for handle in join_set {
        match handle.await {
            Ok(Ok(n)) => total_downloaded += n,
            Ok(Err(e)) => failure = Some(e),
            Err(join_err) => failure = Some(TransportError::S3Get(format!("download task panicked: {join_err}"))),
        }
    }

    if failure.is_none() && total_downloaded != object_size {
        failure = Some(TransportError::S3Get(format!(
            "downloaded {total_downloaded} bytes, expected {object_size}"
        )));
    }

    match failure {
        None => {
            record.atomic_exec(|r| r.set_cache_file_download_progress(CacheDownloadProgress::Success));
            info!("downloaded {key} to cache ({object_size} bytes, {num_workers} workers)");
            Ok(())
        }
        Some(e) => {
            record.atomic_exec(|r| r.set_cache_file_download_progress(CacheDownloadProgress::Failed));
            record.atomic_exec(|r| r.set_last_error_code_if_unset(ErrorCode::DownloadFileError));
            let _ = std::fs::remove_file(cache_path);
            warn!("cache download of {key} failed: {e}");
            Err(e)
        }
    }
}

fn pick_worker_count(configured_max: usize, object_size: u64) -> usize {
    const MIN_BYTES_PER_WORKER: u64 = 1024 * 1024;
    let by_size = (object_size / MIN_BYTES_PER_WORKER).max(1) as usize;
    configured_max.min(by_size).max(1)
}

fn check_free_disk_space(cache_path: &std::path::Path, required_bytes: u64) -> Result<()> {
    let dir = cache_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    std::fs::create_dir_all(dir).map_err(TransportError::Io)?;

    // statvfs is the idiomatic stdlib-adjacent way to check free space on
    // Unix without pulling in a dedicated crate.
    let c_path = std::ffi::CString::new(dir.as_os_str().to_string_lossy().as_bytes())
        .map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }
    let free_bytes = stat.f_bavail as u64 * stat.f_frsize as u64;
    if free_bytes < required_bytes {
        return Err(TransportError::Config(format!(
            "insufficient disk space for cache download: need {required_bytes} bytes, {free_bytes} available"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_clamped_by_size_and_config_max() {
        assert_eq!(pick_worker_count(10, 512 * 1024), 1);
        assert_eq!(pick_worker_count(10, 5 * 1024 * 1024), 5);
        assert_eq!(pick_worker_count(2, 100 * 1024 * 1024), 2);
    }
}
