//! Upload worker and part protocol (§4.2): initiate/upload/complete/abort
//! shape generalized to per-part numbering, retry-restart-from-peek, and
//! sticky-error rules, with the completion-gap handling from §9A.2.

use std::os::unix::fs::FileExt;

use base64::encode as base64_encode;
use bytes::Bytes;
use log::{debug, info, warn};
use md5::{Digest, Md5};
use rusoto_s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedMultipartUpload,
    CompletedPart, CreateMultipartUploadRequest, PutObjectRequest, S3,
    UploadPartRequest,
};

use crate::callbacks::{LivenessPinger, ProgressCallback};
use crate::circular_buffer::CircularBuffer;
use crate::config::Config;
use crate::error::{ErrorCode, Result, TransportError};
use crate::process_init::client_for;
use crate::retry::with_retry;
use crate::shared_record::SharedRecordHandle;

/// How many part-upload/download callback invocations between liveness
/// pings into the shared record (§4.6).
const LIVENESS_PING_INTERVAL: u64 = 8;

fn part_number_for_offset(offset: u64, part_size: u64) -> u32 {
    (offset / part_size) as u32 + 1
}

/// Claims the multipart initiator role if nobody has yet, and returns the
/// `upload_id` either way (§3 invariant 1, §4.2 "Multipart initiation").
pub async fn initiate_multipart_once(
    config: &Config,
    hostname: &str,
    bucket: &str,
    key: &str,
    record: &SharedRecordHandle,
) -> Result<String> {
    if let Some(id) = record.atomic_exec(|r| r.upload_id()) {
        return Ok(id);
    }

    let am_initiator = record.atomic_exec(|r| r.try_claim_initiator());
    if !am_initiator {
        // Lost the race; wait for the winner to publish the id.
        loop {
            if let Some(id) = record.atomic_exec(|r| r.upload_id()) {
                return Ok(id);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    let client = client_for(config, hostname)?;
    let bucket = bucket.to_string();
    let key = key.to_string();
    let sse = config.server_side_encryption;

    let result = with_retry(config, "InitiateMultipartUpload", || {
        let client = client.clone();
        let bucket = bucket.clone();
        let key = key.clone();
        async move {
            client
                .create_multipart_upload(CreateMultipartUploadRequest {
                    bucket,
                    key,
                    server_side_encryption: if sse { Some("AES256".to_string()) } else { None },
                    ..Default::default()
                })
                .await
        }
    })
    .await;

    match result {
        Ok(output) => {
            let upload_id = output
                .upload_id
                .ok_or_else(|| TransportError::S3Put("missing upload_id in response".to_string()))?;
            record.atomic_exec(|r| r.set_upload_id(&upload_id));
            info!("initiated multipart upload {upload_id} for {bucket}/{key}", bucket = bucket, key = key);
            Ok(upload_id)
        }
        Err(e) => {
            record.atomic_exec(|r| r.set_last_error_code_if_unset(ErrorCode::InitiateMultipartUploadError));
            Err(TransportError::S3Put(format!("InitiateMultipartUpload failed: {e}")))
        }
    }
}

fn content_md5_header(data: &[u8]) -> Option<String> {
    let mut hasher = Md5::new();
    hasher.update(data);
    Some(base64_encode(hasher.finalize()))
}

/// Uploads one part, retrying with exponential backoff. On every attempt
/// the body is re-derived from `data` (already peeked from the circular
/// buffer without being popped) rather than from any cursor state, so a
/// retried `UploadPart` always restarts from the part's original offset
/// (§9A.1).
pub async fn upload_part_with_retry(
    config: &Config,
    hostname: &str,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: u32,
    data: Bytes,
) -> Result<String> {
    let client = client_for(config, hostname)?;
    let content_md5 = if config.enable_md5 {
        content_md5_header(&data)
    } else {
        None
    };

    let result = with_retry(config, "UploadPart", || {
        let client = client.clone();
        let data = data.clone();
        let content_md5 = content_md5.clone();
        async move {
            client
                .upload_part(UploadPartRequest {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                    part_number: part_number as i64,
                    content_length: Some(data.len() as i64),
                    content_md5,
                    body: Some(data.to_vec().into()),
                    ..Default::default()
                })
                .await
        }
    })
    .await;

    result
        .map_err(|e| TransportError::S3Put(format!("UploadPart {part_number} failed: {e}")))?
        .e_tag
        .ok_or_else(|| TransportError::S3Put(format!("UploadPart {part_number} response missing ETag")))
}

/// Runs the per-transport upload worker loop (§4.2 "Per-part upload"):
/// peek a part's worth of bytes, upload it, pop on success, repeat until
/// the producer signals end-of-stream via `done_writing` and the buffer
/// drains. Spawned once per transport on the first `write()` (§4.1:
/// "starts one upload worker thread") and run for the transport's whole
/// streaming lifetime, rather than all at once at `close()`, so a
/// producer faster than S3 never overruns the circular buffer's capacity.
///
/// `starting_offset` is this transport instance's first byte offset in
/// the object; successive parts are numbered from it assuming the caller
/// honors `put_repl_flag`'s contiguous-partition contract (§5 "Ordering
/// guarantees").
pub async fn run_upload_worker(
    config: &Config,
    hostname: &str,
    bucket: &str,
    key: &str,
    upload_id: &str,
    record: &SharedRecordHandle,
    buffer: &CircularBuffer,
    starting_offset: u64,
    done_writing: std::sync::Arc<std::sync::atomic::AtomicBool>,
    progress: Option<ProgressCallback>,
) -> Result<()> {
    use std::sync::atomic::Ordering as StdOrdering;
    use std::time::Instant;

    let part_size = config.maximum_part_size;
    let poll_interval = std::time::Duration::from_millis(100);
    let stall_timeout = std::time::Duration::from_secs(config.circular_buffer_timeout_seconds);
    let pinger = progress.map(|cb| LivenessPinger::new(LIVENESS_PING_INTERVAL, cb));

    let mut offset = starting_offset;
    let mut last_progress_at = Instant::now();

    loop {
        if record.atomic_exec(|r| !r.last_error_code().is_success()) {
            return Err(TransportError::Sticky(crate::error::StickyError(
                record.atomic_exec(|r| r.last_error_code()),
            )));
        }

        let done = done_writing.load(StdOrdering::Acquire);
        let available = buffer.len_bytes();
        if done && available == 0 {
            break;
        }
        let desired = if done { available.min(part_size as usize) } else { part_size as usize };

        let part_number = part_number_for_offset(offset, part_size);
        let data = match buffer.peek_timeout(desired, poll_interval) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => {
                if last_progress_at.elapsed() > stall_timeout {
                    record.atomic_exec(|r| r.set_circular_buffer_read_timeout());
                    record.atomic_exec(|r| r.set_last_error_code_if_unset(ErrorCode::UploadFileError));
                    warn!("upload worker timed out waiting for data on part {part_number}");
                    return Err(TransportError::BufferTimeout(stall_timeout));
                }
                continue;
            }
        };

        match upload_part_with_retry(config, hostname, bucket, key, upload_id, part_number, data).await {
            Ok(etag) => {
                record.atomic_exec(|r| r.set_etag(part_number, &etag))?;
                buffer.pop_front(desired);
                offset += desired as u64;
                last_progress_at = Instant::now();
                if let Some(p) = &pinger {
                    p.tick(offset - starting_offset);
                }
                debug!("uploaded part {part_number} ({desired} bytes)");
            }
            Err(e) => {
                record.atomic_exec(|r| r.set_last_error_code_if_unset(ErrorCode::UploadFileError));
                return Err(e);
            }
        }
    }

    if let Some(p) = pinger {
        p.finish(offset - starting_offset);
    }
    Ok(())
}

/// Builds the ordered ETag list and calls `CompleteMultipartUpload`
/// (§4.2 "Completion", §9A.2: iterate `[0, N)`, abort on any gap).
pub async fn complete_multipart(
    config: &Config,
    hostname: &str,
    bucket: &str,
    key: &str,
    upload_id: &str,
    record: &SharedRecordHandle,
) -> Result<()> {
    let etags = match record.atomic_exec(|r| r.collect_etags_for_completion()) {
        Ok(etags) => etags,
        Err(missing_part) => {
            warn!("part {missing_part} missing an ETag at completion time; aborting upload {upload_id}");
            record.atomic_exec(|r| r.set_last_error_code_if_unset(ErrorCode::CompleteMultipartUploadError));
            abort_multipart(config, hostname, bucket, key, upload_id).await?;
            return Err(TransportError::S3Put(format!(
                "part {missing_part} has no ETag; upload {upload_id} aborted"
            )));
        }
    };

    let client = client_for(config, hostname)?;
    let parts: Vec<CompletedPart> = etags
        .into_iter()
        .enumerate()
        .map(|(i, etag)| CompletedPart {
            e_tag: Some(etag),
            part_number: Some((i + 1) as i64),
        })
        .collect();

    let result = with_retry(config, "CompleteMultipartUpload", || {
        let client = client.clone();
        let parts = parts.clone();
        async move {
            client
                .complete_multipart_upload(CompleteMultipartUploadRequest {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                    multipart_upload: Some(CompletedMultipartUpload { parts: Some(parts) }),
                    ..Default::default()
                })
                .await
        }
    })
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            record.atomic_exec(|r| r.set_last_error_code_if_unset(ErrorCode::CompleteMultipartUploadError));
            abort_multipart(config, hostname, bucket, key, upload_id).await?;
            Err(TransportError::S3Put(format!("CompleteMultipartUpload failed: {e}")))
        }
    }
}

pub async fn abort_multipart(
    config: &Config,
    hostname: &str,
    bucket: &str,
    key: &str,
    upload_id: &str,
) -> Result<()> {
    let client = client_for(config, hostname)?;
    client
        .abort_multipart_upload(AbortMultipartUploadRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            ..Default::default()
        })
        .await
        .map_err(|e| TransportError::S3Put(format!("AbortMultipartUpload failed: {e}")))?;
    Ok(())
}

pub async fn put_object_single(
    config: &Config,
    hostname: &str,
    bucket: &str,
    key: &str,
    data: Vec<u8>,
) -> Result<()> {
    let client = client_for(config, hostname)?;
    let content_md5 = if config.enable_md5 { content_md5_header(&data) } else { None };
    let len = data.len() as i64;

    with_retry(config, "PutObject", || {
        let client = client.clone();
        let data = data.clone();
        let content_md5 = content_md5.clone();
        async move {
            client
                .put_object(PutObjectRequest {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    body: Some(data.into()),
                    content_length: Some(len),
                    content_md5,
                    server_side_encryption: if config.server_side_encryption {
                        Some("AES256".to_string())
                    } else {
                        None
                    },
                    ..Default::default()
                })
                .await
        }
    })
    .await
    .map_err(|e| TransportError::S3Put(format!("PutObject failed: {e}")))?;
    Ok(())
}

/// Flushes a cache file to S3 (§4.2.2): single `PutObject` below the
/// part-size threshold, otherwise multipart with per-thread range reads
/// from the cache file via `read_at` (disjoint, so no cross-thread
/// coordination is needed beyond the shared record's ETag table).
pub async fn upload_cache_file(
    config: &Config,
    hostname: &str,
    bucket: &str,
    key: &str,
    cache_path: &std::path::Path,
) -> Result<()> {
    let file = std::fs::File::open(cache_path).map_err(TransportError::Io)?;
    let size = file.metadata().map_err(TransportError::Io)?.len();

    if size < config.minimum_part_size || !config.enable_mpu {
        let mut buf = vec![0u8; size as usize];
        file.read_exact_at(&mut buf, 0).map_err(TransportError::Io)?;
        return put_object_single(config, hostname, bucket, key, buf).await;
    }

    let part_size = config.maximum_part_size.max(config.minimum_part_size);
    let num_parts = ((size + part_size - 1) / part_size).max(1);
    let num_threads = (config.number_of_cache_transfer_threads as u64).min(num_parts).max(1);

    let upload_id = {
        let client = client_for(config, hostname)?;
        let output = with_retry(config, "InitiateMultipartUpload", || {
            let client = client.clone();
            async move {
                client
                    .create_multipart_upload(CreateMultipartUploadRequest {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        ..Default::default()
                    })
                    .await
            }
        })
        .await
        .map_err(|e| TransportError::S3Put(format!("InitiateMultipartUpload failed: {e}")))?;
        output
            .upload_id
            .ok_or_else(|| TransportError::S3Put("missing upload_id".to_string()))?
    };

    let mut parts_per_thread = vec![Vec::new(); num_threads as usize];
    for part_index in 0..num_parts {
        parts_per_thread[(part_index % num_threads) as usize].push(part_index);
    }

    let mut join_set = Vec::new();
    for parts in parts_per_thread {
        let config = config.clone();
        let hostname = hostname.to_string();
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.clone();
        let cache_path = cache_path.to_path_buf();

        join_set.push(tokio::spawn(async move {
            let file = std::fs::File::open(&cache_path).map_err(TransportError::Io)?;
            let mut results = Vec::new();
            for part_index in parts {
                let offset = part_index * part_size;
                let len = part_size.min(size - offset) as usize;
                let mut buf = vec![0u8; len];
                file.read_exact_at(&mut buf, offset).map_err(TransportError::Io)?;
                let part_number = (part_index + 1) as u32;
                let etag =
                    upload_part_with_retry(&config, &hostname, &bucket, &key, &upload_id, part_number, Bytes::from(buf))
                        .await?;
                results.push((part_number, etag));
            }
            Ok::<_, TransportError>(results)
        }));
    }

    let mut etags: Vec<Option<String>> = vec![None; num_parts as usize];
    for handle in join_set {
        match handle.await {
            Ok(Ok(results)) => {
                for (part_number, etag) in results {
                    etags[(part_number - 1) as usize] = Some(etag);
                }
            }
            Ok(Err(e)) => {
                abort_multipart(config, hostname, bucket, key, &upload_id).await?;
                return Err(e);
            }
            Err(join_err) => {
                abort_multipart(config, hostname, bucket, key, &upload_id).await?;
                return Err(TransportError::S3Put(format!("cache upload task panicked: {join_err}")));
            }
        }
    }

    if etags.iter().any(|e| e.is_none()) {
        abort_multipart(config, hostname, bucket, key, &upload_id).await?;
        return Err(TransportError::S3Put("cache upload left a gap in part numbers".to_string()));
    }

    let client = client_for(config, hostname)?;
    let parts: Vec<CompletedPart> = etags
        .into_iter()
        .enumerate()
        .map(|(i, etag)| CompletedPart {
            e_tag: etag,
            part_number: Some((i + 1) as i64),
        })
        .collect();

    let complete_result = with_retry(config, "CompleteMultipartUpload", || {
        let client = client.clone();
        let parts = parts.clone();
        let upload_id = upload_id.clone();
        async move {
            client
                .complete_multipart_upload(CompleteMultipartUploadRequest {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    upload_id,
                    multipart_upload: Some(CompletedMultipartUpload { parts: Some(parts) }),
                    ..Default::default()
                })
                .await
        }
    })
    .await;

    match complete_result {
        Ok(_) => Ok(()),
        Err(e) => {
            abort_multipart(config, hostname, bucket, key, &upload_id).await?;
            Err(TransportError::S3Put(format!("CompleteMultipartUpload failed: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_numbers_are_one_based_and_dense() {
        let part_size = 5 * 1024 * 1024;
        assert_eq!(part_number_for_offset(0, part_size), 1);
        assert_eq!(part_number_for_offset(part_size, part_size), 2);
        assert_eq!(part_number_for_offset(part_size * 9, part_size), 10);
        assert_eq!(part_number_for_offset(part_size + 1, part_size), 2);
    }

    #[test]
    fn content_md5_header_is_base64_of_md5_digest() {
        let header = content_md5_header(b"hello world").unwrap();
        let mut hasher = Md5::new();
        hasher.update(b"hello world");
        let expected = base64_encode(hasher.finalize());
        assert_eq!(header, expected);
    }
}
