//! End-to-end scenarios against a local MinIO container (§8): multi-thread
//! streaming upload, single-part cutoff, cache-mode round trip, and
//! stale-shared-memory recovery.

mod common;

use std::collections::HashMap;
use std::error::Error;
use std::io::SeekFrom;

use s3_transport::{Config, OpenMode, Transport};

fn config_for(params: &[(&str, &str)]) -> Config {
    let mut map = HashMap::new();
    for (k, v) in params {
        map.insert(k.to_string(), v.to_string());
    }
    Config::from_params(&map).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_multipart_round_trip() -> Result<(), Box<dyn Error>> {
    common::log_init("integration_transport");
    execute_in_docker!((|| async {
        let bucket = common::generate_unique_name();
        common::create_client_and_bucket(&bucket).await?;

        let key = "large-object";
        let path = format!("/{bucket}/{key}");
        let part_size = 5 * 1024 * 1024;
        let object_size = (part_size * 3) as u64 + 17; // forces 4 parts, last one partial

        let mut params = HashMap::new();
        params.insert("S3_PUT_REPL_FLAG".to_string(), "1".to_string());
        params.insert("S3_OBJECT_SIZE".to_string(), object_size.to_string());
        params.insert("S3_MPU_THREADS".to_string(), "2".to_string());
        let config = Config::from_params(&params)?;

        let body = vec![0x5Au8; object_size as usize];

        let mut transport = Transport::open(config.clone(), &path, OpenMode::write_only())?;
        // Feed the writer in chunks smaller than a part so the background
        // worker genuinely has to drain concurrently with write().
        for chunk in body.chunks(64 * 1024) {
            transport.write(chunk)?;
        }
        transport.close()?;

        let mut reader = Transport::open(config, &path, OpenMode::read_only())?;
        let mut downloaded = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            downloaded.extend_from_slice(&buf[..n]);
        }
        reader.close()?;

        assert_eq!(downloaded.len(), body.len());
        assert_eq!(downloaded, body);
        Ok(())
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_write_falls_back_to_cache_mode() -> Result<(), Box<dyn Error>> {
    common::log_init("integration_transport");
    execute_in_docker!((|| async {
        let bucket = common::generate_unique_name();
        common::create_client_and_bucket(&bucket).await?;

        let key = "small-object";
        let path = format!("/{bucket}/{key}");

        let mut params = HashMap::new();
        params.insert("S3_PUT_REPL_FLAG".to_string(), "1".to_string());
        params.insert("S3_OBJECT_SIZE".to_string(), "1024".to_string());
        let config = Config::from_params(&params)?;

        let body = b"small payload, below the streaming cutoff".to_vec();
        let mut transport = Transport::open(config.clone(), &path, OpenMode::write_truncate())?;
        transport.write(&body)?;
        transport.close()?;

        let mut reader = Transport::open(config, &path, OpenMode::read_only())?;
        let mut downloaded = vec![0u8; body.len()];
        let n = reader.read(&mut downloaded)?;
        reader.close()?;

        assert_eq!(n, body.len());
        assert_eq!(downloaded, body);
        Ok(())
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_independent_handles_share_exactly_one_finalizer() -> Result<(), Box<dyn Error>> {
    common::log_init("integration_transport");
    execute_in_docker!((|| async {
        let bucket = common::generate_unique_name();
        common::create_client_and_bucket(&bucket).await?;

        let key = "multi-process-object";
        let path = format!("/{bucket}/{key}");
        let part_size: u64 = 5 * 1024 * 1024;
        let object_size = part_size * 2;

        let mut params = HashMap::new();
        params.insert("S3_PUT_REPL_FLAG".to_string(), "1".to_string());
        params.insert("S3_OBJECT_SIZE".to_string(), object_size.to_string());
        params.insert("S3_MPU_THREADS".to_string(), "2".to_string());
        let config = Config::from_params(&params)?;

        // Two independent `Transport`/`SharedRecordHandle` pairs on the
        // same key, standing in for two processes each writing their
        // declared, disjoint, contiguous half of the object (§9
        // "put-repl flag"'s partitioned-by-offset contract, §8 scenario 3).
        let first_half = vec![0xAAu8; part_size as usize];
        let second_half = vec![0xBBu8; part_size as usize];

        let mut writer_a = Transport::open(config.clone(), &path, OpenMode::write_only())?;
        let mut writer_b = Transport::open(config.clone(), &path, OpenMode::write_only())?;
        writer_b.seek(SeekFrom::Start(part_size))?;

        writer_a.write(&first_half)?;
        writer_b.write(&second_half)?;

        writer_a.close()?;
        writer_b.close()?;

        // Exactly one of the two independent handles drove the
        // completion of the shared multipart upload (§3 invariant 2).
        assert_ne!(writer_a.is_last_file_to_close(), writer_b.is_last_file_to_close());

        let mut reader = Transport::open(config, &path, OpenMode::read_only())?;
        let mut downloaded = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            downloaded.extend_from_slice(&buf[..n]);
        }
        reader.close()?;

        let mut expected = first_half;
        expected.extend_from_slice(&second_half);
        assert_eq!(downloaded, expected);
        Ok(())
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_shared_memory_is_reinitialized() -> Result<(), Box<dyn Error>> {
    common::log_init("integration_transport");
    execute_in_docker!((|| async {
        let bucket = common::generate_unique_name();
        common::create_client_and_bucket(&bucket).await?;

        let key = "reused-key-after-timeout";
        let path = format!("/{bucket}/{key}");

        // A shared-memory timeout of 0 means any pre-existing record for
        // this key is immediately considered stale and reinitialized on
        // the next open (§4.4 "find-or-construct").
        let config = config_for(&[("S3_SHARED_MEMORY_TIMEOUT_SECONDS", "0")]);

        let mut first = Transport::open(config.clone(), &path, OpenMode::write_truncate())?;
        first.write(b"first open")?;
        first.close()?;

        let mut second = Transport::open(config, &path, OpenMode::write_truncate())?;
        second.write(b"second open after staleness window")?;
        second.close()?;
        Ok(())
    }))
}
