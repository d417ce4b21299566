//! Configuration recognized by the transport (§6's option table).
//!
//! This is a set of resource-plugin context parameters that normally
//! arrive as environment variables, kept as a typed struct with
//! documented defaults that reads from `std::env` (or any caller-supplied
//! key/value map, for tests).

use std::collections::HashMap;
use std::env;
use std::fs;
use std::time::Duration;

use crate::error::{Result, TransportError};

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_MIN_PART_SIZE: u64 = 5 * 1024 * 1024; // S3 requires >= 5MiB per non-final part
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 5 * 1024 * 1024 * 1024; // 5 GiB
pub const MAX_S3_PART_COUNT: usize = 10_000;
pub const DEFAULT_MPU_THREADS: usize = 10;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_WAIT_TIME_SECONDS: u64 = 2;
pub const DEFAULT_MAX_WAIT_TIME_SECONDS: u64 = 30;
pub const DEFAULT_CIRCULAR_BUFFER_TIMEOUT_SECONDS: u64 = 180;
pub const DEFAULT_NON_DATA_TRANSFER_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_SHARED_MEMORY_TIMEOUT_SECONDS: u64 = 900;
pub const POST_CLOSE_HEAD_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const POST_CLOSE_HEAD_RETRY_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningStyle {
    Amz,
    Date,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriStyle {
    Path,
    VirtualHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorationTier {
    Standard,
    Bulk,
    Expedited,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Everything the transport needs to know about one bucket/region/retry
/// policy. One instance is shared (cheaply cloned) by every `Transport`
/// opened by this process for this resource.
#[derive(Debug, Clone)]
pub struct Config {
    pub hostnames: Vec<String>,
    pub credentials: Option<Credentials>,
    pub region_name: String,
    pub use_https: bool,
    pub signing_style: SigningStyle,
    pub uri_style: UriStyle,

    pub minimum_part_size: u64,
    pub maximum_part_size: u64,
    pub max_upload_size: u64,
    pub number_of_client_transfer_threads: usize,
    pub number_of_cache_transfer_threads: usize,
    pub enable_mpu: bool,
    pub enable_md5: bool,
    pub server_side_encryption: bool,

    pub retry_count_limit: u32,
    pub wait_time_seconds: u64,
    pub max_wait_time_seconds: u64,

    pub circular_buffer_size: u64,
    pub circular_buffer_timeout_seconds: u64,
    pub non_data_transfer_timeout_seconds: u64,

    pub cache_dir: String,
    pub resource_name: String,

    pub shared_memory_timeout_seconds: u64,

    pub restoration_days: u32,
    pub restoration_tier: RestorationTier,

    /// Caller's promise that writes will arrive sequentially, partitioned
    /// by offset, across `number_of_client_transfer_threads` writers
    /// (§4.1.1, §9 "put-repl flag").
    pub put_repl_flag: bool,

    /// Object size known ahead of open (`-1`/`None` if unknown).
    pub object_size: Option<u64>,
}

impl Config {
    /// Reads configuration the way the resource plugin would hand it to us:
    /// a flat key/value map of context parameters. Falls back to `std::env`
    /// for any key that is absent from `params`, which is how production
    /// callers are expected to invoke this (`from_env` below is the common
    /// case).
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| -> Option<String> {
            params
                .get(key)
                .cloned()
                .or_else(|| env::var(key).ok())
                .filter(|v| !v.is_empty())
        };

        let hostnames = get("S3_DEFAULT_HOSTNAME")
            .unwrap_or_else(|| "s3.amazonaws.com".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let credentials = Self::load_credentials(&get)?;

        let region_name = get("S3_REGIONNAME").unwrap_or_else(|| DEFAULT_REGION.to_string());

        let use_https = match get("S3_PROTO").as_deref() {
            Some("http") => false,
            _ => true,
        };

        let signing_style = match get("S3_STSDATE").as_deref() {
            Some("date") => SigningStyle::Date,
            Some("both") => SigningStyle::Both,
            _ => SigningStyle::Amz,
        };

        let uri_style = match get("S3_URI_REQUEST_STYLE").as_deref() {
            Some("virtual") | Some("host") | Some("virtualhost") => UriStyle::VirtualHost,
            _ => UriStyle::Path,
        };

        let minimum_part_size = DEFAULT_MIN_PART_SIZE;

        let max_upload_size_mib: u64 = get("S3_MAX_UPLOAD_SIZE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_SIZE / (1024 * 1024));
        let max_upload_size = max_upload_size_mib * 1024 * 1024;

        // S3_MPU_CHUNK is clamped to [minimum_part_size, max_upload_size]
        // (spec.md: "5 <= x <= max upload"), mirroring `s3GetMPUChunksize`
        // clamping against `s3GetMaxUploadSizeMB`.
        let mpu_chunk_mib: u64 = get("S3_MPU_CHUNK")
            .and_then(|v| v.parse().ok())
            .unwrap_or(minimum_part_size / (1024 * 1024));
        let maximum_part_size = (mpu_chunk_mib * 1024 * 1024).max(minimum_part_size).min(max_upload_size);

        let number_of_client_transfer_threads = get("S3_MPU_THREADS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MPU_THREADS)
            .clamp(1, 100);
        let number_of_cache_transfer_threads = number_of_client_transfer_threads;

        let enable_mpu = get("S3_ENABLE_MPU")
            .map(|v| v != "0")
            .unwrap_or(true);
        let enable_md5 = get("S3_ENABLE_MD5").map(|v| v == "1").unwrap_or(false);
        let server_side_encryption = get("S3_SERVER_ENCRYPT").map(|v| v == "1").unwrap_or(false);

        let retry_count_limit = get("S3_RETRY_COUNT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RETRY_COUNT);
        let wait_time_seconds = get("S3_WAIT_TIME_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WAIT_TIME_SECONDS);
        let max_wait_time_seconds = get("S3_MAX_WAIT_TIME_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_WAIT_TIME_SECONDS);

        let circular_buffer_size = get("CIRCULAR_BUFFER_SIZE")
            .and_then(|v| v.parse::<u64>().ok())
            .map(|multiple| (multiple.max(2)) * minimum_part_size)
            .unwrap_or(2 * minimum_part_size);
        let circular_buffer_timeout_seconds = get("CIRCULAR_BUFFER_TIMEOUT_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CIRCULAR_BUFFER_TIMEOUT_SECONDS);
        let non_data_transfer_timeout_seconds = get("S3_NON_DATA_TRANSFER_TIMEOUT_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_NON_DATA_TRANSFER_TIMEOUT_SECONDS);

        let cache_dir = get("S3_CACHE_DIR").unwrap_or_else(|| "/var/lib/irods/s3_cache".to_string());
        let resource_name = get("RESOURCE_NAME").unwrap_or_else(|| "s3_resc".to_string());

        let shared_memory_timeout_seconds = get("S3_SHARED_MEMORY_TIMEOUT_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SHARED_MEMORY_TIMEOUT_SECONDS);

        let restoration_days = get("S3_RESTORATION_DAYS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let restoration_tier = match get("S3_RESTORATION_TIER").as_deref() {
            Some("Bulk") => RestorationTier::Bulk,
            Some("Expedited") => RestorationTier::Expedited,
            _ => RestorationTier::Standard,
        };

        let put_repl_flag = get("S3_PUT_REPL_FLAG").map(|v| v == "1").unwrap_or(false);
        let object_size = get("S3_OBJECT_SIZE").and_then(|v| v.parse().ok());

        Ok(Config {
            hostnames,
            credentials,
            region_name,
            use_https,
            signing_style,
            uri_style,
            minimum_part_size,
            maximum_part_size,
            max_upload_size,
            number_of_client_transfer_threads,
            number_of_cache_transfer_threads,
            enable_mpu,
            enable_md5,
            server_side_encryption,
            retry_count_limit,
            wait_time_seconds,
            max_wait_time_seconds,
            circular_buffer_size,
            circular_buffer_timeout_seconds,
            non_data_transfer_timeout_seconds,
            cache_dir,
            resource_name,
            shared_memory_timeout_seconds,
            restoration_days,
            restoration_tier,
            put_repl_flag,
            object_size,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_params(&HashMap::new())
    }

    /// `S3_ACCESS_KEY_ID`/`S3_SECRET_ACCESS_KEY` from the environment, else
    /// the two-line `S3_AUTH_FILE` (access key, secret key, one per line).
    fn load_credentials(
        get: &impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Credentials>> {
        if let (Some(access_key_id), Some(secret_access_key)) =
            (get("S3_ACCESS_KEY_ID"), get("S3_SECRET_ACCESS_KEY"))
        {
            return Ok(Some(Credentials {
                access_key_id,
                secret_access_key,
            }));
        }

        if let Some(path) = get("S3_AUTH_FILE") {
            let contents = fs::read_to_string(&path)
                .map_err(|e| TransportError::Config(format!("reading {path}: {e}")))?;
            let mut lines = contents.lines();
            let access_key_id = lines
                .next()
                .ok_or_else(|| TransportError::Config(format!("{path} is missing the access key line")))?
                .trim()
                .to_string();
            let secret_access_key = lines
                .next()
                .ok_or_else(|| TransportError::Config(format!("{path} is missing the secret key line")))?
                .trim()
                .to_string();
            return Ok(Some(Credentials {
                access_key_id,
                secret_access_key,
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_spec_compliant() {
        let cfg = Config::from_params(&HashMap::new()).unwrap();
        assert_eq!(cfg.region_name, "us-east-1");
        assert_eq!(cfg.minimum_part_size, 5 * 1024 * 1024);
        assert_eq!(cfg.number_of_client_transfer_threads, 10);
        assert_eq!(cfg.retry_count_limit, 3);
        assert!(cfg.use_https);
        assert_eq!(cfg.uri_style, UriStyle::Path);
    }

    #[test]
    fn parses_hostname_list() {
        let mut params = HashMap::new();
        params.insert(
            "S3_DEFAULT_HOSTNAME".to_string(),
            "a.example.com, b.example.com,c.example.com".to_string(),
        );
        let cfg = Config::from_params(&params).unwrap();
        assert_eq!(
            cfg.hostnames,
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
    }

    #[test]
    fn circular_buffer_size_is_multiple_of_min_part_size() {
        let mut params = HashMap::new();
        params.insert("CIRCULAR_BUFFER_SIZE".to_string(), "4".to_string());
        let cfg = Config::from_params(&params).unwrap();
        assert_eq!(cfg.circular_buffer_size, 4 * DEFAULT_MIN_PART_SIZE);
    }

    #[test]
    fn mpu_threads_are_clamped() {
        let mut params = HashMap::new();
        params.insert("S3_MPU_THREADS".to_string(), "500".to_string());
        let cfg = Config::from_params(&params).unwrap();
        assert_eq!(cfg.number_of_client_transfer_threads, 100);
    }

    #[test]
    fn mpu_chunk_is_clamped_to_max_upload_size() {
        let mut params = HashMap::new();
        params.insert("S3_MAX_UPLOAD_SIZE".to_string(), "10".to_string()); // 10 MiB
        params.insert("S3_MPU_CHUNK".to_string(), "200".to_string()); // 200 MiB, over the cap
        let cfg = Config::from_params(&params).unwrap();
        assert_eq!(cfg.max_upload_size, 10 * 1024 * 1024);
        assert_eq!(cfg.maximum_part_size, 10 * 1024 * 1024);
    }

    #[test]
    fn mpu_chunk_below_minimum_is_raised_to_minimum() {
        let mut params = HashMap::new();
        params.insert("S3_MPU_CHUNK".to_string(), "1".to_string()); // 1 MiB, under the 5 MiB floor
        let cfg = Config::from_params(&params).unwrap();
        assert_eq!(cfg.maximum_part_size, DEFAULT_MIN_PART_SIZE);
    }
}
