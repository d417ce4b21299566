//! Process-scoped S3 client caching (§6B).
//!
//! `rusoto_s3::S3Client` has no global init/teardown of its own (unlike
//! libs3's curl handles), so there is nothing to reference-count for
//! correctness. The underlying C storage driver this protocol descends
//! from paired a global init counter with its own curl handle setup;
//! here the equivalent guarantee — build the client once per process,
//! reuse it everywhere — comes from a `Mutex<HashMap>` cache keyed by
//! the connection parameters that actually select a distinct client
//! (endpoint, region, https).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use rusoto_core::{HttpClient, Region};
use rusoto_credential::StaticProvider;
use rusoto_s3::S3Client;

use crate::config::Config;
use crate::error::{Result, TransportError};

#[derive(Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    hostname: String,
    region_name: String,
    use_https: bool,
}

fn client_cache() -> &'static Mutex<HashMap<ClientKey, Arc<S3Client>>> {
    static CACHE: OnceLock<Mutex<HashMap<ClientKey, Arc<S3Client>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns a process-wide, cached `S3Client` for `(hostname, region_name,
/// use_https)`, constructing one on first use. Gives an "initialize once
/// per process" guarantee without needing an explicit teardown call,
/// since `S3Client` owns no process-global state.
pub fn client_for(config: &Config, hostname: &str) -> Result<Arc<S3Client>> {
    let key = ClientKey {
        hostname: hostname.to_string(),
        region_name: config.region_name.clone(),
        use_https: config.use_https,
    };

    let mut cache = client_cache().lock().expect("s3 client cache poisoned");
    if let Some(existing) = cache.get(&key) {
        return Ok(existing.clone());
    }

    let scheme = if config.use_https { "https" } else { "http" };
    let endpoint = format!("{scheme}://{hostname}");
    let region = Region::Custom {
        name: config.region_name.clone(),
        endpoint,
    };

    let http_client = HttpClient::new()
        .map_err(|e| TransportError::S3Init(format!("constructing http client: {e}")))?;

    let client = match &config.credentials {
        Some(creds) => {
            let provider = StaticProvider::new_minimal(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
            );
            S3Client::new_with(http_client, provider, region)
        }
        None => S3Client::new(region),
    };

    let client = Arc::new(client);
    cache.insert(key, client.clone());
    Ok(client)
}

/// Number of distinct clients currently cached for this process. Exposed
/// only so tests can assert that repeated `client_for` calls with the same
/// key reuse a single client rather than constructing a fresh one.
#[cfg(test)]
pub fn cached_client_count() -> usize {
    client_cache().lock().unwrap().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn test_config(hostname_suffix: &str) -> Config {
        let mut params = StdHashMap::new();
        params.insert(
            "S3_DEFAULT_HOSTNAME".to_string(),
            format!("process-init-test-{hostname_suffix}.example.com"),
        );
        Config::from_params(&params).unwrap()
    }

    #[test]
    fn reuses_client_for_same_key() {
        let config = test_config("a");
        let before = cached_client_count();
        let c1 = client_for(&config, &config.hostnames[0]).unwrap();
        let c2 = client_for(&config, &config.hostnames[0]).unwrap();
        assert_eq!(cached_client_count(), before + 1);
        assert!(Arc::ptr_eq(&c1, &c2));
    }

    #[test]
    fn distinct_hostnames_get_distinct_clients() {
        let config = test_config("b");
        let before = cached_client_count();
        let _c1 = client_for(&config, "process-init-test-b-1.example.com").unwrap();
        let _c2 = client_for(&config, "process-init-test-b-2.example.com").unwrap();
        assert_eq!(cached_client_count(), before + 2);
    }
}
