//! Rotating endpoint hostname list (§6, §9B).
//!
//! The original picks a random starting index once per transport instance
//! and round-robins from there on every operation
//! (`s3_transport_util.hpp`). We reproduce that rather than picking a fresh
//! random hostname per request, since the point is to spread load across a
//! fixed set of endpoints evenly over the life of one transport, not to
//! re-randomize per call.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

pub struct HostnameRotation {
    hosts: Vec<String>,
    next: AtomicUsize,
}

impl HostnameRotation {
    pub fn new(hosts: Vec<String>) -> Self {
        assert!(!hosts.is_empty(), "hostname list must not be empty");
        let start = rand::thread_rng().gen_range(0..hosts.len());
        Self {
            hosts,
            next: AtomicUsize::new(start),
        }
    }

    /// Returns the next hostname in the rotation.
    pub fn next_hostname(&self) -> &str {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        &self.hosts[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_host_always_returned() {
        let rot = HostnameRotation::new(vec!["only.example.com".to_string()]);
        for _ in 0..5 {
            assert_eq!(rot.next_hostname(), "only.example.com");
        }
    }

    #[test]
    fn rotation_cycles_through_all_hosts() {
        let hosts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let rot = HostnameRotation::new(hosts.clone());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..hosts.len() {
            seen.insert(rot.next_hostname().to_string());
        }
        assert_eq!(seen.len(), hosts.len());
    }
}
