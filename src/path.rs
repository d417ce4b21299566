//! Object URI parsing (§6: "logical path `/<bucket>/<key...>`").

use crate::error::{Result, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    pub bucket: String,
    pub key: String,
}

/// Splits `path` at the first `/` after any leading slash. `path` must
/// contain at least one `/` after the leading slash or this fails with
/// [`TransportError::InvalidFilePath`].
pub fn parse_object_path(path: &str) -> Result<ObjectUri> {
    let trimmed = path.trim_start_matches('/');
    let mut parts = trimmed.splitn(2, '/');
    let bucket = parts.next().filter(|s| !s.is_empty());
    let key = parts.next().filter(|s| !s.is_empty());

    match (bucket, key) {
        (Some(bucket), Some(key)) => Ok(ObjectUri {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }),
        _ => Err(TransportError::InvalidFilePath(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_leading_slash_bucket_and_key() {
        let uri = parse_object_path("/my-bucket/a/b/c.txt").unwrap();
        assert_eq!(uri.bucket, "my-bucket");
        assert_eq!(uri.key, "a/b/c.txt");
    }

    #[test]
    fn accepts_without_leading_slash() {
        let uri = parse_object_path("my-bucket/key").unwrap();
        assert_eq!(uri.bucket, "my-bucket");
        assert_eq!(uri.key, "key");
    }

    #[test]
    fn rejects_missing_key() {
        assert!(parse_object_path("/my-bucket").is_err());
        assert!(parse_object_path("/my-bucket/").is_err());
        assert!(parse_object_path("").is_err());
    }
}
