//! Source and destination paths of `cp`.

use std::path::PathBuf;

use anyhow::bail;

pub const SCHEME: &str = "obs://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    /// `key` may be empty or end in `/`, naming a prefix.
    Remote { bucket: String, key: String },
}

impl Location {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let Some(rest) = raw.strip_prefix(SCHEME) else {
            if raw.is_empty() {
                bail!("empty path");
            }
            return Ok(Self::Local(PathBuf::from(raw)));
        };
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            bail!("missing bucket in {raw}");
        }
        Ok(Self::Remote {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

/// Whether `key` names a prefix rather than a single object.
pub fn is_prefix(key: &str) -> bool {
    key.is_empty() || key.ends_with('/')
}

/// Last path segment of an object key.
pub fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Joins a relative object name below a prefix.
pub fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if prefix.ends_with('/') {
        format!("{prefix}{name}")
    } else {
        format!("{prefix}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_paths() {
        assert_eq!(
            Location::parse("obs://bucket/dir/file.bin").unwrap(),
            Location::Remote {
                bucket: "bucket".into(),
                key: "dir/file.bin".into()
            }
        );
        assert_eq!(
            Location::parse("obs://bucket").unwrap(),
            Location::Remote {
                bucket: "bucket".into(),
                key: String::new()
            }
        );
        assert!(Location::parse("obs:///key").is_err());
    }

    #[test]
    fn parses_local_paths() {
        assert_eq!(
            Location::parse("./data/file.bin").unwrap(),
            Location::Local(PathBuf::from("./data/file.bin"))
        );
        assert!(Location::parse("").is_err());
    }

    #[test]
    fn key_helpers() {
        assert!(is_prefix(""));
        assert!(is_prefix("logs/"));
        assert!(!is_prefix("logs/a.txt"));
        assert_eq!(basename("logs/2024/a.txt"), "a.txt");
        assert_eq!(basename("a.txt"), "a.txt");
        assert_eq!(join_key("", "a.txt"), "a.txt");
        assert_eq!(join_key("logs", "a.txt"), "logs/a.txt");
        assert_eq!(join_key("logs/", "a.txt"), "logs/a.txt");
    }
}
