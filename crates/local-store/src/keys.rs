use std::path::{Component, Path};

/// Why a bucket name or object key was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("empty name")]
    Empty,

    #[error("absolute path not allowed: {0}")]
    Absolute(String),

    #[error("parent directory traversal not allowed: {0}")]
    Traversal(String),

    #[error("path prefix not allowed: {0}")]
    Prefix(String),

    #[error("key must name a file: {0}")]
    Directory(String),

    #[error("invalid bucket name: {0}")]
    Bucket(String),
}

/// Validates that an object key stays inside its bucket directory.
///
/// Rejects:
/// - Empty keys and keys ending in `/`
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_object_key(key: &str) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if key.ends_with('/') || key.ends_with('\\') {
        return Err(KeyError::Directory(key.to_string()));
    }

    let path = Path::new(key);
    if path.is_absolute() {
        return Err(KeyError::Absolute(key.to_string()));
    }

    let mut named = false;
    for component in path.components() {
        match component {
            Component::ParentDir => return Err(KeyError::Traversal(key.to_string())),
            Component::Prefix(_) => return Err(KeyError::Prefix(key.to_string())),
            Component::RootDir => return Err(KeyError::Absolute(key.to_string())),
            Component::CurDir => {}
            Component::Normal(_) => named = true,
        }
    }
    if !named {
        return Err(KeyError::Directory(key.to_string()));
    }
    Ok(())
}

/// Bucket names are single, non-hidden path components.
pub fn validate_bucket_name(bucket: &str) -> Result<(), KeyError> {
    if bucket.is_empty() {
        return Err(KeyError::Empty);
    }
    if bucket.starts_with('.') || bucket.contains(['/', '\\', ':']) {
        return Err(KeyError::Bucket(bucket.to_string()));
    }
    Ok(())
}
