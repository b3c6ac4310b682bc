//! Directory-backed object store.
//!
//! Buckets are directories under a root, objects are files inside them, and
//! multipart sessions are staging directories under `<root>/.multipart/`.
//! Status codes follow the S3 conventions the transfer engine expects
//! (404 for missing buckets, keys and sessions, 416 for ranges past the end).

mod keys;
mod session;
mod store;

pub use keys::{KeyError, validate_bucket_name, validate_object_key};
pub use store::LocalStore;

/// Directory holding multipart staging sessions.
pub const MULTIPART_DIR: &str = ".multipart";

/// Directory holding per-object metadata sidecars.
pub const META_DIR: &str = ".meta";
