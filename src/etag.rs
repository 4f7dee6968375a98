//! Entity tags for resources that are not given one by the caller.
//!
//! A strong tag fingerprints the exact bytes of an entity and is safe to
//! compare against `If-Range`. A weak tag only reflects a resource's size and
//! modification time, so [`negotiate`](crate::negotiate) never honours a range
//! on the strength of one.

use std::time::UNIX_EPOCH;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::ResourceDescriptor;

/// Length of the base64 digest prefix kept in a tag.
const HASH_LEN: usize = 27;

fn fingerprint(data: &[u8]) -> String {
    let mut hash = STANDARD.encode(Sha256::digest(data));
    hash.truncate(HASH_LEN);
    hash
}

/// Strong tag for an in-memory entity: `"<length in hex>-<digest>"`.
pub fn calculate(entity: &[u8]) -> String {
    format!("\"{:x}-{}\"", entity.len(), fingerprint(entity))
}

/// Weak tag derived from the size and modification time of a resource, or
/// `None` when the modification time is unknown.
pub fn calculate_weak(descriptor: &ResourceDescriptor) -> Option<String> {
    let mtime = descriptor.mtime?;
    let millis = match mtime.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i128,
        Err(before) => -(before.duration().as_millis() as i128),
    };
    let hash = fingerprint(millis.to_string().as_bytes());
    Some(format!("W/\"{:x}-{}\"", descriptor.size, hash))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use axum::http::HeaderValue;

    use super::{calculate, calculate_weak};
    use crate::{IfRange, ResourceDescriptor};

    #[test]
    fn test_empty_entity() {
        assert_eq!("\"0-47DEQpj8HBSa+/TImW+5JCeuQeR\"", calculate(b""));
    }

    #[test]
    fn test_strong_tag_shape() {
        let tag = calculate(b"Hello world this is a file to test range requests on!\n");
        assert!(tag.starts_with("\"36-"));
        assert!(tag.ends_with('"'));
        assert_eq!(4 + 27 + 1, tag.len());
        assert_eq!(tag, calculate(b"Hello world this is a file to test range requests on!\n"));
        assert_ne!(tag, calculate(b"Hello world this is a file to test range requests on?\n"));

        let parsed = IfRange::parse(&HeaderValue::from_str(&tag).unwrap());
        assert_eq!(IfRange::Strong(tag), parsed);
    }

    #[test]
    fn test_weak_tag() {
        assert_eq!(None, calculate_weak(&ResourceDescriptor::new(54)));

        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let descriptor = ResourceDescriptor::new(1024).with_mtime(mtime);
        let tag = calculate_weak(&descriptor).unwrap();
        assert!(tag.starts_with("W/\"400-"));

        let touched = descriptor.with_mtime(mtime + Duration::from_millis(1));
        assert_ne!(Some(tag.clone()), calculate_weak(&touched));

        let parsed = IfRange::parse(&HeaderValue::from_str(&tag).unwrap());
        assert_eq!(IfRange::Weak(tag[2..].to_string()), parsed);
    }
}
