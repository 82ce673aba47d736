//! MD5-based entity tags for single and multipart objects.

use md5::{Digest, Md5};

/// Compute the raw MD5 digest of `data`.
pub fn compute_md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Quoted single-part entity tag, e.g. `"5d41402abc4b2a76b9719d911017c592"`.
pub fn etag_for(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(compute_md5(data)))
}

/// Multipart entity tag: MD5 over the concatenated part digests, suffixed
/// with the part count. Part tags that are not hex digests are skipped.
pub fn multipart_etag(part_etags: &[String]) -> String {
    let mut hasher = Md5::new();
    for etag in part_etags {
        let trimmed = etag.trim_matches('"');
        let hex_part = trimmed.split('-').next().unwrap_or(trimmed);
        if let Ok(bytes) = hex::decode(hex_part) {
            hasher.update(&bytes);
        }
    }
    let digest: [u8; 16] = hasher.finalize().into();
    format!("\"{}-{}\"", hex::encode(digest), part_etags.len())
}
