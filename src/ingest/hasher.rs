//! Content fingerprints used for deduplication.

use super::mime::DecodedMessage;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of a message built from its decoded headers and bodies rather
/// than the raw bytes, so header reordering or re-folding does not change it.
pub fn message_fingerprint(message: &DecodedMessage) -> String {
    let projection = format!(
        "Subject:{}\nFrom:{}\nTo:{}\nDate:{}\nContent-Type:{}\nText:{}\nHTML:{}",
        message.subject,
        message.from_header,
        message.to_header,
        message.date_header,
        message.content_type,
        message.text_body,
        message.html_body,
    );
    hash_bytes(projection.as_bytes())
}
