use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Short public code for an attachment stored at `storage_path`.
///
/// Path digest, then random characters, then the clock in reverse digit order,
/// truncated or zero-padded to `length`.
pub fn short_code(storage_path: &str, length: usize) -> String {
    let digest = URL_SAFE_NO_PAD.encode(Sha256::digest(storage_path.as_bytes()));
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let clock: String = nanos.to_string().chars().rev().collect();

    let mut code: String = format!("{}{}{}", &digest[..8], random, clock)
        .chars()
        .take(length)
        .collect();
    while code.len() < length {
        code.push('0');
    }
    code
}
