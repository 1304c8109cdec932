use rand::RngCore;
use rand::rngs::OsRng;

/// Current unix timestamp in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Generate a short random hex id, e.g. for sandbox name suffixes.
pub fn short_id() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate an opaque bearer token (32 random bytes, hex-encoded).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Quote a string for safe interpolation into `sh -c`.
///
/// Wraps in single quotes and escapes embedded single quotes with the
/// standard `'\''` dance.
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
