use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lowercase base58-like alphabet, with ambiguous characters (`0`, `o`, `1`, `l`) dropped
/// so job ids are easy to read aloud and don't get confused with GPU indices.
const ID_ALPHABET: &[u8] = b"23456789abcdefghijkmnpqrstuvwxyz";
pub const ID_LEN: usize = 6;

/// Generates a random candidate id. Uniqueness against existing jobs is the caller's
/// responsibility (see `Store::generate_job_id`).
pub fn random_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| {
            let idx = rng.random_range(0..ID_ALPHABET.len());
            ID_ALPHABET[idx] as char
        })
        .collect()
}

/// Seconds since the Unix epoch, as a float (matches the data model's timestamp fields).
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Turns a relative path into a filesystem-safe flattened string, used for the
/// well-known `/tmp/nexus-{id}-<flattened>` output file destination.
pub fn flatten_path(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
