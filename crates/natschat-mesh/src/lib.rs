pub mod broker;
pub mod crypto;
pub mod envelope;
pub mod identity;
pub mod profile_dir;

/// Current time as unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
