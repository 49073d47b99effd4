pub mod client;
pub mod protocol;

/// Env var that overrides the control socket location.
pub const SOCKET_ENV: &str = "NATSCHAT_SOCKET";
