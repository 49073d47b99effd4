pub mod client;
pub mod daemon;

use std::future::Future;
use std::time::Duration;

/// Default bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `check` until it returns true, or give up after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("natschat_node=debug,natschat_mesh=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
