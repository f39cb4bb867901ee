use std::time::Duration;
use tokio::time::{sleep, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `condition` until it holds, panicking after five seconds.
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("condition not met within {:?}", WAIT_TIMEOUT);
        }
        sleep(WAIT_INTERVAL).await;
    }
}
