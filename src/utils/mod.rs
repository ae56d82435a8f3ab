pub mod metrics;
pub mod validation;

use std::time::Duration;

/// Retries `operation` up to `max_retries` extra times, doubling the delay each time.
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    max_retries: usize,
    initial_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                tracing::warn!(
                    attempt,
                    error = %e,
                    "Operation failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}
