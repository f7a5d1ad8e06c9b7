use std::future::Future;
use std::time::Duration;

/// Linear backoff: `base`, `2 × base`, `3 × base`, ... after each failed attempt.
pub fn linear_backoff(base: Duration) -> impl Fn(u32) -> Duration {
    move |attempt| base.saturating_mul(attempt)
}

/// Runs `operation` up to `max_attempts` times, sleeping `delay(attempt)`
/// between failures. Returns the last error when every attempt fails.
pub async fn retry_with_backoff<T, E, Op, Fut, D>(
    label: &str,
    max_attempts: u32,
    delay: D,
    mut operation: Op,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    D: Fn(u32) -> Duration,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if attempt < max_attempts => {
                let wait = delay(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(error) => {
                tracing::error!(
                    operation = label,
                    attempt,
                    error = %error,
                    "Giving up after final attempt"
                );
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::{linear_backoff, retry_with_backoff};

    #[test]
    fn linear_backoff_grows_with_attempt() {
        let delay = linear_backoff(Duration::from_millis(500));
        assert_eq!(delay(1), Duration::from_millis(500));
        assert_eq!(delay(2), Duration::from_millis(1000));
        assert_eq!(delay(3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff("test", 3, |_| Duration::ZERO, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("boom".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn returns_last_error_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            retry_with_backoff("test", 3, |_| Duration::ZERO, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("failure {attempt}")) }
            })
            .await;
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _: Result<(), String> = retry_with_backoff("test", 0, |_| Duration::ZERO, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
