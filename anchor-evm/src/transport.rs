use std::{future::Future, time::Duration};

use anyhow::{anyhow, Result};
use tracing::warn;

/// Run `primary` bounded by `timeout`. If it fails or times out, run `fallback` once and return
/// its result. `fallback` is never run after a successful primary.
pub async fn with_raw_fallback<T, P, F, Fut>(
    operation: &'static str,
    primary: P,
    timeout: Duration,
    fallback: F,
) -> Result<T>
where
    P: Future<Output = Result<T>>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let reason = match tokio::time::timeout(timeout, primary).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(err)) => err,
        Err(_) => anyhow!("timed out after {timeout:?}"),
    };
    warn!(operation, %reason, "primary rpc call failed, using raw json-rpc");
    fallback()
        .await
        .map_err(|err| err.context(format!("{operation} failed on both paths: {reason}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    #[test(tokio::test)]
    async fn success_skips_fallback() {
        let calls = AtomicUsize::new(0);
        let value = with_raw_fallback(
            "block_number",
            async { Ok(7u64) },
            Duration::from_secs(1),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(8u64)
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test(tokio::test)]
    async fn error_runs_fallback_once() {
        let calls = AtomicUsize::new(0);
        let value = with_raw_fallback(
            "block_number",
            async { Err(anyhow!("deserialization error")) },
            Duration::from_secs(1),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(8u64)
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn timeout_runs_fallback_once() {
        tokio::time::pause();
        let calls = AtomicUsize::new(0);
        let value = with_raw_fallback(
            "gas_price",
            std::future::pending::<Result<u64>>(),
            Duration::from_secs(10),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(9u64)
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn both_failing_keeps_both_reasons() {
        let err = with_raw_fallback(
            "logs",
            async { Err::<u64, _>(anyhow!("bad primary")) },
            Duration::from_secs(1),
            || async { Err(anyhow!("bad raw")) },
        )
        .await
        .unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("bad primary"), "{text}");
        assert!(text.contains("bad raw"), "{text}");
    }
}
