use super::ProviderError;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Polls for the outcome of an approval-gated call.
///
/// "Not found yet" keeps the loop going; any other error ends it. Nothing
/// fires after the token is cancelled or the budget runs out.
#[derive(Debug, Clone)]
pub struct ResultPoller {
    grace: Duration,
    interval: Duration,
    deadline: Instant,
    cancel: CancellationToken,
}

impl ResultPoller {
    pub fn new(grace: Duration, interval: Duration, budget: Duration, cancel: CancellationToken) -> Self {
        Self::until(grace, interval, Instant::now() + budget, cancel)
    }

    pub fn until(grace: Duration, interval: Duration, deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            grace,
            interval,
            deadline,
            cancel,
        }
    }

    pub async fn run<F, Fut>(&self, request_id: u64, mut fetch: F) -> Result<Value, ProviderError>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<Value, ProviderError>>,
    {
        let work = async {
            sleep(self.grace).await;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match fetch(request_id).await {
                    Ok(value) => return Ok(value),
                    Err(err) if err.is_transient() => {
                        debug!(request_id, attempt, "Result not ready");
                    }
                    Err(err) => return Err(err),
                }
                sleep(self.interval).await;
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProviderError::Cancelled),
            outcome = timeout_at(self.deadline, work) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ProviderError::RequestTimeout(format!(
                    "no decision for request {request_id}"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use walletbridge_types::{RpcErrorKind, RpcErrorObject};

    fn not_found() -> ProviderError {
        RpcErrorObject::new(RpcErrorKind::ResultNotFound, "Result not found").into()
    }

    fn poller(budget: Duration, cancel: CancellationToken) -> ResultPoller {
        ResultPoller::new(Duration::from_secs(1), Duration::from_millis(500), budget, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_polling_until_result() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = poller(Duration::from_secs(30), CancellationToken::new())
            .run(9, move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(not_found())
                    } else {
                        Ok(json!("0xhash"))
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), json!("0xhash"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = poller(Duration::from_secs(30), CancellationToken::new())
            .run(9, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<Value, _>(ProviderError::from(RpcErrorObject::new(
                        RpcErrorKind::UserRejected,
                        "User rejected the request",
                    )))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RpcErrorKind::UserRejected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_never_resolved() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();
        let err = poller(Duration::from_secs(30), CancellationToken::new())
            .run(9, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<Value, _>(not_found()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::RequestTimeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        // 1s grace then one attempt every 500ms
        let attempts = calls.load(Ordering::SeqCst);
        assert!((57..=59).contains(&attempts), "{attempts}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_poll() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let p = poller(Duration::from_secs(30), cancel.clone());

        let handle = tokio::spawn(async move {
            p.run(9, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<Value, _>(not_found()) }
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), Err(ProviderError::Cancelled)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
