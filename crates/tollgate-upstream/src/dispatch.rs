use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tollgate_store::{Provider, UpstreamEndpoint};

use crate::{DispatchError, UpstreamRegistry};

/// Value produced by the attempt that succeeded
#[derive(Debug)]
pub struct Dispatched<T> {
    pub upstream: UpstreamEndpoint,
    /// Zero-based index of the winning attempt
    pub attempt: u32,
    pub value: T,
}

/// Terminal failure after the attempt loop stopped
#[derive(Debug)]
pub struct DispatchFailure {
    pub error: DispatchError,
    /// Endpoint of the last attempt, if one was selected
    pub upstream_id: Option<i64>,
    pub attempts: u32,
}

/// Selects endpoints and retries environment failures on other endpoints
///
/// Each failed attempt is reported to the caller's observer before the next
/// selection, and its endpoint joins the exclusion set. Non-retryable errors
/// stop the loop immediately.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<UpstreamRegistry>,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(registry: Arc<UpstreamRegistry>, max_attempts: u32) -> Self {
        Self {
            registry,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn registry(&self) -> &UpstreamRegistry {
        &self.registry
    }

    pub async fn dispatch<T, F, Fut, O>(
        &self,
        provider: Provider,
        mut on_failure: O,
        mut call: F,
    ) -> Result<Dispatched<T>, DispatchFailure>
    where
        F: FnMut(UpstreamEndpoint) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
        O: FnMut(u32, Option<i64>, &DispatchError),
    {
        let mut excluded = HashSet::new();
        let mut attempt = 0;

        loop {
            let (upstream_id, result) = match self.registry.select(provider, &excluded) {
                Ok(upstream) => {
                    let id = upstream.id;
                    tracing::debug!(%provider, upstream_id = id, attempt, "dispatching to upstream");
                    match call(upstream.clone()).await {
                        Ok(value) => {
                            return Ok(Dispatched {
                                upstream,
                                attempt,
                                value,
                            });
                        }
                        Err(e) => (Some(id), e),
                    }
                }
                Err(e) => (None, e),
            };

            tracing::warn!(
                %provider,
                upstream_id,
                attempt,
                error = %result,
                "upstream attempt failed"
            );
            on_failure(attempt, upstream_id, &result);

            attempt += 1;
            if !result.is_retryable() || attempt >= self.max_attempts {
                return Err(DispatchFailure {
                    error: result,
                    upstream_id,
                    attempts: attempt,
                });
            }

            if let Some(id) = upstream_id {
                excluded.insert(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::StatusCode;
    use secrecy::SecretString;

    use super::*;

    fn endpoint(id: i64) -> UpstreamEndpoint {
        UpstreamEndpoint {
            id,
            provider: Provider::OpenAi,
            base_url: format!("http://upstream-{id}"),
            api_key: SecretString::from("key"),
            weight: 1,
        }
    }

    fn dispatcher(ids: &[i64], max_attempts: u32) -> Dispatcher {
        let registry = UpstreamRegistry::from_endpoints(ids.iter().copied().map(endpoint));
        Dispatcher::new(Arc::new(registry), max_attempts)
    }

    #[tokio::test]
    async fn retries_connect_failures_on_other_endpoints() {
        let dispatcher = dispatcher(&[1, 2, 3], 3);
        let tried = Mutex::new(Vec::new());
        let mut failures = Vec::new();

        let result = dispatcher
            .dispatch(
                Provider::OpenAi,
                |attempt, id, _: &DispatchError| failures.push((attempt, id)),
                |upstream| {
                    let first = {
                        let mut tried = tried.lock().unwrap();
                        tried.push(upstream.id);
                        tried.len() == 1
                    };
                    async move {
                        if first {
                            Err(DispatchError::Connect("refused".to_owned()))
                        } else {
                            Ok(upstream.id)
                        }
                    }
                },
            )
            .await
            .unwrap();

        let tried = tried.into_inner().unwrap();
        assert_eq!(result.attempt, 1);
        assert_eq!(result.value, tried[1]);
        assert_ne!(tried[0], tried[1]);
        assert_eq!(failures, vec![(0, Some(tried[0]))]);
    }

    #[tokio::test]
    async fn stops_at_attempt_cap_without_reselecting() {
        let dispatcher = dispatcher(&[1, 2, 3, 4], 3);
        let tried = Mutex::new(Vec::new());

        let failure = dispatcher
            .dispatch(
                Provider::OpenAi,
                |_, _, _: &DispatchError| {},
                |upstream| {
                    tried.lock().unwrap().push(upstream.id);
                    async { Err::<(), _>(DispatchError::Timeout) }
                },
            )
            .await
            .unwrap_err();

        let mut tried = tried.into_inner().unwrap();
        assert_eq!(failure.attempts, 3);
        assert!(matches!(failure.error, DispatchError::Timeout));
        assert_eq!(tried.len(), 3);
        tried.sort_unstable();
        tried.dedup();
        assert_eq!(tried.len(), 3);
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        let dispatcher = dispatcher(&[1, 2], 3);
        let mut calls = 0;

        let failure = dispatcher
            .dispatch(
                Provider::OpenAi,
                |_, _, _: &DispatchError| {},
                |_| {
                    calls += 1;
                    async {
                        Err::<(), _>(DispatchError::UpstreamStatus {
                            status: StatusCode::BAD_REQUEST,
                            body: "bad".to_owned(),
                        })
                    }
                },
            )
            .await
            .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(failure.attempts, 1);
        assert!(failure.upstream_id.is_some());
    }

    #[tokio::test]
    async fn exhausted_pool_reports_no_available_upstream() {
        let dispatcher = dispatcher(&[1], 3);
        let mut failures = Vec::new();

        let failure = dispatcher
            .dispatch(
                Provider::OpenAi,
                |attempt, id, e: &DispatchError| failures.push((attempt, id, e.is_environment())),
                |_| async { Err::<(), _>(DispatchError::Connect("refused".to_owned())) },
            )
            .await
            .unwrap_err();

        assert!(matches!(failure.error, DispatchError::NoAvailableUpstream(Provider::OpenAi)));
        assert_eq!(failure.upstream_id, None);
        assert_eq!(failures, vec![(0, Some(1), true), (1, None, true), (2, None, true)]);
    }
}
