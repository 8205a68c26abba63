use std::sync::Arc;
use std::time::Duration;

use super::methods::{build_methods, FetchMethod};
use super::parser::normalize;
use super::types::{FetchError, FetchReport, MethodFailure, Strategy};
use crate::config::FetchConfig;
use crate::storage::ParsedItem;

/// Retrieves a source's latest items through an ordered chain of methods.
///
/// Every failure of an individual method, including a timeout, is caught
/// here and folded into a typed [`FetchError`].
#[derive(Clone)]
pub struct SourceFetcher {
    methods: Vec<Arc<dyn FetchMethod>>,
    method_timeout: Duration,
}

impl SourceFetcher {
    /// Fetcher with every configured method, sharing one HTTP client.
    pub fn new(config: &FetchConfig, client: reqwest::Client) -> Self {
        Self::with_methods(
            build_methods(config, &client),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Fetcher over an explicit method list; `auto` tries them in list order.
    pub fn with_methods(methods: Vec<Arc<dyn FetchMethod>>, method_timeout: Duration) -> Self {
        Self {
            methods,
            method_timeout,
        }
    }

    /// Fetch up to `limit` normalized items for `identifier`.
    ///
    /// A concrete `strategy` runs only its own method, and that method's
    /// failure is the result. `Auto` walks the method list until one returns
    /// at least one usable item; earlier failures are kept in
    /// [`FetchReport::attempts`].
    ///
    /// # Errors
    ///
    /// - `UnsupportedStrategy` if no method is registered for `strategy`
    /// - the single method's error for a concrete strategy
    /// - `AllMethodsExhausted` with every attempt when `Auto` finds nothing
    pub async fn fetch(
        &self,
        identifier: &str,
        strategy: Strategy,
        limit: usize,
    ) -> Result<FetchReport, FetchError> {
        let limit = limit.max(1);

        if strategy != Strategy::Auto {
            let method = self
                .methods
                .iter()
                .find(|m| m.strategy() == strategy)
                .ok_or_else(|| FetchError::UnsupportedStrategy(strategy.to_string()))?;
            let items = self.attempt(method.as_ref(), identifier, limit).await?;
            return Ok(FetchReport {
                items,
                strategy,
                attempts: Vec::new(),
            });
        }

        let mut attempts = Vec::new();
        for method in &self.methods {
            match self.attempt(method.as_ref(), identifier, limit).await {
                Ok(items) => {
                    if !attempts.is_empty() {
                        tracing::info!(
                            identifier = %identifier,
                            strategy = %method.strategy(),
                            failed_before = attempts.len(),
                            "Fetch succeeded after fallback"
                        );
                    }
                    return Ok(FetchReport {
                        items,
                        strategy: method.strategy(),
                        attempts,
                    });
                }
                Err(error) => attempts.push(MethodFailure {
                    strategy: method.strategy(),
                    error,
                }),
            }
        }

        Err(FetchError::AllMethodsExhausted(attempts))
    }

    /// Whether `identifier` currently yields at least one item.
    ///
    /// Used at registration; a `false` result does not block it.
    pub async fn validate(&self, identifier: &str, strategy: Strategy) -> bool {
        match self.fetch(identifier, strategy, 1).await {
            Ok(_) => true,
            Err(e) => {
                tracing::info!(identifier = %identifier, strategy = %strategy, error = %e, "Source validation failed");
                false
            }
        }
    }

    /// Run one method under the per-method timeout and normalize its output.
    async fn attempt(
        &self,
        method: &dyn FetchMethod,
        identifier: &str,
        limit: usize,
    ) -> Result<Vec<ParsedItem>, FetchError> {
        let strategy = method.strategy();
        let raw = tokio::time::timeout(self.method_timeout, method.fetch(identifier, limit))
            .await
            .map_err(|_| FetchError::Timeout(self.method_timeout.as_secs()))
            .and_then(|result| result);

        let items = match raw {
            Ok(raw) => normalize(raw, limit),
            Err(e) => {
                tracing::debug!(identifier = %identifier, strategy = %strategy, error = %e, "Fetch method failed");
                return Err(e);
            }
        };

        if items.is_empty() {
            tracing::debug!(identifier = %identifier, strategy = %strategy, "Fetch method returned no usable items");
            return Err(FetchError::EmptyResult);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FetchErrorKind;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Method with a scripted outcome, counting its invocations.
    struct Scripted {
        strategy: Strategy,
        outcome: Outcome,
        calls: AtomicUsize,
    }

    #[derive(Clone)]
    enum Outcome {
        Items(usize),
        Fail(fn() -> FetchError),
        Hang,
        Panic,
    }

    impl Scripted {
        fn new(strategy: Strategy, outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                strategy,
                outcome,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FetchMethod for Scripted {
        fn strategy(&self) -> Strategy {
            self.strategy
        }

        async fn fetch(&self, _identifier: &str, _limit: usize) -> Result<Vec<ParsedItem>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Outcome::Items(n) => Ok((0..*n)
                    .map(|i| ParsedItem {
                        title: format!("{} item {}", self.strategy, i),
                        link: format!("https://mp.example.com/{}/{}", self.strategy, i),
                        summary: String::new(),
                        author: String::new(),
                        publish_time: None,
                    })
                    .collect()),
                Outcome::Fail(make) => Err(make()),
                Outcome::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Outcome::Panic => panic!("method exploded"),
            }
        }
    }

    fn fetcher(methods: Vec<Arc<Scripted>>) -> SourceFetcher {
        SourceFetcher::with_methods(
            methods.into_iter().map(|m| m as Arc<dyn FetchMethod>).collect(),
            Duration::from_secs(20),
        )
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_second_method() {
        let first = Scripted::new(Strategy::Mirror, Outcome::Fail(|| FetchError::HttpStatus(502)));
        let second = Scripted::new(Strategy::Rsshub, Outcome::Items(3));
        let third = Scripted::new(Strategy::Search, Outcome::Items(7));
        let fetcher = fetcher(vec![first.clone(), second.clone(), third.clone()]);

        let report = fetcher.fetch("poetry-weekly", Strategy::Auto, 10).await.unwrap();

        assert_eq!(report.items.len(), 3);
        assert_eq!(report.strategy, Strategy::Rsshub);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].strategy, Strategy::Mirror);
        assert!(matches!(report.attempts[0].error, FetchError::HttpStatus(502)));
        assert_eq!(third.calls(), 0);
    }

    #[tokio::test]
    async fn test_auto_treats_empty_as_failure() {
        let empty = Scripted::new(Strategy::Mirror, Outcome::Items(0));
        let full = Scripted::new(Strategy::Feed, Outcome::Items(2));
        let fetcher = fetcher(vec![empty, full]);

        let report = fetcher.fetch("x", Strategy::Auto, 10).await.unwrap();
        assert_eq!(report.strategy, Strategy::Feed);
        assert!(matches!(report.attempts[0].error, FetchError::EmptyResult));
    }

    #[tokio::test]
    async fn test_auto_all_methods_exhausted() {
        let fetcher = fetcher(vec![
            Scripted::new(Strategy::Mirror, Outcome::Fail(|| FetchError::Network("reset".into()))),
            Scripted::new(Strategy::Rsshub, Outcome::Fail(|| FetchError::Parse("bad xml".into()))),
            Scripted::new(Strategy::Search, Outcome::Items(0)),
        ]);

        let err = fetcher.fetch("x", Strategy::Auto, 10).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::AllMethodsExhausted);
        match err {
            FetchError::AllMethodsExhausted(attempts) => {
                let kinds: Vec<_> = attempts.iter().map(|a| a.error.kind()).collect();
                assert_eq!(
                    kinds,
                    vec![
                        FetchErrorKind::Network,
                        FetchErrorKind::Parse,
                        FetchErrorKind::EmptyResult
                    ]
                );
            }
            e => panic!("Expected AllMethodsExhausted, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_single_strategy_does_not_fall_back() {
        let mirror = Scripted::new(Strategy::Mirror, Outcome::Fail(|| FetchError::HttpStatus(404)));
        let rsshub = Scripted::new(Strategy::Rsshub, Outcome::Items(3));
        let fetcher = fetcher(vec![mirror.clone(), rsshub.clone()]);

        let err = fetcher.fetch("x", Strategy::Mirror, 10).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
        assert_eq!(rsshub.calls(), 0);

        let report = fetcher.fetch("x", Strategy::Rsshub, 10).await.unwrap();
        assert_eq!(report.strategy, Strategy::Rsshub);
        assert!(report.attempts.is_empty());
        assert_eq!(mirror.calls(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_strategy_is_unsupported() {
        let fetcher = fetcher(vec![Scripted::new(Strategy::Mirror, Outcome::Items(1))]);
        let err = fetcher.fetch("x", Strategy::Search, 10).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::UnsupportedStrategy);
    }

    #[tokio::test]
    async fn test_limit_truncates_items() {
        let fetcher = fetcher(vec![Scripted::new(Strategy::Mirror, Outcome::Items(8))]);
        let report = fetcher.fetch("x", Strategy::Auto, 5).await.unwrap();
        assert_eq!(report.items.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_method_failure() {
        let slow = Scripted::new(Strategy::Mirror, Outcome::Hang);
        let fast = Scripted::new(Strategy::Search, Outcome::Items(2));
        let fetcher = fetcher(vec![slow, fast]);

        let report = fetcher.fetch("x", Strategy::Auto, 10).await.unwrap();
        assert_eq!(report.strategy, Strategy::Search);
        assert!(matches!(report.attempts[0].error, FetchError::Timeout(20)));
    }

    #[tokio::test]
    async fn test_validate() {
        let fetcher = fetcher(vec![
            Scripted::new(Strategy::Mirror, Outcome::Items(1)),
            Scripted::new(Strategy::Search, Outcome::Fail(|| FetchError::EmptyResult)),
        ]);
        assert!(fetcher.validate("x", Strategy::Auto).await);
        assert!(!fetcher.validate("x", Strategy::Search).await);
    }

    #[tokio::test]
    #[should_panic(expected = "method exploded")]
    async fn test_method_panic_propagates_to_caller() {
        // Panics are contained one level up, per source, by the orchestrator
        let fetcher = fetcher(vec![Scripted::new(Strategy::Mirror, Outcome::Panic)]);
        let _ = fetcher.fetch("x", Strategy::Auto, 10).await;
    }
}
