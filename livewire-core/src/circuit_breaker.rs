use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub call_timeout: Duration,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            call_timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error("circuit open for {0}")]
    Open(String),
    #[error("call to {0} timed out")]
    Timeout(String),
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

/// Fails fast on a collaborator that keeps failing, then probes it again
/// after `reset_timeout`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open(self.name.clone()));
        }

        match timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.record_failure();
                Err(BreakerError::Timeout(self.name.clone()))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
                if cooled {
                    tracing::info!(breaker = %self.name, "Circuit half-open, probing");
                    inner.state = BreakerState::HalfOpen;
                    inner.successes = 0;
                }
                cooled
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    tracing::info!(breaker = %self.name, "Circuit closed");
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                }
            }
            _ => inner.failures = 0,
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures += 1;
        let trip = match inner.state {
            BreakerState::Closed => inner.failures >= self.config.failure_threshold,
            BreakerState::HalfOpen | BreakerState::Open => true,
        };
        if trip {
            if inner.state != BreakerState::Open {
                tracing::warn!(breaker = %self.name, failures = inner.failures, "Circuit opened");
            }
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.successes = 0;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }
}

/// One breaker per collaborator name, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn states(&self) -> HashMap<String, BreakerState> {
        self.breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            call_timeout: Duration::from_millis(50),
            reset_timeout: Duration::from_millis(30),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("webhook", quick());
        assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner("boom"))));
        assert_eq!(breaker.state(), BreakerState::Closed);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let result = breaker.call(|| async { Ok::<_, &str>(1) }).await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new("predictor", quick());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = breaker.call(|| async { Ok::<_, &str>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn slow_call_counts_as_failure() {
        let breaker = CircuitBreaker::new("slow", quick());
        let result = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout(_))));
    }

    #[test]
    fn registry_reuses_breakers() {
        let registry = CircuitBreakerRegistry::new(quick());
        let a = registry.get_or_create("email");
        let b = registry.get_or_create("email");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.states()["email"], BreakerState::Closed);
    }
}
