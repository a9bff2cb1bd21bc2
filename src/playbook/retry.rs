//! Error classification and retry planning
//!
//! Failure messages are matched against a prioritized table of named
//! regex patterns. Each pattern carries an error category and a retry
//! profile; the planner turns a failure into a retry decision with a
//! jittered delay. A per `(step, category)` circuit breaker suppresses
//! retries after repeated failures, and named recovery handlers can run
//! side effects (token refresh, disk cleanup) before the retry delay.

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker failure threshold
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
/// Circuit breaker reset timeout
const BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(300);
/// Fallback delay for unknown errors
const UNKNOWN_ERROR_DELAY: f64 = 5.0;
/// Fallback retry ceiling for unknown errors
const UNKNOWN_ERROR_MAX_RETRIES: u32 = 2;

/// Error categories for intelligent handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connectivity problems
    Network,
    /// Operation timed out
    Timeout,
    /// Credentials invalid or expired
    Authentication,
    /// Permission denied
    Authorization,
    /// Input or schema rejected
    Validation,
    /// Disk, memory or similar exhaustion
    Resource,
    /// Downstream service unavailable
    Dependency,
    /// Misconfiguration
    Configuration,
    /// Transient failure, safe to retry
    Temporary,
    /// Will not succeed on retry
    Permanent,
    /// Unclassified
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Validation => "validation",
            Self::Resource => "resource",
            Self::Dependency => "dependency",
            Self::Configuration => "configuration",
            Self::Temporary => "temporary",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Retry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// base × multiplier^attempt, capped
    ExponentialBackoff,
    /// base × (attempt + 1)
    LinearBackoff,
    /// Constant base delay
    FixedDelay,
    /// Retry with no delay
    Immediate,
    /// Do not retry
    NoRetry,
}

/// Named pattern mapping error text to a category and retry profile
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    /// Pattern name, stable across the table
    pub name: String,
    /// Category assigned on match
    pub category: ErrorCategory,
    /// Compiled case-insensitive regexes
    pub patterns: Vec<Regex>,
    /// Retry strategy
    pub strategy: RetryStrategy,
    /// Retry ceiling
    pub max_retries: u32,
    /// Base delay in seconds
    pub base_delay: f64,
    /// Delay ceiling in seconds
    pub max_delay: f64,
    /// Exponential growth factor
    pub backoff_multiplier: f64,
    /// Apply ±10% jitter
    pub jitter: bool,
    /// Named recovery handler invoked before the delay
    pub custom_handler: Option<String>,
}

impl ErrorPattern {
    fn new(
        name: &str,
        category: ErrorCategory,
        patterns: &[&str],
        strategy: RetryStrategy,
        max_retries: u32,
        base_delay: f64,
        max_delay: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            category,
            patterns: patterns
                .iter()
                .filter_map(|p| Regex::new(&format!("(?i){}", p)).ok())
                .collect(),
            strategy,
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter: true,
            custom_handler: None,
        }
    }

    fn with_handler(mut self, handler: &str) -> Self {
        self.custom_handler = Some(handler.to_string());
        self
    }

    fn matches(&self, message: &str) -> bool {
        self.patterns.iter().any(|r| r.is_match(message))
    }
}

/// Context handed to the planner for one failure
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Failing step
    pub step_id: String,
    /// Owning run
    pub run_id: String,
    /// Failure message
    pub error_message: String,
    /// Zero-based attempt number
    pub attempt_number: u32,
}

/// Decision about whether and how to retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDecision {
    /// Whether another attempt should happen
    pub should_retry: bool,
    /// Delay before the next attempt
    pub delay_seconds: f64,
    /// Strategy that produced the decision
    pub strategy: RetryStrategy,
    /// Human-readable reason
    pub reason: String,
    /// Whether the retry ceiling was hit
    pub max_attempts_reached: bool,
    /// Classified category
    pub category: ErrorCategory,
}

/// Recovery hook invoked before a retry delay
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Attempt recovery for the failed step
    async fn recover(&self, error: &ErrorContext) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug)]
struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
        }
    }

    fn is_open(&mut self) -> bool {
        if self.state == BreakerState::Open {
            if let Some(last) = self.last_failure {
                if last.elapsed() > BREAKER_RESET_TIMEOUT {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    return false;
                }
            }
            return true;
        }
        false
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.failure_count >= BREAKER_FAILURE_THRESHOLD {
            self.state = BreakerState::Open;
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
struct ErrorStats {
    total_errors: u64,
    recovered_after_retry: u64,
    recent_errors: Vec<RecentError>,
}

#[derive(Debug, Clone, Serialize)]
struct RecentError {
    message: String,
    attempt: u32,
}

/// Classifies failures and plans retries
pub struct ErrorClassifier {
    patterns: RwLock<Vec<ErrorPattern>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    stats: Mutex<HashMap<String, ErrorStats>>,
    handlers: tokio::sync::RwLock<HashMap<String, std::sync::Arc<dyn RecoveryHandler>>>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Create a classifier with the built-in pattern table
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(default_patterns()),
            breakers: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            handlers: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Append a custom pattern to the table
    pub fn add_pattern(&self, pattern: ErrorPattern) {
        self.patterns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(pattern);
    }

    /// Register a named recovery handler
    pub async fn add_handler(&self, name: &str, handler: std::sync::Arc<dyn RecoveryHandler>) {
        self.handlers
            .write()
            .await
            .insert(name.to_string(), handler);
    }

    /// Classify a failure message into a category
    pub fn classify(&self, message: &str) -> ErrorCategory {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        patterns
            .iter()
            .find(|p| p.matches(message))
            .map(|p| p.category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    /// Handle one failure and decide whether to retry
    pub async fn decide(&self, error: &ErrorContext) -> RetryDecision {
        let matched = {
            let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
            patterns
                .iter()
                .find(|p| p.matches(&error.error_message))
                .cloned()
        };
        let category = matched
            .as_ref()
            .map(|p| p.category)
            .unwrap_or(ErrorCategory::Unknown);

        self.update_stats(error, category);

        // Circuit breaker check before anything else, then record the failure
        let breaker_key = format!("{}:{}", error.step_id, category);
        {
            let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            let breaker = breakers
                .entry(breaker_key.clone())
                .or_insert_with(CircuitBreaker::new);
            if breaker.is_open() {
                return RetryDecision {
                    should_retry: false,
                    delay_seconds: 0.0,
                    strategy: RetryStrategy::NoRetry,
                    reason: "Circuit breaker open".to_string(),
                    max_attempts_reached: false,
                    category,
                };
            }
            breaker.record_failure();
            if breaker.state == BreakerState::Open {
                warn!("Circuit breaker opened for {}", breaker_key);
            }
        }

        let Some(pattern) = matched else {
            return self.decide_unknown(error);
        };

        if error.attempt_number >= pattern.max_retries {
            return RetryDecision {
                should_retry: false,
                delay_seconds: 0.0,
                strategy: pattern.strategy,
                reason: format!("Max retries ({}) reached", pattern.max_retries),
                max_attempts_reached: true,
                category,
            };
        }

        if let Some(handler_name) = &pattern.custom_handler {
            self.run_handler(handler_name, error).await;
        }

        let delay = compute_delay(&pattern, error.attempt_number);

        RetryDecision {
            should_retry: pattern.strategy != RetryStrategy::NoRetry,
            delay_seconds: delay,
            strategy: pattern.strategy,
            reason: format!(
                "Retry attempt {}/{}",
                error.attempt_number + 1,
                pattern.max_retries
            ),
            max_attempts_reached: false,
            category,
        }
    }

    /// Reset circuit breakers for a step after a successful attempt and
    /// credit recorded errors as recovered
    pub fn record_success(&self, step_id: &str) {
        let prefix = format!("{}:", step_id);
        {
            let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            breakers.retain(|key, _| !key.starts_with(&prefix));
        }
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        for (key, entry) in stats.iter_mut() {
            if key.starts_with(&prefix) && entry.total_errors > entry.recovered_after_retry {
                entry.recovered_after_retry += 1;
            }
        }
    }

    /// Snapshot of accumulated error statistics
    pub fn statistics(&self) -> serde_json::Value {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::to_value(&*stats).unwrap_or(serde_json::Value::Null)
    }

    fn decide_unknown(&self, error: &ErrorContext) -> RetryDecision {
        if error.attempt_number < UNKNOWN_ERROR_MAX_RETRIES {
            RetryDecision {
                should_retry: true,
                delay_seconds: UNKNOWN_ERROR_DELAY,
                strategy: RetryStrategy::ExponentialBackoff,
                reason: "Unknown error - conservative retry".to_string(),
                max_attempts_reached: false,
                category: ErrorCategory::Unknown,
            }
        } else {
            RetryDecision {
                should_retry: false,
                delay_seconds: 0.0,
                strategy: RetryStrategy::NoRetry,
                reason: "Unknown error - max conservative retries reached".to_string(),
                max_attempts_reached: true,
                category: ErrorCategory::Unknown,
            }
        }
    }

    async fn run_handler(&self, name: &str, error: &ErrorContext) {
        let handler = self.handlers.read().await.get(name).cloned();
        match handler {
            Some(handler) => {
                info!("Running recovery handler '{}' for step {}", name, error.step_id);
                if let Err(e) = handler.recover(error).await {
                    warn!("Recovery handler '{}' failed: {}", name, e);
                }
            }
            None => warn!("Recovery handler '{}' not registered", name),
        }
    }

    fn update_stats(&self, error: &ErrorContext, category: ErrorCategory) {
        let key = format!("{}:{}", error.step_id, category);
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let entry = stats.entry(key).or_default();
        entry.total_errors += 1;
        entry.recent_errors.push(RecentError {
            message: error.error_message.clone(),
            attempt: error.attempt_number,
        });
        if entry.recent_errors.len() > 10 {
            let excess = entry.recent_errors.len() - 10;
            entry.recent_errors.drain(..excess);
        }
    }
}

/// Compute the delay for an attempt, with jitter where configured
fn compute_delay(pattern: &ErrorPattern, attempt: u32) -> f64 {
    let raw = match pattern.strategy {
        RetryStrategy::NoRetry | RetryStrategy::Immediate => return 0.0,
        RetryStrategy::FixedDelay => pattern.base_delay,
        RetryStrategy::LinearBackoff => pattern.base_delay * (attempt + 1) as f64,
        RetryStrategy::ExponentialBackoff => {
            pattern.base_delay * pattern.backoff_multiplier.powi(attempt as i32)
        }
    };
    let capped = raw.min(pattern.max_delay);

    if pattern.jitter && capped > 0.0 {
        let jitter = capped * 0.1;
        let delta = rand::thread_rng().gen_range(-jitter..=jitter);
        (capped + delta).max(0.0)
    } else {
        capped
    }
}

/// Built-in pattern table. Order matters: earlier entries win.
fn default_patterns() -> Vec<ErrorPattern> {
    vec![
        // Network errors
        ErrorPattern::new(
            "connection_timeout",
            ErrorCategory::Network,
            &[
                r"connection.*timeout",
                r"timeout.*connection",
                r"read.*timeout",
                r"connect.*timeout",
            ],
            RetryStrategy::ExponentialBackoff,
            5,
            2.0,
            30.0,
        ),
        ErrorPattern::new(
            "connection_refused",
            ErrorCategory::Network,
            &[
                r"connection.*refused",
                r"refused.*connection",
                r"no route to host",
                r"network.*unreachable",
            ],
            RetryStrategy::ExponentialBackoff,
            3,
            5.0,
            60.0,
        ),
        ErrorPattern::new(
            "dns_resolution",
            ErrorCategory::Network,
            &[
                r"name.*not.*resolved",
                r"dns.*resolution.*failed",
                r"hostname.*not.*found",
                r"nodename.*nor.*servname",
            ],
            RetryStrategy::LinearBackoff,
            3,
            10.0,
            60.0,
        ),
        // HTTP errors
        ErrorPattern::new(
            "http_5xx",
            ErrorCategory::Temporary,
            &[
                r"http.*5\d\d",
                r"internal.*server.*error",
                r"bad.*gateway",
                r"service.*unavailable",
                r"gateway.*timeout",
            ],
            RetryStrategy::ExponentialBackoff,
            4,
            1.0,
            16.0,
        ),
        ErrorPattern::new(
            "http_429",
            ErrorCategory::Temporary,
            &[r"http.*429", r"too.*many.*requests", r"rate.*limit.*exceeded"],
            RetryStrategy::ExponentialBackoff,
            5,
            5.0,
            120.0,
        ),
        ErrorPattern::new(
            "http_4xx_client",
            ErrorCategory::Permanent,
            &[
                r"http.*40[0-3]",
                r"http.*40[5-9]",
                r"bad.*request",
                r"unauthorized",
                r"forbidden",
                r"not.*found",
                r"method.*not.*allowed",
            ],
            RetryStrategy::NoRetry,
            0,
            0.0,
            0.0,
        ),
        // Authentication / authorization
        ErrorPattern::new(
            "auth_token_expired",
            ErrorCategory::Authentication,
            &[
                r"token.*expired",
                r"expired.*token",
                r"authentication.*expired",
                r"session.*expired",
            ],
            RetryStrategy::Immediate,
            2,
            0.0,
            0.0,
        )
        .with_handler("refresh_auth_token"),
        ErrorPattern::new(
            "permission_denied",
            ErrorCategory::Authorization,
            &[
                r"permission.*denied",
                r"access.*denied",
                r"insufficient.*privileges",
                r"unauthorized.*access",
            ],
            RetryStrategy::NoRetry,
            0,
            0.0,
            0.0,
        ),
        // Resource errors
        ErrorPattern::new(
            "disk_full",
            ErrorCategory::Resource,
            &[
                r"no.*space.*left",
                r"disk.*full",
                r"insufficient.*disk.*space",
                r"device.*full",
            ],
            RetryStrategy::LinearBackoff,
            2,
            30.0,
            120.0,
        )
        .with_handler("cleanup_disk_space"),
        ErrorPattern::new(
            "memory_exhausted",
            ErrorCategory::Resource,
            &[
                r"out.*of.*memory",
                r"memory.*exhausted",
                r"cannot.*allocate.*memory",
                r"insufficient.*memory",
            ],
            RetryStrategy::LinearBackoff,
            2,
            60.0,
            180.0,
        )
        .with_handler("free_memory"),
        // Service / dependency errors
        ErrorPattern::new(
            "service_unavailable",
            ErrorCategory::Dependency,
            &[
                r"service.*unavailable",
                r"service.*down",
                r"service.*not.*running",
                r"dependency.*unavailable",
            ],
            RetryStrategy::ExponentialBackoff,
            5,
            10.0,
            300.0,
        ),
        // Configuration errors
        ErrorPattern::new(
            "config_invalid",
            ErrorCategory::Configuration,
            &[
                r"invalid.*configuration",
                r"configuration.*error",
                r"config.*not.*found",
                r"malformed.*config",
            ],
            RetryStrategy::NoRetry,
            0,
            0.0,
            0.0,
        ),
        // Validation errors
        ErrorPattern::new(
            "validation_failed",
            ErrorCategory::Validation,
            &[
                r"validation.*failed",
                r"invalid.*input",
                r"schema.*validation",
                r"parameter.*invalid",
            ],
            RetryStrategy::NoRetry,
            0,
            0.0,
            0.0,
        ),
        // Temporary system errors
        ErrorPattern::new(
            "temporary_failure",
            ErrorCategory::Temporary,
            &[
                r"temporary.*failure",
                r"try.*again.*later",
                r"system.*busy",
                r"resource.*temporarily.*unavailable",
            ],
            RetryStrategy::ExponentialBackoff,
            3,
            5.0,
            60.0,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(step: &str, message: &str, attempt: u32) -> ErrorContext {
        ErrorContext {
            step_id: step.to_string(),
            run_id: "run".to_string(),
            error_message: message.to_string(),
            attempt_number: attempt,
        }
    }

    #[test]
    fn test_classification() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("Connection timeout after 30s"),
            ErrorCategory::Network
        );
        assert_eq!(
            classifier.classify("HTTP 503 Service Unavailable"),
            ErrorCategory::Temporary
        );
        assert_eq!(
            classifier.classify("request returned HTTP 403 Forbidden"),
            ErrorCategory::Permanent
        );
        assert_eq!(
            classifier.classify("Validation failed: status_code"),
            ErrorCategory::Validation
        );
        assert_eq!(classifier.classify("wat"), ErrorCategory::Unknown);
    }

    #[tokio::test]
    async fn test_no_retry_for_permanent_errors() {
        let classifier = ErrorClassifier::new();
        let decision = classifier.decide(&error("s1", "HTTP 403 Forbidden", 0)).await;
        assert!(!decision.should_retry);
        assert_eq!(decision.category, ErrorCategory::Permanent);
    }

    #[tokio::test]
    async fn test_exponential_delay_window() {
        let pattern = ErrorPattern::new(
            "t",
            ErrorCategory::Temporary,
            &["x"],
            RetryStrategy::ExponentialBackoff,
            5,
            1.0,
            16.0,
        );
        for attempt in 0..5u32 {
            let expected = (1.0f64 * 2.0f64.powi(attempt as i32)).min(16.0);
            for _ in 0..20 {
                let delay = compute_delay(&pattern, attempt);
                assert!(
                    delay >= expected * 0.9 - 1e-9 && delay <= expected * 1.1 + 1e-9,
                    "delay {} outside window for attempt {}",
                    delay,
                    attempt
                );
            }
        }
    }

    #[tokio::test]
    async fn test_linear_delay() {
        let mut pattern = ErrorPattern::new(
            "t",
            ErrorCategory::Resource,
            &["x"],
            RetryStrategy::LinearBackoff,
            3,
            10.0,
            60.0,
        );
        pattern.jitter = false;
        assert_eq!(compute_delay(&pattern, 0), 10.0);
        assert_eq!(compute_delay(&pattern, 2), 30.0);
    }

    #[tokio::test]
    async fn test_max_retries_reached() {
        let classifier = ErrorClassifier::new();
        let decision = classifier
            .decide(&error("s1", "connection timeout", 5))
            .await;
        assert!(!decision.should_retry);
        assert!(decision.max_attempts_reached);
    }

    #[tokio::test]
    async fn test_unknown_error_conservative_retry() {
        let classifier = ErrorClassifier::new();
        let decision = classifier.decide(&error("s1", "mystery failure", 0)).await;
        assert!(decision.should_retry);
        assert_eq!(decision.delay_seconds, 5.0);

        let decision = classifier.decide(&error("s1", "mystery failure", 2)).await;
        assert!(!decision.should_retry);
        assert!(decision.max_attempts_reached);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_threshold() {
        let classifier = ErrorClassifier::new();
        // Five failures open the breaker; the sixth decision is refused
        for _ in 0..5 {
            let d = classifier.decide(&error("s1", "connection timeout", 0)).await;
            assert_ne!(d.reason, "Circuit breaker open");
        }
        let decision = classifier.decide(&error("s1", "connection timeout", 0)).await;
        assert!(!decision.should_retry);
        assert_eq!(decision.reason, "Circuit breaker open");

        // Success resets the breaker
        classifier.record_success("s1");
        let decision = classifier.decide(&error("s1", "connection timeout", 0)).await;
        assert!(decision.should_retry);
    }

    #[tokio::test]
    async fn test_breaker_is_per_step() {
        let classifier = ErrorClassifier::new();
        for _ in 0..6 {
            classifier.decide(&error("s1", "connection timeout", 0)).await;
        }
        let decision = classifier.decide(&error("s2", "connection timeout", 0)).await;
        assert!(decision.should_retry);
    }

    #[tokio::test]
    async fn test_recovery_handler_invoked() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        struct Counter(AtomicU32);

        #[async_trait]
        impl RecoveryHandler for Counter {
            async fn recover(&self, _error: &ErrorContext) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let classifier = ErrorClassifier::new();
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        classifier
            .add_handler("refresh_auth_token", counter.clone())
            .await;

        classifier.decide(&error("s1", "token expired", 0)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
