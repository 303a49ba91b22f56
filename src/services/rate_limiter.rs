//! RL: dual sliding-window rate limiter with a Retry-After barrier (spec §2 RL,
//! §4.1 step 5, §4.2 steps 2/6).
//!
//! Every outbound call to the metadata provider or fetch library is expected
//! to route through [`RateLimiter::acquire`]. The algorithm mirrors the
//! Python original's `RedisRateLimiter` exactly (burst window + sustained
//! window + a shared Retry-After barrier), but is written against an async
//! [`RateLimiterBackend`] trait so it can run against Redis in production and
//! an in-memory fake in tests, following the teacher's `RateLimitingService`
//! shape (`src/services/rate_limiting.rs`).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::error::{AppError, Result};

/// Storage operations the rate limiter needs. Backed by Redis sorted sets in
/// production; an in-memory fake in tests.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    async fn zremrangebyscore(&self, key: &str, max_score: f64) -> Result<()>;
    async fn zcount(&self, key: &str, min_score: f64, max_score: f64) -> Result<i64>;
    async fn zcard(&self, key: &str) -> Result<i64>;
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    /// Score of the lowest-scored member, if any.
    async fn zrange_oldest_score(&self, key: &str) -> Result<Option<f64>>;
    async fn get_f64(&self, key: &str) -> Result<Option<f64>>;
    async fn set_f64_with_expiry(&self, key: &str, value: f64, expire_seconds: u64) -> Result<()>;
    async fn delete(&self, keys: &[String]) -> Result<()>;
}

/// Tunables for one rate limiter instance (spec §9: burst B per second,
/// sustained N per window W, default N=90/W=30s, B=10).
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub key_prefix: String,
    pub max_requests_per_window: i64,
    pub window_size_seconds: f64,
    pub max_requests_per_second: i64,
    pub per_second_window: f64,
    pub retry_attempts: u32,
    pub base_delay_seconds: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "api_rate_limit".to_string(),
            max_requests_per_window: 90,
            window_size_seconds: 30.0,
            max_requests_per_second: 10,
            per_second_window: 1.0,
            retry_attempts: 3,
            base_delay_seconds: 1.0,
        }
    }
}

pub struct RateLimiter {
    backend: Arc<dyn RateLimiterBackend>,
    config: RateLimiterConfig,
    key_timestamps: String,
    key_retry_after_until: String,
}

/// Current sliding-window consumption, exposed for observability.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitUsage {
    pub current_requests_per_second: i64,
    pub max_requests_per_second: i64,
    pub current_requests_per_window: i64,
    pub max_requests_per_window: i64,
    pub window_size_seconds: f64,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimiterBackend>, config: RateLimiterConfig) -> Self {
        let key_timestamps = format!("{}:timestamps", config.key_prefix);
        let key_retry_after_until = format!("{}:retry_after_until", config.key_prefix);
        Self {
            backend,
            config,
            key_timestamps,
            key_retry_after_until,
        }
    }

    /// Drop any state left behind by a previous process (spec: a fresh
    /// process should not inherit a stale barrier or window).
    pub async fn cleanup_on_startup(&self) -> Result<()> {
        self.backend
            .delete(&[self.key_timestamps.clone(), self.key_retry_after_until.clone()])
            .await
    }

    pub async fn current_usage(&self) -> Result<RateLimitUsage> {
        let now = now_secs();
        self.backend
            .zremrangebyscore(&self.key_timestamps, now - self.config.window_size_seconds)
            .await?;
        let current_requests_per_second = self
            .backend
            .zcount(&self.key_timestamps, now - self.config.per_second_window, now)
            .await?;
        let current_requests_per_window = self.backend.zcard(&self.key_timestamps).await?;
        Ok(RateLimitUsage {
            current_requests_per_second,
            max_requests_per_second: self.config.max_requests_per_second,
            current_requests_per_window,
            max_requests_per_window: self.config.max_requests_per_window,
            window_size_seconds: self.config.window_size_seconds,
        })
    }

    /// Block (yielding to the async runtime) until a permit is available,
    /// respecting any Retry-After barrier set by a prior 429, then the
    /// per-second burst limit, then the sustained window limit. Records the
    /// grant as a uniquely-keyed sorted-set member, matching the original's
    /// `f"{now}-{random.random()}"` scheme.
    pub async fn acquire(&self) -> Result<()> {
        for _attempt in 0..self.config.retry_attempts {
            if self.wait_out_retry_after().await? {
                continue;
            }

            let now = now_secs();
            self.backend
                .zremrangebyscore(&self.key_timestamps, now - self.config.window_size_seconds)
                .await?;
            let per_second = self
                .backend
                .zcount(&self.key_timestamps, now - self.config.per_second_window, now)
                .await?;
            let per_window = self.backend.zcard(&self.key_timestamps).await?;

            if self
                .wait_if_limit_reached(
                    per_second,
                    self.config.max_requests_per_second,
                    self.config.per_second_window,
                    "per-second",
                )
                .await?
            {
                continue;
            }
            if self
                .wait_if_limit_reached(
                    per_window,
                    self.config.max_requests_per_window,
                    self.config.window_size_seconds,
                    "window",
                )
                .await?
            {
                continue;
            }

            let now = now_secs();
            let member = format!("{now}-{}", rand::thread_rng().gen::<f64>());
            self.backend.zadd(&self.key_timestamps, &member, now).await?;
            return Ok(());
        }

        Err(AppError::RateLimited(
            "rate limit exceeded after multiple retries".to_string(),
        ))
    }

    async fn wait_out_retry_after(&self) -> Result<bool> {
        let retry_after_until = self
            .backend
            .get_f64(&self.key_retry_after_until)
            .await?
            .unwrap_or(0.0);
        let now = now_secs();
        if now < retry_after_until {
            let sleep_duration = retry_after_until - now;
            warn!(seconds = sleep_duration, "rate limiter: respecting retry-after barrier");
            tokio::time::sleep(std::time::Duration::from_secs_f64(sleep_duration.max(0.0))).await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn wait_if_limit_reached(
        &self,
        current: i64,
        max: i64,
        window: f64,
        limit_type: &str,
    ) -> Result<bool> {
        if current >= max {
            if let Some(oldest_score) = self.backend.zrange_oldest_score(&self.key_timestamps).await? {
                let now = now_secs();
                let time_to_wait = oldest_score + window - now;
                if time_to_wait > 0.0 {
                    warn!(
                        limit_type,
                        max, seconds = time_to_wait, "rate limiter: proactive limit reached"
                    );
                    tokio::time::sleep(std::time::Duration::from_secs_f64(time_to_wait)).await;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Record a 429's `Retry-After: k` barrier, or fall back to
    /// exponential backoff with jitter when the upstream error carries no
    /// explicit header (spec §9).
    pub async fn record_rate_limited(&self, retry_after_seconds: Option<u64>, attempt: u32) -> Result<()> {
        let until = match retry_after_seconds {
            Some(seconds) => {
                warn!(seconds, "rate limiter: respecting explicit retry-after");
                now_secs() + seconds as f64
            }
            None => {
                let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                let delay = self.config.base_delay_seconds * 2f64.powi(attempt as i32) + jitter;
                warn!(seconds = delay, "rate limiter: exponential backoff with jitter");
                now_secs() + delay
            }
        };
        self.backend
            .set_f64_with_expiry(
                &self.key_retry_after_until,
                until,
                (self.config.window_size_seconds + 60.0) as u64,
            )
            .await?;
        // Spec §4.3: "Clear the shared timestamp set (all workers have
        // effectively been paused)" so the barrier alone governs the next
        // permits instead of a stale window count compounding the wait.
        self.backend.delete(&[self.key_timestamps.clone()]).await
    }

    /// Parse an upstream error message for a `Retry-After: <seconds>` token
    /// the same way the original's decorator does via regex.
    pub fn parse_retry_after(message: &str) -> Option<u64> {
        let lower = message.to_lowercase();
        let idx = lower.find("retry-after:")?;
        let rest = &lower[idx + "retry-after:".len()..];
        let digits: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }

    /// Whether an error message looks like an upstream rate limit response.
    pub fn looks_rate_limited(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("429") || lower.contains("rate limit")
    }
}

/// Production backend: Redis sorted sets via a `deadpool-redis` pool,
/// grounded directly in the original's `ZREMRANGEBYSCORE`/`ZCOUNT`/`ZCARD`
/// pipeline.
pub struct RedisBackend {
    pool: deadpool_redis::Pool,
}

impl RedisBackend {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimiterBackend for RedisBackend {
    async fn zremrangebyscore(&self, key: &str, max_score: f64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(0)
            .arg(max_score)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zcount(&self, key: &str, min_score: f64, max_score: f64) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let count: i64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(min_score)
            .arg(max_score)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let count: i64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrange_oldest_score(&self, key: &str) -> Result<Option<f64>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(rows.into_iter().next().map(|(_, score)| score))
    }

    async fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    async fn set_f64_with_expiry(&self, key: &str, value: f64, expire_seconds: u64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value.to_string())
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(expire_seconds)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::InMemoryBackend;
    use super::*;

    fn limiter_with(config: RateLimiterConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryBackend::new()), config)
    }

    #[tokio::test]
    async fn acquire_succeeds_immediately_under_the_limit() {
        let limiter = limiter_with(RateLimiterConfig::default());
        limiter.acquire().await.unwrap();
        let usage = limiter.current_usage().await.unwrap();
        assert_eq!(usage.current_requests_per_window, 1);
    }

    #[tokio::test]
    async fn acquire_waits_out_the_burst_limit() {
        let config = RateLimiterConfig {
            max_requests_per_second: 1,
            max_requests_per_window: 90,
            retry_attempts: 2,
            ..RateLimiterConfig::default()
        };
        let limiter = limiter_with(config);
        limiter.acquire().await.unwrap();

        let start = std::time::Instant::now();
        limiter.acquire().await.unwrap();
        // Second call had to wait roughly one second for the burst window to clear.
        assert!(start.elapsed() >= std::time::Duration::from_millis(900));
    }

    #[tokio::test]
    async fn record_rate_limited_sets_explicit_barrier() {
        let limiter = limiter_with(RateLimiterConfig::default());
        limiter.record_rate_limited(Some(2), 0).await.unwrap();

        let start = std::time::Instant::now();
        limiter.acquire().await.unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(1800));
    }

    #[tokio::test]
    async fn record_rate_limited_clears_the_shared_timestamp_set() {
        // A window already at capacity would otherwise force an additional
        // proactive sleep on top of the barrier once it clears (spec §4.3:
        // "Clear the shared timestamp set ... so no spurious over-limit
        // sleeps occur afterward").
        let config = RateLimiterConfig {
            max_requests_per_second: 1,
            max_requests_per_window: 1,
            retry_attempts: 2,
            ..RateLimiterConfig::default()
        };
        let limiter = limiter_with(config);
        limiter.acquire().await.unwrap();

        limiter.record_rate_limited(Some(0), 0).await.unwrap();

        let usage = limiter.current_usage().await.unwrap();
        assert_eq!(usage.current_requests_per_window, 0);

        let start = std::time::Instant::now();
        limiter.acquire().await.unwrap();
        assert!(start.elapsed() < std::time::Duration::from_millis(500));
    }

    #[test]
    fn parses_retry_after_header_from_error_message() {
        assert_eq!(
            RateLimiter::parse_retry_after("upstream said Retry-After: 17 seconds"),
            Some(17)
        );
        assert_eq!(RateLimiter::parse_retry_after("no header here"), None);
    }

    #[test]
    fn recognizes_rate_limited_error_messages() {
        assert!(RateLimiter::looks_rate_limited("HTTP 429 Too Many Requests"));
        assert!(RateLimiter::looks_rate_limited("Rate limit exceeded"));
        assert!(!RateLimiter::looks_rate_limited("connection refused"));
    }
}
