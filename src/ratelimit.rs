//! Sliding-window rate limiting for outbound provider calls.
//!
//! One shared limiter caps the combined request rate across every provider adapter and
//! every concurrent upload. Tagged per-service counters exist for statistics only; they
//! never grant additional budget. Highlights:
//!
//! - Timestamp deque trimmed on every query; entries older than the window are discarded.
//! - Requests under budget are admitted immediately with zero delay.
//! - Saturated requests reserve a future slot spaced `min_delay` after the newest
//!   reservation, so grants remain bounded by `max_rpm` over any rolling window and a
//!   waiter is served within one window of its reservation.
//! - The lock is never held across a sleep; `acquire` computes the delay under the lock
//!   and sleeps after releasing it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Shared sliding-window limiter for outbound provider requests.
pub struct RateLimiter {
    max_rpm: usize,
    window: Duration,
    min_delay: Duration,
    inner: Mutex<WindowState>,
}

struct WindowState {
    /// Grant timestamps within the window, oldest first. Saturated reservations may sit
    /// in the future.
    entries: VecDeque<Entry>,
}

struct Entry {
    at: Instant,
    service: String,
}

impl RateLimiter {
    /// Construct a limiter enforcing `max_rpm` requests per 60-second window.
    pub fn new(max_rpm: usize) -> Self {
        Self::with_window(max_rpm, Duration::from_secs(60))
    }

    /// Construct a limiter with an explicit window, used by tests to compress time.
    pub fn with_window(max_rpm: usize, window: Duration) -> Self {
        let max_rpm = max_rpm.max(1);
        // Base spacing plus 10% headroom; the headroom is the bounded positive jitter
        // that keeps steady-state grants strictly under the budget.
        let min_delay = window.div_f64(max_rpm as f64).mul_f64(1.1);
        Self {
            max_rpm,
            window,
            min_delay,
            inner: Mutex::new(WindowState {
                entries: VecDeque::new(),
            }),
        }
    }

    /// Reserve a slot for one outbound request under `service` and return the delay the
    /// caller must wait before performing the call. Zero when under budget.
    ///
    /// The reservation is recorded immediately; cancelling the subsequent sleep burns the
    /// slot, which is acceptable and bounded.
    pub fn request(&self, service: &str) -> Duration {
        let now = Instant::now();
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");
        state.trim(now, self.window);

        if state.entries.len() < self.max_rpm {
            state.entries.push_back(Entry {
                at: now,
                service: service.to_string(),
            });
            return Duration::ZERO;
        }

        // Saturated: space the reservation behind the newest one (which may already be
        // in the future when other callers are queued). The oldest entry is retired so
        // the deque never exceeds `max_rpm`.
        let newest = state.entries.back().map(|entry| entry.at).unwrap_or(now);
        let scheduled = newest.max(now) + self.min_delay;
        state.entries.pop_front();
        state.entries.push_back(Entry {
            at: scheduled,
            service: service.to_string(),
        });
        let delay = scheduled.saturating_duration_since(now);
        tracing::debug!(
            service,
            delay_ms = delay.as_millis() as u64,
            "Rate limit saturated; delaying request"
        );
        delay
    }

    /// Reserve a slot and sleep out the computed delay before returning.
    pub async fn acquire(&self, service: &str) {
        let delay = self.request(service);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Snapshot of the limiter state, safe to call concurrently with `request`.
    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");
        state.trim(now, self.window);

        let mut services: BTreeMap<String, ServiceStats> = BTreeMap::new();
        let mut current = 0usize;
        for entry in &state.entries {
            if entry.at > now {
                continue;
            }
            current += 1;
            services
                .entry(entry.service.clone())
                .or_insert_with(|| ServiceStats { current_rpm: 0 })
                .current_rpm += 1;
        }

        RateLimiterStats {
            global: GlobalStats {
                current_rpm: current,
                max_rpm: self.max_rpm,
                utilization_percent: (current * 100 / self.max_rpm) as u32,
                min_delay_seconds: self.min_delay.as_secs_f64(),
            },
            services,
        }
    }
}

impl WindowState {
    fn trim(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at) > window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Aggregate limiter statistics exposed by `GET /rate-limit-stats`.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    /// Shared-budget view.
    pub global: GlobalStats,
    /// Per-service grant counters (statistics only).
    pub services: BTreeMap<String, ServiceStats>,
}

/// Shared-budget statistics.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    /// Grants observed within the current window.
    pub current_rpm: usize,
    /// Configured budget.
    pub max_rpm: usize,
    /// `100 * current_rpm / max_rpm`, integer-rounded.
    pub utilization_percent: u32,
    /// Spacing applied to saturated reservations, in seconds.
    pub min_delay_seconds: f64,
}

/// Per-service grant counter.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// Grants under this tag within the current window.
    pub current_rpm: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_budget_without_delay() {
        let limiter = RateLimiter::new(10);
        for _ in 0..10 {
            assert_eq!(limiter.request("openai_chat"), Duration::ZERO);
        }
    }

    #[test]
    fn eleventh_request_observes_min_delay() {
        let limiter = RateLimiter::new(10);
        for _ in 0..10 {
            limiter.request("openai_chat");
        }
        let delay = limiter.request("openai_chat").as_secs_f64();
        assert!((5.5..=6.7).contains(&delay), "delay was {delay}");
    }

    #[test]
    fn queued_reservations_space_out() {
        let limiter = RateLimiter::new(10);
        for _ in 0..10 {
            limiter.request("openai_chat");
        }
        let first = limiter.request("openai_chat").as_secs_f64();
        let second = limiter.request("openai_chat").as_secs_f64();
        assert!(second > first + 5.0, "second waiter must queue behind first");
    }

    #[test]
    fn stats_reports_utilization_and_service_counts() {
        let limiter = RateLimiter::new(10);
        for _ in 0..4 {
            limiter.request("openai_embeddings");
        }
        limiter.request("ollama_chat");

        let stats = limiter.stats();
        assert_eq!(stats.global.current_rpm, 5);
        assert_eq!(stats.global.max_rpm, 10);
        assert_eq!(stats.global.utilization_percent, 50);
        assert_eq!(stats.services["openai_embeddings"].current_rpm, 4);
        assert_eq!(stats.services["ollama_chat"].current_rpm, 1);
    }

    #[test]
    fn expired_entries_free_budget() {
        let limiter = RateLimiter::with_window(2, Duration::from_millis(40));
        assert_eq!(limiter.request("svc"), Duration::ZERO);
        assert_eq!(limiter.request("svc"), Duration::ZERO);
        assert!(!limiter.request("svc").is_zero());
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(limiter.request("svc"), Duration::ZERO);
    }

    #[tokio::test]
    async fn acquire_sleeps_outside_the_lock() {
        let limiter = std::sync::Arc::new(RateLimiter::with_window(
            1,
            Duration::from_millis(50),
        ));
        limiter.request("svc");
        let start = Instant::now();
        // A concurrent stats call must not block on the sleeping acquirer.
        let sleeper = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("svc").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = limiter.stats();
        assert!(start.elapsed() < Duration::from_millis(40));
        sleeper.await.expect("acquire task");
    }
}
