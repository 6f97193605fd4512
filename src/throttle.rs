//! Adaptive per-domain throttling.
//!
//! The [`Throttler`] remembers, per registrable domain, when the latest request started,
//! when its response arrived and how long that round trip took. Before the next request to
//! the same domain, [`Throttler::wait_for_go`] waits until
//! `latest_response_end + clamp(random delay, min, max)` has passed, where the random delay
//! is drawn from a fixed range or from a range of multiples of the previous round trip.
//!
//! Requests to different domains never wait on each other: every domain has its own lock.
//! Callers for the same domain serialize on that lock, so two of them cannot compute the
//! same go time.
//!
//! # Example
//!
//! ```
//! use crawler_core::throttle::{ThrottleRange, Throttler};
//! use crawler_core::time::Microseconds;
//!
//! let throttler = Throttler::new(
//!     ThrottleRange::MultipleOf { from: 1.0, to: 2.0 },
//!     Microseconds::from_millis(250),
//!     Microseconds::from_millis(60_000),
//! )
//! .unwrap();
//! assert!(!throttler.is_disabled());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::time::Microseconds;

/// Warning threshold for cumulative throttle delay per domain (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Default lower bound for any throttle wait (0.25 seconds).
pub const DEFAULT_MIN_WAIT: Microseconds = Microseconds::from_millis(250);

/// Default upper bound for any throttle wait (60 seconds).
pub const DEFAULT_MAX_WAIT: Microseconds = Microseconds::from_millis(60_000);

/// Largest accepted upper bound for a throttle wait (one hour).
pub const MAX_WAIT_LIMIT: Microseconds = Microseconds::from_millis(3_600_000);

/// Bucket used when a URL has no host.
const NO_HOST_KEY: &str = "*";

/// Range the random wait is drawn from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThrottleRange {
    /// Fixed durations.
    Absolute { from: Microseconds, to: Microseconds },
    /// Multiples of the previous round-trip duration for the domain.
    MultipleOf { from: f64, to: f64 },
}

impl Default for ThrottleRange {
    fn default() -> Self {
        Self::MultipleOf { from: 1.0, to: 2.0 }
    }
}

/// Invalid throttle configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThrottleError {
    #[error("throttle range start {from} is greater than its end {to}")]
    InvertedRange { from: String, to: String },
    #[error("throttle multiplier {0} must be a finite, non-negative number")]
    InvalidMultiplier(f64),
    #[error("minimum throttle wait {min} is greater than maximum {max}")]
    InvertedBounds { min: Microseconds, max: Microseconds },
    #[error("maximum throttle wait {max} exceeds the limit of {limit}")]
    MaxTooLarge { max: Microseconds, limit: Microseconds },
}

/// Per-domain adaptive wait calculator.
///
/// Designed to be shared behind an `Arc` by every loader of a crawl.
#[derive(Debug)]
pub struct Throttler {
    range: ThrottleRange,
    min: Microseconds,
    max: Microseconds,
    disabled: bool,
    domains: DashMap<String, Arc<DomainState>>,
}

#[derive(Debug, Default)]
struct DomainState {
    timing: Mutex<DomainTiming>,
    cumulative_delay_us: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
struct DomainTiming {
    latest_request_start: Option<Instant>,
    latest_response_end: Option<Instant>,
    latest_duration: Option<Microseconds>,
}

impl DomainState {
    fn add_cumulative_delay(&self, delay: Microseconds) -> Duration {
        let total = self
            .cumulative_delay_us
            .fetch_add(delay.value(), Ordering::SeqCst)
            + delay.value();
        Duration::from_micros(total)
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self {
            range: ThrottleRange::default(),
            min: DEFAULT_MIN_WAIT,
            max: DEFAULT_MAX_WAIT,
            disabled: false,
            domains: DashMap::new(),
        }
    }
}

impl Throttler {
    /// Creates a throttler.
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError`] if `from > to`, a multiplier is negative or not finite,
    /// `min > max`, or `max` exceeds [`MAX_WAIT_LIMIT`].
    #[instrument(level = "debug")]
    pub fn new(
        range: ThrottleRange,
        min: Microseconds,
        max: Microseconds,
    ) -> Result<Self, ThrottleError> {
        match range {
            ThrottleRange::Absolute { from, to } => {
                if from > to {
                    return Err(ThrottleError::InvertedRange {
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
            }
            ThrottleRange::MultipleOf { from, to } => {
                for factor in [from, to] {
                    if !factor.is_finite() || factor < 0.0 {
                        return Err(ThrottleError::InvalidMultiplier(factor));
                    }
                }
                if from > to {
                    return Err(ThrottleError::InvertedRange {
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
            }
        }
        if min > max {
            return Err(ThrottleError::InvertedBounds { min, max });
        }
        if max > MAX_WAIT_LIMIT {
            return Err(ThrottleError::MaxTooLarge {
                max,
                limit: MAX_WAIT_LIMIT,
            });
        }
        debug!("creating throttler");
        Ok(Self {
            range,
            min,
            max,
            disabled: false,
            domains: DashMap::new(),
        })
    }

    /// A throttler that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    #[must_use]
    pub fn range(&self) -> ThrottleRange {
        self.range
    }

    fn state_for(&self, url: &Url) -> (String, Arc<DomainState>) {
        let domain = domain_key(url);
        // Clone the Arc so the DashMap shard lock is released before awaiting.
        let state = self
            .domains
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(DomainState::default()))
            .clone();
        (domain, state)
    }

    /// Records that a request to `url`'s domain is being sent now.
    pub async fn track_request_start_for(&self, url: &Url) {
        let (_, state) = self.state_for(url);
        state.timing.lock().await.latest_request_start = Some(Instant::now());
    }

    /// Records that the response for `url`'s domain arrived now.
    pub async fn track_request_end_for(&self, url: &Url) {
        let (domain, state) = self.state_for(url);
        let mut timing = state.timing.lock().await;
        let now = Instant::now();
        timing.latest_response_end = Some(now);
        if let Some(start) = timing.latest_request_start {
            let duration = Microseconds::between(start, now);
            debug!(domain = %domain, duration_us = duration.value(), "tracked round trip");
            timing.latest_duration = Some(duration);
        }
    }

    /// Waits until the next request to `url`'s domain may be sent.
    ///
    /// Returns immediately until one full request/response cycle was tracked for the domain.
    /// When it returns, the request start is already recorded.
    #[instrument(skip(self), fields(url = %url, domain))]
    pub async fn wait_for_go(&self, url: &Url) {
        if self.disabled {
            return;
        }
        let (domain, state) = self.state_for(url);
        tracing::Span::current().record("domain", domain.as_str());

        let mut timing = state.timing.lock().await;
        let Some(wait_until) = self.go_time(&timing) else {
            debug!(domain = %domain, "no round trip tracked yet - no wait");
            timing.latest_request_start = Some(Instant::now());
            return;
        };

        let now = Instant::now();
        if wait_until > now {
            let delay = Microseconds::between(now, wait_until);
            let cumulative = state.add_cumulative_delay(delay);
            debug!(
                domain = %domain,
                wait_ms = delay.as_duration().as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "throttling request"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    domain = %domain,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive throttling - consider reducing request volume to this domain"
                );
            }
            tokio::time::sleep_until(wait_until).await;
        }
        timing.latest_request_start = Some(Instant::now());
    }

    /// Instant before which no new request may start, `None` if nothing was tracked yet.
    fn go_time(&self, timing: &DomainTiming) -> Option<Instant> {
        let duration = timing.latest_duration?;
        let response_end = timing.latest_response_end?;
        // A request that started after the latest response is still in flight; assume it
        // takes as long as the previous one.
        let base = match timing.latest_request_start {
            Some(start) if start > response_end => start + duration.as_duration(),
            _ => response_end,
        };
        Some(base + self.delay_for(duration).as_duration())
    }

    /// Random wait for a domain whose latest round trip took `duration`, within `[min, max]`.
    #[must_use]
    pub fn delay_for(&self, duration: Microseconds) -> Microseconds {
        let (from, to) = match self.range {
            ThrottleRange::Absolute { from, to } => (from, to),
            ThrottleRange::MultipleOf { from, to } => (duration.multiply(from), duration.multiply(to)),
        };
        let delay = if from == to {
            from
        } else {
            Microseconds::new(rand::thread_rng().gen_range(from.value()..=to.value()))
        };
        delay.clamp_to(self.min, self.max)
    }
}

/// Throttling key for a URL: its registrable domain, else its host, else `"*"`.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use crawler_core::throttle::domain_key;
///
/// let url = Url::parse("https://www.example.co.uk/path").unwrap();
/// assert_eq!(domain_key(&url), "example.co.uk");
/// let url = Url::parse("http://127.0.0.1:8080/").unwrap();
/// assert_eq!(domain_key(&url), "127.0.0.1");
/// ```
#[must_use]
pub fn domain_key(url: &Url) -> String {
    let Some(host) = url.host_str() else {
        return NO_HOST_KEY.to_string();
    };
    let host = host.to_ascii_lowercase();
    if matches!(url.host(), Some(url::Host::Domain(_))) {
        if let Some(domain) = psl::domain_str(&host) {
            return domain.to_string();
        }
    }
    host
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn multiple_of(from: f64, to: f64, min_ms: u64, max_ms: u64) -> Throttler {
        Throttler::new(
            ThrottleRange::MultipleOf { from, to },
            Microseconds::from_millis(min_ms),
            Microseconds::from_millis(max_ms),
        )
        .unwrap()
    }

    async fn track_cycle(throttler: &Throttler, url: &Url, duration: Duration) {
        throttler.track_request_start_for(url).await;
        tokio::time::advance(duration).await;
        throttler.track_request_end_for(url).await;
    }

    #[test]
    fn test_new_rejects_inverted_range() {
        let result = Throttler::new(
            ThrottleRange::Absolute {
                from: Microseconds::from_millis(200),
                to: Microseconds::from_millis(100),
            },
            DEFAULT_MIN_WAIT,
            DEFAULT_MAX_WAIT,
        );
        assert!(matches!(result, Err(ThrottleError::InvertedRange { .. })));

        let result = Throttler::new(
            ThrottleRange::MultipleOf { from: 2.0, to: 1.0 },
            DEFAULT_MIN_WAIT,
            DEFAULT_MAX_WAIT,
        );
        assert!(matches!(result, Err(ThrottleError::InvertedRange { .. })));
    }

    #[test]
    fn test_new_rejects_bad_multiplier_and_bounds() {
        let result = Throttler::new(
            ThrottleRange::MultipleOf { from: -1.0, to: 1.0 },
            DEFAULT_MIN_WAIT,
            DEFAULT_MAX_WAIT,
        );
        assert_eq!(result.unwrap_err(), ThrottleError::InvalidMultiplier(-1.0));

        let result = Throttler::new(
            ThrottleRange::default(),
            Microseconds::from_millis(10),
            Microseconds::from_millis(5),
        );
        assert!(matches!(result, Err(ThrottleError::InvertedBounds { .. })));

        let result = Throttler::new(
            ThrottleRange::default(),
            DEFAULT_MIN_WAIT,
            Microseconds::from_millis(u64::MAX),
        );
        assert!(matches!(result, Err(ThrottleError::MaxTooLarge { .. })));
    }

    #[test]
    fn test_delay_for_equal_bounds_is_deterministic() {
        let throttler = multiple_of(1.5, 1.5, 0, 60_000);
        let d = Microseconds::from_millis(200);
        for _ in 0..10 {
            assert_eq!(throttler.delay_for(d), Microseconds::from_millis(300));
        }
    }

    #[test]
    fn test_delay_for_stays_within_range_and_bounds() {
        let throttler = multiple_of(1.0, 2.0, 0, 60_000);
        let d = Microseconds::from_millis(100);
        for _ in 0..100 {
            let delay = throttler.delay_for(d);
            assert!(delay >= Microseconds::from_millis(100));
            assert!(delay <= Microseconds::from_millis(200));
        }

        let clamped = multiple_of(1.0, 2.0, 500, 600);
        assert_eq!(clamped.delay_for(d), Microseconds::from_millis(500));
        assert_eq!(
            clamped.delay_for(Microseconds::from_millis(10_000)),
            Microseconds::from_millis(600)
        );
    }

    #[test]
    fn test_delay_for_absolute_range_ignores_duration() {
        let throttler = Throttler::new(
            ThrottleRange::Absolute {
                from: Microseconds::from_millis(700),
                to: Microseconds::from_millis(700),
            },
            Microseconds::ZERO,
            DEFAULT_MAX_WAIT,
        )
        .unwrap();
        assert_eq!(
            throttler.delay_for(Microseconds::from_millis(5)),
            Microseconds::from_millis(700)
        );
    }

    /// Paused-clock sleeps resolve on the next millisecond tick after their deadline.
    fn assert_waited(elapsed: Duration, expected: Duration) {
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "waited {elapsed:?}, expected about {expected:?}"
        );
    }

    #[tokio::test]
    async fn test_first_request_is_not_throttled() {
        tokio::time::pause();
        let throttler = Throttler::default();
        let start = Instant::now();
        throttler.wait_for_go(&url("https://example.com/")).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_first_go_starts_tracking() {
        tokio::time::pause();
        let throttler = multiple_of(1.0, 1.0, 0, 60_000);
        let target = url("https://example.com/");
        throttler.wait_for_go(&target).await;
        tokio::time::advance(Duration::from_millis(300)).await;
        throttler.track_request_end_for(&target).await;

        let start = Instant::now();
        throttler.wait_for_go(&target).await;
        assert_waited(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_wait_between_one_and_two_round_trips() {
        tokio::time::pause();
        let throttler = multiple_of(1.0, 2.0, 0, 60_000);
        let target = url("https://example.com/a");
        track_cycle(&throttler, &target, Duration::from_millis(400)).await;

        let start = Instant::now();
        throttler.wait_for_go(&url("https://example.com/b")).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(400), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(801), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_no_wait_once_enough_time_passed() {
        tokio::time::pause();
        let throttler = multiple_of(1.0, 1.0, 0, 60_000);
        let target = url("https://example.com/");
        track_cycle(&throttler, &target, Duration::from_millis(100)).await;
        tokio::time::advance(Duration::from_millis(150)).await;

        let start = Instant::now();
        throttler.wait_for_go(&target).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_min_bound_applies() {
        tokio::time::pause();
        let throttler = multiple_of(1.0, 1.0, 1_000, 60_000);
        let target = url("https://example.com/");
        track_cycle(&throttler, &target, Duration::from_millis(10)).await;

        let start = Instant::now();
        throttler.wait_for_go(&target).await;
        assert_waited(start.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_domains_are_independent() {
        tokio::time::pause();
        let throttler = multiple_of(1.0, 1.0, 0, 60_000);
        track_cycle(&throttler, &url("https://a.example.com/"), Duration::from_secs(5)).await;

        let start = Instant::now();
        throttler.wait_for_go(&url("https://other.org/")).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Subdomains share the registrable domain bucket.
        throttler.wait_for_go(&url("https://b.example.com/")).await;
        assert_waited(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_same_domain_callers_serialize() {
        tokio::time::pause();
        let throttler = Arc::new(multiple_of(1.0, 1.0, 0, 60_000));
        let target = url("https://example.com/");
        track_cycle(&throttler, &target, Duration::from_secs(1)).await;

        let start = Instant::now();
        let first = {
            let throttler = Arc::clone(&throttler);
            let target = target.clone();
            tokio::spawn(async move { throttler.wait_for_go(&target).await })
        };
        let second = {
            let throttler = Arc::clone(&throttler);
            let target = target.clone();
            tokio::spawn(async move { throttler.wait_for_go(&target).await })
        };
        first.await.unwrap();
        second.await.unwrap();

        // The second caller treats the first request as in flight: start + 1s duration + 1s wait.
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_disabled_never_waits() {
        tokio::time::pause();
        let throttler = Throttler::disabled();
        let target = url("https://example.com/");
        track_cycle(&throttler, &target, Duration::from_secs(10)).await;
        let start = Instant::now();
        throttler.wait_for_go(&target).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_domain_key_fallbacks() {
        assert_eq!(domain_key(&url("https://www.Example.com/x")), "example.com");
        assert_eq!(domain_key(&url("http://localhost:8080/")), "localhost");
        assert_eq!(domain_key(&url("http://[::1]/")), "[::1]");
        assert_eq!(domain_key(&url("data:text/plain,hi")), "*");
    }
}
