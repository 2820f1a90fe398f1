//! Failure Breaker (§4.C): a three-state circuit breaker guarding repeated
//! requests to an endpoint that is failing outright.
//!
//! `check()` is the admission decision, called before a Fetcher issues its
//! request; `record_success()`/`record_failure()` feed the outcome back in
//! afterward. Mirrors the closed/open/half-open shape, not any one crate's
//! implementation of it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// If `false`, `check()` always admits and failures are never recorded;
    /// the breaker stays `Closed` for the life of the Download.
    pub enabled: bool,
    /// Consecutive failures (in `Closed`) before the breaker trips `Open`.
    pub failure_threshold: u32,
    /// How long the breaker stays `Open` before allowing one `HalfOpen` probe.
    pub open_duration: Duration,
    /// Consecutive successes required in `HalfOpen` before returning to `Closed`.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 10,
            open_duration: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// `HalfOpen` admits exactly one in-flight probe at a time.
    probe_in_flight: bool,
}

/// Shared across every Fetcher working the same Download; one instance per
/// endpoint (in this engine, per Download, since all Segments share a host).
pub struct Breaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl Breaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Breaker {
            cfg,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Admission check. Must be called immediately before issuing a request.
    pub fn check(&self) -> Result<(), DownloadError> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => Ok(()),
            State::HalfOpen => {
                if inner.probe_in_flight {
                    Err(DownloadError::BreakerOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
            State::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cfg.open_duration {
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                    inner.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(DownloadError::BreakerOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        if !self.cfg.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures = 0;
            }
            State::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.cfg.success_threshold {
                    inner.state = State::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                }
            }
            State::Open => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.cfg.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                inner.probe_in_flight = false;
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
            }
            State::Open => {}
        }
    }

    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(inner.state, State::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> BreakerConfig {
        BreakerConfig {
            enabled: true,
            failure_threshold: 10,
            open_duration: Duration::from_millis(50),
            success_threshold: 2,
        }
    }

    #[test]
    fn stays_closed_under_threshold() {
        let b = Breaker::new(test_cfg());
        for _ in 0..9 {
            b.check().unwrap();
            b.record_failure();
        }
        assert!(!b.is_open());
        b.check().unwrap();
    }

    #[test]
    fn opens_at_failure_threshold() {
        let b = Breaker::new(test_cfg());
        for _ in 0..10 {
            b.check().unwrap();
            b.record_failure();
        }
        assert!(b.is_open());
        assert!(matches!(b.check(), Err(DownloadError::BreakerOpen)));
    }

    #[test]
    fn success_resets_failure_count() {
        let b = Breaker::new(test_cfg());
        for _ in 0..5 {
            b.check().unwrap();
            b.record_failure();
        }
        b.check().unwrap();
        b.record_success();
        for _ in 0..9 {
            b.check().unwrap();
            b.record_failure();
        }
        assert!(!b.is_open(), "counter should have reset after the success");
    }

    #[test]
    fn half_open_admits_single_probe_and_closes_on_success() {
        let b = Breaker::new(test_cfg());
        for _ in 0..10 {
            b.check().unwrap();
            b.record_failure();
        }
        assert!(b.is_open());
        std::thread::sleep(Duration::from_millis(60));

        b.check().unwrap();
        assert!(matches!(b.check(), Err(DownloadError::BreakerOpen)), "second probe rejected while one is in flight");
        b.record_success();
        b.check().unwrap();
        b.record_success();
        assert!(!b.is_open());
        b.check().unwrap();
    }

    #[test]
    fn disabled_breaker_never_trips() {
        let b = Breaker::new(BreakerConfig { enabled: false, ..test_cfg() });
        for _ in 0..1000 {
            b.check().unwrap();
            b.record_failure();
        }
        assert!(!b.is_open());
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = Breaker::new(test_cfg());
        for _ in 0..10 {
            b.check().unwrap();
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        b.check().unwrap();
        b.record_failure();
        assert!(b.is_open());
        assert!(matches!(b.check(), Err(DownloadError::BreakerOpen)));
    }
}
