//! Admission control ahead of any database work.
//!
//! An [`Interceptor`] either rejects a call or admits it with an
//! [`AdmitGuard`]. The guard's release action runs exactly once, when the
//! guard is dropped at the end of the call.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::context::ExecContext;

/// Scoped admission. Dropping it releases whatever the interceptor acquired.
#[must_use = "dropping the guard releases the admission immediately"]
pub struct AdmitGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AdmitGuard {
    /// Guard with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn on_release(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for AdmitGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for AdmitGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmitGuard")
            .field("pending", &self.release.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum Admission {
    Admitted(AdmitGuard),
    Rejected,
}

pub trait Interceptor: Send + Sync {
    fn admit(
        &self,
        ctx: &ExecContext,
        uri: &str,
        request_id: Option<&str>,
        method: &str,
    ) -> Admission;
}

/// Admits every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Interceptor for AllowAll {
    fn admit(&self, _: &ExecContext, _: &str, _: Option<&str>, _: &str) -> Admission {
        Admission::Admitted(AdmitGuard::noop())
    }
}

/// Bounds the number of calls in flight. The permit is held by the guard.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Interceptor for ConcurrencyLimiter {
    fn admit(&self, _: &ExecContext, uri: &str, request_id: Option<&str>, _: &str) -> Admission {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Admission::Admitted(AdmitGuard::on_release(move || drop(permit))),
            Err(_) => {
                tracing::warn!(uri, request_id, "concurrency limit reached");
                Admission::Rejected
            }
        }
    }
}

/// Allows at most `max` calls per fixed window.
#[derive(Debug)]
pub struct WindowRateLimiter {
    max: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    started: Instant,
    count: u32,
}

impl WindowRateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                count: 0,
            }),
        }
    }
}

impl Interceptor for WindowRateLimiter {
    fn admit(&self, _: &ExecContext, uri: &str, request_id: Option<&str>, _: &str) -> Admission {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }
        if state.count >= self.max {
            tracing::warn!(uri, request_id, "rate limit reached");
            return Admission::Rejected;
        }
        state.count += 1;
        Admission::Admitted(AdmitGuard::noop())
    }
}

/// Runs interceptors in order; the first rejection wins. Guards acquired
/// before a rejection are released immediately.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl Interceptor for InterceptorChain {
    fn admit(
        &self,
        ctx: &ExecContext,
        uri: &str,
        request_id: Option<&str>,
        method: &str,
    ) -> Admission {
        let mut guards = Vec::with_capacity(self.interceptors.len());
        for interceptor in &self.interceptors {
            match interceptor.admit(ctx, uri, request_id, method) {
                Admission::Admitted(guard) => guards.push(guard),
                Admission::Rejected => return Admission::Rejected,
            }
        }
        Admission::Admitted(AdmitGuard::on_release(move || drop(guards)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn admit(i: &dyn Interceptor) -> Admission {
        i.admit(&ExecContext::background(), "urn:postgres:query.t", None, "query")
    }

    #[test]
    fn test_guard_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let guard = AdmitGuard::on_release(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrency_limiter() {
        let limiter = ConcurrencyLimiter::new(1);
        let first = admit(&limiter);
        assert!(matches!(first, Admission::Admitted(_)));
        assert!(matches!(admit(&limiter), Admission::Rejected));
        drop(first);
        assert_eq!(limiter.available(), 1);
        assert!(matches!(admit(&limiter), Admission::Admitted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rate_limiter() {
        let limiter = WindowRateLimiter::new(2, Duration::from_secs(1));
        assert!(matches!(admit(&limiter), Admission::Admitted(_)));
        assert!(matches!(admit(&limiter), Admission::Admitted(_)));
        assert!(matches!(admit(&limiter), Admission::Rejected));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(admit(&limiter), Admission::Admitted(_)));
    }

    #[test]
    fn test_chain_releases_on_rejection() {
        let limiter = ConcurrencyLimiter::new(1);
        let chain = InterceptorChain::new()
            .with(Arc::new(limiter.clone()))
            .with(Arc::new(WindowRateLimiter::new(0, Duration::from_secs(60))));
        assert!(matches!(admit(&chain), Admission::Rejected));
        assert_eq!(limiter.available(), 1);
    }
}
