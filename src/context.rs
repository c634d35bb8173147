//! The "current thread" capability the controller needs for wait-queue
//! registration and debug timeouts.
//!
//! MySQL's keycache reaches for a globally shared `struct st_my_thread_var`
//! via thread-local storage. Per DESIGN NOTES we instead carry it as an
//! explicit parameter: easier to unit test (a test can hand in a context
//! with a short debug timeout without touching global state) and avoids a
//! hidden dependency on thread-local initialisation order.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheContext {
    pub thread_id: std::thread::ThreadId,
    /// When set, internal condvar waits use a timed wait and return
    /// `CacheError::WaitTimeout` instead of blocking forever
    /// (`keycache_timeout`/`pagecache_timeout` debug mode, spec.md §5).
    pub debug_timeout: Option<Duration>,
}

impl CacheContext {
    pub fn current() -> Self {
        CacheContext {
            thread_id: std::thread::current().id(),
            debug_timeout: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        CacheContext {
            thread_id: std::thread::current().id(),
            debug_timeout: Some(timeout),
        }
    }
}

impl Default for CacheContext {
    fn default() -> Self {
        Self::current()
    }
}
