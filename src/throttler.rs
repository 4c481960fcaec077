//! Throttling seam.
//!
//! The copier calls [`Throttler::block_wait`] before every chunk copy and
//! never during one. Policy implementations (replica lag, load shedding,
//! ...) live outside this crate; [`NoopThrottler`] is the default.

use async_trait::async_trait;

/// Blocks the caller while the database is unhealthy.
#[async_trait]
pub trait Throttler: Send + Sync {
    /// Wait until the next copy may proceed. May block arbitrarily long;
    /// the copier wraps the call in a cancellation select, so
    /// implementations need not observe cancellation themselves.
    async fn block_wait(&self);
}

/// A throttler that never throttles.
#[derive(Debug, Default)]
pub struct NoopThrottler;

#[async_trait]
impl Throttler for NoopThrottler {
    async fn block_wait(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_returns_immediately() {
        NoopThrottler.block_wait().await;
    }
}
