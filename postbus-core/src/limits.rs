//! Memory-bounded admission control.
//!
//! A request's memory use is estimated as
//!
//! ```text
//! req_mem = (basic_request_size + body_size) * bloat_factor
//! ```
//!
//! and concurrently admitted requests are limited so that
//! `sum(req_mem) <= max_memory`. The estimate deliberately overshoots the
//! real cost to leave headroom for buffers and filter intermediates.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Minimum request footprint added to every body size before bloating.
pub const DEFAULT_BASIC_REQUEST_SIZE: u64 = 1024;

/// Multiplier applied to the serialized size to estimate true footprint.
pub const DEFAULT_BLOAT_FACTOR: f64 = 1.57;

/// Default per-core admission budget (1 GiB).
pub const DEFAULT_MAX_MEMORY: u64 = 1 << 30;

/// Default deadline for reading a message body after its header.
pub const DEFAULT_BODY_PARSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors surfaced by admission.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("request estimate {estimated} bytes exceeds the admission budget of {max_memory}")]
    RequestTooLarge { estimated: u64, max_memory: u64 },

    #[error("admission budget closed (shutting down)")]
    Closed,
}

/// Resource limits shared by every connection on one server instance, or
/// owned by one client.
#[derive(Debug)]
pub struct ConnectionLimits {
    pub basic_request_size: u64,
    pub bloat_factor: f64,
    pub max_memory: u64,
    /// Deadline for the body read that follows a successfully parsed
    /// header. On expiry the connection is failed, not just the message.
    pub max_body_parse_duration: Duration,
    resources: Arc<Semaphore>,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::new(
            DEFAULT_BASIC_REQUEST_SIZE,
            DEFAULT_BLOAT_FACTOR,
            DEFAULT_MAX_MEMORY,
            DEFAULT_BODY_PARSE_TIMEOUT,
        )
    }
}

impl ConnectionLimits {
    /// Creates limits with an admission budget of `max_memory` bytes.
    ///
    /// Budgets are clamped to `u32::MAX`; admission accounting is per
    /// server instance and sized in the hundreds of megabytes.
    pub fn new(
        basic_request_size: u64,
        bloat_factor: f64,
        max_memory: u64,
        max_body_parse_duration: Duration,
    ) -> Self {
        let max_memory = max_memory.min(u32::MAX as u64);
        Self {
            basic_request_size,
            bloat_factor,
            max_memory,
            max_body_parse_duration,
            resources: Arc::new(Semaphore::new(max_memory as usize)),
        }
    }

    /// Estimated memory footprint of a request with `body_size` serialized
    /// bytes. Intentionally linear-overestimating.
    pub fn estimate_request_size(&self, body_size: u64) -> u64 {
        ((self.basic_request_size + body_size) as f64 * self.bloat_factor) as u64
    }

    /// Admits a request of `body_size` bytes, suspending the caller until
    /// enough budget is free.
    ///
    /// A request whose estimate alone exceeds the whole budget fails fast
    /// instead of deadlocking. The returned permit releases the budget on
    /// drop, exactly once, on whichever continuation finishes last.
    pub async fn admit(&self, body_size: u64) -> Result<AdmissionPermit, AdmissionError> {
        let estimated = self.estimate_request_size(body_size);
        if estimated > self.max_memory {
            return Err(AdmissionError::RequestTooLarge {
                estimated,
                max_memory: self.max_memory,
            });
        }
        let permit = self
            .resources
            .clone()
            .acquire_many_owned(estimated as u32)
            .await
            .map_err(|_| AdmissionError::Closed)?;
        Ok(AdmissionPermit {
            estimated,
            _permit: permit,
        })
    }

    /// Budget currently unclaimed, in bytes.
    pub fn available(&self) -> usize {
        self.resources.available_permits()
    }
}

impl std::fmt::Display for ConnectionLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "limits{{basic_request_size:{}, bloat_factor:{}, max_memory:{}, body_timeout:{}ms, available:{}}}",
            self.basic_request_size,
            self.bloat_factor,
            self.max_memory,
            self.max_body_parse_duration.as_millis(),
            self.available()
        )
    }
}

/// Admission credit for one in-flight message. Dropping it returns the
/// estimated bytes to the budget.
#[derive(Debug)]
pub struct AdmissionPermit {
    estimated: u64,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn estimated(&self) -> u64 {
        self.estimated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits(max_memory: u64) -> ConnectionLimits {
        ConnectionLimits::new(100, 2.0, max_memory, Duration::from_secs(1))
    }

    #[test]
    fn test_estimate_overestimates() {
        let limits = ConnectionLimits::default();
        let estimate = limits.estimate_request_size(1000);
        assert!(estimate > 1000);
        assert_eq!(estimate, ((1024u64 + 1000) as f64 * 1.57) as u64);
    }

    #[tokio::test]
    async fn test_admitted_sum_never_exceeds_budget() {
        let limits = small_limits(10_000);
        let a = limits.admit(1000).await.unwrap();
        let b = limits.admit(1000).await.unwrap();
        assert!(a.estimated() + b.estimated() <= 10_000);
        assert_eq!(
            limits.available() as u64,
            10_000 - a.estimated() - b.estimated()
        );
    }

    #[tokio::test]
    async fn test_oversized_request_fails_fast() {
        let limits = small_limits(1_000);
        let result = limits.admit(10_000).await;
        assert!(matches!(
            result,
            Err(AdmissionError::RequestTooLarge { .. })
        ));
        // budget untouched
        assert_eq!(limits.available(), 1_000);
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let limits = small_limits(10_000);
        let permit = limits.admit(2000).await.unwrap();
        let held = limits.available();
        drop(permit);
        assert!(limits.available() > held);
        assert_eq!(limits.available(), 10_000);
    }

    #[tokio::test]
    async fn test_admission_blocks_until_release() {
        let limits = Arc::new(small_limits(5_000));
        // (100 + 2000) * 2.0 = 4200: a second identical request cannot fit
        let first = limits.admit(2000).await.unwrap();

        let limits2 = limits.clone();
        let waiter = tokio::spawn(async move { limits2.admit(2000).await.unwrap().estimated() });

        // the waiter must still be pending while the first permit lives
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let estimated = waiter.await.unwrap();
        assert_eq!(estimated, 4200);
    }
}
