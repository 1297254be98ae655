//! Token-bucket rate controller (spec.md §4.8).
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::PgmError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Byte-granularity token bucket gating SPM and ODATA/RDATA egress.
///
/// NCFs bypass this controller entirely (spec.md §4.6, §4.8); callers simply
/// never route NCF emission through `check`.
pub struct RateController {
    rate_bytes_per_sec: f64,
    burst_cap: f64,
    bucket: Mutex<Bucket>,
    refill: Condvar,
}

impl RateController {
    /// Builds a controller replenishing at `rate_bytes_per_sec`, with a burst
    /// cap of `burst_cap` bytes (the bucket never holds more than this many
    /// tokens, bounding how much can be sent in one instant after idling).
    pub fn new(rate_bytes_per_sec: u64, burst_cap: u64) -> Self {
        let burst_cap = burst_cap.max(1) as f64;
        Self {
            rate_bytes_per_sec: rate_bytes_per_sec.max(1) as f64,
            burst_cap,
            bucket: Mutex::new(Bucket {
                tokens: burst_cap,
                last_refill: Instant::now(),
            }),
            refill: Condvar::new(),
        }
    }

    fn refill_locked(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_bytes_per_sec).min(self.burst_cap);
        bucket.last_refill = now;
    }

    /// Reserves `bytes` tokens. If `dontwait` is set, rejects immediately
    /// with [`PgmError::RateLimited`] rather than blocking (spec.md §4.4's
    /// DONTWAIT|WAITALL "reserve atomically or reject" batch semantics).
    /// Otherwise blocks until enough tokens accumulate.
    pub fn check(&self, bytes: usize, dontwait: bool) -> Result<(), PgmError> {
        let bytes = bytes as f64;
        if bytes > self.burst_cap {
            // No amount of waiting ever fills the bucket past `burst_cap`
            // (`refill_locked` caps it there), so a blocking caller would
            // otherwise wait forever. Distinct from `Oversize`, which is
            // APDU length against the window's total capacity.
            return Err(PgmError::Invalid(format!(
                "request of {bytes} bytes exceeds the rate burst cap of {}",
                self.burst_cap
            )));
        }
        let mut bucket = self.bucket.lock().unwrap();
        loop {
            self.refill_locked(&mut bucket);
            if bucket.tokens >= bytes {
                bucket.tokens -= bytes;
                return Ok(());
            }
            if dontwait {
                return Err(PgmError::RateLimited);
            }
            let wait_secs = (bytes - bucket.tokens) / self.rate_bytes_per_sec;
            let (guard, _) = self
                .refill
                .wait_timeout(bucket, Duration::from_secs_f64(wait_secs.max(0.001)))
                .unwrap();
            bucket = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_within_cap_succeeds_immediately() {
        let rc = RateController::new(1_000_000_000, 1500);
        assert!(rc.check(1000, true).is_ok());
    }

    #[test]
    fn dontwait_rejects_when_bucket_exhausted() {
        let rc = RateController::new(1, 10);
        assert!(rc.check(5, true).is_ok());
        assert!(matches!(rc.check(1000, true), Err(PgmError::RateLimited)));
    }

    #[test]
    fn refill_grants_tokens_over_time() {
        let rc = RateController::new(1_000_000, 10);
        assert!(rc.check(10, true).is_ok());
        assert!(rc.check(1, true).is_err());
        std::thread::sleep(Duration::from_millis(5));
        assert!(rc.check(1, true).is_ok());
    }

    #[test]
    fn request_larger_than_burst_cap_errors_instead_of_blocking_forever() {
        let rc = RateController::new(1_000_000_000, 100);
        assert!(matches!(rc.check(1000, true), Err(PgmError::Invalid(_))));
        // dontwait=false (blocking) must also return promptly, not hang.
        assert!(matches!(rc.check(1000, false), Err(PgmError::Invalid(_))));
    }
}
