//! Continuous-refill token bucket

use std::time::Instant;

/// Token bucket for rate limiting.
///
/// Tokens refill continuously at `rate` tokens/second up to `capacity`.
/// The balance can go negative after reconciliation when actual usage
/// exceeded the estimate, borrowing from future capacity.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket refilling at `rate` tokens per second.
    pub fn new(capacity: f64, rate: f64) -> Self {
        Self {
            capacity,
            rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Advance the balance for elapsed time.
    pub fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `amount` tokens if available. Does not mutate on failure.
    pub fn try_acquire(&mut self, amount: f64) -> bool {
        self.refill();
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Give back tokens taken by a failed compound acquire.
    pub fn release(&mut self, amount: f64) {
        self.tokens = (self.tokens + amount).min(self.capacity);
    }

    /// Seconds until `amount` tokens will be available.
    pub fn time_until_available(&mut self, amount: f64) -> f64 {
        self.refill();
        if self.tokens >= amount {
            0.0
        } else {
            (amount - self.tokens) / self.rate
        }
    }

    /// Adjust the balance once actual usage is known. Over-estimation is
    /// returned to the bucket; under-estimation borrows from future
    /// capacity and may leave the balance transiently negative.
    pub fn reconcile(&mut self, estimated: f64, actual: f64) {
        self.tokens = (self.tokens + (estimated - actual)).min(self.capacity);
    }
}
