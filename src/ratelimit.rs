//! Sliding-window admission gate for outbound commands.
//!
//! A courtesy limit on the client side only; the executor enforces its own.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Admits at most `capacity` commands in any trailing `window`.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            admitted: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a dispatch if the window has room. Denied calls are not queued.
    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.admitted.len() < self.capacity {
            self.admitted.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn remaining(&mut self) -> usize {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.capacity.saturating_sub(self.admitted.len())
    }

    /// Milliseconds until the oldest admission leaves the window; zero if empty.
    pub fn next_available_in_ms(&mut self) -> u64 {
        self.next_available_at(Instant::now())
    }

    pub fn next_available_at(&mut self, now: Instant) -> u64 {
        self.prune(now);
        match self.admitted.front() {
            Some(oldest) => (*oldest + self.window)
                .saturating_duration_since(now)
                .as_millis() as u64,
            None => 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_then_window_elapses() {
        let mut limiter = RateLimiter::new(2, Duration::from_millis(1000));
        let start = Instant::now();

        assert!(limiter.admit_at(start));
        assert!(limiter.admit_at(start));
        assert!(!limiter.admit_at(start));
        assert_eq!(limiter.remaining_at(start), 0);

        let later = start + Duration::from_millis(1000);
        assert!(limiter.admit_at(later));
        assert_eq!(limiter.remaining_at(later), 0);
    }

    #[test]
    fn test_next_available() {
        let mut limiter = RateLimiter::new(2, Duration::from_millis(1000));
        let start = Instant::now();
        assert_eq!(limiter.next_available_at(start), 0);

        limiter.admit_at(start);
        limiter.admit_at(start + Duration::from_millis(300));
        assert_eq!(limiter.next_available_at(start + Duration::from_millis(400)), 600);

        // Oldest entry has left; the second one is now the oldest
        assert_eq!(limiter.next_available_at(start + Duration::from_millis(1100)), 200);
        assert_eq!(limiter.remaining_at(start + Duration::from_millis(1100)), 1);
    }

    #[test]
    fn test_denied_calls_do_not_consume() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(500));
        let start = Instant::now();
        assert!(limiter.admit_at(start));
        for i in 1..10 {
            assert!(!limiter.admit_at(start + Duration::from_millis(i * 10)));
        }
        assert!(limiter.admit_at(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_wall_clock_admit() {
        let mut limiter = RateLimiter::new(10, Duration::from_secs(60));
        assert!(limiter.admit());
        assert_eq!(limiter.remaining(), 9);
        assert!(limiter.next_available_in_ms() > 0);
    }
}
