//! Client side rate limiting for the remote APIs.
//!
//! A sliding window: the limiter remembers when each accepted request happened and
//! refuses a new one while `max_requests` of them are younger than `window`.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    accepted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// A limiter allowing `max_requests` per `window`. Zero is treated as one.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            max_requests,
            window,
            accepted: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Records a request if the window has room, otherwise returns how long to wait
    /// until the oldest request leaves the window.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        // A poisoned lock only means another thread panicked mid-push; the queue is still valid.
        let mut accepted = self.accepted.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(oldest) = accepted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                accepted.pop_front();
            } else {
                break;
            }
        }
        if accepted.len() < self.max_requests {
            accepted.push_back(now);
            Ok(())
        } else {
            let oldest = accepted.front().copied().unwrap_or(now);
            Err(self.window.saturating_sub(now.saturating_duration_since(oldest)))
        }
    }

    /// Blocks until a request may be made. Sleeping happens without holding the lock.
    pub fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    log::debug!("Rate limit window full, waiting {wait:?}");
                    std::thread::sleep(wait.max(Duration::from_millis(1)));
                }
            }
        }
    }
}
