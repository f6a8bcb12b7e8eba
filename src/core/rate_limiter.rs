//! Per-provider call rate limiting.
//!
//! A window remembers when each of its last `calls` grants happened. A new
//! grant waits until the oldest one is a full window old, so no rolling
//! window ever holds more than `calls` grants.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Rate limit of `calls` per rolling `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub calls: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(calls: u32, window: Duration) -> Self {
        Self { calls, window }
    }
}

/// Sliding-window log of grant instants
#[derive(Debug)]
pub struct RateWindow {
    limit: RateLimit,
    grants: Mutex<VecDeque<Instant>>,
}

impl RateWindow {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            calls: limit.calls.max(1),
            window: limit.window,
        };
        Self {
            limit,
            grants: Mutex::new(VecDeque::with_capacity(limit.calls as usize)),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Record a grant, waiting until the window has room
    ///
    /// Dropping the returned future while it waits takes nothing.
    pub async fn acquire(&self) {
        loop {
            let ready_at = {
                let mut grants = self.grants.lock().await;
                let now = Instant::now();
                Self::expire(&mut grants, now, self.limit.window);

                if grants.len() < self.limit.calls as usize {
                    grants.push_back(now);
                    return;
                }

                match grants.front() {
                    Some(oldest) => *oldest + self.limit.window,
                    None => now,
                }
            };
            sleep_until(ready_at).await;
        }
    }

    /// Grants available right now
    pub async fn available(&self) -> u32 {
        let mut grants = self.grants.lock().await;
        Self::expire(&mut grants, Instant::now(), self.limit.window);
        self.limit.calls - grants.len() as u32
    }

    fn expire(grants: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = grants.front() {
            if now.duration_since(*oldest) >= window {
                grants.pop_front();
            } else {
                break;
            }
        }
    }
}
