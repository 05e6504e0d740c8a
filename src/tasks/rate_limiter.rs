use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use crate::config::RateLimits;

const SHORT_WINDOW: Duration = Duration::from_secs(1);
const DESTINATION_WINDOW: Duration = Duration::from_secs(60);
const REPORT_INTERVAL: Duration = Duration::from_secs(60);
const MIN_WAIT: Duration = Duration::from_millis(5);

/// Sliding-window limiter shared by every outbound send.
///
/// Three ceilings are enforced together: all traffic per second, one
/// recipient per second, and one destination per minute. A limit of zero
/// disables that ceiling.
pub struct RateLimiter {
    limits: RateLimits,
    state: Mutex<WindowState>,
}

struct WindowState {
    global: VecDeque<Instant>,
    per_recipient: HashMap<i64, VecDeque<Instant>>,
    per_destination: HashMap<i64, VecDeque<Instant>>,
    report_started: Instant,
    sends_since_report: u64,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(WindowState {
                global: VecDeque::new(),
                per_recipient: HashMap::new(),
                per_destination: HashMap::new(),
                report_started: Instant::now(),
                sends_since_report: 0,
            }),
        }
    }

    /// Waits until one more send to `destination` (and `recipient`, when
    /// given) fits every window, then records it.
    pub async fn acquire(&self, destination: i64, recipient: Option<i64>) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.prune(now);
                match state.required_wait(&self.limits, now, destination, recipient) {
                    None => {
                        state.record(now, destination, recipient);
                        return;
                    }
                    Some(wait) => wait,
                }
            };
            tracing::trace!(
                target: "ratelimit",
                destination,
                ?recipient,
                wait_ms = wait.as_millis() as u64,
                "rate limit saturated; waiting"
            );
            sleep(wait.max(MIN_WAIT)).await;
        }
    }
}

impl WindowState {
    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.global, now, SHORT_WINDOW);
        self.per_recipient.retain(|_, window| {
            prune_window(window, now, SHORT_WINDOW);
            !window.is_empty()
        });
        self.per_destination.retain(|_, window| {
            prune_window(window, now, DESTINATION_WINDOW);
            !window.is_empty()
        });
    }

    /// Longest wait among the saturated windows, or `None` if all have room.
    fn required_wait(
        &self,
        limits: &RateLimits,
        now: Instant,
        destination: i64,
        recipient: Option<i64>,
    ) -> Option<Duration> {
        let recipient_window = recipient.and_then(|id| self.per_recipient.get(&id));
        [
            saturation_wait(Some(&self.global), limits.global_per_sec, SHORT_WINDOW, now),
            saturation_wait(
                recipient_window,
                limits.per_recipient_per_sec,
                SHORT_WINDOW,
                now,
            ),
            saturation_wait(
                self.per_destination.get(&destination),
                limits.per_destination_per_min,
                DESTINATION_WINDOW,
                now,
            ),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    fn record(&mut self, now: Instant, destination: i64, recipient: Option<i64>) {
        self.global.push_back(now);
        if let Some(recipient) = recipient {
            self.per_recipient.entry(recipient).or_default().push_back(now);
        }
        self.per_destination
            .entry(destination)
            .or_default()
            .push_back(now);

        self.sends_since_report += 1;
        let elapsed = now.duration_since(self.report_started);
        if elapsed >= REPORT_INTERVAL {
            let per_sec = self.sends_since_report as f64 / elapsed.as_secs_f64();
            tracing::info!(
                target: "ratelimit",
                sends = self.sends_since_report,
                per_sec = %format!("{per_sec:.2}"),
                "outbound throughput"
            );
            self.report_started = now;
            self.sends_since_report = 0;
        }
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant, size: Duration) {
    while let Some(oldest) = window.front() {
        if now.duration_since(*oldest) >= size {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn saturation_wait(
    window: Option<&VecDeque<Instant>>,
    limit: usize,
    size: Duration,
    now: Instant,
) -> Option<Duration> {
    let window = window?;
    if limit == 0 || window.len() < limit {
        return None;
    }
    // The entry that has to expire is the one `limit` positions from the back.
    let blocking = window.get(window.len() - limit)?;
    Some((*blocking + size).saturating_duration_since(now))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn limits(global: usize, per_recipient: usize, per_destination: usize) -> RateLimits {
        RateLimits {
            global_per_sec: global,
            per_recipient_per_sec: per_recipient,
            per_destination_per_min: per_destination,
        }
    }

    fn max_in_window(stamps: &[Instant], size: Duration) -> usize {
        stamps
            .iter()
            .map(|start| {
                stamps
                    .iter()
                    .filter(|t| **t >= *start && t.duration_since(*start) < size)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn global_ceiling_delays_the_overflowing_send() {
        let limiter = RateLimiter::new(limits(3, 0, 0));
        let start = Instant::now();
        for id in 0..3 {
            limiter.acquire(id, Some(id)).await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire(99, Some(99)).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn same_recipient_waits_a_full_second() {
        let limiter = RateLimiter::new(limits(30, 1, 0));
        let start = Instant::now();
        limiter.acquire(1, Some(1)).await;
        limiter.acquire(2, Some(2)).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire(1, Some(1)).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn destination_ceiling_spans_a_minute() {
        let limiter = RateLimiter::new(limits(30, 0, 2));
        let start = Instant::now();
        limiter.acquire(-100, None).await;
        limiter.acquire(-100, None).await;
        limiter.acquire(-200, None).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire(-100, None).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn binding_window_is_the_longest_one() {
        let limiter = RateLimiter::new(limits(1, 1, 1));
        let start = Instant::now();
        limiter.acquire(5, Some(5)).await;
        // Global and recipient free up after 1s, the destination only after 60s.
        limiter.acquire(5, Some(5)).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_any_window() {
        let limiter = Arc::new(RateLimiter::new(limits(5, 1, 20)));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for worker in 0..4_i64 {
            let limiter = limiter.clone();
            let stamps = stamps.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..10_i64 {
                    let recipient = (worker * 10 + n) % 7;
                    limiter.acquire(recipient, Some(recipient)).await;
                    stamps.lock().push((recipient, Instant::now()));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stamps = stamps.lock().clone();
        assert_eq!(stamps.len(), 40);
        let all: Vec<Instant> = stamps.iter().map(|(_, t)| *t).collect();
        assert!(max_in_window(&all, SHORT_WINDOW) <= 5);
        for recipient in 0..7 {
            let own: Vec<Instant> = stamps
                .iter()
                .filter(|(id, _)| *id == recipient)
                .map(|(_, t)| *t)
                .collect();
            assert!(max_in_window(&own, SHORT_WINDOW) <= 1);
            assert!(max_in_window(&own, DESTINATION_WINDOW) <= 20);
        }
    }

    #[test]
    fn empty_windows_are_pruned() {
        let limiter = RateLimiter::new(limits(30, 1, 20));
        let now = Instant::now();
        {
            let mut state = limiter.state.lock();
            state.record(now, 1, Some(1));
            state.prune(now + DESTINATION_WINDOW);
            assert!(state.global.is_empty());
            assert!(state.per_recipient.is_empty());
            assert!(state.per_destination.is_empty());
        }
    }
}
