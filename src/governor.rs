use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// Sliding-window request budget: no window of length `window` ever records
/// more than `budget` reservations.
pub struct RateGovernor {
    budget: u32,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateGovernor {
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            budget,
            window,
            issued: Mutex::new(VecDeque::with_capacity(budget as usize)),
        }
    }

    /// Suspends until `cost` more requests fit in the window, then records them.
    pub async fn reserve(&self, cost: u32) -> Result<()> {
        if cost == 0 {
            return Ok(());
        }
        if cost > self.budget {
            return Err(Error::InvalidParameter(format!(
                "cost {cost} exceeds rate budget {}",
                self.budget
            )));
        }

        loop {
            let wait = {
                let mut issued = self.issued.lock().await;
                let now = Instant::now();
                self.expire(&mut issued, now);

                let needed = issued.len() + cost as usize;
                if needed <= self.budget as usize {
                    issued.extend(std::iter::repeat_n(now, cost as usize));
                    return Ok(());
                }
                // The entry whose expiry frees enough room for this reservation.
                let blocking = issued[needed - self.budget as usize - 1];
                (blocking + self.window).saturating_duration_since(now)
            };
            debug!(cost, wait_ms = wait.as_millis() as u64, "rate budget exhausted, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn remaining(&self) -> u32 {
        let mut issued = self.issued.lock().await;
        self.expire(&mut issued, Instant::now());
        self.budget.saturating_sub(issued.len() as u32)
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    fn expire(&self, issued: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = issued.front()
            && oldest + self.window <= now
        {
            issued.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn reserve_within_budget_is_immediate() {
        let gov = RateGovernor::new(10, Duration::from_secs(60));
        let start = Instant::now();
        gov.reserve(4).await.unwrap();
        gov.reserve(4).await.unwrap();
        assert_eq!(Instant::now(), start);
        assert_eq!(gov.remaining().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_suspends_until_window_slides() {
        let gov = RateGovernor::new(4, Duration::from_secs(60));
        let start = Instant::now();
        gov.reserve(4).await.unwrap();
        gov.reserve(1).await.unwrap();
        assert!(Instant::now() - start >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn cost_above_budget_is_rejected() {
        let gov = RateGovernor::new(3, Duration::from_secs(60));
        assert!(matches!(gov.reserve(4).await, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_recovers_after_window() {
        let gov = RateGovernor::new(5, Duration::from_secs(10));
        gov.reserve(5).await.unwrap();
        assert_eq!(gov.remaining().await, 0);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(gov.remaining().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn no_window_exceeds_budget_under_contention() {
        let window = Duration::from_secs(30);
        let gov = Arc::new(RateGovernor::new(5, window));
        let start = Instant::now();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gov = gov.clone();
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..3 {
                    gov.reserve(1).await.unwrap();
                    log.lock().unwrap().push(Instant::now() - start);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let times = log.lock().unwrap().clone();
        assert_eq!(times.len(), 24);
        for &t in &times {
            let in_window = times.iter().filter(|&&o| o >= t && o < t + window).count();
            assert!(in_window <= 5, "{in_window} requests within one window");
        }
    }
}
