use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::MonitorResult;

// ─── Deadline ────────────────────────────────────────────────────

/// Wall-clock budget anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Saturates at `Instant` far in the future for absurd limits.
    pub fn at(&self) -> Instant {
        self.started
            .checked_add(self.limit)
            .unwrap_or_else(|| self.started + Duration::from_secs(86_400 * 365))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.at().saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at()
    }

    /// Sleeps for `pause`, cut short at the deadline.
    /// Returns `false` if the deadline was reached.
    pub async fn sleep(&self, pause: Duration) -> bool {
        let wake = Instant::now()
            .checked_add(pause)
            .map_or(self.at(), |t| t.min(self.at()));
        tokio::time::sleep_until(wake).await;
        !self.expired()
    }
}

// ─── Poll schedules ──────────────────────────────────────────────

/// One step of a tiered schedule: `interval` applies while the tick
/// index is below `until_tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    pub until_tick: u32,
    pub interval: Duration,
}

/// Pause between ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Fixed(Duration),
    /// Intervals grow as the wait drags on; the last tier applies forever.
    Tiered(Vec<Tier>),
}

impl Schedule {
    /// Short / medium / long tiers used for slow cross-service sync:
    /// 10 s for the first 12 ticks, 60 s until tick 22, then 300 s.
    pub fn slow_sync() -> Self {
        Self::Tiered(vec![
            Tier {
                until_tick: 12,
                interval: Duration::from_secs(10),
            },
            Tier {
                until_tick: 22,
                interval: Duration::from_secs(60),
            },
            Tier {
                until_tick: u32::MAX,
                interval: Duration::from_secs(300),
            },
        ])
    }

    pub fn interval_for(&self, tick: u32) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Tiered(tiers) => tiers
                .iter()
                .find(|t| tick < t.until_tick)
                .or_else(|| tiers.last())
                .map_or(Duration::ZERO, |t| t.interval),
        }
    }
}

// ─── Bounded retry ───────────────────────────────────────────────

/// Runs `op` once plus up to `retries` more times, returning the first
/// success or the last error. No pause between attempts; callers already
/// pace themselves by tick.
pub async fn retry_bounded<T, F, Fut>(what: &str, retries: u32, mut op: F) -> MonitorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MonitorResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!("{what}: attempt {attempt}/{retries} failed: {e}");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whole milliseconds; sub-millisecond precision is dropped.
pub fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn slow_sync_tiers() {
        let s = Schedule::slow_sync();
        assert_eq!(s.interval_for(0), Duration::from_secs(10));
        assert_eq!(s.interval_for(11), Duration::from_secs(10));
        assert_eq!(s.interval_for(12), Duration::from_secs(60));
        assert_eq!(s.interval_for(21), Duration::from_secs(60));
        assert_eq!(s.interval_for(22), Duration::from_secs(300));
        assert_eq!(s.interval_for(10_000), Duration::from_secs(300));
    }

    #[test]
    fn tiered_falls_back_to_last_tier() {
        let s = Schedule::Tiered(vec![Tier {
            until_tick: 2,
            interval: Duration::from_secs(1),
        }]);
        assert_eq!(s.interval_for(5), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_sleep_is_cut_short() {
        let d = Deadline::after(Duration::from_secs(3));
        assert!(d.sleep(Duration::from_secs(2)).await);
        assert!(!d.sleep(Duration::from_secs(2)).await);
        assert!(d.elapsed() >= Duration::from_secs(3));
        assert!(d.elapsed() < Duration::from_secs(4));
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn retry_bounded_stops_after_budget() {
        let calls = AtomicU32::new(0);
        let res: MonitorResult<()> = retry_bounded("stats", 2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MonitorError::infra("stats", "503")) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_bounded_returns_first_success() {
        let calls = AtomicU32::new(0);
        let res = retry_bounded("stats", 5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(MonitorError::infra("stats", "reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 1);
    }

    #[test]
    fn millis_truncates() {
        assert_eq!(as_millis(Duration::from_micros(240_900)), 240);
    }
}
