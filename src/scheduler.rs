// Throttle Scheduler - phase-locked tick deadlines
use std::time::{Duration, Instant};

/// Tracks the target time of the current tick. The next target is always the
/// previous target plus one interval, so per-tick processing time never
/// accumulates into drift.
#[derive(Debug, Clone)]
pub struct Ticker {
    target: Instant,
}

impl Ticker {
    /// First tick is due at `start`.
    pub fn new(start: Instant) -> Self {
        Ticker { target: start }
    }

    /// Target time of the tick currently being processed.
    pub fn target(&self) -> Instant {
        self.target
    }

    /// Time left in the current tick's budget.
    pub fn remaining(&self, now: Instant, interval: Duration) -> Duration {
        (self.target + interval).saturating_duration_since(now)
    }

    /// Advance to the next tick and return how long to sleep until it is due.
    ///
    /// Returns zero when processing overran. If the loop fell more than a whole
    /// interval behind (a stalled capture, a suspended machine) the schedule is
    /// re-anchored at `now` instead of firing a burst of catch-up ticks.
    pub fn advance(&mut self, now: Instant, interval: Duration) -> Duration {
        let mut next = self.target + interval;
        if now.saturating_duration_since(next) > interval {
            next = now;
        }
        self.target = next;
        next.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Deterministic per-tick workloads below the interval
    fn workload(i: u64, interval_ms: u64) -> Duration {
        Duration::from_micros((i * 7919 + 13) % (interval_ms * 1000 - 1))
    }

    #[test]
    fn average_period_matches_interval() {
        let interval = Duration::from_millis(200);
        let start = Instant::now();
        let mut ticker = Ticker::new(start);
        let mut tick_start = start;
        let ticks = 1000u32;

        for i in 0..ticks {
            let done = tick_start + workload(u64::from(i), 200);
            let sleep = ticker.advance(done, interval);
            tick_start = done + sleep;
        }

        // Every tick fires exactly on the fixed grid regardless of workload
        assert_eq!(tick_start, start + interval * ticks);
        assert_eq!((tick_start - start) / ticks, interval);
    }

    #[test]
    fn sleep_is_interval_minus_elapsed() {
        let start = Instant::now();
        let mut ticker = Ticker::new(start);
        let sleep = ticker.advance(start + Duration::from_millis(30), Duration::from_millis(100));
        assert_eq!(sleep, Duration::from_millis(70));
        assert_eq!(ticker.target(), start + Duration::from_millis(100));
    }

    #[test]
    fn overrun_fires_immediately_then_recovers_phase() {
        let interval = Duration::from_millis(100);
        let start = Instant::now();
        let mut ticker = Ticker::new(start);

        // Tick 0 overruns by 50ms: tick 1 is due now
        let sleep = ticker.advance(start + Duration::from_millis(150), interval);
        assert_eq!(sleep, Duration::ZERO);

        // Tick 1 is quick: tick 2 lands back on the grid
        let sleep = ticker.advance(start + Duration::from_millis(160), interval);
        assert_eq!(sleep, Duration::from_millis(40));
        assert_eq!(ticker.target(), start + Duration::from_millis(200));
    }

    #[test]
    fn long_stall_reanchors() {
        let interval = Duration::from_millis(100);
        let start = Instant::now();
        let mut ticker = Ticker::new(start);
        let now = start + Duration::from_secs(5);
        assert_eq!(ticker.advance(now, interval), Duration::ZERO);
        assert_eq!(ticker.target(), now);
        assert_eq!(ticker.advance(now + Duration::from_millis(10), interval), Duration::from_millis(90));
    }

    #[test]
    fn remaining_budget() {
        let start = Instant::now();
        let ticker = Ticker::new(start);
        let interval = Duration::from_millis(100);
        assert_eq!(ticker.remaining(start + Duration::from_millis(25), interval), Duration::from_millis(75));
        assert_eq!(ticker.remaining(start + Duration::from_millis(250), interval), Duration::ZERO);
    }
}
