use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::rng();
    let timeout_ms = rng.random_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Single-shot election deadline owned by the node.
///
/// Every re-arm draws a fresh random duration and bumps `epoch`; a timeout
/// observed for an older epoch is stale and must be ignored.
#[derive(Debug)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    deadline: Instant,
    epoch: u64,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms,
            deadline: Instant::now() + random_election_timeout(min_ms, max_ms),
            epoch: 0,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.deadline = now + random_election_timeout(self.min_ms, self.max_ms);
        self.epoch += 1;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Fixed-interval heartbeat schedule, armed only while leading.
#[derive(Debug)]
pub struct HeartbeatTimer {
    interval: Duration,
    next: Option<Instant>,
}

impl HeartbeatTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.next = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    pub fn next(&self) -> Option<Instant> {
        self.next
    }

    /// Returns true and schedules the next beat when a beat is due.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next {
            Some(at) if now >= at => {
                self.next = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_timeout_stays_in_range() {
        for _ in 0..100 {
            let t = random_election_timeout(150, 300);
            assert!(t >= Duration::from_millis(150) && t <= Duration::from_millis(300));
        }
    }

    #[test]
    fn reset_bumps_epoch_and_moves_deadline() {
        let mut timer = ElectionTimer::new(150, 300);
        let epoch = timer.epoch();
        let now = Instant::now() + Duration::from_secs(10);

        timer.reset(now);

        assert!(!timer.is_current(epoch));
        assert!(timer.is_current(epoch + 1));
        assert!(timer.deadline() >= now + Duration::from_millis(150));
        assert!(!timer.expired(now));
        assert!(timer.expired(now + Duration::from_millis(300)));
    }

    #[test]
    fn heartbeat_fires_only_when_started_and_due() {
        let mut hb = HeartbeatTimer::new(Duration::from_millis(50));
        let now = Instant::now();
        assert!(!hb.poll(now + Duration::from_secs(1)));

        hb.start(now);
        assert!(!hb.poll(now + Duration::from_millis(10)));
        assert!(hb.poll(now + Duration::from_millis(50)));
        assert_eq!(hb.next(), Some(now + Duration::from_millis(100)));

        hb.stop();
        assert!(hb.next().is_none());
    }
}
