use std::time::{Duration, Instant};

use tracing::debug;

use super::traits::ProgressFn;
use crate::config::PROGRESS_THROTTLE_MS;

/// Forwards progress to a sink at most twice per second; the final update
/// (`current == total`) always goes through.
pub struct ProgressThrottle<'a> {
    sink: Option<&'a ProgressFn>,
    interval: Duration,
    last_event: Instant,
}

impl<'a> ProgressThrottle<'a> {
    pub fn new(sink: Option<&'a ProgressFn>) -> Self {
        Self::with_interval(sink, Duration::from_millis(PROGRESS_THROTTLE_MS))
    }

    pub fn with_interval(sink: Option<&'a ProgressFn>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            last_event: Instant::now(),
        }
    }

    pub fn report(&mut self, current: u64, total: u64) {
        let Some(sink) = self.sink else {
            return;
        };
        if current != total && self.last_event.elapsed() < self.interval {
            return;
        }
        self.last_event = Instant::now();
        debug!("progress {}/{}", current, total);
        sink(current, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_throttle_drops_intermediate_but_keeps_final() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let sink = move |cur: u64, total: u64| recorded.lock().push((cur, total));
        {
            let mut throttle = ProgressThrottle::new(Some(&sink));
            for cur in 1..100 {
                throttle.report(cur, 100);
            }
            throttle.report(100, 100);
        }
        assert_eq!(*events.lock(), vec![(100, 100)]);
    }

    #[test]
    fn test_throttle_fires_after_interval() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let sink = move |cur: u64, total: u64| recorded.lock().push((cur, total));
        {
            let mut throttle = ProgressThrottle::with_interval(Some(&sink), Duration::ZERO);
            throttle.report(10, 100);
            throttle.report(20, 100);
        }
        assert_eq!(events.lock().len(), 2);
    }
}
