/*! Monotonic timing helpers.

A [`Timing`] accumulates wall-clock intervals (start/stop may be called many
times; the intervals add up), and an [`Ema`] keeps an exponential moving
average over a series of samples. Workers account for the time they sleep on
their mailbox with a `Timing`; every task keeps an `Ema` of its activation
lengths (surfaced through the run-time accessors on
[`TaskHandle`](crate::TaskHandle)). Monitoring implementations will typically
want both for wait-ratio bookkeeping as well.
*/

use std::time::{Duration, Instant};

/// An accumulating stopwatch over the monotonic clock.
#[derive(Debug, Clone, Default)]
pub struct Timing {
    acc: Duration,
    started: Option<Instant>,
}

impl Timing {
    pub fn new() -> Timing {
        Timing::default()
    }

    /// Start (or restart) an interval.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// End the current interval and add it to the accumulated total.
    ///
    /// Ending without a matching `start` is a no-op.
    pub fn end(&mut self) {
        if let Some(t0) = self.started.take() {
            self.acc += t0.elapsed();
        }
    }

    /// Add another timing's accumulated total to this one.
    pub fn add(&mut self, other: &Timing) {
        self.acc += other.acc;
    }

    /// The accumulated total so far.
    pub fn total(&self) -> Duration {
        self.acc
    }

    pub fn as_nanos(&self) -> u128 {
        self.acc.as_nanos()
    }
}

/// Exponential moving average: `avg' = alpha * sample + (1 - alpha) * avg`.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    avg: f64,
    alpha: f64,
}

impl Ema {
    /// `alpha` is the weight of a new sample, in (0, 1].
    pub fn new(alpha: f64) -> Ema {
        debug_assert!(alpha > 0.0 && alpha <= 1.0);
        Ema { avg: 0.0, alpha }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        self.avg = self.alpha * sample + (1.0 - self.alpha) * self.avg;
        self.avg
    }

    pub fn get(&self) -> f64 {
        self.avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn timing_accumulates() {
        let mut t = Timing::new();
        t.start();
        thread::sleep(Duration::from_millis(2));
        t.end();
        let first = t.total();
        assert!(first >= Duration::from_millis(2));
        t.start();
        thread::sleep(Duration::from_millis(2));
        t.end();
        assert!(t.total() > first);
    }

    #[test]
    fn end_without_start_is_noop() {
        let mut t = Timing::new();
        t.end();
        assert_eq!(t.total(), Duration::ZERO);
    }

    #[test]
    fn ema_converges() {
        let mut e = Ema::new(0.5);
        for _ in 0..32 {
            e.update(10.0);
        }
        assert!((e.get() - 10.0).abs() < 1e-6);
    }
}
