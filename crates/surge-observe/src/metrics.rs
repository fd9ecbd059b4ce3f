use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic event count.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A value that moves both ways (queue depth, in-flight writes).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Returns the value after the addition.
    pub fn add(&self, delta: u64) -> u64 {
        self.0.fetch_add(delta, Ordering::Relaxed).saturating_add(delta)
    }

    pub fn sub(&self, delta: u64) {
        let mut prev = self.0.load(Ordering::Relaxed);
        loop {
            let next = prev.saturating_sub(delta);
            match self
                .0
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Raises the gauge to `value` if it is currently lower (high-water marks).
    pub fn max(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Adds one until the returned guard drops, even if the owning future is cancelled.
    pub fn enter(&self) -> GaugeGuard<'_> {
        let level = self.add(1);
        GaugeGuard { gauge: self, level }
    }
}

pub struct GaugeGuard<'a> {
    gauge: &'a Gauge,
    level: u64,
}

impl GaugeGuard<'_> {
    /// Gauge value right after this guard was taken.
    pub fn level(&self) -> u64 {
        self.level
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.sub(1);
    }
}

/// Lock-free latency summary: sample count, total, fastest and slowest sample.
#[derive(Debug)]
pub struct LatencyAgg {
    samples: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Default for LatencyAgg {
    fn default() -> Self {
        Self {
            samples: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }
}

impl LatencyAgg {
    pub fn record(&self, latency: Duration) {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    /// Starts a sample that is recorded when the returned timer drops.
    pub fn start(&self) -> LatencyTimer<'_> {
        LatencyTimer {
            started: Instant::now(),
            agg: self,
        }
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return LatencySnapshot::default();
        }
        LatencySnapshot {
            samples,
            total: Duration::from_nanos(self.total_ns.load(Ordering::Relaxed)),
            min: Duration::from_nanos(self.min_ns.load(Ordering::Relaxed)),
            max: Duration::from_nanos(self.max_ns.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub samples: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl LatencySnapshot {
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.samples) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_nanos(
                u64::try_from(self.total.as_nanos() / u128::from(self.samples)).unwrap_or(0),
            ),
        }
    }
}

pub struct LatencyTimer<'a> {
    started: Instant,
    agg: &'a LatencyAgg,
}

impl Drop for LatencyTimer<'_> {
    fn drop(&mut self) {
        self.agg.record(self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_high_water() {
        let g = Gauge::default();
        let hw = Gauge::default();
        hw.max(g.add(5));
        hw.max(g.add(3));
        g.sub(6);
        hw.max(g.get());
        assert_eq!(g.get(), 2);
        assert_eq!(hw.get(), 8);
    }

    #[test]
    fn gauge_sub_saturates_at_zero() {
        let g = Gauge::default();
        g.add(1);
        g.sub(10);
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn gauge_guard_releases_on_drop() {
        let g = Gauge::default();
        {
            let a = g.enter();
            let b = g.enter();
            assert_eq!((a.level(), b.level()), (1, 2));
        }
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn latency_agg_reports_min_mean_max() {
        let agg = LatencyAgg::default();
        agg.record(Duration::from_micros(10));
        agg.record(Duration::from_micros(30));
        agg.record(Duration::from_micros(20));
        let snap = agg.snapshot();
        assert_eq!(snap.samples, 3);
        assert_eq!(snap.min, Duration::from_micros(10));
        assert_eq!(snap.max, Duration::from_micros(30));
        assert_eq!(snap.mean(), Duration::from_micros(20));
    }

    #[test]
    fn empty_latency_agg_is_all_zero() {
        let snap = LatencyAgg::default().snapshot();
        assert_eq!(snap, LatencySnapshot::default());
        assert_eq!(snap.mean(), Duration::ZERO);
    }

    #[test]
    fn timer_records_one_sample_on_drop() {
        let agg = LatencyAgg::default();
        drop(agg.start());
        assert_eq!(agg.snapshot().samples, 1);
    }
}
