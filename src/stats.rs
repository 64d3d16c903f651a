//! # Statistics hub
//!
//! Per-stage counters and timers, exposed for external reporting. The
//! reporting transport itself (shipping these numbers to a collector) is
//! a named external collaborator; this module only implements the
//! in-process registry and the `StatSink` trait a transport would plug
//! into, separating counter bookkeeping from report delivery.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A single named counter, monotonically increasing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter(u64);

impl Counter {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A single named timer: count of samples and their total duration, so
/// the mean can be recovered by a reporting transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timer {
    samples: u64,
    total: Duration,
}

impl Timer {
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn mean(&self) -> Duration {
        if self.samples == 0 {
            Duration::default()
        } else {
            self.total / self.samples as u32
        }
    }
}

/// Session-scoped counter/timer registry, passed by reference into
/// stages at construction rather than reached through a global.
#[derive(Default)]
pub struct StatsHub {
    counters: Mutex<HashMap<&'static str, Counter>>,
    timers: Mutex<HashMap<&'static str, Timer>>,
}

impl StatsHub {
    pub fn new() -> StatsHub {
        StatsHub::default()
    }

    pub fn incr(&self, name: &'static str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &'static str, amount: u64) {
        let mut counters = self.counters.lock().unwrap();
        counters.entry(name).or_insert_with(Counter::default).0 += amount;
    }

    pub fn record(&self, name: &'static str, elapsed: Duration) {
        let mut timers = self.timers.lock().unwrap();
        let timer = timers.entry(name).or_insert_with(Timer::default);
        timer.samples += 1;
        timer.total += elapsed;
    }

    /// Time a closure and record it under `name`.
    pub fn time<T>(&self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.record(name, start.elapsed());
        result
    }

    pub fn counter(&self, name: &str) -> Counter {
        self.counters.lock().unwrap().get(name).copied().unwrap_or_default()
    }

    pub fn timer(&self, name: &str) -> Timer {
        self.timers.lock().unwrap().get(name).copied().unwrap_or_default()
    }

    /// Snapshot every counter, for a `StatSink` to publish.
    pub fn counter_snapshot(&self) -> HashMap<&'static str, u64> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .map(|(&k, v)| (k, v.0))
            .collect()
    }
}

/// External reporting transport interface. Implementations of this
/// trait live outside this crate.
pub trait StatSink {
    fn publish(&self, counters: HashMap<&'static str, u64>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let hub = StatsHub::new();
        hub.incr("frames_sifted");
        hub.incr_by("frames_sifted", 4);
        assert_eq!(hub.counter("frames_sifted").value(), 5);
    }

    #[test]
    fn timers_accumulate_samples() {
        let hub = StatsHub::new();
        hub.record("align", Duration::from_millis(10));
        hub.record("align", Duration::from_millis(30));
        let t = hub.timer("align");
        assert_eq!(t.samples(), 2);
        assert_eq!(t.mean(), Duration::from_millis(20));
    }

    #[test]
    fn unknown_counter_defaults_to_zero() {
        let hub = StatsHub::new();
        assert_eq!(hub.counter("nope").value(), 0);
    }
}
