// ============================================
// CHORUS - Dispatch Metrics
// ============================================

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Counters and latency samples collected by the orchestrator.
pub struct Metrics {
    timers: RwLock<HashMap<String, Vec<Duration>>>,
    counters: RwLock<HashMap<String, u64>>,
    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            timers: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn record_time(&self, name: &str, duration: Duration) {
        self.timers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .push(duration);
    }

    pub fn increment(&self, name: &str) {
        *self
            .counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Record the outcome of one provider call
    pub fn record_provider(&self, provider: &str, success: bool, latency: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.increment(&format!("provider.{}.{}", provider, outcome));
        self.record_time(&format!("provider.{}.latency", provider), latency);
    }

    pub fn get_timing_stats(&self, name: &str) -> Option<TimingStats> {
        let timers = self.timers.read().unwrap_or_else(PoisonError::into_inner);
        TimingStats::from_samples(timers.get(name)?)
    }

    pub fn summary(&self) -> MetricsSummary {
        let timings = self
            .timers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(name, samples)| {
                TimingStats::from_samples(samples).map(|s| (name.clone(), s))
            })
            .collect();

        let counters = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        MetricsSummary {
            uptime: self.start_time.elapsed(),
            timings,
            counters,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimingStats {
    pub count: usize,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p95: Duration,
}

impl TimingStats {
    fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort();
        let count = sorted.len();
        let total: Duration = sorted.iter().sum();
        let p95_index = ((count as f64 * 0.95) as usize).min(count - 1);

        Some(Self {
            count,
            avg: total / count as u32,
            min: sorted[0],
            max: sorted[count - 1],
            p50: sorted[count / 2],
            p95: sorted[p95_index],
        })
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub uptime: Duration,
    pub timings: BTreeMap<String, TimingStats>,
    pub counters: BTreeMap<String, u64>,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Uptime: {:?}", self.uptime)?;

        if !self.counters.is_empty() {
            writeln!(f, "Counters:")?;
            for (name, value) in &self.counters {
                writeln!(f, "  {}: {}", name, value)?;
            }
        }

        if !self.timings.is_empty() {
            writeln!(f, "Latency:")?;
            for (name, stats) in &self.timings {
                writeln!(
                    f,
                    "  {}: count={}, avg={:?}, p50={:?}, p95={:?}, max={:?}",
                    name, stats.count, stats.avg, stats.p50, stats.p95, stats.max
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let metrics = Metrics::new();
        metrics.increment("cache.hit");
        metrics.increment("cache.hit");

        assert_eq!(metrics.get_counter("cache.hit"), 2);
        assert_eq!(metrics.get_counter("cache.miss"), 0);
    }

    #[test]
    fn test_record_provider() {
        let metrics = Metrics::new();
        metrics.record_provider("claude", true, Duration::from_millis(10));
        metrics.record_provider("claude", true, Duration::from_millis(30));
        metrics.record_provider("claude", false, Duration::from_millis(20));

        assert_eq!(metrics.get_counter("provider.claude.success"), 2);
        assert_eq!(metrics.get_counter("provider.claude.failure"), 1);

        let stats = metrics.get_timing_stats("provider.claude.latency").unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(30));
        assert_eq!(stats.p50, Duration::from_millis(20));
    }

    #[test]
    fn test_summary_display() {
        let metrics = Metrics::new();
        metrics.increment("cache.miss");
        metrics.record_time("provider.grok.latency", Duration::from_millis(5));

        let rendered = metrics.summary().to_string();
        assert!(rendered.contains("cache.miss: 1"));
        assert!(rendered.contains("provider.grok.latency"));
    }
}
