use hdrhistogram::Histogram;
use serde::Serialize;

/// Percentile breakdown of probe latency, in milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct PercentileSet {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub count: u64,
}

impl PercentileSet {
    /// Zeroed when the histogram is empty.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::empty();
        }

        Self {
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p90: hist.value_at_quantile(0.90),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p999: hist.value_at_quantile(0.999),
            count: hist.len(),
        }
    }

    pub fn empty() -> Self {
        Self {
            min: 0,
            max: 0,
            mean: 0.0,
            p50: 0,
            p90: 0,
            p95: 0,
            p99: 0,
            p999: 0,
            count: 0,
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        if !self.has_data() {
            return "no samples".into();
        }
        format!(
            "n={} min={}ms p50={}ms p90={}ms p95={}ms p99={}ms max={}ms",
            self.count, self.min, self.p50, self.p90, self.p95, self.p99, self.max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_is_zeroed() {
        let hist = Histogram::<u64>::new_with_bounds(1, 3_600_000, 3).unwrap();
        let set = PercentileSet::from_histogram(&hist);
        assert!(!set.has_data());
        assert_eq!(set.summary(), "no samples");
    }

    #[test]
    fn percentiles_follow_recorded_values() {
        let mut hist = Histogram::<u64>::new_with_bounds(1, 3_600_000, 3).unwrap();
        for v in 1..=100u64 {
            hist.record(v).unwrap();
        }
        let set = PercentileSet::from_histogram(&hist);
        assert_eq!(set.count, 100);
        assert_eq!(set.min, 1);
        assert_eq!(set.max, 100);
        assert_eq!(set.p50, 50);
        assert_eq!(set.p95, 95);
        assert!(set.summary().starts_with("n=100 "));
    }
}
