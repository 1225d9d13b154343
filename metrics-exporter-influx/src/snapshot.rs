/// A point-in-time copy of a single metric's value(s).
///
/// Registries hand these to the exporter while being visited, which decouples conversion into points from any
/// concurrent updates happening to the live metric.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricSnapshot {
    /// A monotonic (or up/down) count.
    Counter(i64),

    /// An instantaneous value.
    Gauge(GaugeValue),

    /// A distribution of recorded values.
    Histogram(HistogramSnapshot),

    /// A rate of events.
    Meter(MeterSnapshot),

    /// A distribution of durations along with the rate at which they were recorded.
    Timer(TimerSnapshot),
}

/// Value of a gauge, preserving whether the source gauge was integral or floating-point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GaugeValue {
    /// Integral gauge value.
    Integer(i64),

    /// Floating-point gauge value.
    Float(f64),
}

impl From<i64> for GaugeValue {
    fn from(value: i64) -> Self {
        GaugeValue::Integer(value)
    }
}

impl From<f64> for GaugeValue {
    fn from(value: f64) -> Self {
        GaugeValue::Float(value)
    }
}

/// Snapshot of a histogram.
///
/// Holds the sorted samples the histogram had at the time of the snapshot, along with the total number of values
/// recorded. The two can differ when the histogram samples its input, so `count` is tracked separately.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistogramSnapshot {
    count: u64,
    values: Vec<f64>,
}

impl HistogramSnapshot {
    /// Creates a snapshot from the given samples, with the count equal to the number of samples.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut values = values.into_iter().filter(|v| !v.is_nan()).collect::<Vec<_>>();
        values.sort_by(f64::total_cmp);

        Self { count: values.len() as u64, values }
    }

    /// Overrides the total count of values recorded.
    #[must_use]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    /// Total number of values recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sorted samples held by this snapshot.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Smallest sample, or 0 if empty.
    pub fn min(&self) -> f64 {
        self.values.first().copied().unwrap_or(0.0)
    }

    /// Largest sample, or 0 if empty.
    pub fn max(&self) -> f64 {
        self.values.last().copied().unwrap_or(0.0)
    }

    /// Arithmetic mean of the samples, or 0 if empty.
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }

        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance of the samples, or 0 if empty.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }

        let mean = self.mean();
        let sum = self.values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
        sum / self.values.len() as f64
    }

    /// Population standard deviation of the samples, or 0 if empty.
    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Calculates the value at each of the given quantiles, in order.
    ///
    /// Quantiles are expressed in the range `[0, 1]`. For `n` samples, quantile `p` sits at position
    /// `pos = p * (n + 1)`: positions below 1 resolve to the smallest sample, positions at or beyond `n` resolve to the
    /// largest sample, and anything in between is linearly interpolated between its two neighboring samples.
    pub fn percentiles(&self, quantiles: &[f64]) -> Vec<f64> {
        let size = self.values.len();
        if size == 0 {
            return vec![0.0; quantiles.len()];
        }

        quantiles
            .iter()
            .map(|p| {
                let pos = p * (size + 1) as f64;
                if pos < 1.0 {
                    self.values[0]
                } else if pos >= size as f64 {
                    self.values[size - 1]
                } else {
                    let lower = self.values[pos as usize - 1];
                    let upper = self.values[pos as usize];
                    lower + (pos - pos.floor()) * (upper - lower)
                }
            })
            .collect()
    }
}

/// Snapshot of a meter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeterSnapshot {
    /// Total number of events marked.
    pub count: u64,

    /// One-minute exponentially-weighted moving average rate, in events per second.
    pub rate1: f64,

    /// Five-minute exponentially-weighted moving average rate, in events per second.
    pub rate5: f64,

    /// Fifteen-minute exponentially-weighted moving average rate, in events per second.
    pub rate15: f64,

    /// Mean rate since the meter was created, in events per second.
    pub rate_mean: f64,
}

/// Snapshot of a timer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimerSnapshot {
    /// Distribution of the recorded durations.
    pub histogram: HistogramSnapshot,

    /// Rate at which durations were recorded.
    pub rates: MeterSnapshot,
}
