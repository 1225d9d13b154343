use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    point::{FieldValue, Point},
    registry::Registry,
    snapshot::{GaugeValue, HistogramSnapshot, MeterSnapshot, MetricSnapshot},
};

/// Set of percentiles emitted for histograms and timers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PercentileSet {
    /// p50, p75, p95, and p99.
    Standard,

    /// p50, p75, p95, p99, p999, and p9999.
    #[default]
    Extended,
}

impl PercentileSet {
    const STANDARD: &'static [(&'static str, f64)] =
        &[("p50", 0.5), ("p75", 0.75), ("p95", 0.95), ("p99", 0.99)];
    const EXTENDED: &'static [(&'static str, f64)] = &[
        ("p50", 0.5),
        ("p75", 0.75),
        ("p95", 0.95),
        ("p99", 0.99),
        ("p999", 0.999),
        ("p9999", 0.9999),
    ];

    /// Statistic names and quantiles in this set.
    pub fn quantiles(self) -> &'static [(&'static str, f64)] {
        match self {
            PercentileSet::Standard => Self::STANDARD,
            PercentileSet::Extended => Self::EXTENDED,
        }
    }
}

/// Metric kind, as reflected in the suffix of a field key.
#[derive(Clone, Copy)]
enum Kind {
    Counter,
    Gauge,
    Histogram,
    Meter,
    Timer,
}

impl Kind {
    fn suffix(self) -> &'static str {
        match self {
            Kind::Counter => "count",
            Kind::Gauge => "gauge",
            Kind::Histogram => "histogram",
            Kind::Meter => "meter",
            Kind::Timer => "timer",
        }
    }
}

fn field_key(name: &str, kind: Kind) -> String {
    format!("{}.{}", name, kind.suffix())
}

/// Settings controlling how snapshots are turned into points.
#[derive(Clone, Debug)]
pub(crate) struct ExportConfiguration {
    /// Measurement every point is written to.
    pub measurement: String,

    /// Tags applied to every point.
    pub tags: BTreeMap<String, String>,

    /// Tag key identifying the statistic carried by a histogram, meter, or timer point.
    pub statistic_tag_key: String,

    /// Percentiles emitted for histograms and timers.
    pub percentiles: PercentileSet,

    /// Reporting interval, used when aligning timestamps.
    pub interval: Duration,

    /// Whether timestamps are aligned to a multiple of the reporting interval.
    pub align_timestamps: bool,
}

impl ExportConfiguration {
    /// Gets the timestamp to use for points generated at `now`.
    ///
    /// With alignment enabled, `now` is truncated down to the nearest multiple of the reporting interval since the
    /// Unix epoch, such that a 30 second interval produces timestamps on `:00` and `:30`.
    pub fn timestamp(&self, now: SystemTime) -> SystemTime {
        if !self.align_timestamps {
            return now;
        }

        let interval = self.interval.as_nanos();
        match now.duration_since(UNIX_EPOCH) {
            Ok(since_epoch) if interval > 0 => {
                let nanos = since_epoch.as_nanos();
                let truncated = nanos - nanos % interval;
                let secs = (truncated / 1_000_000_000) as u64;
                let subsec_nanos = (truncated % 1_000_000_000) as u32;
                UNIX_EPOCH + Duration::new(secs, subsec_nanos)
            }
            _ => now,
        }
    }

    /// Snapshots every metric in `registry`, converting them into points stamped with `timestamp`.
    pub fn collect<R>(&self, registry: &R, timestamp: SystemTime) -> Vec<Point>
    where
        R: Registry + ?Sized,
    {
        let mut points = Vec::new();
        registry.visit(&mut |name: &str, snapshot: MetricSnapshot| {
            self.convert(name, snapshot, timestamp, &mut points);
        });
        points
    }

    fn convert(&self, name: &str, snapshot: MetricSnapshot, timestamp: SystemTime, points: &mut Vec<Point>) {
        match snapshot {
            MetricSnapshot::Counter(count) => {
                points.push(self.simple_point(name, Kind::Counter, FieldValue::Integer(count), timestamp));
            }
            MetricSnapshot::Gauge(value) => {
                let value = match value {
                    GaugeValue::Integer(v) => FieldValue::Integer(v),
                    GaugeValue::Float(v) => FieldValue::Float(v),
                };
                points.push(self.simple_point(name, Kind::Gauge, value, timestamp));
            }
            MetricSnapshot::Histogram(histogram) => {
                let key = field_key(name, Kind::Histogram);
                let stats = self.histogram_statistics(&histogram);
                self.statistic_points(&key, stats, timestamp, points);
            }
            MetricSnapshot::Meter(meter) => {
                let key = field_key(name, Kind::Meter);
                let stats = meter_statistics(&meter, "mean");
                self.statistic_points(&key, stats, timestamp, points);
            }
            MetricSnapshot::Timer(timer) => {
                let key = field_key(name, Kind::Timer);
                let mut stats = self.histogram_statistics(&timer.histogram);
                // The count is already covered by the histogram statistics.
                stats.extend(meter_statistics(&timer.rates, "meanrate").into_iter().skip(1));
                self.statistic_points(&key, stats, timestamp, points);
            }
        }
    }

    fn simple_point(&self, name: &str, kind: Kind, value: FieldValue, timestamp: SystemTime) -> Point {
        Point::new(
            self.measurement.clone(),
            self.tags.clone(),
            vec![(field_key(name, kind), value)],
            timestamp,
        )
    }

    fn statistic_points(
        &self,
        key: &str,
        stats: Vec<(&'static str, f64)>,
        timestamp: SystemTime,
        points: &mut Vec<Point>,
    ) {
        for (statistic, value) in stats {
            let mut tags = self.tags.clone();
            tags.insert(self.statistic_tag_key.clone(), statistic.to_string());

            points.push(Point::new(
                self.measurement.clone(),
                tags,
                vec![(key.to_string(), FieldValue::Float(value))],
                timestamp,
            ));
        }
    }

    fn histogram_statistics(&self, histogram: &HistogramSnapshot) -> Vec<(&'static str, f64)> {
        let quantiles = self.percentiles.quantiles();
        let ps = histogram.percentiles(&quantiles.iter().map(|(_, q)| *q).collect::<Vec<_>>());

        let mut stats = vec![
            ("count", histogram.count() as f64),
            ("max", histogram.max()),
            ("mean", histogram.mean()),
            ("min", histogram.min()),
            ("stddev", histogram.stddev()),
            ("variance", histogram.variance()),
        ];
        stats.extend(quantiles.iter().map(|(name, _)| *name).zip(ps));
        stats
    }
}

fn meter_statistics(meter: &MeterSnapshot, mean_name: &'static str) -> Vec<(&'static str, f64)> {
    vec![
        ("count", meter.count as f64),
        ("m1", meter.rate1),
        ("m5", meter.rate5),
        ("m15", meter.rate15),
        (mean_name, meter.rate_mean),
    ]
}
