use std::{fmt::Write as _, sync::Arc};

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry as MetricsRegistry};

use crate::{
    registry::Registry,
    snapshot::{GaugeValue, HistogramSnapshot, MetricSnapshot},
};

/// A recorder that collects metrics to be reported to InfluxDB.
///
/// The recorder itself does not report anything: pass its [`handle`](InfluxRecorder::handle) to a reporter, or use
/// [`InfluxBuilder::install`](crate::InfluxBuilder::install) to do both at once.
pub struct InfluxRecorder {
    inner: InfluxHandle,
}

impl InfluxRecorder {
    pub(crate) fn new() -> Self {
        InfluxRecorder { inner: InfluxHandle { registry: Arc::new(MetricsRegistry::atomic()) } }
    }

    /// Gets a handle to the metrics collected by this recorder.
    pub fn handle(&self) -> InfluxHandle {
        self.inner.clone()
    }
}

impl Recorder for InfluxRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.inner
            .registry
            .get_or_create_counter(key, |existing| Counter::from_arc(Arc::clone(existing)))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.inner
            .registry
            .get_or_create_gauge(key, |existing| Gauge::from_arc(Arc::clone(existing)))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.inner
            .registry
            .get_or_create_histogram(key, |existing| Histogram::from_arc(Arc::clone(existing)))
    }
}

/// Handle to the metrics collected by an [`InfluxRecorder`].
///
/// Counters are reported with their running total, and gauges with their current floating-point value. Histograms
/// are reported from the values recorded since they were last visited, so each reporting tick describes only the
/// values recorded during its interval.
///
/// Labels are folded into the metric name as `name{key1=value1,key2=value2}`, in the order they were given.
#[derive(Clone)]
pub struct InfluxHandle {
    registry: Arc<MetricsRegistry<Key, AtomicStorage>>,
}

fn metric_name(key: &Key) -> String {
    let mut name = key.name().to_string();
    let mut labels = key.labels().peekable();
    if labels.peek().is_none() {
        return name;
    }

    name.push('{');
    for (i, label) in labels.enumerate() {
        if i > 0 {
            name.push(',');
        }
        let _ = write!(name, "{}={}", label.key(), label.value());
    }
    name.push('}');
    name
}

impl Registry for InfluxHandle {
    fn visit(&self, f: &mut dyn FnMut(&str, MetricSnapshot)) {
        self.registry.visit_counters(|key, counter| {
            let value = counter.load(std::sync::atomic::Ordering::Acquire);
            f(&metric_name(key), MetricSnapshot::Counter(i64::try_from(value).unwrap_or(i64::MAX)));
        });

        self.registry.visit_gauges(|key, gauge| {
            let value = f64::from_bits(gauge.load(std::sync::atomic::Ordering::Acquire));
            f(&metric_name(key), MetricSnapshot::Gauge(GaugeValue::Float(value)));
        });

        self.registry.visit_histograms(|key, histogram| {
            let mut values = Vec::new();
            histogram.clear_with(|block| values.extend_from_slice(block));
            f(&metric_name(key), MetricSnapshot::Histogram(HistogramSnapshot::from_values(values)));
        });
    }
}
