//! A [`metrics`]-compatible exporter that periodically pushes metrics to [InfluxDB][influxdb].
//!
//! [influxdb]: https://docs.influxdata.com/influxdb/v2/
//!
//! # Usage
//!
//! ```no_run
//! # use std::time::Duration;
//! # use metrics_exporter_influx::InfluxBuilder;
//! // Configure where and how often to report.
//! let builder = InfluxBuilder::new()
//!     .with_endpoint("http://localhost:8086")
//!     .expect("failed to parse endpoint")
//!     .with_destination("my-org", "my-bucket")
//!     .with_token("my-token")
//!     .with_measurement("my-service")
//!     .add_tag("host", "web-1")
//!     .with_reporting_interval(Duration::from_secs(30))
//!     .expect("invalid reporting interval")
//!     .with_timestamp_alignment(true);
//!
//! // Install the recorder as the global recorder for all `metrics` calls, and report its metrics in the background.
//! builder.install().expect("failed to install recorder/exporter");
//! ```
//!
//! Metrics kept somewhere other than the global recorder can be reported by implementing [`Registry`] and passing it
//! to [`InfluxBuilder::spawn`] or [`InfluxBuilder::run`].
//!
//! # Data model
//!
//! All points are written to a single measurement, carrying the configured tags. Every metric contributes a field
//! named after it, suffixed by its kind:
//!
//! | kind      | field key          | points                                                               |
//! |-----------|--------------------|----------------------------------------------------------------------|
//! | counter   | `<name>.count`     | one, with the count                                                  |
//! | gauge     | `<name>.gauge`     | one, with the value                                                  |
//! | histogram | `<name>.histogram` | one per statistic: count, max, mean, min, stddev, variance, p50, ... |
//! | meter     | `<name>.meter`     | one per statistic: count, m1, m5, m15, mean                          |
//! | timer     | `<name>.timer`     | histogram statistics, plus m1, m5, m15, meanrate                     |
//!
//! Points for histograms, meters, and timers carry one extra tag naming the statistic. The tag key defaults to
//! `bucket`, and can be changed with [`InfluxBuilder::with_statistic_tag_key`].
//!
//! All points written during a reporting tick share the same timestamp.
//!
//! # Failure handling
//!
//! Failed writes are logged and dropped: the next tick reports fresh values. Every 5 seconds the endpoint is checked
//! for readiness, and the client is recreated if the check fails. Requests that go unanswered for longer than the
//! request timeout (see [`InfluxBuilder::with_request_timeout`]) count as failures.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

use std::{collections::BTreeMap, time::Duration};

use tracing::error;

mod builder;
pub use self::builder::{BuildError, InfluxBuilder};

mod client;
pub use self::client::{Client, ClientError, ClientFactory, HttpClient, HttpClientFactory, DEFAULT_REQUEST_TIMEOUT};

mod export;
pub use self::export::PercentileSet;

mod point;
pub use self::point::{FieldValue, Point};

mod recorder;
pub use self::recorder::{InfluxHandle, InfluxRecorder};

mod registry;
pub use self::registry::Registry;

mod reporter;
pub use self::reporter::{Reporter, LIVENESS_CHECK_INTERVAL};

mod snapshot;
pub use self::snapshot::{GaugeValue, HistogramSnapshot, MeterSnapshot, MetricSnapshot, TimerSnapshot};

/// Reports the metrics in `registry` to InfluxDB every `interval`, on the current thread.
///
/// See [`influxdb_with_tags`].
#[allow(clippy::too_many_arguments)]
pub fn influxdb<R>(
    registry: R,
    interval: Duration,
    endpoint: &str,
    org: &str,
    bucket: &str,
    measurement: &str,
    token: &str,
    align_timestamps: bool,
) where
    R: Registry,
{
    influxdb_with_tags(
        registry,
        interval,
        endpoint,
        org,
        bucket,
        measurement,
        token,
        BTreeMap::new(),
        align_timestamps,
    );
}

/// Reports the metrics in `registry` to InfluxDB every `interval`, on the current thread, applying `tags` to every
/// point.
///
/// This never returns once reporting has started. If `endpoint` is not a valid URL, or `interval` is zero, the error is
/// logged and this returns without reporting anything.
///
/// Must not be called from within a Tokio runtime.
#[allow(clippy::too_many_arguments)]
pub fn influxdb_with_tags<R>(
    registry: R,
    interval: Duration,
    endpoint: &str,
    org: &str,
    bucket: &str,
    measurement: &str,
    token: &str,
    tags: BTreeMap<String, String>,
    align_timestamps: bool,
) where
    R: Registry,
{
    let builder = InfluxBuilder::new()
        .with_endpoint(endpoint)
        .and_then(|builder| builder.with_reporting_interval(interval));
    let builder = match builder {
        Ok(builder) => builder,
        Err(e) => {
            error!(error = %e, "Unable to start InfluxDB reporter.");
            return;
        }
    };

    builder
        .with_destination(org, bucket)
        .with_measurement(measurement)
        .with_token(token)
        .with_tags(tags)
        .with_timestamp_alignment(align_timestamps)
        .run(registry);
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use super::{influxdb, influxdb_with_tags, MetricSnapshot};

    fn registry() -> Vec<(String, MetricSnapshot)> {
        vec![("x".to_string(), MetricSnapshot::Counter(5))]
    }

    #[test]
    fn malformed_endpoint_returns_without_reporting() {
        influxdb_with_tags(
            registry(),
            Duration::from_secs(1),
            "not a url",
            "acme",
            "apps",
            "service",
            "secret",
            BTreeMap::from([("host".to_string(), "web-1".to_string())]),
            false,
        );
        influxdb(registry(), Duration::from_secs(1), "localhost:8086", "acme", "apps", "service", "secret", true);
    }

    #[test]
    fn zero_interval_returns_without_reporting() {
        influxdb(registry(), Duration::ZERO, "http://127.0.0.1:8086", "acme", "apps", "service", "secret", false);
    }
}
