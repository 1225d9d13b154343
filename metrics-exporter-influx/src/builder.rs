use std::{collections::BTreeMap, thread, time::Duration};

use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{
    client::{ClientError, ClientFactory, HttpClientFactory, DEFAULT_REQUEST_TIMEOUT},
    export::{ExportConfiguration, PercentileSet},
    recorder::InfluxRecorder,
    registry::Registry,
    reporter::{Destination, Reporter},
};

const DEFAULT_REPORTING_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8086";
const DEFAULT_MEASUREMENT: &str = "metrics";
const DEFAULT_STATISTIC_TAG_KEY: &str = "bucket";

/// Errors that could occur while building or installing an InfluxDB reporter.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the endpoint URL.
    #[error("invalid endpoint URL '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// The endpoint that failed to parse.
        endpoint: String,

        /// Details about the parsing failure.
        reason: String,
    },

    /// The reporting interval was zero.
    #[error("reporting interval must be greater than zero")]
    InvalidInterval,

    /// The request timeout was zero.
    #[error("request timeout must be greater than zero")]
    InvalidTimeout,

    /// Failed to create the initial client.
    #[error("failed to create InfluxDB client: {0}")]
    Client(#[from] ClientError),

    /// Failed to spawn the background thread or its runtime.
    #[error("failed to spawn background thread for reporter")]
    Backend,

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install reporter as global recorder")]
    FailedToInstall,
}

/// Builder for an InfluxDB reporter.
pub struct InfluxBuilder {
    endpoint: Result<Url, BuildError>,
    org: String,
    bucket: String,
    token: String,
    measurement: String,
    tags: BTreeMap<String, String>,
    interval: Duration,
    align_timestamps: bool,
    statistic_tag_key: String,
    percentiles: PercentileSet,
    request_timeout: Duration,
}

impl InfluxBuilder {
    /// Creates a new `InfluxBuilder` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the InfluxDB endpoint to report to, such as `http://localhost:8086`.
    ///
    /// Defaults to `http://127.0.0.1:8086`.
    ///
    /// # Errors
    ///
    /// If the given endpoint cannot be parsed as a URL, an error will be returned indicating the reason.
    pub fn with_endpoint<E>(mut self, endpoint: E) -> Result<Self, BuildError>
    where
        E: AsRef<str>,
    {
        self.endpoint = Ok(parse_endpoint(endpoint.as_ref())?);
        Ok(self)
    }

    /// Sets the organization and bucket to write points to.
    ///
    /// Both default to empty.
    #[must_use]
    pub fn with_destination<O, B>(mut self, org: O, bucket: B) -> Self
    where
        O: Into<String>,
        B: Into<String>,
    {
        self.org = org.into();
        self.bucket = bucket.into();
        self
    }

    /// Sets the token used to authenticate with InfluxDB.
    ///
    /// Defaults to empty.
    #[must_use]
    pub fn with_token<T>(mut self, token: T) -> Self
    where
        T: Into<String>,
    {
        self.token = token.into();
        self
    }

    /// Sets the measurement all points are written to.
    ///
    /// Defaults to `metrics`.
    #[must_use]
    pub fn with_measurement<M>(mut self, measurement: M) -> Self
    where
        M: Into<String>,
    {
        self.measurement = measurement.into();
        self
    }

    /// Adds a tag that is applied to every point.
    ///
    /// Setting the same key twice replaces the previous value.
    #[must_use]
    pub fn add_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets the tags applied to every point, replacing any previously added.
    ///
    /// Defaults to no tags.
    #[must_use]
    pub fn with_tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags = tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Sets how often metrics are reported.
    ///
    /// Defaults to 10 seconds.
    ///
    /// # Errors
    ///
    /// If the interval is zero, an error will be returned.
    pub fn with_reporting_interval(mut self, interval: Duration) -> Result<Self, BuildError> {
        if interval.is_zero() {
            return Err(BuildError::InvalidInterval);
        }

        self.interval = interval;
        Ok(self)
    }

    /// Sets whether point timestamps are aligned to the reporting interval.
    ///
    /// When enabled, the timestamp of each reporting tick is truncated down to the nearest multiple of the reporting
    /// interval, so that with a 30 second interval, all points land on `:00` or `:30`. This makes points from several
    /// processes line up with each other.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_timestamp_alignment(mut self, align_timestamps: bool) -> Self {
        self.align_timestamps = align_timestamps;
        self
    }

    /// Sets the tag key identifying the statistic carried by histogram, meter, and timer points.
    ///
    /// Each of these metrics is written as one point per statistic (`count`, `mean`, `p99`, and so on), all sharing
    /// the same field key and differing only by the value of this tag.
    ///
    /// Defaults to `bucket`.
    #[must_use]
    pub fn with_statistic_tag_key<K>(mut self, key: K) -> Self
    where
        K: Into<String>,
    {
        self.statistic_tag_key = key.into();
        self
    }

    /// Sets the percentiles reported for histograms and timers.
    ///
    /// Defaults to [`PercentileSet::Extended`].
    #[must_use]
    pub fn with_percentiles(mut self, percentiles: PercentileSet) -> Self {
        self.percentiles = percentiles;
        self
    }

    /// Sets the time allowed for each write or readiness request before it is abandoned.
    ///
    /// A request that times out is handled like any other failed request: a failed write is logged and dropped, and a
    /// failed readiness check replaces the client.
    ///
    /// Defaults to 20 seconds.
    ///
    /// # Errors
    ///
    /// If the timeout is zero, an error will be returned.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self, BuildError> {
        if timeout.is_zero() {
            return Err(BuildError::InvalidTimeout);
        }

        self.request_timeout = timeout;
        Ok(self)
    }

    fn into_parts(self) -> Result<(ExportConfiguration, Destination), BuildError> {
        let config = ExportConfiguration {
            measurement: self.measurement,
            tags: self.tags,
            statistic_tag_key: self.statistic_tag_key,
            percentiles: self.percentiles,
            interval: self.interval,
            align_timestamps: self.align_timestamps,
        };
        let destination = Destination {
            endpoint: self.endpoint?,
            org: self.org,
            bucket: self.bucket,
            token: self.token,
        };

        Ok((config, destination))
    }

    /// Builds a reporter for the given registry, using `factory` to create clients.
    ///
    /// # Errors
    ///
    /// If the initial client could not be created, an error will be returned.
    pub fn build_with_client_factory<R, F>(self, registry: R, factory: F) -> Result<Reporter<R, F>, BuildError>
    where
        R: Registry,
        F: ClientFactory,
    {
        let (config, destination) = self.into_parts()?;
        Ok(Reporter::new(registry, config, destination, factory)?)
    }

    /// Builds a reporter for the given registry, writing over HTTP.
    ///
    /// # Errors
    ///
    /// If the initial client could not be created, an error will be returned.
    pub fn build<R>(self, registry: R) -> Result<Reporter<R, HttpClientFactory>, BuildError>
    where
        R: Registry,
    {
        let factory = HttpClientFactory::default().with_timeout(self.request_timeout);
        self.build_with_client_factory(registry, factory)
    }

    /// Builds a reporter for the given registry and spawns it in the background.
    ///
    /// When called from within a Tokio runtime, the reporter is spawned directly onto the runtime. Otherwise, a new
    /// single-threaded Tokio runtime is created on a background thread, and the reporter is run there.
    ///
    /// # Errors
    ///
    /// If the reporter could not be built, or the background thread could not be spawned, an error will be returned.
    pub fn spawn<R>(self, registry: R) -> Result<(), BuildError>
    where
        R: Registry + Send + Sync + 'static,
    {
        use tokio::runtime;

        if let Ok(handle) = runtime::Handle::try_current() {
            let reporter = {
                let _g = handle.enter();
                self.build(registry)?
            };
            handle.spawn(reporter.run());
            return Ok(());
        }

        let runtime =
            runtime::Builder::new_current_thread().enable_all().build().map_err(|_| BuildError::Backend)?;
        let reporter = {
            let _g = runtime.enter();
            self.build(registry)?
        };

        thread::Builder::new()
            .name("metrics-exporter-influx-reporter".to_string())
            .spawn(move || runtime.block_on(reporter.run()))
            .map_err(|_| BuildError::Backend)?;

        Ok(())
    }

    /// Builds a reporter for the given registry and runs it on the current thread.
    ///
    /// This never returns once the reporter has started. If the reporter cannot be started, the error is logged and
    /// this returns immediately.
    ///
    /// Must not be called from within a Tokio runtime.
    pub fn run<R>(self, registry: R)
    where
        R: Registry,
    {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "Unable to create runtime for InfluxDB reporter.");
                return;
            }
        };

        let reporter = {
            let _g = runtime.enter();
            match self.build(registry) {
                Ok(reporter) => reporter,
                Err(e) => {
                    error!(error = %e, "Unable to start InfluxDB reporter.");
                    return;
                }
            }
        };

        runtime.block_on(reporter.run());
    }

    /// Builds the recorder without reporting anything.
    ///
    /// Pass the recorder's handle to [`spawn`](InfluxBuilder::spawn) or [`build`](InfluxBuilder::build) to report
    /// the metrics it collects.
    #[allow(clippy::unused_self)]
    pub fn build_recorder(&self) -> InfluxRecorder {
        InfluxRecorder::new()
    }

    /// Builds the recorder, installs it as the global recorder, and spawns a reporter for it in the background.
    ///
    /// # Errors
    ///
    /// If the reporter could not be spawned, or if a global recorder is already installed, an error will be returned.
    pub fn install(self) -> Result<(), BuildError> {
        let recorder = self.build_recorder();
        self.spawn(recorder.handle())?;

        metrics::set_global_recorder(recorder).map_err(|_| BuildError::FailedToInstall)
    }
}

impl Default for InfluxBuilder {
    fn default() -> Self {
        InfluxBuilder {
            endpoint: parse_endpoint(DEFAULT_ENDPOINT),
            org: String::new(),
            bucket: String::new(),
            token: String::new(),
            measurement: DEFAULT_MEASUREMENT.to_string(),
            tags: BTreeMap::new(),
            interval: DEFAULT_REPORTING_INTERVAL,
            align_timestamps: false,
            statistic_tag_key: DEFAULT_STATISTIC_TAG_KEY.to_string(),
            percentiles: PercentileSet::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, BuildError> {
    let invalid = |reason: String| BuildError::InvalidEndpoint { endpoint: endpoint.to_string(), reason };

    let url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(invalid(format!("unsupported scheme '{scheme}' (expected 'http' or 'https')"))),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BuildError, InfluxBuilder};
    use crate::{
        client::{Client, ClientError},
        export::PercentileSet,
        point::Point,
        snapshot::MetricSnapshot,
    };

    struct NoopClient;

    impl Client for NoopClient {
        async fn ready(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn write(&self, _: &str, _: &str, _: &[Point]) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn noop_factory(_: &url::Url, _: &str) -> Result<NoopClient, ClientError> {
        Ok(NoopClient)
    }

    #[test]
    fn invalid_endpoints() {
        for endpoint in ["not a url", "localhost:8086", "ftp://example.com"] {
            let result = InfluxBuilder::new().with_endpoint(endpoint);
            assert!(
                matches!(result, Err(BuildError::InvalidEndpoint { .. })),
                "{endpoint} should be rejected"
            );
        }

        assert!(InfluxBuilder::new().with_endpoint("https://influx.example.com:8086").is_ok());
    }

    #[test]
    fn zero_interval() {
        let result = InfluxBuilder::new().with_reporting_interval(Duration::ZERO);
        assert!(matches!(result, Err(BuildError::InvalidInterval)));
    }

    #[test]
    fn request_timeout() {
        assert_eq!(InfluxBuilder::default().request_timeout, Duration::from_secs(20));

        let result = InfluxBuilder::new().with_request_timeout(Duration::ZERO);
        assert!(matches!(result, Err(BuildError::InvalidTimeout)));

        let builder = InfluxBuilder::new().with_request_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(builder.request_timeout, Duration::from_secs(2));
    }

    #[test]
    fn defaults() {
        let (config, destination) = InfluxBuilder::default().into_parts().unwrap();
        assert_eq!(destination.endpoint.as_str(), "http://127.0.0.1:8086/");
        assert_eq!(config.measurement, "metrics");
        assert!(config.tags.is_empty());
        assert_eq!(config.statistic_tag_key, "bucket");
        assert_eq!(config.percentiles, PercentileSet::Extended);
        assert_eq!(config.interval, Duration::from_secs(10));
        assert!(!config.align_timestamps);
    }

    #[test]
    fn configured() {
        let (config, destination) = InfluxBuilder::new()
            .with_endpoint("http://influx:8086")
            .unwrap()
            .with_destination("acme", "apps")
            .with_token("secret")
            .with_measurement("service")
            .with_tags([("host", "a"), ("region", "eu")])
            .add_tag("host", "b")
            .with_reporting_interval(Duration::from_secs(30))
            .unwrap()
            .with_timestamp_alignment(true)
            .with_statistic_tag_key("bucketId")
            .with_percentiles(PercentileSet::Standard)
            .into_parts()
            .unwrap();

        assert_eq!(destination.org, "acme");
        assert_eq!(destination.bucket, "apps");
        assert_eq!(destination.token, "secret");
        assert_eq!(config.measurement, "service");
        assert_eq!(config.tags["host"], "b");
        assert_eq!(config.tags["region"], "eu");
        assert_eq!(config.statistic_tag_key, "bucketId");
        assert_eq!(config.percentiles, PercentileSet::Standard);
        assert_eq!(config.interval, Duration::from_secs(30));
        assert!(config.align_timestamps);
    }

    #[tokio::test]
    async fn build_with_custom_client() {
        let registry = vec![("x".to_string(), MetricSnapshot::Counter(5))];
        let reporter = InfluxBuilder::new().build_with_client_factory(registry, noop_factory).unwrap();
        assert_eq!(reporter.report().await.unwrap(), 1);
    }
}
