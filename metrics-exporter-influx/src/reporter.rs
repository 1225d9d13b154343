use std::time::{Duration, SystemTime};

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};
use url::Url;

use crate::{
    client::{Client, ClientError, ClientFactory},
    export::ExportConfiguration,
    registry::Registry,
};

/// How often the remote endpoint is checked for readiness.
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Where points are written to, and how to authenticate.
#[derive(Clone, Debug)]
pub(crate) struct Destination {
    pub endpoint: Url,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

/// Periodically exports the metrics of a registry to InfluxDB.
///
/// A reporter drives two independent timers from a single task: the reporting timer, which snapshots the registry and
/// writes the resulting points, and the liveness timer, which pings the remote endpoint and replaces the client when
/// the ping fails. Only one of the two runs at a time, and ticks missed while the other is busy are skipped rather than
/// caught up on.
pub struct Reporter<R, F>
where
    F: ClientFactory,
{
    registry: R,
    config: ExportConfiguration,
    destination: Destination,
    factory: F,
    client: F::Client,
}

impl<R, F> Reporter<R, F>
where
    R: Registry,
    F: ClientFactory,
{
    pub(crate) fn new(
        registry: R,
        config: ExportConfiguration,
        destination: Destination,
        factory: F,
    ) -> Result<Self, ClientError> {
        let client = factory.create(&destination.endpoint, &destination.token)?;
        Ok(Self { registry, config, destination, factory, client })
    }

    /// Snapshots the registry and writes the resulting points, as of `now`.
    ///
    /// All points share a single timestamp, derived from `now` and aligned to the reporting interval if configured to
    /// do so. Returns the number of points written.
    ///
    /// # Errors
    ///
    /// If the points could not be written, an error is returned. Nothing is retried.
    pub async fn report_at(&self, now: SystemTime) -> Result<usize, ClientError> {
        let timestamp = self.config.timestamp(now);
        let points = self.config.collect(&self.registry, timestamp);
        if points.is_empty() {
            debug!("No metrics registered, skipping write.");
            return Ok(0);
        }

        self.client.write(&self.destination.org, &self.destination.bucket, &points).await?;

        debug!(points = points.len(), "Wrote points.");
        Ok(points.len())
    }

    /// Snapshots the registry and writes the resulting points, as of the current time.
    ///
    /// # Errors
    ///
    /// If the points could not be written, an error is returned. Nothing is retried.
    pub async fn report(&self) -> Result<usize, ClientError> {
        self.report_at(SystemTime::now()).await
    }

    /// Checks whether the remote endpoint is ready, replacing the client if it is not.
    ///
    /// Returns `true` if the endpoint was ready.
    pub async fn check_liveness(&mut self) -> bool {
        let Err(e) = self.client.ready().await else {
            return true;
        };

        error!(error = %e, "Got error while pinging InfluxDB, recreating client.");
        match self.factory.create(&self.destination.endpoint, &self.destination.token) {
            Ok(client) => self.client = client,
            Err(e) => error!(error = %e, "Failed to recreate InfluxDB client, keeping the existing one."),
        }

        false
    }

    /// Runs the reporter forever.
    pub async fn run(mut self) {
        let start = Instant::now();
        let mut report_ticker = interval_at(start + self.config.interval, self.config.interval);
        report_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut liveness_ticker = interval_at(start + LIVENESS_CHECK_INTERVAL, LIVENESS_CHECK_INTERVAL);
        liveness_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            endpoint = %self.destination.endpoint,
            interval = ?self.config.interval,
            "Reporting metrics to InfluxDB."
        );

        loop {
            tokio::select! {
                _ = report_ticker.tick() => {
                    if let Err(e) = self.report().await {
                        error!(error = %e, "Unable to send metrics to InfluxDB.");
                    }
                }
                _ = liveness_ticker.tick() => {
                    self.check_liveness().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use url::Url;

    use super::{Destination, Reporter};
    use crate::{
        client::{Client, ClientError},
        export::{ExportConfiguration, PercentileSet},
        point::{FieldValue, Point},
        snapshot::MetricSnapshot,
    };

    #[derive(Default)]
    struct Shared {
        // (endpoint, token) of every client created.
        created: Mutex<Vec<(String, String)>>,
        // (client id, org, bucket, points) of every write.
        writes: Mutex<Vec<(usize, String, String, Vec<Point>)>>,
        pings: AtomicUsize,
        fail_writes: Mutex<bool>,
        fail_pings: Mutex<bool>,
    }

    struct MockClient {
        id: usize,
        shared: Arc<Shared>,
    }

    fn failure() -> ClientError {
        ClientError::UnexpectedStatus { status: 503, body: "unavailable".to_string() }
    }

    impl Client for MockClient {
        async fn ready(&self) -> Result<(), ClientError> {
            self.shared.pings.fetch_add(1, Ordering::SeqCst);
            if *self.shared.fail_pings.lock().unwrap() {
                Err(failure())
            } else {
                Ok(())
            }
        }

        async fn write(&self, org: &str, bucket: &str, points: &[Point]) -> Result<(), ClientError> {
            if *self.shared.fail_writes.lock().unwrap() {
                return Err(failure());
            }

            self.shared.writes.lock().unwrap().push((
                self.id,
                org.to_string(),
                bucket.to_string(),
                points.to_vec(),
            ));
            Ok(())
        }
    }

    type MockFactory = Box<dyn Fn(&Url, &str) -> Result<MockClient, ClientError> + Send + Sync>;

    fn factory(shared: &Arc<Shared>) -> MockFactory {
        let shared = Arc::clone(shared);
        Box::new(move |endpoint: &Url, token: &str| {
            let mut created = shared.created.lock().unwrap();
            created.push((endpoint.to_string(), token.to_string()));
            Ok(MockClient { id: created.len(), shared: Arc::clone(&shared) })
        })
    }

    fn registry() -> Vec<(String, MetricSnapshot)> {
        vec![("x".to_string(), MetricSnapshot::Counter(5))]
    }

    fn config(align_timestamps: bool) -> ExportConfiguration {
        ExportConfiguration {
            measurement: "app".to_string(),
            tags: BTreeMap::new(),
            statistic_tag_key: "bucket".to_string(),
            percentiles: PercentileSet::Extended,
            interval: Duration::from_secs(30),
            align_timestamps,
        }
    }

    fn destination() -> Destination {
        Destination {
            endpoint: Url::parse("http://influx.local:8086").unwrap(),
            org: "acme".to_string(),
            bucket: "metrics".to_string(),
            token: "secret".to_string(),
        }
    }

    fn reporter(
        shared: &Arc<Shared>,
        align_timestamps: bool,
    ) -> Reporter<Vec<(String, MetricSnapshot)>, MockFactory> {
        Reporter::new(registry(), config(align_timestamps), destination(), factory(shared)).unwrap()
    }

    // 2023-11-14T12:00:17Z
    fn tick() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_699_963_217)
    }

    #[tokio::test]
    async fn report_writes_single_batch() {
        let shared = Arc::new(Shared::default());
        let reporter = reporter(&shared, false);

        assert_eq!(reporter.report_at(tick()).await.unwrap(), 1);

        let writes = shared.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let (_, org, bucket, points) = &writes[0];
        assert_eq!(org, "acme");
        assert_eq!(bucket, "metrics");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].fields(), &[("x.count".to_string(), FieldValue::Integer(5))]);
        assert_eq!(points[0].timestamp(), tick());
    }

    #[tokio::test]
    async fn report_aligns_timestamps() {
        let shared = Arc::new(Shared::default());
        let reporter = reporter(&shared, true);

        reporter.report_at(tick()).await.unwrap();

        let writes = shared.writes.lock().unwrap();
        assert_eq!(writes[0].3[0].timestamp(), UNIX_EPOCH + Duration::from_secs(1_699_963_200));
    }

    #[tokio::test]
    async fn empty_registry_skips_write() {
        let shared = Arc::new(Shared::default());
        let mut reporter = reporter(&shared, false);
        reporter.registry.clear();

        assert_eq!(reporter.report_at(tick()).await.unwrap(), 0);
        assert!(shared.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_does_not_affect_next_tick() {
        let shared = Arc::new(Shared::default());
        let reporter = reporter(&shared, false);
        let config_before = format!("{:?} {:?}", reporter.config, reporter.destination);

        *shared.fail_writes.lock().unwrap() = true;
        assert!(reporter.report_at(tick()).await.is_err());
        assert!(shared.writes.lock().unwrap().is_empty());

        *shared.fail_writes.lock().unwrap() = false;
        assert_eq!(reporter.report_at(tick() + Duration::from_secs(30)).await.unwrap(), 1);
        assert_eq!(shared.writes.lock().unwrap().len(), 1);

        assert_eq!(format!("{:?} {:?}", reporter.config, reporter.destination), config_before);
        assert_eq!(shared.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn successful_ping_keeps_client() {
        let shared = Arc::new(Shared::default());
        let mut reporter = reporter(&shared, false);

        assert!(reporter.check_liveness().await);
        assert!(reporter.check_liveness().await);
        assert_eq!(shared.pings.load(Ordering::SeqCst), 2);
        assert_eq!(shared.created.lock().unwrap().len(), 1);
        assert_eq!(reporter.client.id, 1);
    }

    #[tokio::test]
    async fn failed_ping_replaces_client() {
        let shared = Arc::new(Shared::default());
        let mut reporter = reporter(&shared, false);

        *shared.fail_pings.lock().unwrap() = true;
        assert!(!reporter.check_liveness().await);
        assert_eq!(reporter.client.id, 2);
        assert!(!reporter.check_liveness().await);
        assert_eq!(reporter.client.id, 3);

        let created = shared.created.lock().unwrap().clone();
        assert_eq!(created.len(), 3);
        assert!(created
            .iter()
            .all(|(endpoint, token)| endpoint == "http://influx.local:8086/" && token == "secret"));

        // Writes go through the replacement client.
        reporter.report_at(tick()).await.unwrap();
        assert_eq!(shared.writes.lock().unwrap()[0].0, 3);
    }

    #[tokio::test]
    async fn failed_replacement_keeps_existing_client() {
        let shared = Arc::new(Shared::default());
        let attempts = Arc::new(AtomicUsize::new(0));

        let factory_shared = Arc::clone(&shared);
        let factory_attempts = Arc::clone(&attempts);
        let factory: MockFactory = Box::new(move |_: &Url, _: &str| {
            if factory_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(MockClient { id: 1, shared: Arc::clone(&factory_shared) })
            } else {
                Err(ClientError::InvalidToken)
            }
        });
        let mut reporter = Reporter::new(registry(), config(false), destination(), factory).unwrap();

        *shared.fail_pings.lock().unwrap() = true;
        assert!(!reporter.check_liveness().await);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(reporter.client.id, 1);

        // The next check tries again.
        assert!(!reporter.check_liveness().await);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drives_both_timers() {
        let shared = Arc::new(Shared::default());
        let mut reporter = reporter(&shared, false);
        reporter.config.interval = Duration::from_secs(10);

        let handle = tokio::spawn(reporter.run());
        tokio::time::sleep(Duration::from_secs(31)).await;
        handle.abort();

        assert_eq!(shared.writes.lock().unwrap().len(), 3);
        assert_eq!(shared.pings.load(Ordering::SeqCst), 6);
    }
}
