use std::{thread, time::Duration};

use metrics::{counter, gauge, histogram};
use metrics_exporter_influx::InfluxBuilder;
use rand::Rng;

fn main() {
    tracing_subscriber::fmt::init();

    InfluxBuilder::new()
        .with_endpoint("http://localhost:8086")
        .expect("failed to parse endpoint")
        .with_destination("example", "metrics")
        .with_token("example-token")
        .with_measurement("influx_reporter")
        .add_tag("system", "foo")
        .with_reporting_interval(Duration::from_secs(5))
        .expect("invalid reporting interval")
        .with_timestamp_alignment(true)
        .install()
        .expect("failed to install InfluxDB recorder");

    counter!("idle_metric").increment(1);
    gauge!("testing").set(42.0);

    let server_loops = counter!("tcp_server_loops", "system" => "foo");
    let server_loops_delta_secs = histogram!("tcp_server_loop_delta_secs", "system" => "foo");

    let mut rng = rand::rng();

    // Loop over and over, pretending to do some work.
    loop {
        server_loops.increment(1);
        server_loops_delta_secs.record(rng.random_range(0.0..1.0));

        let gauge = gauge!("lucky_iterations");
        if rng.random_bool(0.75) {
            gauge.increment(1.0);
        } else {
            gauge.decrement(1.0);
        }

        thread::sleep(Duration::from_millis(10));
    }
}
