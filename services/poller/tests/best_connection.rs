//! Best-connection selection: metrics route through the lowest-latency
//! connection and fail over when it dies.

use poller::checks::Check;
use poller::config::{ChecksPolicy, Config, EndpointsConfig, TimeoutsConfig, TlsSettings};
use poller::metrics::PollerMetrics;
use poller::stream::ConnectionStream;
use poller::tls::TlsClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use zp_protocol::{methods, CheckDefinition, CheckMetricsPostParams};
use zp_test_utils::{EndpointBehavior, MockEndpoint};

fn agent_config(addresses: Vec<String>) -> Config {
    Config {
        schema_version: 1,
        agent_id: "agent-best".to_owned(),
        agent_name: "zone-poller".to_owned(),
        token: "tkn-best".to_owned(),
        zones: vec!["zn1".to_owned()],
        endpoints: EndpointsConfig {
            use_srv: false,
            srv_queries: vec![],
            addresses,
        },
        timeouts: TimeoutsConfig {
            auth: Duration::from_secs(5),
            prepare_end: Duration::from_secs(2),
            read_slack: Duration::from_secs(5),
            write_slack: Duration::from_secs(5),
            dial: Duration::from_secs(2),
            reconnect: Duration::from_millis(200),
            graceful_shutdown: Duration::from_secs(1),
        },
        tls: TlsSettings {
            ca_file: None,
            insecure: false,
            cleartext: true,
        },
        checks: ChecksPolicy {
            period_min: Duration::from_secs(1),
            period_max: Duration::from_secs(3600),
            spread_ms: 0,
        },
        features: vec![],
    }
}

async fn run_one_check(target_port: u16) -> poller::checks::ResultSet {
    let def = CheckDefinition {
        check_id: "ch-route".to_owned(),
        entity_id: "en-route".to_owned(),
        zone_id: "zn1".to_owned(),
        check_type: "remote.tcp".to_owned(),
        period: 1,
        timeout: 1,
        disabled: false,
        details: serde_json::json!({ "host": "127.0.0.1", "port": target_port }),
    };
    let policy = ChecksPolicy {
        period_min: Duration::from_secs(1),
        period_max: Duration::from_secs(3600),
        spread_ms: 0,
    };
    let check =
        Check::from_definition(&def, &policy, &CancellationToken::new()).expect("parse check");
    check.run().await.expect("run check")
}

#[tokio::test]
async fn metrics_route_through_the_lowest_latency_connection_and_fail_over() {
    // ~20ms vs ~80ms measured one-way latency.
    let mut fast = MockEndpoint::start(EndpointBehavior {
        response_delay_ms: 40,
        ..Default::default()
    })
    .await
    .expect("fast endpoint");
    let mut slow = MockEndpoint::start(EndpointBehavior {
        response_delay_ms: 160,
        ..Default::default()
    })
    .await
    .expect("slow endpoint");

    let target = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind check target");
    let target_port = target.local_addr().expect("local_addr").port();
    tokio::spawn(async move {
        loop {
            if target.accept().await.is_err() {
                break;
            }
        }
    });

    let cancel = CancellationToken::new();
    let stream = ConnectionStream::new(
        agent_config(vec![fast.address(), slow.address()]),
        TlsClient::Cleartext,
        Arc::new(PollerMetrics::new()),
        &cancel,
    );
    stream.connect();

    // Both sessions must have at least one latency measurement.
    timeout(
        Duration::from_secs(5),
        fast.recv_method(methods::HEARTBEAT_POST),
    )
    .await
    .expect("fast heartbeat in time")
    .expect("fast heartbeat");
    timeout(
        Duration::from_secs(5),
        slow.recv_method(methods::HEARTBEAT_POST),
    )
    .await
    .expect("slow heartbeat in time")
    .expect("slow heartbeat");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let best = stream.choose_best().expect("a measured connection");
    assert_eq!(best.address(), fast.address());

    let crs = run_one_check(target_port).await;
    stream.send_metrics(&crs).expect("metrics routed");

    let post = timeout(
        Duration::from_secs(5),
        fast.recv_method(methods::CHECK_METRICS_POST_MULTI),
    )
    .await
    .expect("post on fast endpoint in time")
    .expect("post frame");
    let params: CheckMetricsPostParams = post.decode_params().expect("post params");
    assert_eq!(params.check_id, "ch-route");

    // Kill the fast endpoint; the slow connection takes over.
    fast.shutdown();
    let slow_address = slow.address();
    let mut failed_over = false;
    for _ in 0..100 {
        if let Some(best) = stream.choose_best() {
            if best.address() == slow_address {
                failed_over = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(failed_over, "best connection never moved to the slow endpoint");

    stream.send_metrics(&crs).expect("metrics routed after failover");
    let post = timeout(
        Duration::from_secs(5),
        slow.recv_method(methods::CHECK_METRICS_POST_MULTI),
    )
    .await
    .expect("post on slow endpoint in time")
    .expect("post frame");
    let params: CheckMetricsPostParams = post.decode_params().expect("post params");
    assert_eq!(params.check_id, "ch-route");

    cancel.cancel();
}
