use std::sync::Arc;
use std::time::Duration;

use netgauge::{Settings, SpeedTest, SpeedTestError, TestPhase};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_settings(endpoint: String) -> Settings {
    Settings {
        endpoints: vec![endpoint],
        min_duration: Duration::from_millis(700),
        max_duration: Duration::from_millis(700),
        upload_duration: Duration::from_millis(600),
        progress_interval: Duration::from_millis(50),
        monitor_interval: Duration::from_millis(200),
        probe_count: 3,
        probe_delay: Duration::from_millis(5),
        snapshot_window_ms: 50,
        upload_write_delay: Duration::from_millis(2),
        upload_connections: 2,
        ..Settings::default()
    }
}

async fn mock_endpoint() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 262_144]))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn latency_phase_reports_a_median_round_trip() {
    let server = mock_endpoint().await;
    let engine = SpeedTest::new(fast_settings(server.uri()));

    let latency = engine.measure_latency().await.expect("latency phase runs");
    assert!(latency > 0.0);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn download_phase_moves_bytes_and_stops_on_its_ceiling() {
    let server = mock_endpoint().await;
    let engine = SpeedTest::new(fast_settings(server.uri()));

    let result = engine
        .measure_download(|_event| {})
        .await
        .expect("download phase runs");

    assert!(result.total_bytes > 0, "no bytes moved");
    assert!(result.elapsed_ms >= 700, "stopped early: {}", result.elapsed_ms);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn upload_phase_emits_monotonic_progress_and_completes() {
    let server = mock_endpoint().await;
    let engine = SpeedTest::new(fast_settings(server.uri()));

    let mut events = Vec::new();
    let result = engine
        .measure_upload(|event| events.push(event))
        .await
        .expect("upload phase runs");

    assert!(!events.is_empty(), "no progress emitted");
    assert!(events.iter().all(|e| e.speed_mbps > 0.0));
    assert!(
        events.windows(2).all(|w| w[0].bytes_transferred <= w[1].bytes_transferred),
        "byte total went backwards"
    );
    assert!(result.total_bytes >= events.last().map(|e| e.bytes_transferred).unwrap_or(0));
    assert!(result.elapsed_ms >= 600);
    assert_eq!(engine.phase(), TestPhase::Complete);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn cancel_mid_phase_lands_back_in_idle_without_error() {
    let server = mock_endpoint().await;
    let mut settings = fast_settings(server.uri());
    settings.upload_duration = Duration::from_secs(30);
    let engine = Arc::new(SpeedTest::new(settings));

    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.measure_upload(|_event| {}).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.is_running());
    engine.cancel();

    let result = task
        .await
        .expect("phase task joins")
        .expect("cancel is not an error");
    assert!(result.elapsed_ms < 5000, "cancel was not prompt");
    assert_eq!(engine.phase(), TestPhase::Idle);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn a_second_phase_cannot_start_while_one_runs() {
    let server = mock_endpoint().await;
    let mut settings = fast_settings(server.uri());
    settings.upload_duration = Duration::from_secs(30);
    let engine = Arc::new(SpeedTest::new(settings));

    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.measure_upload(|_event| {}).await })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.phase(), TestPhase::Upload);
    assert!(matches!(
        engine.measure_latency().await,
        Err(SpeedTestError::PhaseActive)
    ));

    engine.cancel();
    task.await
        .expect("phase task joins")
        .expect("cancel is not an error");
}

#[tokio::test]
async fn cancelled_engine_can_run_a_fresh_phase() {
    let server = mock_endpoint().await;
    let engine = SpeedTest::new(fast_settings(server.uri()));

    engine.cancel();
    let result = engine
        .measure_upload(|_event| {})
        .await
        .expect("stale cancel does not poison the next phase");
    assert!(result.total_bytes > 0);
    assert_eq!(engine.phase(), TestPhase::Complete);
}
