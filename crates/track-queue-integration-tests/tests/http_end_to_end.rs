//! End-to-end tests: a real HTTP server driven through the CLI client

mod common;

use clap::Parser;
use common::{points_for, Harness};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use track_queue_api::{serve, AppState, ServiceConfig, ServiceError};
use track_queue_cli::{execute, AdminClient, Cli, CliError};
use track_queue_core::{DlqReason, HealthStatus, IngestConfig, OwnerId, QueueType, ShutdownToken};

fn parse(server: &str, args: &[&str]) -> Cli {
    let mut argv = vec!["track-queue", "--server", server];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap()
}

struct RunningServer {
    harness: Harness,
    address: SocketAddr,
    shutdown: ShutdownToken,
    handle: JoinHandle<Result<(), ServiceError>>,
}

impl RunningServer {
    async fn start(ingest: IngestConfig) -> Self {
        let harness = Harness::new(ingest.clone());
        let config = ServiceConfig {
            ingest,
            ..ServiceConfig::default()
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let shutdown = ShutdownToken::new();
        let state = AppState::new(config, harness.service.clone());
        let handle = tokio::spawn(serve(listener, state, shutdown.clone()));

        Self {
            harness,
            address,
            shutdown,
            handle,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    fn client(&self) -> AdminClient {
        AdminClient::new(&self.url(), Duration::from_secs(5)).unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

/// Verify the producer and admin round trip over HTTP
#[tokio::test]
async fn test_enqueue_process_and_inspect_over_http() {
    // Arrange
    let server = RunningServer::start(IngestConfig::default()).await;
    server
        .harness
        .points
        .add_owner(QueueType::LivePosition, OwnerId::new(1));
    let client = server.client();

    // Act
    let accepted = client
        .enqueue(QueueType::LivePosition, points_for(1, 4), None)
        .await
        .unwrap();
    client
        .enqueue(QueueType::LivePosition, points_for(2, 3), None)
        .await
        .unwrap();
    let cycle = client
        .process(QueueType::LivePosition, None)
        .await
        .unwrap();

    // Assert
    assert_eq!(accepted.points, 4);
    assert_eq!(accepted.queue_type, QueueType::LivePosition);
    assert_eq!(cycle.persisted_points, 4);
    assert_eq!(cycle.dead_lettered.len(), 1);

    let stats = client.stats(QueueType::LivePosition).await.unwrap();
    assert_eq!(stats.processed_total, 4);
    assert_eq!(stats.dlq_size, 1);

    let inspection = client.inspect(QueueType::LivePosition, 5).await.unwrap();
    assert_eq!(inspection.count, 1);
    assert_eq!(inspection.items[0].count, 3);
    assert_eq!(inspection.items[0].reason, DlqReason::UnknownParentReference);

    server.stop().await;
}

/// Verify replay and clear through the client
#[tokio::test]
async fn test_replay_and_clear_over_http() {
    let server = RunningServer::start(IngestConfig::default()).await;
    let client = server.client();

    client
        .enqueue(QueueType::Upload, points_for(5, 2), None)
        .await
        .unwrap();
    client.process(QueueType::Upload, Some(10)).await.unwrap();

    server.harness.points.add_owner(QueueType::Upload, OwnerId::new(5));
    let replay = client.replay(QueueType::Upload, 10, false).await.unwrap();
    assert_eq!(replay.reprocessed, 1);
    assert_eq!(replay.remaining, 0);
    assert_eq!(server.harness.points.row_count(QueueType::Upload), 2);

    client
        .enqueue(QueueType::Upload, points_for(6, 1), None)
        .await
        .unwrap();
    let cleared = client.clear(QueueType::Upload, true).await.unwrap();
    assert_eq!(cleared.removed.queue, 1);

    server.stop().await;
}

/// Verify that rejected requests surface as client errors
#[tokio::test]
async fn test_invalid_requests_map_to_client_errors() {
    let server = RunningServer::start(IngestConfig::default()).await;
    let client = server.client();

    let err = client.process(QueueType::Upload, Some(0)).await.unwrap_err();
    assert!(matches!(err, CliError::Server { status: 400, .. }));
    assert_eq!(err.exit_code(), 3);

    let err = client
        .enqueue(QueueType::Upload, Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CliError::Server { status: 400, .. }));

    let err = client
        .enqueue(QueueType::Upload, points_for(1, 1), Some(-1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, CliError::Server { status: 400, .. }));

    server.stop().await;
}

/// Verify CLI commands end to end, including JSON output
#[tokio::test]
async fn test_cli_commands_against_running_server() {
    let server = RunningServer::start(IngestConfig::default()).await;
    server
        .harness
        .service
        .enqueue(QueueType::DerivedScore, points_for(3, 2), None)
        .await
        .unwrap();

    let output = execute(&parse(&server.url(), &["--format", "json", "stats"]))
        .await
        .unwrap();
    let stats: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(stats.as_array().unwrap().len(), QueueType::ALL.len());

    let output = execute(&parse(&server.url(), &["process", "derived-score"]))
        .await
        .unwrap();
    assert!(output.contains("2 point(s) persisted"));

    let output = execute(&parse(&server.url(), &["health"])).await.unwrap();
    assert!(output.starts_with("Status: healthy"));

    let output = execute(&parse(
        &server.url(),
        &["cleanup", "--max-age-secs", "3600", "--dry-run"],
    ))
    .await
    .unwrap();
    assert!(output.starts_with("Would remove 0 entries"));

    server.stop().await;
}

/// Verify that a critical service answers 503 and the CLI reports it
#[tokio::test]
async fn test_critical_health_over_http() {
    let mut ingest = IngestConfig::default();
    ingest.health.pending_warn = 0;
    ingest.health.pending_critical = 0;
    let server = RunningServer::start(ingest).await;
    let client = server.client();

    client
        .enqueue(QueueType::Upload, points_for(1, 1), None)
        .await
        .unwrap();

    let health = client.health().await.unwrap();
    assert_eq!(health.report.status, HealthStatus::Critical);

    let err = execute(&parse(&server.url(), &["health"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CliError::Unhealthy {
            status: HealthStatus::Critical
        }
    ));
    assert_eq!(err.exit_code(), 5);

    server.stop().await;
}

/// Verify that an unreachable server is a connection error
#[tokio::test]
async fn test_unreachable_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let cli = parse(&format!("http://{}", address), &["health"]);
    let err = execute(&cli).await.unwrap_err();

    assert!(matches!(err, CliError::Connection(_)));
    assert_eq!(err.exit_code(), 1);
}
