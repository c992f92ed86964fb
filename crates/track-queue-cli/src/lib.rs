//! # Track Queue CLI
//!
//! Operator command-line interface for a running track queue service.
//!
//! Every command is a thin call against the service's HTTP API:
//! - Health and per-queue statistics
//! - Dead-letter inspection and replay
//! - Forced processing, queue clearing and age-based cleanup

use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use track_queue_api::{
    CleanupRequest, ClearRequest, ClearResponse, EnqueueRequest, EnqueueResponse, HealthResponse,
    ProcessRequest, ReplayRequest, StatsResponse,
};
use track_queue_core::{
    CleanupReport, CycleReport, DlqInspection, HealthStatus, PointRecord, QueueStats, QueueType,
    ReplayReport,
};
use tracing::debug;

// ============================================================================
// CLI Structure
// ============================================================================

/// Track Queue CLI - operate a running ingestion queue
#[derive(Debug, Parser)]
#[command(name = "track-queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operate the track ingestion queue")]
pub struct Cli {
    /// Base URL of the track queue service
    #[arg(
        short,
        long,
        global = true,
        env = "TRACK_QUEUE_SERVER",
        default_value = "http://localhost:8080"
    )]
    pub server: String,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Logging level
    #[arg(short, long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value = "30")]
    pub timeout: u64,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the health verdict; exits non-zero when critical
    Health,

    /// Show queue statistics
    Stats {
        /// Queue type; all queues when omitted
        #[arg(value_parser = parse_queue_type)]
        queue: Option<QueueType>,
    },

    /// Show the dead-letter store of a queue
    Inspect {
        #[arg(value_parser = parse_queue_type)]
        queue: QueueType,

        /// Items to list
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Run one processing cycle now
    Process {
        #[arg(value_parser = parse_queue_type)]
        queue: QueueType,

        /// Items to process; the service's worker batch size when omitted
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Replay dead-lettered items
    Replay {
        #[arg(value_parser = parse_queue_type)]
        queue: QueueType,

        /// Items to replay
        #[arg(short = 'n', long, default_value = "100")]
        limit: usize,

        /// Only report what would pass validation
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every pending item of a queue
    Clear {
        #[arg(value_parser = parse_queue_type)]
        queue: QueueType,

        /// Also empty the dead-letter store
        #[arg(long)]
        include_dlq: bool,

        /// Confirm the purge
        #[arg(short, long)]
        yes: bool,
    },

    /// Purge queue and dead-letter entries older than a given age
    Cleanup {
        /// Maximum age in seconds
        #[arg(long)]
        max_age_secs: u64,

        /// Only count matching entries
        #[arg(long)]
        dry_run: bool,
    },
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

fn parse_queue_type(value: &str) -> Result<QueueType, String> {
    value.parse::<QueueType>().map_err(|e| e.to_string())
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Could not reach the service: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("Service returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Refusing to clear {queue_type} without --yes")]
    ConfirmationRequired { queue_type: QueueType },

    #[error("Service health is {status}")]
    Unhealthy { status: HealthStatus },

    #[error("Could not encode output: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Connection(_) => 1,
            Self::Server { status, .. } if *status >= 500 => 2,
            Self::Server { .. } => 3,
            Self::InvalidArgument { .. } | Self::ConfirmationRequired { .. } => 4,
            Self::Unhealthy { .. } => 5,
            Self::Output(_) => 6,
        }
    }
}

// ============================================================================
// HTTP Client
// ============================================================================

/// Typed client for the service's HTTP API
#[derive(Debug, Clone)]
pub struct AdminClient {
    base_url: String,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CliError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(CliError::InvalidArgument {
                arg: "server".to_string(),
                message: format!("'{}' is not an http(s) URL", base_url),
            });
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CliError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(CliError::Server {
            status: status.as_u16(),
            message: error_message(&body).unwrap_or_else(|| status.to_string()),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        debug!(path = path, "GET");
        let response = self.http.get(self.url(path)).send().await?;
        Self::decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CliError> {
        debug!(path = path, "POST");
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    /// Health report; a critical service answers 503 but still sends the report
    pub async fn health(&self) -> Result<HealthResponse, CliError> {
        let response = self.http.get(self.url("/health")).send().await?;
        if response.status() != StatusCode::SERVICE_UNAVAILABLE {
            return Self::decode(response).await;
        }

        let body = response.text().await?;
        serde_json::from_str::<HealthResponse>(&body).map_err(|_| CliError::Server {
            status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            message: error_message(&body).unwrap_or_else(|| "service unavailable".to_string()),
        })
    }

    pub async fn all_stats(&self) -> Result<Vec<QueueStats>, CliError> {
        let response: StatsResponse = self.get("/stats").await?;
        Ok(response.queues)
    }

    pub async fn stats(&self, queue_type: QueueType) -> Result<QueueStats, CliError> {
        self.get(&format!("/stats/{}", queue_type)).await
    }

    pub async fn enqueue(
        &self,
        queue_type: QueueType,
        points: Vec<PointRecord>,
        priority: Option<f64>,
    ) -> Result<EnqueueResponse, CliError> {
        self.post(
            &format!("/queues/{}/points", queue_type),
            &EnqueueRequest { points, priority },
        )
        .await
    }

    pub async fn inspect(&self, queue_type: QueueType, limit: usize) -> Result<DlqInspection, CliError> {
        self.get(&format!("/admin/dlq/{}?limit={}", queue_type, limit))
            .await
    }

    pub async fn process(
        &self,
        queue_type: QueueType,
        batch_size: Option<usize>,
    ) -> Result<CycleReport, CliError> {
        self.post(
            &format!("/admin/queues/{}/process", queue_type),
            &ProcessRequest { batch_size },
        )
        .await
    }

    pub async fn replay(
        &self,
        queue_type: QueueType,
        limit: usize,
        dry_run: bool,
    ) -> Result<ReplayReport, CliError> {
        self.post(
            &format!("/admin/dlq/{}/replay", queue_type),
            &ReplayRequest { limit, dry_run },
        )
        .await
    }

    pub async fn clear(
        &self,
        queue_type: QueueType,
        include_dlq: bool,
    ) -> Result<ClearResponse, CliError> {
        self.post(
            &format!("/admin/queues/{}/clear", queue_type),
            &ClearRequest {
                include_dlq,
                confirm: true,
            },
        )
        .await
    }

    pub async fn cleanup(&self, max_age_seconds: u64, dry_run: bool) -> Result<CleanupReport, CliError> {
        self.post(
            "/admin/cleanup",
            &CleanupRequest {
                max_age_seconds,
                dry_run,
            },
        )
        .await
    }
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("error")?
        .as_str()
        .map(str::to_string)
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Parse arguments, run the command and print its output
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli.log_level);

    let output = execute(&cli).await?;
    println!("{}", output);
    Ok(())
}

/// Run the parsed command and return what should be printed
///
/// A critical health verdict prints the report and then fails with
/// [`CliError::Unhealthy`].
pub async fn execute(cli: &Cli) -> Result<String, CliError> {
    let client = AdminClient::new(&cli.server, Duration::from_secs(cli.timeout))?;
    let format = cli.format;

    match &cli.command {
        Commands::Health => {
            let health = client.health().await?;
            let output = render(format, &health, render_health)?;
            if health.report.status == HealthStatus::Critical {
                println!("{}", output);
                return Err(CliError::Unhealthy {
                    status: health.report.status,
                });
            }
            Ok(output)
        }
        Commands::Stats { queue: Some(queue) } => {
            let stats = vec![client.stats(*queue).await?];
            render(format, &stats, |s| render_stats(s))
        }
        Commands::Stats { queue: None } => {
            let stats = client.all_stats().await?;
            render(format, &stats, |s| render_stats(s))
        }
        Commands::Inspect { queue, limit } => {
            let inspection = client.inspect(*queue, *limit).await?;
            render(format, &inspection, render_inspection)
        }
        Commands::Process { queue, batch_size } => {
            if *batch_size == Some(0) {
                return Err(CliError::InvalidArgument {
                    arg: "batch-size".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
            let report = client.process(*queue, *batch_size).await?;
            render(format, &report, render_cycle)
        }
        Commands::Replay {
            queue,
            limit,
            dry_run,
        } => {
            let report = client.replay(*queue, *limit, *dry_run).await?;
            render(format, &report, render_replay)
        }
        Commands::Clear {
            queue,
            include_dlq,
            yes,
        } => {
            if !yes {
                return Err(CliError::ConfirmationRequired { queue_type: *queue });
            }
            let response = client.clear(*queue, *include_dlq).await?;
            render(format, &response, render_clear)
        }
        Commands::Cleanup {
            max_age_secs,
            dry_run,
        } => {
            let report = client.cleanup(*max_age_secs, *dry_run).await?;
            render(format, &report, render_cleanup)
        }
    }
}

fn initialize_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    // Ignore the error when a subscriber is already installed
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

// ============================================================================
// Output Rendering
// ============================================================================

fn render<T: Serialize>(
    format: OutputFormat,
    value: &T,
    text: impl FnOnce(&T) -> String,
) -> Result<String, CliError> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        OutputFormat::Text => Ok(text(value)),
    }
}

pub fn render_health(health: &HealthResponse) -> String {
    let mut out = format!("Status: {}\n", health.report.status);
    for queue in &health.report.queues {
        let _ = write!(
            out,
            "  {:<14} {:<9} pending={} dlq={}",
            queue.queue_type.as_str(),
            queue.status.to_string(),
            queue.pending,
            queue.dlq_size
        );
        if !queue.reasons.is_empty() {
            let _ = write!(out, " ({})", queue.reasons.join("; "));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

pub fn render_stats(stats: &[QueueStats]) -> String {
    let mut out = format!(
        "{:<14} {:>8} {:>9} {:>6} {:>10} {:>8} {:>8}",
        "QUEUE", "PENDING", "IN-FLIGHT", "DLQ", "PROCESSED", "FAILED", "RETRIED"
    );
    for s in stats {
        let _ = write!(
            out,
            "\n{:<14} {:>8} {:>9} {:>6} {:>10} {:>8} {:>8}",
            s.queue_type.as_str(),
            s.pending,
            s.in_flight,
            s.dlq_size,
            s.processed_total,
            s.failed_total,
            s.retried_total
        );
    }
    out
}

pub fn render_inspection(inspection: &DlqInspection) -> String {
    let mut out = format!(
        "Dead-letter store of {}: {} item(s)",
        inspection.queue_type, inspection.count
    );
    for item in &inspection.items {
        let _ = write!(
            out,
            "\n  {}  {:>5} point(s)  retries={}  failed_at={}  {}",
            item.id, item.count, item.retry_count, item.failed_at, item.reason
        );
    }
    out
}

pub fn render_cycle(report: &CycleReport) -> String {
    format!(
        "Fetched {} item(s): {} point(s) persisted, {} retried, {} dead-lettered, {} malformed",
        report.fetched_items,
        report.persisted_points,
        report.retries.len(),
        report.dead_lettered.len(),
        report.malformed
    )
}

pub fn render_replay(report: &ReplayReport) -> String {
    let prefix = if report.dry_run { "Dry run: " } else { "" };
    format!(
        "{}{} attempted, {} reprocessed, {} still failing, {} point(s) persisted, {} remaining",
        prefix,
        report.attempted,
        report.reprocessed,
        report.still_failing,
        report.persisted_points,
        report.remaining
    )
}

pub fn render_clear(response: &ClearResponse) -> String {
    format!(
        "Cleared {}: {} queued item(s), {} dead-letter item(s)",
        response.queue_type, response.removed.queue, response.removed.dead_letter
    )
}

pub fn render_cleanup(report: &CleanupReport) -> String {
    let verb = if report.dry_run { "Would remove" } else { "Removed" };
    let mut out = format!(
        "{} {} entr{} older than {}",
        verb,
        report.total(),
        if report.total() == 1 { "y" } else { "ies" },
        report.cutoff
    );
    for queue in report
        .queues
        .iter()
        .filter(|q| q.queue_entries + q.dead_letters > 0)
    {
        let _ = write!(
            out,
            "\n  {:<14} queue={} dlq={}",
            queue.queue_type.as_str(),
            queue.queue_entries,
            queue.dead_letters
        );
    }
    out
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
