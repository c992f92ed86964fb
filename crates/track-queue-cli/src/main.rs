use track_queue_cli::run_cli;
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!("track-queue: {}", e);
        std::process::exit(e.exit_code());
    }
}
