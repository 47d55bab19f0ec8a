/// batchget - batch HTTP download/upload tool
///
/// Registers one transfer per URL with the coordinator, runs them serially
/// or in parallel over reqwest, and exits once every transfer has finished.
mod config;
mod workers;

use std::process::ExitCode;

use batchget_shared::network::event_channel;
use batchget_shared::TransferCoordinator;
use clap::Parser;
use tracing::{error, info, warn};

use config::{build_tasks, Args, RunConfig};
use workers::http_client::{ClientConfig, HttpNetworkClient};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batchget=info,batchget_shared=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = RunConfig::from_args(args)?;

    config.prepare_output_dir()?;

    let (events, mut event_rx) = event_channel();
    let client = HttpNetworkClient::new(
        &ClientConfig {
            user_agent: config.user_agent.clone(),
            proxy: config.proxy.clone(),
        },
        events,
    )?;
    let shutdown = client.shutdown_signal();

    let mut coordinator =
        TransferCoordinator::new(client, config.mode, config.proxy_credentials.clone());

    let built = build_tasks(&config);
    for task in built.tasks {
        coordinator.register_transfer(task);
    }

    info!(
        "Starting {} transfer(s) in {} mode",
        coordinator.transfers().len(),
        coordinator.mode()
    );
    coordinator.run(&mut event_rx).await;

    if !*shutdown.borrow() {
        warn!("Stopped with {} transfer(s) unfinished", coordinator.transfers().len());
    }

    for task in coordinator.history() {
        match &task.error {
            None => info!(
                "{} {} {} ({} bytes)",
                task.status,
                task.direction.as_str(),
                task.request.url,
                task.transferred
            ),
            Some(e) if e.is_auth_failure() => warn!(
                "{} {} {}: {} (check the supplied credentials)",
                task.status,
                task.direction.as_str(),
                task.request.url,
                e
            ),
            Some(e) => warn!(
                "{} {} {}: {}",
                task.status,
                task.direction.as_str(),
                task.request.url,
                e
            ),
        }
    }

    let stats = coordinator.stats();
    info!(
        "{} succeeded, {} failed, {} skipped, {} bytes",
        stats.completed, stats.failed, built.skipped, stats.bytes
    );

    if config.summary_json {
        println!("{}", stats.to_json()?);
    }

    let clean = stats.failed == 0 && built.skipped == 0 && coordinator.transfers().is_empty();
    Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
