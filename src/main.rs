use std::{process, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use trainboard::{
    application::{error::AppError, monitor::Monitor},
    config,
    infra::{http::ReqwestFetcher, sse::SseChannel, telemetry},
    resources::Resources,
    sync::{CacheStore, PushConfig, PushSubscriptionManager, QueryConfig, QueryCoordinator},
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let messages = error.messages();
    if dispatcher::has_been_set() {
        error!(error = %error, causes = ?messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, causes = ?messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    let command = cli_args.command.unwrap_or(config::Command::Watch);

    telemetry::init(&settings.logging)?;

    let store = CacheStore::new();
    let query_config = QueryConfig::from(&settings.query);
    let fetcher = ReqwestFetcher::new(&settings.api)?;
    let channel = SseChannel::new(&settings.api)?;
    let resources = Resources::new(Arc::new(fetcher), query_config.metric_window);
    let coordinator = QueryCoordinator::new(store.clone(), query_config);
    let push = PushSubscriptionManager::new(Arc::new(channel), store.clone(), PushConfig::from(&settings.push));
    let monitor = Monitor::new(coordinator, push.clone(), resources);

    info!(api = %settings.api.base_url, command = ?command, "trainboard starting");

    let shutdown = CancellationToken::new();
    let signal = tokio::spawn(watch_ctrl_c(shutdown.clone()));

    let result = match command {
        config::Command::Watch => monitor.watch_jobs(shutdown.clone()).await,
        config::Command::Job(args) => monitor.watch_job(&args.id, shutdown.clone()).await,
        config::Command::Summary => print_summary(&monitor).await,
    };

    signal.abort();
    push.close_all();
    store.clear();
    info!("trainboard stopped");
    result
}

async fn print_summary(monitor: &Monitor) -> Result<(), AppError> {
    let summary = monitor.summary().await?;
    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|err| AppError::unexpected(format!("failed to render summary: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn watch_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown requested");
            shutdown.cancel();
        }
        Err(err) => warn!(error = %err, "Failed to listen for ctrl-c"),
    }
}
