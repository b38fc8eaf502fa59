use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use knb_adapters::FixtureBoardAdapter;
use knb_storage::NoticeQuery;
use knb_sync::{
    open_store, pipeline_from_config, IngestPipeline, IngestScheduler, SyncConfig, TickOutcome,
};
use knb_web::AppState;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "knb")]
#[command(about = "Kangnam notice board collector and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest once, then keep ingesting on the interval while serving the API.
    Serve,
    /// Run one ingest and print its summary as JSON.
    Sync {
        /// Read the board from a saved HTML file instead of the network.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Create the notice table if it does not exist.
    Migrate,
    /// Print the most recent notices.
    List {
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sync { fixture } => {
            let store = open_store(&config).await?;
            let pipeline = match fixture {
                Some(path) => {
                    let adapter = FixtureBoardAdapter::new(path, &config.base_origin)
                        .context("building fixture adapter")?;
                    IngestPipeline::new(Box::new(adapter), store.clone())
                }
                None => pipeline_from_config(&config, store.clone())?,
            };
            let summary = pipeline.run().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
            store.close().await;
            if !summary.is_committed() {
                bail!("ingest run {} did not commit", summary.run_id);
            }
        }
        Commands::Migrate => {
            let store = open_store(&config).await?;
            let notices = store.count().await.context("counting notices")?;
            store.close().await;
            println!(
                "notice schema ready at {} ({notices} notices)",
                config.database_url
            );
        }
        Commands::List { limit } => {
            let store = open_store(&config).await?;
            let query =
                NoticeQuery::new(store.clone()).with_limit(limit.unwrap_or(config.recent_limit));
            for notice in query.list_recent().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    notice.id,
                    notice.created_at.to_rfc3339(),
                    notice.title,
                    notice.link
                );
            }
            store.close().await;
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let pipeline = Arc::new(pipeline_from_config(&config, store.clone())?);
    let scheduler = IngestScheduler::new(pipeline, config.sync_interval());

    if let TickOutcome::Ran(summary) = scheduler.run_now().await {
        info!(
            new_notices = summary.new_notices,
            committed = summary.is_committed(),
            "startup ingest finished"
        );
    }
    let mut jobs = scheduler.start().await?;

    let state = AppState::new(NoticeQuery::new(store.clone()).with_limit(config.recent_limit));
    let served = knb_web::serve(state, config.web_port, shutdown_signal()).await;

    if let Err(err) = jobs.shutdown().await {
        error!(error = %err, "stopping scheduler failed");
    }
    store.close().await;
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("received shutdown signal, stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_defaults_to_serve() {
        let cli = Cli::parse_from(["knb"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn sync_accepts_fixture_path() {
        let cli = Cli::parse_from(["knb", "sync", "--fixture", "fixtures/kangnam/primary.html"]);
        match cli.command {
            Some(Commands::Sync { fixture }) => {
                assert_eq!(fixture, Some(PathBuf::from("fixtures/kangnam/primary.html")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn list_accepts_limit() {
        let cli = Cli::parse_from(["knb", "list", "--limit", "5"]);
        assert!(matches!(cli.command, Some(Commands::List { limit: Some(5) })));
    }
}
