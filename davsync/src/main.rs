use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use davsync::config::RunConfig;
use davsync::journal::SqliteJournal;
use davsync::propagator::{Propagator, PropagatorEvent, PropagatorRun, Status, SyncItem};
use davsync::transfer::DavTransport;
use davsync_core::DavClient;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run(PathBuf),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut changes = None;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliMode::Help),
            other if other.starts_with('-') => anyhow::bail!("unknown argument: {other}"),
            other => {
                if changes.is_some() {
                    anyhow::bail!("only one change list can be given");
                }
                changes = Some(PathBuf::from(other));
            }
        }
    }
    changes
        .map(CliMode::Run)
        .context("missing change list; see --help")
}

fn print_help() {
    println!("Usage: davsync <changes.json>");
    println!("  Applies a reconciled change list to the local tree and the WebDAV server.");
    println!();
    println!("Environment:");
    println!("  DAVSYNC_SERVER_URL        server base url (required)");
    println!("  DAVSYNC_TOKEN             bearer token, or DAVSYNC_USER + DAVSYNC_PASSWORD");
    println!("  DAVSYNC_LOCAL_DIR         local sync root (default ~/DavSync)");
    println!("  DAVSYNC_REMOTE_ROOT       server path of the sync root");
    println!("  DAVSYNC_REMOTE_FOLDER     folder this connection is mapped to");
    println!("  DAVSYNC_JOURNAL           journal database path");
    println!("  DAVSYNC_MAX_PARALLEL      concurrent transfers (default 3)");
    println!("  DAVSYNC_UPLOAD_LIMIT      bytes per second, 0 for unlimited");
    println!("  DAVSYNC_DOWNLOAD_LIMIT    bytes per second, 0 for unlimited");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("davsync=info")),
        )
        .init();

    let changes = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            print_help();
            return Ok(());
        }
        CliMode::Run(changes) => changes,
    };
    let raw = tokio::fs::read_to_string(&changes)
        .await
        .with_context(|| format!("failed to read change list {}", changes.display()))?;
    let items: Vec<SyncItem> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse change list {}", changes.display()))?;

    let config = RunConfig::from_env()?;
    let journal = match &config.journal_path {
        Some(path) => SqliteJournal::open(path).await,
        None => SqliteJournal::open_default().await,
    }
    .context("failed to open journal")?;
    let client = DavClient::new(&config.server_url, config.credentials.clone())
        .context("invalid server url")?;
    let propagator = Propagator::new(
        config.propagator,
        Arc::new(journal),
        Arc::new(DavTransport::new(client)),
    );

    let PropagatorRun { mut events, task } = propagator.start(items)?;
    let aborter = propagator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, aborting propagation");
            aborter.abort().await;
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            PropagatorEvent::ItemCompleted(outcome) => println!("{}", serde_json::to_string(&outcome)?),
            PropagatorEvent::Progress {
                kind,
                path,
                bytes,
                total,
            } => debug!(?kind, path = %path, bytes, total, "progress"),
            PropagatorEvent::TransmissionSizeChanged(delta) => {
                debug!(delta, "transmission size changed")
            }
            PropagatorEvent::Finished(status) => info!(?status, "finished"),
        }
    }

    let summary = task.await.context("propagation task failed")?;
    match summary.status {
        Status::Success | Status::FileIgnored | Status::NoStatus => Ok(()),
        status => anyhow::bail!("propagation finished with {status:?}"),
    }
}
