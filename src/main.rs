mod article;
mod config;
mod context;
mod error;
mod event;
mod service;
mod storage;

use anyhow::Result;
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Auction tab companion: mirrors bidding preferences into extension
/// storage and arbitrates auto-bid between windows.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extension origin, first half of the window identity
    #[arg(long, default_value = "bidmirror")]
    origin: String,

    /// Window handle, second half of the window identity
    #[arg(long)]
    window: Option<u64>,
}

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bidmirror=debug"));

    // stdout belongs to the host protocol
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let config = config::Config::load(args.config.as_deref())?;
    let identity = context::WindowIdentity::new(
        &args.origin,
        args.window.unwrap_or_else(|| u64::from(std::process::id())),
    );
    info!(window = %identity, "starting");

    let ctx = context::Context::new_shared(identity, config, Arc::new(context::SystemClock));

    let synced: storage::SharedSettingsStore =
        storage::InMemorySettingsStore::new_shared(storage::Tier::Synced);
    let local: storage::SharedSettingsStore =
        storage::InMemorySettingsStore::new_shared(storage::Tier::Local);

    let engine = service::auto_bid::AutoBidEngine::new_shared(ctx.clone(), synced.clone(), local.clone());
    let groups = service::groups::GroupRegistry::new_shared(synced.clone());
    let tracker = service::articles::ArticleTracker::new_shared(ctx.clone(), synced.clone(), local.clone());
    let stdio = service::messaging::StdioTabMessenger::new_shared();

    tracker.load_stored().await?;
    engine.get_state().await?;

    let popup = service::popup::Popup::new_shared(
        ctx.clone(),
        synced.clone(),
        engine.clone(),
        groups,
        tracker.clone(),
        stdio.clone(),
    );

    let svc_ctr = service::ServiceControl::new();

    ctrlc::set_handler({
        let svc_ctr = svc_ctr.clone();
        move || {
            eprintln!("Stopping all services...");
            svc_ctr.stop_all();
        }
    })?;

    let handles = vec![
        svc_ctr.spawn_loop(service::auto_bid::LivenessSweep::new(engine.clone())),
        svc_ctr.spawn_loop(service::articles::TabScanner::new(tracker.clone())),
        svc_ctr.spawn_change_follower(
            service::auto_bid::AutoBidWatcher::new(engine.clone()),
            synced.subscribe(),
        ),
        svc_ctr.spawn_loop(service::popup::StdioBridge::new(popup, stdio, svc_ctr.clone())),
    ];

    for result in futures::future::join_all(handles.into_iter().map(|h| h.join())).await {
        result?;
    }

    Ok(())
}
