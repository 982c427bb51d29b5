use anyhow::{Context, Result};
use lib_sync::{
    install_signal_hooks, CleanupRegistry, SseTransport, StreamClient, StreamHandlers,
    StreamOptions,
};
use log::{info, warn};
use std::env;

fn setup_logging() -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to initialize logging")?;

    let args: Vec<String> = env::args().collect();

    // Endpoint from arguments, auth token from argument or environment
    let endpoint = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "http://127.0.0.1:8787/admin/logs/api/stream".to_string());
    let auth_token = args
        .get(2)
        .cloned()
        .or_else(|| env::var("SYNC_AUTH_TOKEN").ok());

    let registry = CleanupRegistry::new();
    let hooks = install_signal_hooks(registry.clone()).context("Failed to install signal hooks")?;

    let mut options = StreamOptions::new(&endpoint);
    options.auth_token = auth_token.clone();

    let client: StreamClient<serde_json::Value> = StreamClient::spawn(
        SseTransport::new(auth_token),
        options,
        StreamHandlers::default(),
        registry.clone(),
    );
    let mut updates = client.subscribe();

    info!("Tailing stream at {} (Ctrl-C to stop)...", endpoint);

    // Print each item exactly once; a shrinking list means a snapshot
    // replaced the state, so restart from the top.
    let mut printed = 0usize;
    loop {
        if updates.changed().await.is_err() {
            break;
        }
        let snapshot = updates.borrow_and_update().clone();
        if let Some(error) = &snapshot.error {
            warn!("Stream error: {}", error);
        }
        if snapshot.items.len() < printed {
            info!("Snapshot replaced the materialized list. Reprinting...");
            printed = 0;
        }
        for item in snapshot.items.iter().skip(printed) {
            println!("{}", item);
        }
        printed = snapshot.items.len();

        if registry.is_cleaned_up() {
            break;
        }
    }

    info!("Final resource counts: {:?}", registry.resource_counts());
    hooks.abort();
    Ok(())
}
