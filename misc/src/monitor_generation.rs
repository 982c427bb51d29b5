use anyhow::{Context, Result};
use lib_sync::{
    install_signal_hooks, ApiClient, CleanupRegistry, GenerationTracker, HttpGenerationApi,
};
use log::{info, warn};
use std::env;
use std::sync::Arc;

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

    let base_url = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "http://127.0.0.1:8787/".to_string());
    let signal_id = args.get(2).cloned().unwrap_or_default();
    let auth_token = args
        .get(3)
        .cloned()
        .or_else(|| env::var("SYNC_AUTH_TOKEN").ok());

    if signal_id.is_empty() {
        anyhow::bail!("Usage: monitor_generation <base_url> <signal_id> [auth_token]");
    }

    let registry = CleanupRegistry::new();
    let hooks = install_signal_hooks(registry.clone()).context("Failed to install signal hooks")?;

    let api = Arc::new(HttpGenerationApi::new(Arc::new(ApiClient::new(
        &base_url, auth_token,
    ))));
    let tracker = GenerationTracker::new(api, registry.clone(), signal_id.clone());

    info!("Checking for an existing generation for signal {}...", signal_id);
    tracker.refresh_status().await;

    let state = tracker.state();
    if let Some(error) = &state.error {
        warn!("Lookup failed: {}", error);
    }
    let Some(generation) = state.generation else {
        info!("No generation found for signal {}.", signal_id);
        return Ok(());
    };

    info!(
        "Found generation {} ({:?}): {}/{} contacts processed",
        generation.generation_id,
        generation.status,
        generation.contacts_processed,
        generation.total_emails
    );

    // Follow the job until it reaches a terminal state.
    let mut updates = tracker.subscribe();
    while tracker.state().is_in_progress() {
        if updates.changed().await.is_err() || registry.is_cleaned_up() {
            break;
        }
        let state = updates.borrow_and_update().clone();
        if let Some(generation) = &state.generation {
            info!(
                "Generation {} ({:?}): {}/{} contacts processed, {} emails ready",
                generation.generation_id,
                generation.status,
                generation.contacts_processed,
                generation.total_emails,
                generation.generated_emails.len()
            );
        }
    }

    let state = tracker.state();
    if state.has_results() {
        info!("Generation finished with results:");
        for email in &state.generation.expect("generation present").generated_emails {
            println!("{}", serde_json::to_string(email)?);
        }
    } else if state.has_failed() {
        let message = state
            .generation
            .and_then(|g| g.error_message)
            .unwrap_or_else(|| "no error message supplied".to_string());
        warn!("Generation failed: {}", message);
    }

    info!("Final resource counts: {:?}", registry.resource_counts());
    hooks.abort();
    Ok(())
}
