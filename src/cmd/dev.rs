//! Live-dev sync client — `nixopus dev`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use nixopus::config::{DevClientConfig, NixopusToml};
use nixopus::sync::transport::StateCallback;
use nixopus::sync::{
    FileWatcher, IgnoreRules, StateChange, SyncCallbacks, SyncEngine, Transport, TransportOptions,
};
use nixopus_common::Payload;
use tracing::{debug, warn};

use super::super::DevArgs;

pub fn dev_client_config(config: &NixopusToml, args: DevArgs) -> Result<DevClientConfig> {
    let Some(server_url) = args.server.or_else(|| config.dev.server_url.clone()) else {
        bail!("No server URL: pass --server or set dev.server_url");
    };
    if args.app.trim().is_empty() {
        bail!("--app must not be empty");
    }
    let mut excludes = config.dev.exclude.clone();
    excludes.extend(args.excludes);
    Ok(DevClientConfig {
        server_url,
        token: args.token,
        organization_id: args.org,
        application_id: args.app,
        root: args.dir,
        excludes,
        debounce: Duration::from_millis(args.debounce_ms.unwrap_or(config.dev.debounce_ms)),
        max_reconnect_attempts: args
            .max_reconnect_attempts
            .unwrap_or(config.dev.max_reconnect_attempts),
    })
}

pub async fn cmd_dev(config: &NixopusToml, args: DevArgs) -> Result<()> {
    let client = dev_client_config(config, args)?;
    let root = client
        .root
        .canonicalize()
        .with_context(|| format!("Cannot watch {}", client.root.display()))?;
    let rules = Arc::new(IgnoreRules::new(&root, &client.excludes)?);

    let endpoint = client.endpoint();
    let mut options = TransportOptions::new(&endpoint, &client.token);
    options.organization_id = client.organization_id.clone();
    options.max_reconnect_attempts = client.max_reconnect_attempts;
    let on_state: StateCallback = Arc::new(|change: &StateChange| match &change.error {
        Some(error) if change.attempt > 0 => {
            eprintln!("[{}] attempt {}: {}", change.state, change.attempt, error)
        }
        Some(error) => eprintln!("[{}] {}", change.state, error),
        None => eprintln!("[{}]", change.state),
    });
    let (transport, mut incoming) = Transport::connect(options, Some(on_state))
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;
    let transport = Arc::new(transport);

    let engine = Arc::new(SyncEngine::new(
        rules.clone(),
        transport.clone(),
        SyncCallbacks {
            on_file_synced: Some(Arc::new(|path: &str| debug!(path, "synced"))),
            on_change_detected: Some(Arc::new(|path: &str| println!("changed {path}"))),
        },
    ));
    let total = engine.initial_sync().await?;
    println!("Synced {} files from {}", total, root.display());

    tokio::spawn(async move {
        while let Some(message) = incoming.recv().await {
            match message.payload {
                Payload::Ack(ack) => debug!(path = %ack.path, "acknowledged"),
                Payload::Error(err) => {
                    warn!(path = ?err.path, "server rejected change: {}", err.message)
                }
                _ => {}
            }
        }
    });

    let (_watcher, events) = FileWatcher::start(&root, rules, client.debounce)?;
    println!("Watching {} (Ctrl+C to stop)", root.display());
    let mut sync = tokio::spawn(engine.run(events, transport.subscribe()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("\nStopping..."),
        _ = &mut sync => {}
    }
    transport.close().await;
    sync.abort();
    Ok(())
}
