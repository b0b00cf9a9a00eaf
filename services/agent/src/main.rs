//! tether agent
//!
//! Heartbeats the objects named in `TETHER_TRACK` and logs every change in
//! the watched namespace until interrupted.

use std::sync::Arc;

use anyhow::Result;
use tether_agent::config::Config;
use tether_agent::{
    handler_fn, InMemoryApi, KubeClient, ResourceApi, ResourceKind, ResourceLifecycle, WatchEvent,
    WatchRequest,
};
use tether_resource::{Resource, ResourceKey};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        api_url = %config.api_url,
        namespace = %config.namespace,
        heartbeat_interval_secs = config.heartbeat_interval_secs,
        memory = config.memory,
        "Starting tether agent"
    );

    let api: Arc<dyn ResourceApi> = if config.memory {
        Arc::new(InMemoryApi::new())
    } else {
        Arc::new(KubeClient::new(&config.api_url, ResourceKind::services())?)
    };

    let lifecycle = ResourceLifecycle::with_watch_config(
        Arc::clone(&api),
        config.heartbeat_config(),
        config.watch_config(),
    )?;

    // Start heartbeats
    for name in &config.track {
        let key = match ResourceKey::new(name.clone(), config.namespace.clone()) {
            Ok(key) => key,
            Err(e) => {
                warn!(name = %name, error = %e, "Skipping invalid track entry");
                continue;
            }
        };

        if config.memory {
            // Nothing exists in a fresh store; create what we track.
            let resource = Resource::new("v1", "Service", key.name(), key.namespace());
            if let Err(e) = lifecycle.create_and_track(resource).await {
                error!(key = %key, error = %e, "Failed to create tracked object");
            }
        } else {
            lifecycle.track(key).await?;
        }
    }

    // Start the watch
    let mut request = WatchRequest::namespace(config.namespace.clone());
    if let Some(name) = &config.watch_name {
        request = request.named(name.clone());
    }
    let subscription = lifecycle.watch(
        request,
        handler_fn(|event: WatchEvent| {
            let resource = event.resource();
            info!(
                kind = event.kind(),
                name = %resource.name(),
                namespace = %resource.namespace(),
                resource_version = ?resource.resource_version(),
                "Resource changed"
            );
        }),
    )?;

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = subscription.stopped() => {
            warn!("Watch stopped on its own");
        }
    }

    subscription.stop().await;
    let stopped = lifecycle.shutdown().await;

    info!(heartbeats = stopped, "tether agent shutdown complete");
    Ok(())
}
