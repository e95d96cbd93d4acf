//! Watch a game session
//!
//! Joins a session, then prints every cache change, push and connection flip
//! until interrupted. Request statistics are printed on exit.
//!
//! Run with:
//!
//! ```text
//! SEGSYNC_URL=ws://localhost:8000/ws SEGSYNC_SESSION=AB12CD cargo run --example watch
//! ```

use segsync::client::{Collection, ExponentialBackoff, SledSessionStore};
use segsync::core::ObservabilityConfig;
use segsync::{ClientBuilder, SyncEvent};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let url = std::env::var("SEGSYNC_URL").unwrap_or_else(|_| "ws://localhost:8000/ws".into());
    let session = std::env::var("SEGSYNC_SESSION").ok();

    let store = Arc::new(SledSessionStore::open("segsync-watch.db")?);

    let client = ClientBuilder::new(url)
        .instance_id("watch")
        .with_reconnect(Box::new(
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(15))
                .with_jitter(),
        ))
        .with_session_store(store)
        .with_observability(ObservabilityConfig::new("segsync-watch").with_log_level("info"))
        .build()?;

    let mut events = client.subscribe();

    if let Err(e) = client.connect().await {
        tracing::warn!(error = %e, "first attempt failed, retrying in the background");
    }

    if let Some(token) = session {
        match client.join_session(&token).await {
            Ok(_) => tracing::info!(session_id = %token, "joined"),
            Err(e) => tracing::error!(session_id = %token, error = %e, "could not join"),
        }
    } else {
        tracing::info!("no SEGSYNC_SESSION given, resuming the stored session if any");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::CollectionChanged(Collection::Session)) => {
                    let state = client.snapshot().await;
                    println!(
                        "session {:?}: stage {:?} step {:?}/{:?}",
                        state.session.id, state.session.stage, state.session.step, state.session.max_steps
                    );
                }
                Ok(SyncEvent::CollectionChanged(collection)) => {
                    println!("{:?} changed", collection);
                }
                Ok(SyncEvent::Push { topic, .. }) => println!("push {}", topic),
                Ok(SyncEvent::ConnectionChanged { connected, connecting }) => {
                    println!("connected={} connecting={}", connected, connecting);
                }
                Ok(SyncEvent::Error(message)) => tracing::warn!(%message, "client error"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event listener lagged");
                }
                Err(_) => break,
            },
        }
    }

    let stats = client.request_stats().await;
    println!(
        "\n{} requests ({:.1}/min), {} debounced",
        stats.total,
        stats.per_minute(),
        stats.debounced
    );
    for (source, count) in &stats.by_source {
        println!("  {}: {}", source, count);
    }

    client.dispose().await;
    segsync::core::shutdown_observability();
    Ok(())
}
