//! pvlink - control-system channel protocol engine
//!
//! Hosts named, structured-value channels over PVP with read, write, and
//! subscription delivery.

use pvlink_server::{Config, Server, ServerConfig, StaticProvider};
use pvlink_types::{BitSet, Descriptor, Scalar, ScalarKind, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if PVLINK_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("PVLINK_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("PVLINK_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting pvlink server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!("  Idle timeout: {}s", config.network.idle_timeout_secs);
    tracing::info!(
        "  Segment capacity: {} bytes",
        config.protocol.segment_capacity
    );
    tracing::info!(
        "  Monitor queue capacity: {} slots",
        config.monitor.queue_capacity()
    );

    // Demo channels until a real provider is plugged in
    let provider = Arc::new(StaticProvider::new());
    install_demo_channels(&provider);
    tracing::info!("  Channels: {}", provider.channel_names().join(", "));

    let server = Arc::new(Server::new(
        ServerConfig::from_config(&config),
        provider.clone(),
    ));

    // Ramp the demo counter so monitors have something to watch
    let demo_source = {
        let provider = provider.clone();
        tokio::spawn(async move {
            let mut tick: i64 = 0;
            let mut changed = BitSet::new();
            changed.set(0);
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                tick += 1;
                let value = Value::Structure(vec![
                    Value::Scalar(Scalar::Int64(tick)),
                    Value::Scalar(Scalar::String("ramping".to_string())),
                ]);
                if provider.post("demo:counter", value, &changed).is_err() {
                    return;
                }
            }
        })
    };

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    demo_source.abort();
    tracing::info!("Server stopped");
    Ok(())
}

fn install_demo_channels(provider: &StaticProvider) {
    let counter = Arc::new(Descriptor::Structure {
        name: "counter_t".to_string(),
        fields: vec![
            (
                "value".to_string(),
                Arc::new(Descriptor::Scalar(ScalarKind::Int64)),
            ),
            (
                "state".to_string(),
                Arc::new(Descriptor::Scalar(ScalarKind::String)),
            ),
        ],
    });
    provider.add_channel(
        "demo:counter",
        counter.clone(),
        Value::default_for(&counter),
    );

    let waveform = Arc::new(Descriptor::ScalarArray(ScalarKind::Float64));
    provider.add_channel(
        "demo:waveform",
        waveform,
        Value::Array(vec![Scalar::Float64(0.0); 8]),
    );
}
