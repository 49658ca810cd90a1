//! chunkcastd — chunked-transfer receiver and device simulator daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};

use chunkcast_core::config::ChunkcastConfig;
use chunkcast_core::Topics;
use chunkcast_services::{
    ColorService, LampService, MqttTransport, PayloadStore, ReassemblySettings, SessionManager,
    TopicService, Transport, TransferService,
};

mod dispatch;
mod sink;

use dispatch::ServiceDispatcher;

const USAGE: &str = "usage: chunkcastd [--broker HOST] [--port PORT]";

#[derive(Debug, Default, PartialEq, Eq)]
struct DaemonArgs {
    broker: Option<String>,
    port: Option<u16>,
}

impl DaemonArgs {
    /// Returns `Ok(None)` when help was requested.
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Option<Self>> {
        let mut parsed = DaemonArgs::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--broker" => parsed.broker = Some(args.next().context("--broker needs a host")?),
                "--port" => {
                    let port = args.next().context("--port needs a number")?;
                    let port = port
                        .parse()
                        .with_context(|| format!("invalid port {port:?}"))?;
                    parsed.port = Some(port);
                }
                "-h" | "--help" => return Ok(None),
                other => bail!("unexpected argument {other:?}\n{USAGE}"),
            }
        }
        Ok(Some(parsed))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Some(args) = DaemonArgs::parse(std::env::args().skip(1))? else {
        println!("{USAGE}");
        return Ok(());
    };

    // Load config
    if let Err(e) = ChunkcastConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = ChunkcastConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        let mut config = ChunkcastConfig::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    });
    if let Some(host) = args.broker {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    config.validate()?;

    tracing::info!(
        broker = %config.broker.host,
        port = config.broker.port,
        namespace = %config.topics.namespace,
        "chunkcastd starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Transport ────────────────────────────────────────────────────────────
    let packet_limit = config.receive_packet_limit();
    let (transport, inbound) =
        MqttTransport::connect(&config.broker, &config.broker.client_id, packet_limit)
            .await
            .context("failed to connect to broker")?;
    let transport = Arc::new(transport);

    // ── Services ─────────────────────────────────────────────────────────────
    let topics = Topics::new(config.topics.namespace.clone());
    let mut dispatcher = ServiceDispatcher::new();

    let transfer_task = if config.services.transfers {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (manager, handle) = SessionManager::new(
            topics.clone(),
            ReassemblySettings::from(&config.receiver),
            config.receiver.sweep_interval(),
            events_tx,
            shutdown_tx.subscribe(),
        );
        let transfers = Arc::new(TransferService::new(topics, handle.clone()));
        dispatcher.register(transfers as Arc<dyn TopicService>);

        // Periodic session table snapshot
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let Ok(sessions) = handle.snapshot().await else { break };
                for s in sessions.iter() {
                    tracing::info!(
                        transfer = %s.key,
                        filename = %s.filename,
                        received = s.received,
                        total = s.total,
                        idle_secs = s.idle.as_secs(),
                        "  session"
                    );
                }
            }
        });

        // The sink drains until the manager drops its event sender.
        let store = PayloadStore::new(config.receiver.output_dir.clone());
        let sink = sink::EventSink::new(store, events_rx);
        Some(tokio::spawn(async move {
            tokio::try_join!(manager.run(), sink.run()).map(|_| ())
        }))
    } else {
        None
    };

    if config.services.lamp {
        let lamp = Arc::new(LampService::from_config(&config.topics));
        dispatcher.register(lamp as Arc<dyn TopicService>);
    }
    if config.services.color {
        let color = Arc::new(ColorService::from_config(&config.topics));
        dispatcher.register(color as Arc<dyn TopicService>);
    }
    tracing::info!(services = ?dispatcher.service_names(), "services enabled");

    dispatch::subscribe_all(transport.as_ref(), &dispatcher).await?;

    let router_task = tokio::spawn(dispatch::route_loop(
        transport.clone(),
        Arc::new(dispatcher),
        inbound,
        shutdown_tx.subscribe(),
    ));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let transfer_task = async {
        match transfer_task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = router_task        => tracing::error!("router exited: {:?}", r),
        r = transfer_task      => tracing::error!("transfer receiver exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = transport.disconnect().await {
        tracing::warn!(error = %e, "disconnect failed");
    }
    // Let the event loop flush the DISCONNECT packet.
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
