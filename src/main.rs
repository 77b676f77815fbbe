use color_eyre::Result;
use iot_bridge::bridge::InboundLoop;
use iot_bridge::command::CommandRouter;
use iot_bridge::config::BridgeConfig;
use iot_bridge::hub::FanoutHub;
use iot_bridge::mqtt::MqttHandler;
use iot_bridge::server::{self, AppState};
use iot_bridge::state::{MergeEngine, StateStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Transport events buffered between the MQTT task and the inbound loop
const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = BridgeConfig::load().await?;
    let routes = Arc::new(config.routes.clone());

    let store = Arc::new(StateStore::default());
    let hub = Arc::new(FanoutHub::new(store.clone(), config.server.session_buffer));
    let engine = MergeEngine::new(
        store.clone(),
        config.categories.clone(),
        config.bridge.online_policy,
    );

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (mqtt_handler, mqtt_handle) =
        MqttHandler::new(config.mqtt.clone(), routes.subscriptions(), event_tx)?;
    let commands = CommandRouter::new(mqtt_handle, routes.clone(), config.mqtt.command_qos);
    let state = Arc::new(AppState::new(store.clone(), hub.clone(), commands));

    let http_addr = format!("{}:{}", config.server.bind, config.server.port);
    let ws_addr = format!("{}:{}", config.server.bind, config.server.ws_port);
    let http_listener = server::bind(&http_addr).await?;
    let ws_listener = server::bind(&ws_addr).await?;

    let cancel = CancellationToken::new();
    let transport_task = tokio::spawn(mqtt_handler.run(cancel.clone()));
    let inbound_task =
        InboundLoop::new(event_rx, engine, store, hub.clone(), routes).spawn(cancel.clone());
    let http_task = tokio::spawn(server::serve_http(http_listener, state, cancel.clone()));
    let ws_task = tokio::spawn(server::serve_ws(ws_listener, hub, cancel.clone()));

    info!(
        http = %http_addr,
        websocket = %ws_addr,
        broker = %config.mqtt.server,
        policy = ?config.bridge.online_policy,
        "IoT MQTT bridge running"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Unable to listen for shutdown signal");
            }
            info!("Shutting down");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    let (transport, inbound, http, ws) = tokio::join!(transport_task, inbound_task, http_task, ws_task);
    transport?;
    let stats = inbound?;
    info!(
        accepted = stats.accepted,
        dropped = stats.dropped,
        unrouted = stats.unrouted,
        "Bridge stopped"
    );
    http??;
    ws??;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
