use color_eyre::{eyre::eyre, Result};
use pcmon_mqtt::config::AppConfig;
use pcmon_mqtt::metrics::{publish_power_state, start_publisher_task, MetricsSnapshot};
use pcmon_mqtt::mqtt::discovery::entity_names;
use pcmon_mqtt::mqtt::message_manager::QoS;
use pcmon_mqtt::mqtt::mqtt_handler::{SessionEvent, SessionHandle};
use pcmon_mqtt::mqtt::router::{CommandAction, CommandRouter, InboundCommand};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = AppConfig::config_path();
    if let Err(e) = AppConfig::ensure_default_config(&config_path).await {
        warn!("Could not write default config: {}", e);
    }
    let config = AppConfig::load_or_default(&config_path).await;
    setup_logging(config.logging.level().unwrap_or_else(|e| {
        eprintln!("{}, falling back to info", e);
        Level::INFO
    }));

    let session_config = config.session_config();
    let device_id = session_config.device_id.clone();
    info!("Starting pcmon-mqtt as device '{}'", device_id);
    for name in entity_names(&device_id) {
        debug!("Entity: {}", name);
    }

    let (action_tx, action_rx) = mpsc::channel(16);
    let router = command_router(&device_id, action_tx);
    let command_filter = router.command_filter();

    let session = SessionHandle::spawn_mqtt(session_config, Some(router))
        .map_err(|e| eyre!("Failed to start MQTT session: {}", e))?;

    // Filled by the platform sampler; the action sink keeps power_state current.
    let (snapshot_tx, snapshot_rx) = watch::channel(MetricsSnapshot::default());
    start_publisher_task(
        session.clone(),
        device_id.clone(),
        snapshot_rx,
        config.metrics.interval(),
    );

    tokio::spawn(log_status(session.clone()));
    tokio::spawn(handle_actions(
        session.clone(),
        device_id.clone(),
        snapshot_tx,
        action_rx,
    ));
    #[cfg(unix)]
    tokio::spawn(resume_on_signal(session.clone()));

    session.subscribe(command_filter, QoS::AtLeastOnce).await?;
    session.connect().await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("Shutting down");
    session.shutdown().await?;
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
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Forwards power commands that switch an entity on to `actions`; the router
/// runs on the session task, so nothing here may block.
fn command_router(device_id: &str, actions: mpsc::Sender<InboundCommand>) -> CommandRouter {
    CommandAction::SWITCHES
        .iter()
        .fold(CommandRouter::new(device_id), |router, action| {
            let actions = actions.clone();
            router.on(*action, move |command| {
                if !command.is_on() {
                    debug!(
                        "Ignoring {} command with payload '{}'",
                        command.action, command.payload
                    );
                    return;
                }
                if let Err(e) = actions.try_send(command.clone()) {
                    warn!("Dropping {} command: {}", command.action, e);
                }
            })
        })
}

/// Action sink. Executing power actions is up to the platform shell, so this
/// reports the new power state and logs the request.
async fn handle_actions(
    session: SessionHandle,
    device_id: String,
    snapshot: watch::Sender<MetricsSnapshot>,
    mut actions: mpsc::Receiver<InboundCommand>,
) {
    while let Some(command) = actions.recv().await {
        warn!(
            "Power action requested: {} (payload: {})",
            command.action, command.payload
        );
        if let Some(state) = command.action.power_state() {
            snapshot.send_modify(|snapshot| snapshot.power_state = state);
            if let Err(e) = publish_power_state(&session, &device_id, state).await {
                error!("Failed to report power state {}: {}", state, e);
            }
        }
    }
}

async fn log_status(session: SessionHandle) {
    let mut events = session.events();
    loop {
        match events.recv().await {
            Ok(SessionEvent::Status(status)) => info!("MQTT Status: {}", status),
            Ok(SessionEvent::Message(message)) => debug!("Received on {}", message.topic),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Status log lagged, skipped {} events", skipped)
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// `kill -USR1` asks the session to re-establish its link, the same thing
/// the tray shell does after an OS resume notification.
#[cfg(unix)]
async fn resume_on_signal(session: SessionHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut resumes = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot listen for SIGUSR1: {}", e);
            return;
        }
    };
    while resumes.recv().await.is_some() {
        match session.resume().await {
            Ok(outcome) => info!("Resume requested: {:?}", outcome),
            Err(_) => break,
        }
    }
}
