use std::{path::PathBuf, sync::Arc};

use manipulator::{
    communication::run_communication_layer,
    config::{create_default_config, init_config, should_create_config},
    controller::{MultiAxisManager, run_controller},
    events::{ChannelSink, EventSink, FanOut, TracingSink},
    logging,
    models::ManipulatorCommand,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init()?;

    if should_create_config() {
        create_default_config(None::<PathBuf>)?;
    }

    let (config_manager, config) = init_config().map_err(|e| {
        error!("Failed to load configuration: {:#}", e);
        error!("Run with CREATE_CONFIG=1 to create a default configuration file.");
        e
    })?;
    info!(path = %config_manager.path().display(), "Configuration loaded");

    let sink: Arc<dyn EventSink> = Arc::new(FanOut(vec![
        Arc::new(TracingSink) as Arc<dyn EventSink>,
        Arc::new(ChannelSink::new(config.service.event_capacity)) as Arc<dyn EventSink>,
    ]));
    let manager = Arc::new(MultiAxisManager::from_config(&config, sink));

    let (command_tx, command_rx) = mpsc::channel(32);
    let controller = tokio::spawn(run_controller(command_rx, Arc::clone(&manager)));

    match manager.dispatch(ManipulatorCommand::Connect).await {
        Ok(_) => info!("Manipulator connected"),
        Err(e) => warn!("Starting without hardware: {}", e.message),
    }

    let socket_path = config.service.socket_path.clone();
    tokio::select! {
        result = run_communication_layer(&socket_path, command_tx) => {
            if let Err(e) = result {
                error!("Communication layer stopped: {:#}", e);
            }
        }
        result = controller => {
            warn!(?result, "Controller task ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    manager.pause_path().await;
    manager.disconnect_all().await;
    info!("Manipulator stopped");
    Ok(())
}
