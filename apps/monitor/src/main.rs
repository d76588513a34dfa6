use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ibpmon::api;
use ibpmon::bus::{NatsBus, StatusBus};
use ibpmon::config::{Config, FileConfigSource};
use ibpmon::error::StartupError;
use ibpmon::monitoring::probes;
use ibpmon::monitoring::{CheckManager, CheckRegistry, ResultSink};
use ibpmon::results::ResultsStore;

const DEFAULT_CONFIG_PATH: &str = "ibpmonitor.json";
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn config_path_from_args(mut args: impl Iterator<Item = String>) -> PathBuf {
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        } else if let Some(path) = arg.strip_prefix("--config=") {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = config_path_from_args(env::args().skip(1));
    if !config_path.exists() {
        eprintln!("{}", StartupError::ConfigMissing(config_path));
        return ExitCode::FAILURE;
    }
    let config = match Config::load(&config_path).map_err(StartupError::from) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::FAILURE;
        }
    };

    logger::init(&config.local.system.log_level);
    info!(version = VERSION, config = %config_path.display(), "IBPMonitor starting");

    let store = Arc::new(ResultsStore::new());

    let bus = match NatsBus::connect(&config.local.nats).await {
        Ok(bus) => Arc::new(bus),
        Err(error) => {
            error!(%error, "Failed to connect to NATS");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = bus.enable_monitor_role().await {
        error!(%error, "Failed to enable monitor role");
        return ExitCode::FAILURE;
    }

    let shutdown = CancellationToken::new();
    let bus_listener = bus.spawn_official_listener(Arc::clone(&store), shutdown.clone());

    let mut registry = CheckRegistry::new();
    probes::register_builtin(&mut registry);
    let registry = Arc::new(registry);

    let status_bus: Arc<dyn StatusBus> = bus.clone();
    let sink =
        Arc::new(ResultSink::new(Arc::clone(&store), status_bus, config.local.nats.node_id.clone()));

    let api_store = Arc::clone(&store);
    let listen_address = config.local.monitor_api.listen_address.clone();
    let listen_port = config.local.monitor_api.listen_port.clone();
    let api_shutdown = shutdown.clone();
    let api_task = tokio::spawn(async move {
        if let Err(error) = api::serve(api_store, &listen_address, &listen_port, api_shutdown).await
        {
            error!(%error, "Monitor results API terminated");
        }
    });

    let config_source = Arc::new(FileConfigSource::new(config_path.clone()));
    let manager = CheckManager::new(config, config_source, registry, sink);
    manager.start().await;

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received, cleaning up");

    manager.stop().await;
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        let _ = api_task.await;
        let _ = bus_listener.await;
    })
    .await;

    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            error!(%error, "Failed to install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> impl Iterator<Item = String> {
        values.iter().map(|value| value.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn config_flag_variants_are_accepted() {
        assert_eq!(
            config_path_from_args(args(&["--config", "/etc/ibp/monitor.json"])),
            PathBuf::from("/etc/ibp/monitor.json")
        );
        assert_eq!(
            config_path_from_args(args(&["--config=/etc/ibp/monitor.json"])),
            PathBuf::from("/etc/ibp/monitor.json")
        );
    }

    #[test]
    fn missing_flag_falls_back_to_the_default_path() {
        assert_eq!(config_path_from_args(args(&[])), PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(config_path_from_args(args(&["--config"])), PathBuf::from(DEFAULT_CONFIG_PATH));
    }
}
