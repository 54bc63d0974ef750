//! Sensor node binary.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin node [-- --resume]`
//! - **ESP32**: `cargo espflash flash --bin node --features esp32 --release`
//!
//! On ESP32 one process runs exactly one wake cycle and then enters deep
//! sleep. On the host the wake cycles loop, with a tokio sleep standing in for
//! deep sleep, a simulated access point and a stdin console playing the
//! provisioning peer. Type `help` for console commands.
//!
//! The first host cycle is a power-on wake and therefore provisions; pass
//! `--resume` to start as if woken by the timer.

use log::info;
use sensor_node_fw::event;

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== Sensor node starting ===");

    #[cfg(feature = "esp32")]
    esp::run().await;

    #[cfg(not(feature = "esp32"))]
    host::run().await;
}

#[cfg(feature = "esp32")]
mod esp {
    use super::event;
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use log::{error, info};
    use sensor_node_fw::platform::{EspPlatform, Platform};
    use sensor_node_fw::provisioning::BleLink;
    use sensor_node_fw::store::{NvsStorage, PersistentStore};
    use sensor_node_fw::telemetry::{MqttPublisher, StubSensor};
    use sensor_node_fw::wifi::{ConnectionManager, EspRadio};
    use sensor_node_fw::{NodeConfig, NodeContext, Orchestrator};

    pub async fn run() {
        let config = NodeConfig::default();
        let (tx, mut rx) = event::channel();

        let orchestrator = match boot(&config, tx) {
            Ok(orchestrator) => orchestrator,
            Err(fault) => {
                error!("Boot failed, going to sleep: {}", fault);
                let mut platform = EspPlatform::new();
                if let Err(e) = platform.arm_wake_timer(config.wake_interval()) {
                    error!("{}", e);
                }
                platform.enter_deep_sleep();
            }
        };

        let report = orchestrator.run_cycle(&mut rx).await;
        info!("Cycle finished: {:?}", report.visited);
        EspPlatform::new().enter_deep_sleep()
    }

    type Node = Orchestrator<NvsStorage, EspRadio, BleLink, MqttPublisher, EspPlatform, StubSensor>;

    fn boot(config: &NodeConfig, tx: event::EventSender) -> Result<Node, String> {
        let storage = NvsStorage::take().map_err(|e| e.to_string())?;
        let peripherals = Peripherals::take().map_err(|e| format!("peripherals: {:?}", e))?;
        let sysloop = EspSystemEventLoop::take().map_err(|e| format!("event loop: {:?}", e))?;

        let radio = EspRadio::new(
            peripherals.modem,
            sysloop,
            Some(storage.partition()),
            tx.clone(),
        )
        .map_err(|e| e.to_string())?;
        let link = BleLink::new(&config.device_name, tx).map_err(|e| e.to_string())?;

        let platform = EspPlatform::new();
        let client_id = format!(
            "sensor-{}",
            platform
                .device_mac()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>()
        );
        let publisher =
            MqttPublisher::connect(&config.broker_url, &client_id).map_err(|e| e.to_string())?;

        Ok(Orchestrator::new(
            config.clone(),
            NodeContext::new(PersistentStore::new(storage), ConnectionManager::new(radio)),
            link,
            publisher,
            platform,
            StubSensor,
        ))
    }
}

#[cfg(not(feature = "esp32"))]
mod host {
    use super::event;
    use log::{debug, error, info, warn};
    use sensor_node_fw::console::{ConsoleCommand, HELP_TEXT};
    use sensor_node_fw::platform::HostPlatform;
    use sensor_node_fw::sim::{ChannelLink, LogPublisher, SimulatedRadio};
    use sensor_node_fw::store::{FileStorage, PersistentStore};
    use sensor_node_fw::telemetry::StubSensor;
    use sensor_node_fw::wifi::ConnectionManager;
    use sensor_node_fw::{
        Event, EventReceiver, EventSender, NodeConfig, NodeContext, Orchestrator, WakeCause,
    };
    use std::io::{BufRead, Write};
    use std::path::PathBuf;

    /// Network the simulated radio can join, as `ssid:secret`.
    const SIM_AP_ENV: &str = "SENSOR_NODE_SIM_AP";
    const DEFAULT_SIM_AP: (&str, &str) = ("Lab", "pass1234");

    const CONFIG_ENV: &str = "SENSOR_NODE_CONFIG";

    pub async fn run() {
        let config = load_config();
        let storage = match FileStorage::default_location() {
            Ok(storage) => storage,
            Err(e) => {
                error!("No location for the store: {}", e);
                std::process::exit(1);
            }
        };
        info!("Store at {}", storage.root().display());

        let sim_ap = std::env::var(SIM_AP_ENV).ok();
        let (ap_ssid, ap_secret) = sim_ap
            .as_deref()
            .and_then(|s| s.split_once(':'))
            .unwrap_or(DEFAULT_SIM_AP);
        info!("Simulated access point: {}", ap_ssid);

        let (tx, mut rx) = event::channel();
        spawn_console(tx.clone());
        println!("Type 'help' for provisioning commands (Ctrl+C to exit)");

        let publisher = LogPublisher::default();
        let mut wake = if std::env::args().any(|a| a == "--resume") {
            WakeCause::Timer
        } else {
            WakeCause::Other
        };

        loop {
            drop_stale_radio_events(&mut rx, &tx);

            let orchestrator = Orchestrator::new(
                config.clone(),
                NodeContext::new(
                    PersistentStore::new(storage.clone()),
                    ConnectionManager::new(
                        SimulatedRadio::new(tx.clone()).with_access_point(ap_ssid, ap_secret),
                    ),
                ),
                ChannelLink::new().with_events(tx.clone()).echo_replies(),
                publisher.clone(),
                HostPlatform::new(wake),
                StubSensor,
            );

            let report = tokio::select! {
                report = orchestrator.run_cycle(&mut rx) => report,
                _ = tokio::signal::ctrl_c() => break,
            };
            info!(
                "Cycle {:?} online={} window={:?}",
                report.visited, report.online, report.window
            );
            if let Some(fault) = &report.fault {
                warn!("Cycle ended on fault: {}", fault);
            }

            info!("Sleeping {:?}", report.sleep_for);
            tokio::select! {
                _ = tokio::time::sleep(report.sleep_for) => {}
                _ = tokio::signal::ctrl_c() => break,
            }
            wake = WakeCause::Timer;
        }

        info!("Shutting down");
    }

    fn load_config() -> NodeConfig {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => match std::env::var("HOME") {
                Ok(home) => PathBuf::from(home).join(".sensor-node").join("config.json"),
                Err(_) => return NodeConfig::default(),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(json) => match NodeConfig::from_json(&json) {
                Ok(config) => {
                    info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Ignoring {}: {}", path.display(), e);
                    NodeConfig::default()
                }
            },
            Err(e) => {
                debug!("No config at {} ({}), using defaults", path.display(), e);
                NodeConfig::default()
            }
        }
    }

    /// Radio events from the previous cycle's radio mean nothing to the next
    /// one. Console input typed during the sleep is kept.
    fn drop_stale_radio_events(rx: &mut EventReceiver, tx: &EventSender) {
        let mut keep = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Radio(stale) => debug!("Dropping stale {:?}", stale),
                other => keep.push(other),
            }
        }
        for event in keep {
            event::post(tx, event);
        }
    }

    fn spawn_console(tx: EventSender) {
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match ConsoleCommand::parse(&line) {
                    ConsoleCommand::Help => println!("{}", HELP_TEXT),
                    ConsoleCommand::Unknown(hint) => {
                        if !hint.is_empty() {
                            println!("{}", hint);
                        }
                    }
                    command => {
                        if let Some(event) = command.into_event() {
                            event::post(&tx, event);
                        }
                    }
                }
                let _ = std::io::stdout().flush();
            }
        });
    }
}
