mod calibration;
mod config;
mod db;
mod error;
mod manual;
mod model;
mod monitor;
mod mqtt;
mod notify;
mod policy;
mod power;
mod service;
mod settings;
mod state;
mod store;
mod threshold;
mod watering;
mod web;

#[cfg(test)]
mod testutil;

use anyhow::{Context, Result};
use irrigation_hw::HardwareAccess;
use std::{env, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::Db;
use manual::ManualOverrideInput;
use monitor::SensorMonitor;
use notify::{FanoutNotifier, NotificationSink, StateNotifier};
use policy::AutomaticIrrigationPolicy;
use power::PowerSafetyGuard;
use service::IrrigationService;
use store::PersistenceStore;
use watering::WateringController;

#[cfg(not(feature = "gpio"))]
fn build_hardware(cfg: &Config) -> Result<Arc<dyn HardwareAccess>> {
    use irrigation_hw::{Scenario, SimulatedHardware};
    use model::SensorKind;

    // Raw counts at the dry and wet ends of the simulated probes.
    const SIM_RAW_DRY: f64 = 26000.0;
    const SIM_RAW_WET: f64 = 8000.0;

    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let volts = |name: &str, default: f64| -> f64 {
        env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    };
    let adc = cfg.adc_scale();
    let divider = cfg.power.divider_ratio;

    let soil_channels: Vec<u8> = cfg
        .sensors
        .iter()
        .filter(|s| s.kind == SensorKind::SoilMoisture)
        .map(|s| s.channel as u8)
        .collect();

    let mut hw = SimulatedHardware::new(scenario, soil_channels, SIM_RAW_DRY, SIM_RAW_WET)
        .with_fixed(
            cfg.power.battery_channel as u8,
            calibration::raw_for_voltage(volts("SIM_BATTERY_V", 12.6), adc, divider),
        )
        .with_fixed(
            cfg.power.solar_channel as u8,
            calibration::raw_for_voltage(volts("SIM_SOLAR_V", 13.5), adc, divider),
        )
        .with_input(cfg.manual.button_pin as u8);

    for s in cfg.sensors.iter().filter(|s| s.kind != SensorKind::SoilMoisture) {
        hw = hw.with_uniform(s.channel as u8, 2000, 2600);
    }

    Ok(Arc::new(hw))
}

#[cfg(feature = "gpio")]
fn build_hardware(cfg: &Config) -> Result<Arc<dyn HardwareAccess>> {
    use irrigation_hw::{RpiHardware, RpiPins};

    let pins = RpiPins {
        adc_addr: 0x48,
        pump: cfg.pump.gpio_pin as u8,
        pump_active_low: cfg.pump.active_low,
        inputs: vec![cfg.manual.button_pin as u8],
    };
    let hw = RpiHardware::new(&pins).context("failed to open raspberry pi hardware")?;
    Ok(Arc::new(hw))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed sensors) ──────────────────────────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    let sensors = db.load_sensors().await?;
    info!(sensors = sensors.len(), "db ready");

    let store: Arc<dyn PersistenceStore> = Arc::new(db);

    // ── Hardware ────────────────────────────────────────────────────
    let hw = build_hardware(&cfg)?;
    // Whatever state the relay came up in, start with the pump off.
    hw.set_pump(false).context("failed to switch pump off at startup")?;

    // ── Shared state (ephemeral, for the status endpoint) ───────────
    let shared = state::shared();
    shared
        .write()
        .await
        .record_system("controller started".to_string());

    // ── Notifications ───────────────────────────────────────────────
    let mut fanout = FanoutNotifier::new().with(Arc::new(StateNotifier::new(shared.clone())));
    match env::var("MQTT_HOST") {
        Ok(host) => {
            let port: u16 = env::var("MQTT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883);
            let (client, eventloop) = mqtt::connect(&host, port);
            tokio::spawn(mqtt::drive(eventloop, shared.clone()));
            fanout = fanout.with(Arc::new(mqtt::MqttNotifier::new(client)));
            info!(%host, port, "mqtt notifications enabled");
        }
        Err(_) => info!("MQTT_HOST not set, mqtt notifications disabled"),
    }
    let notifier: Arc<dyn NotificationSink> = Arc::new(fanout);

    // ── Engine ──────────────────────────────────────────────────────
    let controller = WateringController::new(
        hw.clone(),
        store.clone(),
        notifier.clone(),
        shared.clone(),
        cfg.watering(),
    );
    let guard = Arc::new(PowerSafetyGuard::new(controller.clone(), cfg.power_thresholds()));
    let settings = Arc::new(cfg.runtime_settings());
    let policy = AutomaticIrrigationPolicy::new(
        controller.clone(),
        cfg.irrigation.sensor_id.clone(),
        settings.clone(),
    );
    let monitor = SensorMonitor::new(
        hw.clone(),
        store.clone(),
        notifier,
        guard,
        policy,
        shared.clone(),
        cfg.monitor(),
    );
    monitor.start().await?;

    let (stop_tx, stop_rx) = watch::channel(false);

    // ── Manual override button ──────────────────────────────────────
    let button = ManualOverrideInput::new(
        hw,
        controller.clone(),
        cfg.manual.button_pin as u8,
        cfg.irrigation.sensor_id.clone(),
        cfg.manual_duration(),
        cfg.manual_poll(),
        cfg.manual_debounce(),
    );
    let button_task = tokio::spawn(button.run(stop_rx.clone()));

    // ── Web server ──────────────────────────────────────────────────
    let service = Arc::new(IrrigationService::new(controller.clone(), store, settings));
    let web_task = tokio::spawn(web::serve(
        web::AppState {
            service,
            shared: shared.clone(),
        },
        stop_rx,
    ));

    // ── Run until interrupted ───────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    monitor.stop().await;
    let _ = stop_tx.send(true);
    controller.shutdown().await;

    if let Err(e) = button_task.await {
        warn!(error = %e, "button task ended abnormally");
    }
    match web_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %format!("{e:#}"), "web server failed"),
        Err(e) => warn!(error = %e, "web task ended abnormally"),
    }

    info!("controller stopped");
    Ok(())
}
