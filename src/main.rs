//! Controller daemon entry point.
//!
//! ```bash
//! RUST_LOG=debug twcmaster /etc/twcmaster/config.json
//! ```
//!
//! Exits non-zero only for unrecoverable startup failures: a missing or
//! invalid configuration, or a serial port that will not open. Everything
//! after that point degrades instead of exiting.

use env_logger::Env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use twcmaster::allocator::AllocatorState;
use twcmaster::carapi::CarApi;
use twcmaster::config::{apply_debug_level, Config};
use twcmaster::engine::{Engine, EngineConfig, Role};
use twcmaster::ems;
use twcmaster::ipc::WebIpc;
use twcmaster::message::{Sign, TwcId};
use twcmaster::settings::Settings;
use twcmaster::tasks::{Task, TaskRunner};
use twcmaster::transport::SerialBus;
use twcmaster::{Shared, DEFAULT_ID, DEFAULT_SIGN};

/// Push credential/home changes from the worker's API client into the
/// persisted settings, saving only when something actually moved.
fn sync_car_settings(shared: &Shared, carapi: &CarApi) {
    let changed = {
        let mut settings = shared.settings.lock().expect("settings poisoned");
        let before = settings.clone();

        settings.sync_from_carapi(carapi);

        *settings != before
    };

    if changed {
        shared.save_settings();
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_owned());

    let config = match Config::load(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);

            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG wins over the config file when both are given.
    if std::env::var_os("RUST_LOG").is_none() {
        apply_debug_level(config.debug_level);
    }

    let bus = match SerialBus::open(&config.rs485_adapter, config.baud) {
        Ok(bus) => bus,
        Err(e) => {
            log::error!("can't open serial port {}: {}", config.rs485_adapter, e);

            return ExitCode::FAILURE;
        }
    };

    let settings_path = PathBuf::from(&config.settings_path).join("twcmaster.settings");
    let settings = Settings::load(&settings_path);

    let mut carapi = match CarApi::new(
        config.car_api_error_retry_mins,
        config.only_charge_multi_cars_at_home,
    ) {
        Ok(carapi) => carapi,
        Err(e) => {
            log::error!("can't set up the vehicle API client: {}", e);

            return ExitCode::FAILURE;
        }
    };

    let mut alloc = AllocatorState::new(config.subtract_charger_load);
    settings.apply(&mut alloc, &mut carapi);

    let shared = Arc::new(Shared::new(alloc, settings, settings_path));

    // The background worker owns the vehicle API client and the telemetry
    // sources outright; it is the only thread that ever blocks on the
    // network.
    let sources = ems::sources_from_config(&config);
    let green_offset = config.green_energy_amps_offset;
    let worker_shared = Arc::clone(&shared);

    let runner = TaskRunner::spawn(move |task| match task {
        Task::CheckGreenEnergy => {
            ems::check_green_energy(&sources, &worker_shared.alloc, green_offset)
        }
        Task::Charge { start } => {
            carapi.charge(start, Instant::now());
            sync_car_settings(&worker_shared, &carapi);
        }
        Task::CarApiCredentials { email, password } => {
            carapi.clear_error_holdoff();
            carapi.available(Some((email.as_str(), password.as_str())), Instant::now());
            sync_car_settings(&worker_shared, &carapi);
        }
        Task::Shutdown => {}
    });

    let shutdown = Arc::new(AtomicBool::new(false));

    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            log::warn!("can't register signal handler: {}", e);
        }
    }

    let ipc = match WebIpc::open(&config.ipc_socket_path) {
        Ok(ipc) => Some(ipc),
        Err(e) => {
            // The bus keeps running without its web interface.
            log::error!(
                "can't create IPC socket {} for the web interface: {}",
                config.ipc_socket_path,
                e
            );

            None
        }
    };

    let role = if config.fake_master == 1 {
        Role::Master
    } else {
        Role::Slave
    };

    let engine_config = EngineConfig {
        role,
        id: TwcId(DEFAULT_ID),
        sign: Sign(DEFAULT_SIGN),
        wiring_max_all: config.wiring_max_all(),
        wiring_max_per_outlet: config.wiring_max_per_outlet(),
        min_amps: config.min_amps(),
    };

    let mut engine = Engine::new(
        bus,
        engine_config,
        Arc::clone(&shared),
        runner.queue(),
        ipc,
        shutdown,
    );

    engine.run();

    log::info!("letting background tasks finish");
    runner.shutdown();

    shared.save_settings();

    drop(engine);
    let _ = std::fs::remove_file(&config.ipc_socket_path);

    ExitCode::SUCCESS
}
