//! Operator configuration.
//!
//! A JSON file, `config.json` next to the binary unless a path is given
//! on the command line. Full-line `//` and `#` comments are tolerated.
//! Missing or unparsable configuration is fatal at startup; everything
//! here is wiring- and safety-relevant, so there are no silent fallbacks
//! to another file.

use crate::amps::Centiamps;
use crate::error::Error;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the RS-485 adapter device.
    #[serde(rename = "rs485adapter")]
    pub rs485_adapter: String,
    pub baud: u32,
    /// `1` to impersonate the bus master (normal operation); any other
    /// value impersonates a slave for protocol testing.
    #[serde(rename = "fakeMaster")]
    pub fake_master: u8,
    /// Absolute ceiling for the sum of all offers, set by the wiring
    /// feeding the chargers.
    #[serde(rename = "wiringMaxAmpsAllTWCs")]
    pub wiring_max_amps_all_twcs: f64,
    /// Per-outlet wiring ceiling.
    #[serde(rename = "wiringMaxAmpsPerTWC")]
    pub wiring_max_amps_per_twc: f64,
    /// Below this there is no point offering power at all; cars either
    /// refuse or charge inefficiently.
    #[serde(rename = "minAmpsPerTWC")]
    pub min_amps_per_twc: f64,
    /// A fixed consumption figure (in amps) for loads the meters miss.
    #[serde(rename = "greenEnergyAmpsOffset")]
    pub green_energy_amps_offset: f64,
    #[serde(rename = "subtractChargerLoad")]
    pub subtract_charger_load: bool,
    #[serde(rename = "debugLevel")]
    pub debug_level: i32,
    #[serde(rename = "onlyChargeMultiCarsAtHome")]
    pub only_charge_multi_cars_at_home: bool,
    /// Directory the settings file lives in.
    #[serde(rename = "settingsPath")]
    pub settings_path: String,
    #[serde(rename = "ipcSocketPath")]
    pub ipc_socket_path: String,
    #[serde(rename = "carApiErrorRetryMins")]
    pub car_api_error_retry_mins: u64,
    #[serde(rename = "froniusUrl")]
    pub fronius_url: Option<String>,
    #[serde(rename = "hassUrl")]
    pub hass_url: Option<String>,
    #[serde(rename = "hassToken")]
    pub hass_token: Option<String>,
    #[serde(rename = "hassGenerationEntity")]
    pub hass_generation_entity: String,
    #[serde(rename = "hassConsumptionEntity")]
    pub hass_consumption_entity: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rs485_adapter: "/dev/ttyUSB0".to_owned(),
            baud: 9600,
            fake_master: 1,
            wiring_max_amps_all_twcs: 6.0,
            wiring_max_amps_per_twc: 6.0,
            min_amps_per_twc: 6.0,
            green_energy_amps_offset: 0.0,
            subtract_charger_load: false,
            debug_level: 1,
            only_charge_multi_cars_at_home: true,
            settings_path: "/etc/twcmaster".to_owned(),
            ipc_socket_path: "/tmp/twcmaster.sock".to_owned(),
            car_api_error_retry_mins: 10,
            fronius_url: None,
            hass_url: None,
            hass_token: None,
            hass_generation_entity: "sensor.solar_generation".to_owned(),
            hass_consumption_entity: "sensor.home_consumption".to_owned(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("can't read {}: {}", path.display(), e)))?;

        Self::parse(&text)
            .map_err(|e| Error::Config(format!("can't parse {}: {}", path.display(), e)))
    }

    fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let stripped: String = text
            .lines()
            .filter(|line| {
                let trimmed = line.trim_start();

                !trimmed.starts_with("//") && !trimmed.starts_with('#')
            })
            .collect::<Vec<_>>()
            .join("\n");

        serde_json::from_str(&stripped)
    }

    pub fn wiring_max_all(&self) -> Centiamps {
        Centiamps::from_amps_f64(self.wiring_max_amps_all_twcs)
    }

    pub fn wiring_max_per_outlet(&self) -> Centiamps {
        Centiamps::from_amps_f64(self.wiring_max_amps_per_twc)
    }

    pub fn min_amps(&self) -> Centiamps {
        Centiamps::from_amps_f64(self.min_amps_per_twc)
    }
}

/// Map the operator's numeric debug level onto the log facade.
pub fn apply_debug_level(level: i32) {
    let filter = match level {
        i32::MIN..=0 => log::LevelFilter::Error,
        1..=7 => log::LevelFilter::Info,
        8 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    log::set_max_level(filter);
}
