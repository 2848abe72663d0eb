//! Energy-management data sources.
//!
//! Each source is an opaque provider of a `(generation_W, consumption_W)`
//! sample, scraped over HTTP on the background worker. The allocator only
//! ever sees the per-source watt figures; everything about how they are
//! obtained stays behind [`EnergySource`].

use crate::allocator::{AllocatorState, LINE_VOLTS};
use crate::config::Config;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
pub enum EmsError {
    Http(reqwest::Error),
    /// The source answered with something that isn't a watt figure.
    Malformed(&'static str),
}

impl std::error::Error for EmsError {}

impl core::fmt::Display for EmsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EmsError::Http(e) => write!(f, "http: {}", e),
            EmsError::Malformed(what) => write!(f, "malformed response: {}", what),
        }
    }
}

impl From<reqwest::Error> for EmsError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

/// One telemetry sample.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct EnergySample {
    pub generation_w: f64,
    pub consumption_w: f64,
}

/// An external generation/consumption meter.
pub trait EnergySource: Send {
    fn name(&self) -> &'static str;

    fn poll(&self) -> Result<EnergySample, EmsError>;
}

/// Fronius inverters expose a local JSON API with site-level power flow.
pub struct FroniusSource {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl FroniusSource {
    pub fn new(base_url: String) -> Result<Self, EmsError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { base_url, client })
    }
}

impl EnergySource for FroniusSource {
    fn name(&self) -> &'static str {
        "Fronius"
    }

    fn poll(&self) -> Result<EnergySample, EmsError> {
        let url = format!(
            "{}/solar_api/v1/GetPowerFlowRealtimeData.fcgi",
            self.base_url
        );
        let value: Value = self.client.get(url).send()?.json()?;
        let site = &value["Body"]["Data"]["Site"];

        if site.is_null() {
            return Err(EmsError::Malformed("missing Body.Data.Site"));
        }

        // P_PV is null overnight. P_Load is negative while the site
        // consumes.
        Ok(EnergySample {
            generation_w: site["P_PV"].as_f64().unwrap_or(0.0).max(0.0),
            consumption_w: site["P_Load"].as_f64().unwrap_or(0.0).abs(),
        })
    }
}

/// A home-automation bridge exposing generation and consumption sensor
/// entities.
pub struct HassSource {
    base_url: String,
    token: String,
    generation_entity: String,
    consumption_entity: String,
    client: reqwest::blocking::Client,
}

impl HassSource {
    pub fn new(
        base_url: String,
        token: String,
        generation_entity: String,
        consumption_entity: String,
    ) -> Result<Self, EmsError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url,
            token,
            generation_entity,
            consumption_entity,
            client,
        })
    }

    fn read_entity(&self, entity: &str) -> Result<f64, EmsError> {
        let url = format!("{}/api/states/{}", self.base_url, entity);
        let value: Value = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()?
            .json()?;

        value["state"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or(EmsError::Malformed("entity state is not a number"))
    }
}

impl EnergySource for HassSource {
    fn name(&self) -> &'static str {
        "HomeAssistant"
    }

    fn poll(&self) -> Result<EnergySample, EmsError> {
        Ok(EnergySample {
            generation_w: self.read_entity(&self.generation_entity)?,
            consumption_w: self.read_entity(&self.consumption_entity)?,
        })
    }
}

/// Instantiate every source the configuration names.
pub fn sources_from_config(config: &Config) -> Vec<Box<dyn EnergySource>> {
    let mut sources: Vec<Box<dyn EnergySource>> = Vec::new();

    if let Some(url) = &config.fronius_url {
        match FroniusSource::new(url.clone()) {
            Ok(source) => sources.push(Box::new(source)),
            Err(e) => log::error!("can't set up Fronius source: {}", e),
        }
    }

    if let (Some(url), Some(token)) = (&config.hass_url, &config.hass_token) {
        match HassSource::new(
            url.clone(),
            token.clone(),
            config.hass_generation_entity.clone(),
            config.hass_consumption_entity.clone(),
        ) {
            Ok(source) => sources.push(Box::new(source)),
            Err(e) => log::error!("can't set up home-automation source: {}", e),
        }
    }

    sources
}

/// The `checkGreenEnergy` background task: scrape every source, then fold
/// the fresh figures into the shared allocator state.
///
/// All HTTP happens before the lock is taken.
pub fn check_green_energy(
    sources: &[Box<dyn EnergySource>],
    alloc: &Mutex<AllocatorState>,
    green_energy_amps_offset: f64,
) {
    let mut samples = Vec::with_capacity(sources.len());

    for source in sources {
        match source.poll() {
            Ok(sample) => samples.push((source.name(), sample)),
            Err(e) => log::debug!("telemetry source {} failed: {}", source.name(), e),
        }
    }

    let mut state = alloc.lock().expect("allocator state poisoned");

    // A fixed operator-configured draw, e.g. a well pump the meters miss.
    state.set_consumption("Manual", green_energy_amps_offset * f64::from(LINE_VOLTS));

    for (name, sample) in samples {
        state.set_generation(name, sample.generation_w);
        state.set_consumption(name, sample.consumption_w);
    }

    log::info!(
        "solar generating {:.0} W, consumption {:.0} W, charger load {:.0} W, \
         green budget {} A",
        state.generation_w(),
        state.consumption_w(),
        state.charger_load_w(),
        state.green_budget()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedSource(EnergySample);

    impl EnergySource for FixedSource {
        fn name(&self) -> &'static str {
            "Fixed"
        }

        fn poll(&self) -> Result<EnergySample, EmsError> {
            Ok(self.0)
        }
    }

    struct BrokenSource;

    impl EnergySource for BrokenSource {
        fn name(&self) -> &'static str {
            "Broken"
        }

        fn poll(&self) -> Result<EnergySample, EmsError> {
            Err(EmsError::Malformed("no data"))
        }
    }

    #[test]
    fn samples_land_in_allocator_state() {
        let alloc = Mutex::new(AllocatorState::new(false));
        let sources: Vec<Box<dyn EnergySource>> = vec![
            Box::new(FixedSource(EnergySample {
                generation_w: 5000.0,
                consumption_w: 1200.0,
            })),
            Box::new(BrokenSource),
        ];

        check_green_energy(&sources, &alloc, 1.0);

        let state = alloc.lock().unwrap();

        assert_eq!(state.generation_w(), 5000.0);
        // 1200 W metered plus the 1 A (240 W) manual offset.
        assert_eq!(state.consumption_w(), 1440.0);
    }

    #[test]
    fn failed_source_keeps_last_figures() {
        let alloc = Mutex::new(AllocatorState::new(false));

        {
            let mut state = alloc.lock().unwrap();
            state.set_generation("Fixed", 4000.0);
        }

        let sources: Vec<Box<dyn EnergySource>> = vec![Box::new(BrokenSource)];

        check_green_energy(&sources, &alloc, 0.0);

        assert_eq!(alloc.lock().unwrap().generation_w(), 4000.0);
    }
}
