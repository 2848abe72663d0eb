//! Vehicle cloud API edge.
//!
//! The controller cannot tell a car to charge over the charger bus alone;
//! cars that went to sleep ignore the pilot. This module wakes vehicles
//! and starts/stops charging through the owner API, with the retry
//! discipline the API demands: a per-API error holdoff, a per-vehicle
//! error holdoff, a 60 s floor between charge commands, and a staged
//! wake-up schedule. Runs exclusively on the background worker thread and
//! may block for up to a minute per request.

use serde_json::{json, Value};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const API_BASE: &str = "https://owner-api.teslamotors.com";

// The owner API's public third-party client pair, unchanged for years and
// shipped by every third-party charging tool.
const CLIENT_ID: &str = "81527cff06843c8634fdc09e8ac0abefb46ac849f38fe1e431c2ef2106796384";
const CLIENT_SECRET: &str = "c7257eb71a564034f9419ee651c7d0e5f7aa6bfbd18bafb5c5c033b093bb2fa3";

/// Error strings worth a quick retry instead of the long holdoff.
const TRANSIENT_ERRORS: &[&str] = &[
    "upstream internal error",
    "operation_timedout",
    "vehicle unavailable",
];

/// Vehicles within this many degrees of latitude and longitude of home
/// (roughly two miles) count as parked at home.
const HOME_BOX_DEGREES: f64 = 0.0289;

/// Sentinel meaning "home has never been set".
pub const HOME_UNSET: f64 = 10000.0;

/// Don't issue charge commands more than once a minute.
const START_STOP_HOLDOFF: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum CarApiError {
    Http(reqwest::Error),
    /// The API answered but not with what we needed.
    Api(String),
}

impl std::error::Error for CarApiError {}

impl core::fmt::Display for CarApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CarApiError::Http(e) => write!(f, "http: {}", e),
            CarApiError::Api(e) => write!(f, "api: {}", e),
        }
    }
}

impl From<reqwest::Error> for CarApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

fn is_transient(error: &str) -> bool {
    TRANSIENT_ERRORS.iter().any(|known| error.starts_with(known))
}

/// Wake-up pacing: every 30 s for the first ten minutes, every 5 min up
/// to 70 minutes, every 15 min beyond that.
fn wake_retry_delay(since_first_attempt: Duration) -> Duration {
    if since_first_attempt <= Duration::from_secs(10 * 60) {
        Duration::from_secs(30)
    } else if since_first_attempt <= Duration::from_secs(70 * 60) {
        Duration::from_secs(5 * 60)
    } else {
        Duration::from_secs(15 * 60)
    }
}

/// A wake attempt running longer than this is surfaced as an error.
const WAKE_GIVE_UP_AFTER: Duration = Duration::from_secs(60 * 60);

fn is_at_home(home: (f64, f64), location: (f64, f64)) -> bool {
    (home.0 - location.0).abs() <= HOME_BOX_DEGREES
        && (home.1 - location.1).abs() <= HOME_BOX_DEGREES
}

/// Per-vehicle wake progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WakeState {
    /// Never woken, or demoted after an error.
    Idle,
    Waking {
        first_attempt_at: Instant,
        last_attempt_at: Instant,
    },
    Online,
}

#[derive(Debug)]
pub struct Vehicle {
    pub id: u64,
    wake: WakeState,
    last_error_at: Option<Instant>,
    /// Set when the car said "complete" or "charging": further start
    /// requests are pointless until we next ask everyone to stop.
    stop_asking_to_start: bool,
    location: Option<(f64, f64)>,
}

impl Vehicle {
    fn new(id: u64) -> Self {
        Self {
            id,
            wake: WakeState::Idle,
            last_error_at: None,
            stop_asking_to_start: false,
            location: None,
        }
    }

    fn ready(&self) -> bool {
        self.wake == WakeState::Online
    }
}

pub struct CarApi {
    client: reqwest::blocking::Client,
    bearer_token: String,
    refresh_token: String,
    /// Unix seconds; persisted across restarts.
    pub token_expires_at: f64,
    vehicles: Vec<Vehicle>,
    last_error_at: Option<Instant>,
    error_holdoff: Duration,
    last_start_stop_at: Option<Instant>,
    pub home: Option<(f64, f64)>,
    only_charge_multi_cars_at_home: bool,
}

impl CarApi {
    pub fn new(
        error_retry_mins: u64,
        only_charge_multi_cars_at_home: bool,
    ) -> Result<Self, CarApiError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            bearer_token: String::new(),
            refresh_token: String::new(),
            token_expires_at: 0.0,
            vehicles: Vec::new(),
            last_error_at: None,
            error_holdoff: Duration::from_secs(error_retry_mins * 60),
            last_start_stop_at: None,
            home: None,
            only_charge_multi_cars_at_home,
        })
    }

    pub fn bearer_token(&self) -> &str {
        &self.bearer_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn need_bearer_token(&self) -> bool {
        self.bearer_token.is_empty()
    }

    pub fn set_tokens(&mut self, bearer: String, refresh: String, expires_at: f64) {
        self.bearer_token = bearer;
        self.refresh_token = refresh;
        self.token_expires_at = expires_at;
    }

    /// Clear the API-wide error holdoff; used when the operator submits
    /// fresh credentials.
    pub fn clear_error_holdoff(&mut self) {
        self.last_error_at = None;
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    fn api_blocked(&self, now: Instant) -> bool {
        self.last_error_at
            .is_some_and(|at| now.duration_since(at) < self.error_holdoff)
    }

    fn unix_now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn post(&self, path: &str, body: Option<Value>) -> Result<Value, CarApiError> {
        let mut req = self.client.post(format!("{}{}", API_BASE, path));

        if !self.bearer_token.is_empty() {
            req = req.bearer_auth(&self.bearer_token);
        }

        if let Some(body) = body {
            req = req.json(&body);
        }

        Ok(req.send()?.json()?)
    }

    fn get(&self, path: &str) -> Result<Value, CarApiError> {
        Ok(self
            .client
            .get(format!("{}{}", API_BASE, path))
            .bearer_auth(&self.bearer_token)
            .send()?
            .json()?)
    }

    /// Obtain a bearer token, either from the stored refresh token or
    /// from a freshly entered email/password pair.
    ///
    /// A failed attempt erases both tokens: retrying a bad credential
    /// every few minutes risks the account being locked out remotely, so
    /// we stay quiet until the operator re-enters credentials.
    fn authenticate(&mut self, credentials: Option<(&str, &str)>, now: Instant) {
        let body = if !self.refresh_token.is_empty() {
            json!({
                "grant_type": "refresh_token",
                "client_id": CLIENT_ID,
                "client_secret": CLIENT_SECRET,
                "refresh_token": self.refresh_token,
            })
        } else if let Some((email, password)) = credentials {
            json!({
                "grant_type": "password",
                "client_id": CLIENT_ID,
                "client_secret": CLIENT_SECRET,
                "email": email,
                "password": password,
            })
        } else {
            return;
        };

        let response = self.post("/oauth/token", Some(body));

        match response {
            Ok(value)
                if value.get("access_token").is_some() && value.get("refresh_token").is_some() =>
            {
                self.bearer_token = value["access_token"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned();
                self.refresh_token = value["refresh_token"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned();
                self.token_expires_at =
                    Self::unix_now() + value["expires_in"].as_f64().unwrap_or(0.0);

                log::info!("vehicle API token refreshed");
            }
            other => {
                log::error!(
                    "can't authenticate to the vehicle API, log in again via the web \
                     interface ({:?})",
                    other.err()
                );

                self.bearer_token.clear();
                self.refresh_token.clear();
                self.last_error_at = Some(now);
            }
        }
    }

    fn refresh_vehicle_list(&mut self, now: Instant) {
        if !self.vehicles.is_empty() {
            return;
        }

        match self.get("/api/1/vehicles") {
            Ok(value) => {
                if let Some(list) = value["response"].as_array() {
                    for entry in list {
                        if let Some(id) = entry["id"].as_u64() {
                            self.vehicles.push(Vehicle::new(id));
                        }
                    }

                    log::info!("vehicle API lists {} vehicle(s)", self.vehicles.len());
                } else {
                    log::error!("can't list vehicles, retrying after the holdoff");
                    self.last_error_at = Some(now);
                }
            }
            Err(e) => {
                log::error!("vehicle list failed: {}", e);
                self.last_error_at = Some(now);
            }
        }
    }

    /// Step one vehicle's wake machine. Returns `true` if it is online.
    fn wake_vehicle(&mut self, index: usize, now: Instant) -> bool {
        let vehicle = &self.vehicles[index];

        if vehicle.ready() {
            return true;
        }

        if let WakeState::Waking {
            first_attempt_at,
            last_attempt_at,
        } = vehicle.wake
        {
            if now.duration_since(last_attempt_at)
                < wake_retry_delay(now.duration_since(first_attempt_at))
            {
                // Still inside the pacing window.
                return false;
            }
        }

        let id = vehicle.id;
        let response = self.post(&format!("/api/1/vehicles/{}/wake_up", id), None);

        let state = response
            .ok()
            .and_then(|v| v["response"]["state"].as_str().map(str::to_owned))
            .unwrap_or_else(|| "error".to_owned());

        let vehicle = &mut self.vehicles[index];

        if state == "online" {
            vehicle.wake = WakeState::Online;

            return true;
        }

        let first_attempt_at = match vehicle.wake {
            WakeState::Waking {
                first_attempt_at, ..
            } => first_attempt_at,
            _ => now,
        };

        vehicle.wake = WakeState::Waking {
            first_attempt_at,
            last_attempt_at: now,
        };

        let waited = now.duration_since(first_attempt_at);

        if waited > WAKE_GIVE_UP_AFTER {
            log::error!(
                "vehicle {} has refused to wake from '{}' for {:.1} hours",
                id,
                state,
                waited.as_secs_f64() / 3600.0
            );
        } else {
            log::info!(
                "vehicle {} not awake yet ('{}'), next attempt in {} s",
                id,
                state,
                wake_retry_delay(waited).as_secs()
            );
        }

        false
    }

    /// Make sure we hold a token, know our vehicles, and have started
    /// waking any that sleep. Returns `true` when commands may be sent.
    pub fn available(&mut self, credentials: Option<(&str, &str)>, now: Instant) -> bool {
        if self.api_blocked(now) {
            return false;
        }

        // Refresh tokens die at 45 days; renew whenever less than 30
        // days of validity remain.
        let expiring = self.token_expires_at - Self::unix_now() < (30 * 24 * 60 * 60) as f64;

        if self.bearer_token.is_empty() || expiring {
            self.authenticate(credentials, now);
        }

        if self.bearer_token.is_empty() {
            return false;
        }

        self.refresh_vehicle_list(now);

        if self.api_blocked(now) {
            return false;
        }

        let mut all_awake = true;

        for index in 0..self.vehicles.len() {
            let vehicle = &self.vehicles[index];

            if vehicle
                .last_error_at
                .is_some_and(|at| now.duration_since(at) < self.error_holdoff)
            {
                continue;
            }

            if !self.wake_vehicle(index, now) {
                all_awake = false;
            }
        }

        all_awake && !self.vehicles.is_empty()
    }

    fn update_location(&mut self, index: usize) -> bool {
        let id = self.vehicles[index].id;

        match self.get(&format!("/api/1/vehicles/{}/data_request/drive_state", id)) {
            Ok(value) => {
                let lat = value["response"]["latitude"].as_f64();
                let lon = value["response"]["longitude"].as_f64();

                if let (Some(lat), Some(lon)) = (lat, lon) {
                    self.vehicles[index].location = Some((lat, lon));

                    return true;
                }

                false
            }
            Err(e) => {
                log::debug!("drive_state for vehicle {} failed: {}", id, e);

                false
            }
        }
    }

    /// Ask every eligible vehicle to start or stop charging.
    ///
    /// Returns `true` if home was newly learned from a vehicle's location
    /// and should be persisted.
    pub fn charge(&mut self, start: bool, now: Instant) -> bool {
        let mut home_learned = false;

        if !start {
            for vehicle in &mut self.vehicles {
                vehicle.stop_asking_to_start = false;
            }
        }

        if self
            .last_start_stop_at
            .is_some_and(|at| now.duration_since(at) < START_STOP_HOLDOFF)
        {
            return false;
        }

        if !self.available(None, now) {
            return false;
        }

        let verb = if start { "start" } else { "stop" };

        for index in 0..self.vehicles.len() {
            let vehicle = &self.vehicles[index];

            if (start && vehicle.stop_asking_to_start) || !vehicle.ready() {
                continue;
            }

            if vehicle
                .last_error_at
                .is_some_and(|at| now.duration_since(at) < self.error_holdoff)
            {
                continue;
            }

            self.last_start_stop_at = Some(now);

            if self.only_charge_multi_cars_at_home && self.vehicles.len() > 1 {
                if !self.update_location(index) {
                    continue;
                }

                let Some(location) = self.vehicles[index].location else {
                    continue;
                };

                if self.home.is_none() {
                    log::info!(
                        "home never set; taking the first located vehicle's position \
                         lat={:.4} lon={:.4} as home",
                        location.0,
                        location.1
                    );

                    self.home = Some(location);
                    home_learned = true;
                }

                if let Some(home) = self.home {
                    if !is_at_home(home, location) {
                        log::info!(
                            "vehicle {} is not at home, not asking it to {} charging",
                            self.vehicles[index].id,
                            verb
                        );

                        continue;
                    }
                }

                // Commands too soon after drive_state bounce with
                // could_not_wake_buses.
                std::thread::sleep(Duration::from_secs(5));
            }

            self.send_charge_command(index, start, now);
        }

        home_learned
    }

    fn send_charge_command(&mut self, index: usize, start: bool, now: Instant) {
        let id = self.vehicles[index].id;
        let verb = if start { "start" } else { "stop" };
        let path = format!("/api/1/vehicles/{}/command/charge_{}", id, verb);

        for _attempt in 0..3 {
            let response = match self.post(&path, None) {
                Ok(value) => value,
                Err(e) => {
                    log::error!("charge_{} for vehicle {} failed: {}", verb, id, e);
                    self.vehicles[index].last_error_at = Some(now);

                    return;
                }
            };

            if response["response"].is_null() {
                if let Some(error) = response["error"].as_str() {
                    if is_transient(error) {
                        log::info!(
                            "vehicle API answered '{}' to charge_{}, retrying in a minute",
                            error,
                            verb
                        );

                        std::thread::sleep(Duration::from_secs(60));

                        continue;
                    }
                }

                self.vehicles[index].last_error_at = Some(now);

                return;
            }

            if response["response"]["result"].as_bool() == Some(false) && start {
                match response["response"]["reason"].as_str() {
                    Some("complete") | Some("charging") => {
                        log::info!(
                            "vehicle {} is done charging or already charging, \
                             not asking again",
                            id
                        );

                        self.vehicles[index].stop_asking_to_start = true;
                    }
                    Some("could_not_wake_buses") => {
                        // Happens when commands follow each other too
                        // closely; retrying shortly usually succeeds.
                        std::thread::sleep(Duration::from_secs(5));

                        continue;
                    }
                    Some(reason) => {
                        log::error!(
                            "'{}' when trying to {} charging for vehicle {}",
                            reason,
                            verb,
                            id
                        );

                        self.vehicles[index].last_error_at = Some(now);
                    }
                    None => {}
                }
            }

            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wake_schedule_stages() {
        assert_eq!(
            wake_retry_delay(Duration::from_secs(60)),
            Duration::from_secs(30)
        );
        assert_eq!(
            wake_retry_delay(Duration::from_secs(11 * 60)),
            Duration::from_secs(5 * 60)
        );
        assert_eq!(
            wake_retry_delay(Duration::from_secs(2 * 60 * 60)),
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn transient_errors_match_prefixes() {
        assert!(is_transient("vehicle unavailable: {:error=>\"vehicle unavailable:\"}"));
        assert!(is_transient("operation_timedout for txid `4853`"));
        assert!(!is_transient("invalid_token"));
    }

    #[test]
    fn home_box_is_two_miles_ish() {
        let home = (37.4919, -121.9469);

        assert!(is_at_home(home, (37.4920, -121.9470)));
        assert!(is_at_home(home, (37.4919 + 0.028, -121.9469)));
        assert!(!is_at_home(home, (37.4919 + 0.03, -121.9469)));
        assert!(!is_at_home(home, (37.4919, -121.9469 - 0.03)));
    }
}
