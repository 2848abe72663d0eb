//! Durable operator settings.
//!
//! A plain `key=value` text file so the web interface and any shell tool
//! can read it. Unknown keys warn and are ignored; a missing file just
//! yields defaults. Saved whenever a persisted field changes.

use crate::allocator::{AllocatorState, Days, SchedulePolicy};
use crate::amps::Centiamps;
use crate::carapi::{CarApi, HOME_UNSET};
use std::io;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub non_scheduled_amps_max: i32,
    pub scheduled_amps_max: i32,
    /// Fractional hours, e.g. `7.5` for 07:30. `-1` means unset.
    pub scheduled_amps_start_hour: f64,
    pub scheduled_amps_end_hour: f64,
    pub scheduled_amps_days_bitmap: u8,
    pub hour_resume_track_green_energy: f64,
    pub kwh_delivered: f64,
    pub car_api_bearer_token: String,
    pub car_api_refresh_token: String,
    pub car_api_token_expire_time: f64,
    pub home_lat: f64,
    pub home_lon: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            non_scheduled_amps_max: -1,
            scheduled_amps_max: -1,
            scheduled_amps_start_hour: -1.0,
            scheduled_amps_end_hour: -1.0,
            scheduled_amps_days_bitmap: 0x7F,
            hour_resume_track_green_energy: -1.0,
            kwh_delivered: 119.0,
            car_api_bearer_token: String::new(),
            car_api_refresh_token: String::new(),
            car_api_token_expire_time: 0.0,
            home_lat: HOME_UNSET,
            home_lon: HOME_UNSET,
        }
    }
}

/// `-1`-style fractional hours to minutes after midnight.
pub fn hours_to_minutes(hours: f64) -> Option<u16> {
    if hours < 0.0 {
        None
    } else {
        Some(((hours * 60.0).round() as u16).min(24 * 60))
    }
}

pub fn minutes_to_hours(minutes: Option<u16>) -> f64 {
    match minutes {
        Some(m) => f64::from(m) / 60.0,
        None => -1.0,
    }
}

fn amps_option(raw: i32) -> Option<Centiamps> {
    if raw < 0 {
        None
    } else {
        Some(Centiamps::from_whole_amps(raw as u32))
    }
}

fn amps_raw(amps: Option<Centiamps>) -> i32 {
    match amps {
        Some(a) => (a.0 / 100) as i32,
        None => -1,
    }
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::warn!("can't read settings file {}: {}", path.display(), e);

                return Self::default();
            }
        };

        let mut settings = Self::default();

        for line in text.lines() {
            let line = line.trim();

            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                log::warn!("settings line without '=': {}", line);
                continue;
            };

            let (key, value) = (key.trim(), value.trim());

            let parsed = match key {
                "nonScheduledAmpsMax" => value
                    .parse()
                    .map(|v| settings.non_scheduled_amps_max = v)
                    .is_ok(),
                "scheduledAmpsMax" => value
                    .parse()
                    .map(|v| settings.scheduled_amps_max = v)
                    .is_ok(),
                "scheduledAmpsStartHour" => value
                    .parse()
                    .map(|v| settings.scheduled_amps_start_hour = v)
                    .is_ok(),
                "scheduledAmpsEndHour" => value
                    .parse()
                    .map(|v| settings.scheduled_amps_end_hour = v)
                    .is_ok(),
                "scheduledAmpsDaysBitmap" => value
                    .parse()
                    .map(|v| settings.scheduled_amps_days_bitmap = v)
                    .is_ok(),
                "hourResumeTrackGreenEnergy" => value
                    .parse()
                    .map(|v| settings.hour_resume_track_green_energy = v)
                    .is_ok(),
                "kWhDelivered" => value.parse().map(|v| settings.kwh_delivered = v).is_ok(),
                "carApiBearerToken" => {
                    settings.car_api_bearer_token = value.to_owned();
                    true
                }
                "carApiRefreshToken" => {
                    settings.car_api_refresh_token = value.to_owned();
                    true
                }
                "carApiTokenExpireTime" => value
                    .parse()
                    .map(|v| settings.car_api_token_expire_time = v)
                    .is_ok(),
                "homeLat" => value.parse().map(|v| settings.home_lat = v).is_ok(),
                "homeLon" => value.parse().map(|v| settings.home_lon = v).is_ok(),
                other => {
                    log::warn!("unknown setting '{}', ignoring", other);
                    continue;
                }
            };

            if !parsed {
                log::warn!("can't parse setting {}={}", key, value);
            }
        }

        settings
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let text = format!(
            "nonScheduledAmpsMax={}\n\
             scheduledAmpsMax={}\n\
             scheduledAmpsStartHour={}\n\
             scheduledAmpsEndHour={}\n\
             scheduledAmpsDaysBitmap={}\n\
             hourResumeTrackGreenEnergy={}\n\
             kWhDelivered={}\n\
             carApiBearerToken={}\n\
             carApiRefreshToken={}\n\
             carApiTokenExpireTime={}\n\
             homeLat={}\n\
             homeLon={}",
            self.non_scheduled_amps_max,
            self.scheduled_amps_max,
            self.scheduled_amps_start_hour,
            self.scheduled_amps_end_hour,
            self.scheduled_amps_days_bitmap,
            self.hour_resume_track_green_energy,
            self.kwh_delivered,
            self.car_api_bearer_token,
            self.car_api_refresh_token,
            self.car_api_token_expire_time as i64,
            self.home_lat,
            self.home_lon,
        );

        std::fs::write(path, text)
    }

    /// Push loaded values into the live state.
    pub fn apply(&self, alloc: &mut AllocatorState, carapi: &mut CarApi) {
        alloc.non_scheduled_amps_max = amps_option(self.non_scheduled_amps_max);
        alloc.schedule = SchedulePolicy {
            scheduled_amps_max: amps_option(self.scheduled_amps_max),
            start_minutes: hours_to_minutes(self.scheduled_amps_start_hour),
            end_minutes: hours_to_minutes(self.scheduled_amps_end_hour),
            days: Days::from_bits_truncate(self.scheduled_amps_days_bitmap),
        };
        alloc.hour_resume_green = hours_to_minutes(self.hour_resume_track_green_energy);
        alloc.kwh_delivered = self.kwh_delivered;

        carapi.set_tokens(
            self.car_api_bearer_token.clone(),
            self.car_api_refresh_token.clone(),
            self.car_api_token_expire_time,
        );

        if self.home_lat != HOME_UNSET && self.home_lon != HOME_UNSET {
            carapi.home = Some((self.home_lat, self.home_lon));
        }
    }

    /// Refresh the policy fields this snapshot shares with the live
    /// allocator state.
    pub fn sync_from_alloc(&mut self, alloc: &AllocatorState) {
        self.non_scheduled_amps_max = amps_raw(alloc.non_scheduled_amps_max);
        self.scheduled_amps_max = amps_raw(alloc.schedule.scheduled_amps_max);
        self.scheduled_amps_start_hour = minutes_to_hours(alloc.schedule.start_minutes);
        self.scheduled_amps_end_hour = minutes_to_hours(alloc.schedule.end_minutes);
        self.scheduled_amps_days_bitmap = alloc.schedule.days.bits();
        self.hour_resume_track_green_energy = minutes_to_hours(alloc.hour_resume_green);
        self.kwh_delivered = alloc.kwh_delivered;
    }

    /// Refresh the credential fields owned by the vehicle API client.
    pub fn sync_from_carapi(&mut self, carapi: &CarApi) {
        self.car_api_bearer_token = carapi.bearer_token().to_owned();
        self.car_api_refresh_token = carapi.refresh_token().to_owned();
        self.car_api_token_expire_time = carapi.token_expires_at;

        let (home_lat, home_lon) = carapi.home.unwrap_or((HOME_UNSET, HOME_UNSET));
        self.home_lat = home_lat;
        self.home_lon = home_lon;
    }
}
