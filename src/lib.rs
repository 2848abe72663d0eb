//! A load-sharing controller for a fleet of wall chargers on a shared
//! RS-485 bus.
//!
//! The controller impersonates the "master" role of the chargers' link
//! protocol: it discovers slave chargers as they advertise themselves,
//! keeps a heartbeat session with each, and spreads an amperage budget
//! across the fleet. The budget follows solar surplus by default and can
//! be overridden by a schedule or an immediate charge-now request from
//! the web interface.
//!
//! Two threads cooperate. The bus thread owns the serial port and runs
//! the protocol loop on a 25 ms cadence; it never blocks on the network.
//! A single background worker does everything slow — telemetry scrapes
//! and vehicle cloud API calls — and hands results over through
//! [`Shared`], guarded by plain mutexes held only long enough to copy
//! values in or out.

pub mod allocator;
pub mod amps;
pub mod carapi;
pub mod config;
pub mod ems;
pub mod engine;
pub mod error;
pub mod framing;
pub mod ipc;
pub mod message;
pub mod registry;
pub mod session;
pub mod settings;
pub mod tasks;
pub mod transport;

use crate::allocator::AllocatorState;
use crate::settings::Settings;
use std::path::PathBuf;
use std::sync::Mutex;

pub use crate::error::Error;

/// The id this controller answers to until the operator's chargers force
/// a reseed. Every real charger ships with a random id; this fixed value
/// is easy to spot in bus captures.
pub const DEFAULT_ID: [u8; 2] = [0x77, 0x77];

/// Our advertised sign byte, equally recognizable in logs.
pub const DEFAULT_SIGN: u8 = 0x77;

/// State shared between the bus thread and the background worker.
///
/// Lock order where both are needed: `alloc` before `settings`.
pub struct Shared {
    pub alloc: Mutex<AllocatorState>,
    /// Canonical persisted snapshot. Credential fields are refreshed by
    /// the worker, policy fields mirror `alloc` at every save.
    pub settings: Mutex<Settings>,
    pub settings_path: PathBuf,
}

impl Shared {
    pub fn new(alloc: AllocatorState, settings: Settings, settings_path: PathBuf) -> Self {
        Self {
            alloc: Mutex::new(alloc),
            settings: Mutex::new(settings),
            settings_path,
        }
    }

    /// Write the settings file, first folding the allocator's persisted
    /// policy fields into the snapshot.
    pub fn save_settings(&self) {
        let snapshot = {
            let alloc = self.alloc.lock().expect("allocator state poisoned");
            let mut settings = self.settings.lock().expect("settings poisoned");

            settings.sync_from_alloc(&alloc);

            settings.clone()
        };

        if let Err(e) = snapshot.save(&self.settings_path) {
            log::warn!(
                "can't save settings to {}: {}",
                self.settings_path.display(),
                e
            );
        }
    }
}
