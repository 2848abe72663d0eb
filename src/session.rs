//! Per-slave session state and the heartbeat command machine.

use crate::amps::Centiamps;
use crate::message::{HeartbeatData, ProtocolVersion, Sign, SlaveChargeState, TwcId};
use std::time::Instant;

/// Steady state: no change, byte 1..3 repeat the current offer.
const CMD_STEADY: u8 = 0x00;
/// Tell the slave to ramp its draw down to zero.
const CMD_STOP: u8 = 0x05;
/// Set a new amps target for the slave to ramp towards.
const CMD_SET_TARGET: u8 = 0x09;

/// A command queued for the next heartbeat tick by the allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Pending {
    Stop,
    SetTarget(Centiamps),
}

/// Everything known about one bonded slave charger.
///
/// Created on the first link-ready observed from its id, dropped after
/// 26 s of bus silence.
#[derive(Debug)]
pub struct SlaveSession {
    pub id: TwcId,
    pub sign: Sign,
    /// Latched from the first link-ready's frame length, never downgraded.
    pub protocol_version: ProtocolVersion,
    pub min_amps_supported: Centiamps,
    /// The maximum the charger advertises for itself.
    pub max_amps: Centiamps,
    /// Operator-configured per-outlet ceiling, never above `max_amps`.
    pub wiring_max_amps: Centiamps,
    /// Amps reported flowing in the last slave heartbeat.
    pub reported_amps_actual: Centiamps,
    /// Limit echoed back in the last slave heartbeat.
    pub reported_amps_max: Centiamps,
    /// Opaque charger state code from the last slave heartbeat.
    pub reported_state: u8,
    /// Updated on any frame from this slave.
    pub time_last_rx: Instant,
    /// The last heartbeat command block we sent this slave.
    pub last_heartbeat_sent: HeartbeatData,
    last_amps_offered: Centiamps,
    pending: Option<Pending>,
    spike_pending: bool,
}

impl SlaveSession {
    pub fn new(
        id: TwcId,
        sign: Sign,
        version: ProtocolVersion,
        advertised_max_amps: Centiamps,
        wiring_max_per_outlet: Centiamps,
        now: Instant,
    ) -> Self {
        let wiring_max_amps = if wiring_max_per_outlet > advertised_max_amps {
            log::warn!(
                "wiring max {} A exceeds the {} A slave {} says it can handle; \
                 derating to a quarter of the advertised limit until the wiring is reviewed",
                wiring_max_per_outlet,
                advertised_max_amps,
                id
            );

            advertised_max_amps.div(4)
        } else {
            wiring_max_per_outlet
        };

        Self {
            id,
            sign,
            protocol_version: version,
            min_amps_supported: version.min_amps(),
            max_amps: advertised_max_amps,
            wiring_max_amps,
            reported_amps_actual: Centiamps::ZERO,
            reported_amps_max: Centiamps::ZERO,
            reported_state: 0,
            time_last_rx: now,
            last_heartbeat_sent: HeartbeatData::default(),
            last_amps_offered: Centiamps::ZERO,
            pending: None,
            spike_pending: false,
        }
    }

    /// The amps currently being commanded.
    pub fn last_amps_offered(&self) -> Centiamps {
        self.last_amps_offered
    }

    /// Hard ceiling for anything offered to this slave.
    pub fn offer_ceiling(&self) -> Centiamps {
        self.max_amps.min(self.wiring_max_amps)
    }

    /// A car drawing at least 1 A counts as charging.
    pub fn is_charging(&self) -> bool {
        self.reported_amps_actual >= Centiamps::from_whole_amps(1)
    }

    /// The transient offer that defeats the vehicle-side 6 A clamp: 21 A
    /// for chargers advertising 80 A or more, 16 A otherwise.
    pub fn spike_amps(&self) -> Centiamps {
        if self.max_amps >= Centiamps::from_whole_amps(80) {
            Centiamps::from_whole_amps(21)
        } else {
            Centiamps::from_whole_amps(16)
        }
    }

    /// Record the allocator's decision for this slave.
    ///
    /// The value is clamped so `0 <= offer <= min(max_amps,
    /// wiring_max_amps)` always holds. A transition away from 0 A arms the
    /// spike override for exactly one heartbeat cycle.
    pub fn set_offer(&mut self, amps: Centiamps) {
        let amps = amps.min(self.offer_ceiling());

        if amps == self.last_amps_offered {
            return;
        }

        if amps.is_zero() {
            self.pending = Some(Pending::Stop);
            self.spike_pending = false;
        } else {
            if self.last_amps_offered.is_zero() {
                self.spike_pending = true;
            }

            self.pending = Some(Pending::SetTarget(amps));
        }

        self.last_amps_offered = amps;
    }

    /// Build the command block for this slave's next heartbeat and record
    /// it as sent.
    pub fn next_heartbeat_data(&mut self) -> HeartbeatData {
        let (status, amps) = if self.spike_pending {
            self.spike_pending = false;

            (CMD_SET_TARGET, self.spike_amps())
        } else {
            match self.pending.take() {
                Some(Pending::Stop) => (CMD_STOP, Centiamps::ZERO),
                Some(Pending::SetTarget(amps)) => (CMD_SET_TARGET, amps),
                None => (CMD_STEADY, self.last_amps_offered),
            }
        };

        let amps_be = amps.to_be_bytes();
        let data = HeartbeatData::from_slice(&[status, amps_be[0], amps_be[1], 0, 0, 0, 0]);

        self.last_heartbeat_sent = data.clone();

        data
    }

    /// Fold a slave heartbeat into the session.
    pub fn receive_heartbeat(&mut self, data: &HeartbeatData, now: Instant) {
        self.reported_state = data.status();
        self.reported_amps_max = data.amps_limit();
        self.reported_amps_actual = data.amps_actual();
        self.time_last_rx = now;

        let state = SlaveChargeState::from(data.status());

        match state {
            SlaveChargeState::Other(code) => {
                log::info!("slave {} sent unrecognized heartbeat state {:02X}", self.id, code)
            }
            _ => log::debug!(
                "slave {}: {}, limit {} A, drawing {} A",
                self.id,
                state,
                self.reported_amps_max,
                self.reported_amps_actual
            ),
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.time_last_rx = now;
    }
}
