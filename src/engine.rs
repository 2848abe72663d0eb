//! The single-bus arbitration loop.
//!
//! One engine owns the serial transport outright and interleaves periodic
//! TX — the startup link-ready burst, then round-robin heartbeats — with
//! draining inbound bytes, never both at once. Periodic transmissions
//! happen only when no RX bytes are pending and no partial frame is
//! buffered, which is what keeps a single half-duplex pair collision-free
//! without any arbitration hardware.
//!
//! The loop itself must survive anything: per-frame errors are logged and
//! dropped, and an unexpected panic inside a tick is caught, reported and
//! followed by a 5 s pause before the loop resumes.

use crate::allocator::divide_among_slaves;
use crate::amps::Centiamps;
use crate::config::apply_debug_level;
use crate::framing::{self, FrameReader};
use crate::ipc::{fmt_hhmm, parse_command, WebCommand, WebIpc, WebRequest};
use crate::message::{
    self, HeartbeatData, Message, ProtocolVersion, Sign, SlaveChargeState, TwcId,
};
use crate::registry::SlaveRegistry;
use crate::tasks::{Task, TaskQueue};
use crate::transport::Bus;
use crate::Shared;
use chrono::{Datelike, Timelike};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Loop cadence while nothing is happening.
const IDLE_SLEEP: Duration = Duration::from_millis(25);

/// Gap after a periodic TX so the addressed slave can reply.
const TX_GAP: Duration = Duration::from_millis(100);

/// One heartbeat per second across the round robin.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// A bonded slave expects our linkready silence; an unbonded fake slave
/// advertises itself every 10 s.
const SLAVE_LINKREADY_PERIOD: Duration = Duration::from_secs(10);

/// Telemetry poll cadence.
const GREEN_ENERGY_PERIOD: Duration = Duration::from_secs(10);

/// Pause after a caught panic, long enough for the log line to be seen.
const PANIC_PAUSE: Duration = Duration::from_secs(5);

/// Web-interface charge-now override duration.
const CHARGE_NOW_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Save the delivered-kWh counter at most this often.
const KWH_SAVE_PERIOD: Duration = Duration::from_secs(300);

/// What the fake slave advertises: an 80 A US charger.
const FAKE_SLAVE_MAX_AMPS: Centiamps = Centiamps::from_whole_amps(80);

/// Message types that repeat constantly and are never worth capturing
/// for `getLastTWCMsgResponse`.
const PERIODIC_TYPES: &[(u8, u8)] = &[
    (0xFB, 0xE0),
    (0xFD, 0xE0),
    (0xFC, 0xE1),
    (0xFB, 0xE2),
    (0xFD, 0xE2),
    (0xFB, 0xEB),
    (0xFD, 0xEB),
];

pub fn hex_str(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Which side of the link protocol to impersonate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Normal operation: drive the chargers.
    Master,
    /// Protocol testing: answer a real master like a charger would.
    Slave,
}

/// Static engine parameters, snapshotted from the configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub role: Role,
    pub id: TwcId,
    pub sign: Sign,
    pub wiring_max_all: Centiamps,
    pub wiring_max_per_outlet: Centiamps,
    pub min_amps: Centiamps,
}

/// `getLastTWCMsgResponse` bookkeeping: armed by `sendTWCMsg`, filled by
/// the first non-periodic inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Capture {
    Off,
    Armed,
    Got(Vec<u8>),
}

pub struct Engine<B> {
    bus: B,
    cfg: EngineConfig,
    shared: Arc<Shared>,
    tasks: TaskQueue,
    ipc: Option<WebIpc>,
    shutdown: Arc<AtomicBool>,

    registry: SlaveRegistry,
    reader: FrameReader,
    /// Remaining startup burst: 10 messages, linkready1 while above 5,
    /// then linkready2.
    num_init_msgs: u8,
    time_last_tx: Option<Instant>,
    override_heartbeat: Option<HeartbeatData>,
    capture: Capture,
    /// Last tick's "budget clears the minimum" verdict, for edge
    /// detection on the vehicle-API side.
    budget_above_min: bool,
    last_green_check: Option<Instant>,
    /// Minute-of-day the resume-green-energy reset last fired in.
    resume_fired_at: Option<u16>,

    // Slave-impersonation state.
    master_id: Option<TwcId>,
    slave_hb: [u8; 9],
    raise_2a_at: Option<Instant>,
    report_0a_at: Option<Instant>,
    kwh_integrated_at: Option<Instant>,
    kwh_saved_at: Option<Instant>,
}

impl<B: Bus> Engine<B> {
    pub fn new(
        bus: B,
        cfg: EngineConfig,
        shared: Arc<Shared>,
        tasks: TaskQueue,
        ipc: Option<WebIpc>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            bus,
            cfg,
            shared,
            tasks,
            ipc,
            shutdown,
            registry: SlaveRegistry::new(),
            reader: FrameReader::new(),
            num_init_msgs: 10,
            time_last_tx: None,
            override_heartbeat: None,
            capture: Capture::Off,
            budget_above_min: false,
            last_green_check: None,
            resume_fired_at: None,
            master_id: None,
            // Fake slave boot status: state 01, limit and draw 40.00 A.
            slave_hb: [0x01, 0x0F, 0xA0, 0x0F, 0xA0, 0x00, 0x00, 0x00, 0x00],
            raise_2a_at: None,
            report_0a_at: None,
            kwh_integrated_at: None,
            kwh_saved_at: None,
        }
    }

    /// Run until shutdown is signalled.
    pub fn run(&mut self) {
        log::info!(
            "starting as fake {} with id {} and sign {}",
            match self.cfg.role {
                Role::Master => "master",
                Role::Slave => "slave",
            },
            self.cfg.id,
            self.cfg.sign
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            let tick = catch_unwind(AssertUnwindSafe(|| self.tick()));

            if tick.is_err() {
                log::error!("bus loop tick panicked; continuing after a pause");
                std::thread::sleep(PANIC_PAUSE);
            } else {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        log::info!("bus loop stopped");
    }

    fn tick(&mut self) {
        let now = Instant::now();

        match self.cfg.role {
            Role::Master => self.master_tx(now),
            Role::Slave => self.slave_tx(now),
        }

        self.poll_ipc(now);
        self.drain_rx();
        self.housekeeping(now);
    }

    /// `true` while transmitting would risk clobbering an inbound frame.
    fn rx_busy(&mut self) -> bool {
        let pending = self.bus.rx_pending().unwrap_or(0);

        pending > 0 || !self.reader.is_idle()
    }

    fn transmit(&mut self, payload: &[u8]) {
        let wire = match framing::encode(payload) {
            Ok(wire) => wire,
            Err(e) => {
                log::error!("can't frame outgoing message: {}", e);

                return;
            }
        };

        log::trace!("tx: {}", hex_str(&wire));

        match self.bus.write_all(&wire) {
            Ok(()) => self.time_last_tx = Some(Instant::now()),
            Err(e) => log::error!("serial write failed: {}", e),
        }
    }

    fn heartbeat_due(&self, now: Instant) -> bool {
        match self.time_last_tx {
            Some(at) => now.duration_since(at) >= HEARTBEAT_PERIOD,
            None => true,
        }
    }

    /// Periodic master-role TX: the startup burst, then one round-robin
    /// heartbeat per second.
    fn master_tx(&mut self, now: Instant) {
        if self.rx_busy() {
            return;
        }

        if self.num_init_msgs > 5 {
            self.num_init_msgs -= 1;

            let payload = message::master_linkready1(self.cfg.id, self.cfg.sign);
            log::info!("send master linkready1");
            self.transmit(&payload);

            std::thread::sleep(TX_GAP);
        } else if self.num_init_msgs > 0 {
            self.num_init_msgs -= 1;

            let payload = message::master_linkready2(self.cfg.id, self.cfg.sign);
            log::info!("send master linkready2");
            self.transmit(&payload);

            std::thread::sleep(TX_GAP);
        } else if self.heartbeat_due(now) && !self.registry.is_empty() {
            self.registry.evict_idle(now);

            if self.registry.is_empty() {
                return;
            }

            self.allocate(now);

            if let Some(id) = self.registry.round_robin_next() {
                self.send_heartbeat_to(id);

                std::thread::sleep(TX_GAP);
            }
        }
    }

    /// Periodic slave-role TX: advertise every 10 s until a master
    /// heartbeats us.
    fn slave_tx(&mut self, now: Instant) {
        if self.rx_busy() {
            return;
        }

        let due = match self.time_last_tx {
            Some(at) => now.duration_since(at) >= SLAVE_LINKREADY_PERIOD,
            None => true,
        };

        if due {
            log::info!(
                "advertise fake slave {} with sign {}, once per 10 s until a master \
                 heartbeats us",
                self.cfg.id,
                self.cfg.sign
            );

            let payload = message::slave_linkready(
                self.cfg.id,
                self.cfg.sign,
                FAKE_SLAVE_MAX_AMPS,
                ProtocolVersion::V1,
            );
            self.transmit(&payload);
        }
    }

    /// Refresh telemetry-facing fields, compute the budget, and spread it
    /// over the registry. Runs on the heartbeat cadence.
    fn allocate(&mut self, now: Instant) {
        let local = chrono::Local::now();
        let weekday = local.weekday().num_days_from_monday();
        let minute = (local.hour() * 60 + local.minute()) as u16;

        let budget = {
            let mut alloc = self.shared.alloc.lock().expect("allocator state poisoned");

            alloc.total_amps_in_use = self.registry.total_amps_in_use();

            let budget = alloc.compute_budget(weekday, minute, now, self.cfg.wiring_max_all);
            alloc.max_amps_to_divide = budget;

            budget
        };

        divide_among_slaves(budget, self.cfg.min_amps, &mut self.registry);

        // Crossing the minimum in either direction is what the cars need
        // to hear about: below it the chargers stop offering power and a
        // sleeping car would never resume on its own.
        let above = budget >= self.cfg.min_amps;

        if above != self.budget_above_min {
            if above {
                self.tasks.enqueue(Task::Charge { start: true });
            } else if self.registry.total_amps_in_use() >= Centiamps::from_whole_amps(1) {
                self.tasks.enqueue(Task::Charge { start: false });
            }
        }

        self.budget_above_min = above;
    }

    fn send_heartbeat_to(&mut self, id: TwcId) {
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };

        let data = match &self.override_heartbeat {
            Some(data) => {
                session.last_heartbeat_sent = data.clone();

                data.clone()
            }
            None => session.next_heartbeat_data(),
        };

        let version = session.protocol_version;
        let payload = message::master_heartbeat(self.cfg.id, id, &data, version);

        self.transmit(&payload);
    }

    /// Pull bytes off the wire and dispatch every complete frame. A
    /// partial frame holds the loop here (in 25 ms steps) until it
    /// completes or times out, mirroring how the chargers themselves
    /// treat mid-frame silence.
    fn drain_rx(&mut self) {
        let mut buf = [0u8; 64];

        loop {
            let read = match self.bus.read_available(&mut buf) {
                Ok(read) => read,
                Err(e) => {
                    log::warn!("serial read failed: {}", e);

                    return;
                }
            };

            let now = Instant::now();

            if read == 0 {
                if self.reader.is_idle() || self.reader.expire_partial(now) {
                    return;
                }

                std::thread::sleep(IDLE_SLEEP);

                continue;
            }

            for &byte in &buf[..read] {
                if let Some(wire) = self.reader.push(byte, now) {
                    self.process_frame(&wire, now);
                }
            }
        }
    }

    fn process_frame(&mut self, wire: &[u8], now: Instant) {
        let payload = match framing::decode(wire) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("dropping frame ({}): {}", e, hex_str(wire));

                return;
            }
        };

        log::trace!("rx: {}", hex_str(&payload));

        if self.capture == Capture::Armed {
            if let Some(type_bytes) = Message::type_of(&payload) {
                if !PERIODIC_TYPES.contains(&type_bytes) {
                    self.capture = Capture::Got(payload.to_vec());
                }
            }
        }

        let parsed = Message::parse(&payload);

        match self.cfg.role {
            Role::Master => self.dispatch_master(parsed, now),
            Role::Slave => self.dispatch_slave(parsed, now),
        }
    }

    fn dispatch_master(&mut self, message: Message, now: Instant) {
        match message {
            Message::SlaveLinkReady {
                sender,
                sign,
                max_amps,
                version,
            } => {
                if sender == self.cfg.id {
                    log::warn!(
                        "slave {} reports the same id as this master; it should \
                         resolve the clash by reseeding itself",
                        sender
                    );

                    // A real master answers an id clash with a fresh
                    // linkready volley, which is what prompts the slave
                    // to pick a new id.
                    self.num_init_msgs = 10;

                    return;
                }

                log::info!(
                    "{} amp slave {} (sign {}) is ready to link",
                    max_amps,
                    sender,
                    sign
                );

                let session = self.registry.find_or_create(
                    sender,
                    sign,
                    version,
                    max_amps,
                    self.cfg.wiring_max_per_outlet,
                    now,
                );

                session.touch(now);

                // Bond right away; the slave stops advertising once it
                // hears its first heartbeat.
                self.send_heartbeat_to(sender);
            }
            Message::SlaveHeartbeat {
                sender,
                receiver,
                data,
            } => {
                let our_id = self.cfg.id;

                match self.registry.get_mut(sender) {
                    Some(session) if receiver == our_id => {
                        session.receive_heartbeat(&data, now);
                    }
                    Some(session) => {
                        log::warn!(
                            "slave {} sent status {} to {} instead of us",
                            sender,
                            data,
                            receiver
                        );

                        session.touch(now);
                    }
                    None => {
                        log::warn!(
                            "heartbeat from slave {} we've never seen a linkready from",
                            sender
                        );
                    }
                }
            }
            Message::VoltageReport {
                sender,
                kwh_total,
                volts,
            } => {
                log::info!(
                    "slave {} reports {} kWh delivered, phases {} V / {} V / {} V",
                    sender,
                    kwh_total,
                    volts[0],
                    volts[1],
                    volts[2]
                );
            }
            Message::VinReport { sender, vin } => {
                if vin.iter().all(|b| *b == 0) {
                    log::info!("slave {} reports no VIN available", sender);
                } else {
                    log::info!(
                        "slave {} reports VIN ending {}",
                        sender,
                        String::from_utf8_lossy(&vin)
                    );
                }
            }
            Message::MasterLinkReady1 { sender, .. } | Message::MasterLinkReady2 { sender, .. } => {
                log::error!(
                    "another master ({}) is advertising on this bus; two masters \
                     cannot share it. Check the rotary switch on every charger",
                    sender
                );
            }
            Message::MasterHeartbeat { sender, .. } => {
                log::error!(
                    "master heartbeat from {} while we are the master; ignoring",
                    sender
                );
            }
            Message::IdlePing => log::debug!("2-hour idle ping heard"),
            Message::VoltageRequest { sender, .. } => {
                log::debug!("ignoring voltage request from {}", sender)
            }
            Message::Unknown { bytes } => {
                if bytes.starts_with(&[0xFC, 0xE2]) {
                    log::error!(
                        "another master is advertising on this bus; two masters \
                         cannot share it. Check the rotary switch on every charger"
                    );
                } else {
                    log::info!("unknown message: {}", hex_str(&bytes));
                }
            }
        }
    }

    fn dispatch_slave(&mut self, message: Message, now: Instant) {
        match message {
            Message::MasterLinkReady1 { sender, sign } | Message::MasterLinkReady2 { sender, sign } => {
                log::info!("master {} linkready (sign {})", sender, sign);

                self.master_id = Some(sender);

                if sender == self.cfg.id {
                    self.reseed_identity();
                }
            }
            Message::MasterHeartbeat {
                sender,
                receiver,
                data,
            } => {
                self.master_id = Some(sender);

                if receiver == self.cfg.id {
                    self.slave_respond_heartbeat(sender, &data, now);
                } else {
                    // Remember what the master last told that slave; handy
                    // when eavesdropping on a real installation.
                    let session = self.registry.find_or_create(
                        receiver,
                        Sign(0),
                        ProtocolVersion::V1,
                        FAKE_SLAVE_MAX_AMPS,
                        self.cfg.wiring_max_per_outlet,
                        now,
                    );

                    session.last_heartbeat_sent = data;
                    session.touch(now);
                }
            }
            Message::SlaveLinkReady {
                sender,
                sign,
                max_amps,
                version,
            } => {
                if sender == self.cfg.id {
                    log::error!(
                        "slave {} advertises the same id as our fake slave",
                        sender
                    );

                    return;
                }

                log::info!("{} amp slave {} is ready to link", max_amps, sender);

                self.registry.find_or_create(
                    sender,
                    sign,
                    version,
                    max_amps,
                    self.cfg.wiring_max_per_outlet,
                    now,
                );
            }
            Message::SlaveHeartbeat { sender, data, .. } => {
                if sender == self.cfg.id {
                    log::error!(
                        "slave heartbeat from {} which clashes with our fake slave id",
                        sender
                    );

                    return;
                }

                log::debug!(
                    "slave {}: {}, drawing {} A",
                    sender,
                    SlaveChargeState::from(data.status()),
                    data.amps_actual()
                );
            }
            Message::VoltageRequest { sender, receiver } => {
                if sender == self.cfg.id {
                    log::error!("voltage request claims our own id {}", sender);

                    return;
                }

                if receiver == self.cfg.id {
                    let kwh = {
                        let alloc = self.shared.alloc.lock().expect("allocator state poisoned");

                        alloc.kwh_delivered as u32
                    };

                    log::info!("answering voltage request: {} kWh, 240 V single phase", kwh);

                    let payload = message::voltage_report(self.cfg.id, kwh, [240, 0, 0]);
                    self.transmit(&payload);
                }
            }
            Message::VoltageReport {
                sender,
                kwh_total,
                volts,
            } => {
                log::info!(
                    "{} reports {} kWh, phases {} V / {} V / {} V",
                    sender,
                    kwh_total,
                    volts[0],
                    volts[1],
                    volts[2]
                );
            }
            Message::IdlePing => log::info!("2-hour idle ping from the master"),
            Message::VinReport { .. } => {}
            Message::Unknown { bytes } => log::info!("unknown message: {}", hex_str(&bytes)),
        }
    }

    /// We are playing slave and a master turned up with our id. By
    /// convention the slave side yields: pick a fresh random id and sign.
    fn reseed_identity(&mut self) {
        let old = self.cfg.id;
        let mut rng = rand::thread_rng();

        let mut id = TwcId::random(&mut rng);
        while id == old {
            id = TwcId::random(&mut rng);
        }

        self.cfg.id = id;
        self.cfg.sign = Sign::random(&mut rng);

        log::warn!(
            "master's id matches our fake slave's; picked new id {} with sign {}",
            self.cfg.id,
            self.cfg.sign
        );
    }

    fn set_slave_hb_amps(&mut self, offset: usize, value: u16) {
        let bytes = value.to_be_bytes();
        self.slave_hb[offset] = bytes[0];
        self.slave_hb[offset + 1] = bytes[1];
    }

    /// Answer a master heartbeat the way a real charger does, well enough
    /// to exercise a master implementation on the bench.
    fn slave_respond_heartbeat(&mut self, master: TwcId, data: &HeartbeatData, now: Instant) {
        // Integrate delivered energy from the amps we claim to draw.
        let claimed = u16::from_be_bytes([self.slave_hb[1], self.slave_hb[2]]);
        let elapsed = self
            .kwh_integrated_at
            .map(|at| now.duration_since(at).as_secs_f64())
            .unwrap_or(0.0);
        self.kwh_integrated_at = Some(now);

        {
            let mut alloc = self.shared.alloc.lock().expect("allocator state poisoned");

            alloc.kwh_delivered +=
                240.0 * (f64::from(claimed) / 100.0) / 1000.0 / 3600.0 * elapsed;
        }

        let save_due = match self.kwh_saved_at {
            Some(at) => now.duration_since(at) >= KWH_SAVE_PERIOD,
            None => true,
        };

        if save_due {
            self.kwh_saved_at = Some(now);
            self.shared.save_settings();
        }

        let limit = data.amps_limit();

        match data.status() {
            0x07 => {
                // Drop the claimed draw by 2 A for ten seconds.
                self.slave_hb[0] = 0x07;
                self.raise_2a_at = Some(now + Duration::from_secs(10));
                self.set_slave_hb_amps(3, claimed.saturating_sub(280));
            }
            0x06 => {
                // Raise the limit by 2 A; report state 0A after 44 s.
                self.slave_hb[0] = 0x06;
                self.report_0a_at = Some(now + Duration::from_secs(44));

                let raised = claimed.saturating_add(200);
                self.set_slave_hb_amps(1, raised);
                self.set_slave_hb_amps(3, raised.saturating_sub(80));
            }
            0x05 | 0x08 | 0x09 => {
                if !limit.is_zero() {
                    // A real slave mimics the master's limit bytes, then
                    // claims to draw just under them.
                    let limit_raw = u16::from_be_bytes(limit.to_be_bytes());
                    self.set_slave_hb_amps(1, limit_raw);
                    self.set_slave_hb_amps(3, limit_raw.saturating_sub(80));
                }
            }
            0x00 => {
                if self.report_0a_at.is_some_and(|at| now >= at) {
                    self.report_0a_at = None;
                    self.slave_hb[0] = 0x0A;
                } else if self.raise_2a_at.is_some_and(|at| now >= at) {
                    self.raise_2a_at = None;
                    self.set_slave_hb_amps(3, claimed.saturating_sub(80));
                    self.slave_hb[0] = 0x0A;
                }
            }
            0x02 => {
                log::error!("master heartbeat carries error indication: {}", data);
            }
            other => {
                log::info!("unknown master heartbeat state {:02X}: {}", other, data);
            }
        }

        let reply = HeartbeatData::from_slice(&self.slave_hb[..7]);
        let payload =
            message::slave_heartbeat(self.cfg.id, master, &reply, ProtocolVersion::V1);

        self.transmit(&payload);
    }

    fn poll_ipc(&mut self, now: Instant) {
        let Some(request) = self.ipc.as_ref().and_then(|ipc| ipc.poll()) else {
            return;
        };

        self.log_web_request(&request);

        let command = parse_command(&request.body);
        let response = self.handle_web_command(command, now);

        if !response.is_empty() {
            if let Some(ipc) = self.ipc.as_ref() {
                ipc.respond(&request, &response);
            }
        }
    }

    fn log_web_request(&self, request: &WebRequest) {
        // Never log the vehicle account password.
        let shown = if request.body.starts_with(b"carApiEmailPassword=") {
            "carApiEmailPassword=[HIDDEN]".to_owned()
        } else {
            String::from_utf8_lossy(&request.body).into_owned()
        };

        log::info!(
            "web query '{}', id {}, time {}",
            shown,
            request.id,
            request.time
        );
    }

    fn handle_web_command(&mut self, command: WebCommand, now: Instant) -> String {
        match command {
            WebCommand::GetStatus => self.status_response(now),
            WebCommand::SetNonScheduledAmps(amps) => {
                {
                    let mut alloc = self.shared.alloc.lock().expect("allocator state poisoned");

                    alloc.non_scheduled_amps_max = if amps < 0 {
                        None
                    } else {
                        Some(Centiamps::from_whole_amps(amps as u32))
                    };
                }

                self.shared.save_settings();

                String::new()
            }
            WebCommand::SetScheduledAmps {
                amps,
                start_minutes,
                end_minutes,
                days,
            } => {
                {
                    let mut alloc = self.shared.alloc.lock().expect("allocator state poisoned");

                    alloc.schedule.scheduled_amps_max = if amps < 0 {
                        None
                    } else {
                        Some(Centiamps::from_whole_amps(amps as u32))
                    };
                    alloc.schedule.start_minutes = start_minutes;
                    alloc.schedule.end_minutes = end_minutes;
                    alloc.schedule.days = crate::allocator::Days::from_bits_truncate(days);
                }

                self.shared.save_settings();

                String::new()
            }
            WebCommand::SetResumeGreenTime(minutes) => {
                {
                    let mut alloc = self.shared.alloc.lock().expect("allocator state poisoned");

                    alloc.hour_resume_green = minutes;
                }

                self.shared.save_settings();

                String::new()
            }
            WebCommand::ChargeNow => {
                {
                    let mut alloc = self.shared.alloc.lock().expect("allocator state poisoned");

                    alloc.start_charge_now(self.cfg.wiring_max_all, now + CHARGE_NOW_DURATION);
                }

                log::info!(
                    "charge-now: offering {} A for 24 hours",
                    self.cfg.wiring_max_all
                );

                String::new()
            }
            WebCommand::ChargeNowCancel => {
                self.shared
                    .alloc
                    .lock()
                    .expect("allocator state poisoned")
                    .cancel_charge_now();

                log::info!("charge-now cancelled");

                String::new()
            }
            WebCommand::SendTwcMsg(bytes) => {
                self.send_raw_frame(bytes);

                String::new()
            }
            WebCommand::GetLastTwcResponse => match &self.capture {
                Capture::Got(bytes) => hex_str(bytes),
                _ => "None".to_owned(),
            },
            WebCommand::CarApiCredentials { email, password } => {
                self.tasks.enqueue(Task::CarApiCredentials { email, password });

                String::new()
            }
            WebCommand::SetMasterHeartbeatData(bytes) => {
                self.override_heartbeat = if bytes.is_empty() {
                    None
                } else {
                    Some(HeartbeatData::from_slice(&bytes))
                };

                String::new()
            }
            WebCommand::SetDebugLevel(level) => {
                log::info!("debug level set to {}", level);
                apply_debug_level(level);

                String::new()
            }
            WebCommand::DumpState => self.dump_state(),
            WebCommand::Unknown(body) => {
                log::warn!(
                    "unknown request from web interface: {}",
                    String::from_utf8_lossy(&body)
                );

                String::new()
            }
        }
    }

    /// Forward a raw frame from the web interface, refusing the handful
    /// of message types known to permanently disable or crash a charger.
    fn send_raw_frame(&mut self, mut bytes: Vec<u8>) {
        match bytes.as_slice() {
            [0xFC, 0x19, ..] | [0xFC, 0x1A, ..] => {
                log::error!(
                    "web interface requested sending {} which could permanently \
                     disable the charger; refusing",
                    hex_str(&bytes)
                );

                return;
            }
            [0xFB, 0xE8, ..] => {
                log::error!(
                    "web interface requested sending {} which can crash the \
                     charger; refusing",
                    hex_str(&bytes)
                );

                return;
            }
            _ => {}
        }

        // Pad to the fleet's frame length.
        let version = self
            .registry
            .iter()
            .next()
            .map(|s| s.protocol_version)
            .unwrap_or(ProtocolVersion::V2);

        bytes.resize(version.payload_len(), 0x00);

        self.capture = Capture::Armed;
        self.transmit(&bytes);
    }

    fn status_response(&self, now: Instant) -> String {
        let alloc = self.shared.alloc.lock().expect("allocator state poisoned");
        let settings = self.shared.settings.lock().expect("settings poisoned");

        let amps_or_unset = |amps: Option<Centiamps>| match amps {
            Some(a) => ((a.0 / 100) as i32).to_string(),
            None => (-1).to_string(),
        };

        // Credentials are only worth nagging about when a protocol 2
        // charger is present; older fleets can't tell the car apart
        // anyway.
        let need_credentials = settings.car_api_bearer_token.is_empty()
            && self
                .registry
                .iter()
                .any(|s| s.protocol_version == ProtocolVersion::V2);

        let charge_now = if alloc.charge_now_active(now) {
            alloc.charge_now_amps
        } else {
            Centiamps::ZERO
        };

        let mut response = format!(
            "{}`{}`{}`{}`{}`{}`{}`{}`{}`{}`{}`{}",
            alloc.max_amps_to_divide,
            self.cfg.wiring_max_all,
            self.cfg.min_amps,
            charge_now,
            amps_or_unset(alloc.non_scheduled_amps_max),
            amps_or_unset(alloc.schedule.scheduled_amps_max),
            fmt_hhmm(alloc.schedule.start_minutes),
            fmt_hhmm(alloc.schedule.end_minutes),
            alloc.schedule.days.bits(),
            fmt_hhmm(alloc.hour_resume_green),
            u8::from(need_credentials),
            self.registry.len(),
        );

        for session in self.registry.iter() {
            response.push_str(&format!(
                "`{}~{}~{}~{}~{}",
                session.id,
                session.max_amps,
                session.reported_amps_actual,
                session.last_amps_offered(),
                session.reported_state,
            ));
        }

        response
    }

    fn dump_state(&self) -> String {
        let alloc = self.shared.alloc.lock().expect("allocator state poisoned");

        let mut dump = format!(
            "role={:?}, id={}, masterSeen={:?}, wiringMaxAmpsAllTWCs={}, \
             wiringMaxAmpsPerTWC={}, minAmpsPerTWC={}\n{:?}\n",
            self.cfg.role,
            self.cfg.id,
            self.master_id,
            self.cfg.wiring_max_all,
            self.cfg.wiring_max_per_outlet,
            self.cfg.min_amps,
            *alloc,
        );

        for session in self.registry.iter() {
            dump.push_str(&format!("{:?}\n", session));
        }

        dump
    }

    fn housekeeping(&mut self, now: Instant) {
        if self.cfg.role == Role::Master {
            let green_due = match self.last_green_check {
                Some(at) => now.duration_since(at) >= GREEN_ENERGY_PERIOD,
                None => true,
            };

            if green_due {
                self.last_green_check = Some(now);
                self.tasks.enqueue(Task::CheckGreenEnergy);
            }
        }

        self.check_resume_green_energy();
    }

    /// At the operator's chosen time of day, clear the non-scheduled amps
    /// cap so the budget falls back to tracking green energy.
    fn check_resume_green_energy(&mut self) {
        let local = chrono::Local::now();
        let minute = (local.hour() * 60 + local.minute()) as u16;

        if self.resume_fired_at == Some(minute) {
            return;
        }

        let fired = {
            let mut alloc = self.shared.alloc.lock().expect("allocator state poisoned");

            if alloc.hour_resume_green == Some(minute) && alloc.non_scheduled_amps_max.is_some()
            {
                alloc.non_scheduled_amps_max = None;

                true
            } else {
                false
            }
        };

        if fired {
            log::info!("resume-green-energy time reached, tracking green energy again");

            self.resume_fired_at = Some(minute);
            self.shared.save_settings();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorState;
    use crate::settings::Settings;
    use crate::tasks::TaskRunner;
    use crate::transport::MockBus;
    use pretty_assertions::assert_eq;

    fn test_engine(role: Role) -> Engine<MockBus> {
        let dir = tempfile::tempdir().unwrap();
        let shared = Arc::new(Shared::new(
            AllocatorState::new(false),
            Settings::default(),
            dir.path().join("test.settings"),
        ));

        // Keep the tempdir alive for the engine's lifetime.
        std::mem::forget(dir);

        let runner = TaskRunner::spawn(|_| {});
        let queue = runner.queue();
        std::mem::forget(runner);

        Engine::new(
            MockBus::new(),
            EngineConfig {
                role,
                id: TwcId([0x77, 0x77]),
                sign: Sign(0x77),
                wiring_max_all: Centiamps::from_whole_amps(60),
                wiring_max_per_outlet: Centiamps::from_whole_amps(40),
                min_amps: Centiamps::from_whole_amps(6),
            },
            shared,
            queue,
            None,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn feed_frame(engine: &mut Engine<MockBus>, payload: &[u8]) {
        let wire = framing::encode(payload).unwrap();

        engine.bus.feed(&wire);
        engine.drain_rx();
    }

    fn sent_payloads(engine: &mut Engine<MockBus>) -> Vec<Vec<u8>> {
        let mut reader = FrameReader::new();
        let now = Instant::now();
        let bytes = std::mem::take(&mut engine.bus.tx);

        bytes
            .iter()
            .filter_map(|b| reader.push(*b, now))
            .map(|wire| framing::decode(&wire).unwrap().to_vec())
            .collect()
    }

    const LINKREADY_ABCD: [u8; 13] = [
        0xFD, 0xE2, 0xAB, 0xCD, 0x77, 0x1F, 0x40, 0, 0, 0, 0, 0, 0,
    ];

    #[test]
    fn link_up_creates_session_and_bonds() {
        let mut engine = test_engine(Role::Master);
        engine.num_init_msgs = 0;

        feed_frame(&mut engine, &LINKREADY_ABCD);

        let session = engine.registry.get(TwcId([0xAB, 0xCD])).expect("session");

        assert_eq!(session.max_amps, Centiamps(8000));
        assert_eq!(session.protocol_version, ProtocolVersion::V1);
        assert_eq!(session.min_amps_supported, Centiamps(500));

        // The bonding heartbeat goes out immediately, addressed to the
        // new slave, offering 0 A.
        let sent = sent_payloads(&mut engine);

        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            vec![0xFB, 0xE0, 0x77, 0x77, 0xAB, 0xCD, 0x00, 0x00, 0x00, 0, 0, 0, 0]
        );
    }

    #[test]
    fn startup_burst_sends_ten_linkreadys() {
        let mut engine = test_engine(Role::Master);

        for _ in 0..10 {
            let now = Instant::now();
            engine.master_tx(now);
        }

        let sent = sent_payloads(&mut engine);

        assert_eq!(sent.len(), 10);
        assert!(sent[..5].iter().all(|p| p.starts_with(&[0xFC, 0xE1])));
        assert!(sent[5..].iter().all(|p| p.starts_with(&[0xFB, 0xE2])));
        assert_eq!(engine.num_init_msgs, 0);
    }

    #[test]
    fn silent_slave_evicted_before_next_heartbeat() {
        let mut engine = test_engine(Role::Master);
        engine.num_init_msgs = 0;

        feed_frame(&mut engine, &LINKREADY_ABCD);
        sent_payloads(&mut engine);

        engine
            .registry
            .get_mut(TwcId([0xAB, 0xCD]))
            .unwrap()
            .time_last_rx = Instant::now() - Duration::from_secs(27);
        engine.time_last_tx = None;

        engine.master_tx(Instant::now());

        assert!(engine.registry.is_empty());
        assert!(sent_payloads(&mut engine).is_empty());
    }

    #[test]
    fn heartbeat_carries_allocated_amps() {
        let mut engine = test_engine(Role::Master);
        engine.num_init_msgs = 0;

        feed_frame(&mut engine, &LINKREADY_ABCD);
        sent_payloads(&mut engine);

        {
            let mut alloc = engine.shared.alloc.lock().unwrap();

            alloc.set_generation("test", 5760.0);
        }

        engine.time_last_tx = None;
        engine.master_tx(Instant::now());

        let sent = sent_payloads(&mut engine);

        assert_eq!(sent.len(), 1);
        // 5760 W / 240 V = 24 A target, but the first cycle after 0 A
        // carries the 21 A spike.
        assert_eq!(&sent[0][..9], &[0xFB, 0xE0, 0x77, 0x77, 0xAB, 0xCD, 0x09, 0x08, 0x34]);

        engine.time_last_tx = None;
        engine.master_tx(Instant::now() + HEARTBEAT_PERIOD);

        let sent = sent_payloads(&mut engine);

        assert_eq!(&sent[0][6..9], &[0x09, 0x09, 0x60]);
    }

    #[test]
    fn peer_master_logged_not_answered() {
        let mut engine = test_engine(Role::Master);
        engine.num_init_msgs = 0;

        let peer = [0xFC, 0xE1, 0x11, 0x22, 0x33, 0, 0, 0, 0, 0, 0, 0, 0];
        feed_frame(&mut engine, &peer);

        assert!(engine.registry.is_empty());
        assert!(sent_payloads(&mut engine).is_empty());
    }

    #[test]
    fn id_conflict_reseeds_fake_slave() {
        let mut engine = test_engine(Role::Slave);

        let clash = [0xFC, 0xE1, 0x77, 0x77, 0x99, 0, 0, 0, 0, 0, 0, 0, 0];
        feed_frame(&mut engine, &clash);

        assert_ne!(engine.cfg.id, TwcId([0x77, 0x77]));
    }

    #[test]
    fn fake_slave_answers_master_heartbeat() {
        let mut engine = test_engine(Role::Slave);

        let heartbeat = [
            0xFB, 0xE0, 0xAA, 0xBB, 0x77, 0x77, 0x00, 0x00, 0x00, 0, 0, 0, 0,
        ];
        feed_frame(&mut engine, &heartbeat);

        let sent = sent_payloads(&mut engine);

        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with(&[0xFD, 0xE0, 0x77, 0x77, 0xAA, 0xBB]));
    }

    #[test]
    fn dangerous_raw_frames_refused() {
        let mut engine = test_engine(Role::Master);

        for frame in [[0xFC, 0x19], [0xFC, 0x1A], [0xFB, 0xE8]] {
            engine.handle_web_command(
                WebCommand::SendTwcMsg(frame.to_vec()),
                Instant::now(),
            );
        }

        assert!(engine.bus.tx.is_empty());
        assert_eq!(engine.capture, Capture::Off);
    }

    #[test]
    fn raw_frame_arms_response_capture() {
        let mut engine = test_engine(Role::Master);
        engine.num_init_msgs = 0;

        engine.handle_web_command(
            WebCommand::SendTwcMsg(vec![0xFB, 0xEB, 0x77, 0x77, 0xAB, 0xCD]),
            Instant::now(),
        );

        assert!(!engine.bus.tx.is_empty());
        assert_eq!(engine.capture, Capture::Armed);

        // A periodic frame must not be captured...
        feed_frame(&mut engine, &LINKREADY_ABCD);
        assert_eq!(engine.capture, Capture::Armed);

        // ...but an unusual one is.
        let unusual = [0xFD, 0xE1, 0xAB, 0xCD, 0x01, 0x02, 0, 0, 0, 0, 0, 0, 0];
        feed_frame(&mut engine, &unusual);

        let response = engine.handle_web_command(WebCommand::GetLastTwcResponse, Instant::now());

        assert_eq!(response, "FD E1 AB CD 01 02 00 00 00 00 00 00 00");
    }

    #[test]
    fn status_lists_slaves() {
        let mut engine = test_engine(Role::Master);
        engine.num_init_msgs = 0;

        feed_frame(&mut engine, &LINKREADY_ABCD);

        let status = engine.handle_web_command(WebCommand::GetStatus, Instant::now());
        let fields: Vec<&str> = status.split('`').collect();

        assert_eq!(fields[1], "60.00");
        assert_eq!(fields[2], "6.00");
        assert_eq!(fields[11], "1");
        assert!(fields[12].starts_with("ABCD~80.00~0.00~0.00~0"));
    }

    #[test]
    fn charge_now_override_set_and_cleared() {
        let mut engine = test_engine(Role::Master);
        let now = Instant::now();

        engine.handle_web_command(WebCommand::ChargeNow, now);

        {
            let alloc = engine.shared.alloc.lock().unwrap();

            assert!(alloc.charge_now_active(now));
            assert_eq!(alloc.charge_now_amps, Centiamps::from_whole_amps(60));
        }

        engine.handle_web_command(WebCommand::ChargeNowCancel, now);

        assert!(!engine.shared.alloc.lock().unwrap().charge_now_active(now));
    }
}
