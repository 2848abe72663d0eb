//! Typed encode/decode of the known message set.
//!
//! Every message starts with a two byte type after the framing layer is
//! stripped. Fields are fixed-offset; messages are zero-padded to 13
//! payload bytes for protocol 1 peers or 15 for protocol 2, with the
//! framing layer appending the checksum on top.

use crate::amps::Centiamps;
use crate::framing::FRAME_MAX;
use core::fmt;
use rand::Rng;

/// Two opaque bytes identifying a device on the bus.
///
/// Chargers ship with a random id and the protocol does not enforce
/// uniqueness; the slave side of a collision reseeds itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TwcId(pub [u8; 2]);

impl TwcId {
    pub fn random(rng: &mut impl Rng) -> Self {
        Self([rng.gen(), rng.gen()])
    }
}

impl fmt::Display for TwcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0[0], self.0[1])
    }
}

/// A device's one byte nonce, constant until the device power-cycles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Sign(pub u8);

impl Sign {
    pub fn random(rng: &mut impl Rng) -> Self {
        Self(rng.gen())
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

/// Link protocol revision, inferred from the length of the first
/// link-ready frame a device sends (14 unescaped bytes for version 1, 16
/// for version 2) and never changed afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn from_payload_len(len: usize) -> Option<Self> {
        match len {
            13 => Some(Self::V1),
            15 => Some(Self::V2),
            _ => None,
        }
    }

    /// Payload length excluding the checksum byte.
    pub fn payload_len(self) -> usize {
        match self {
            Self::V1 => 13,
            Self::V2 => 15,
        }
    }

    /// Length of the heartbeat command/status block.
    pub fn heartbeat_len(self) -> usize {
        match self {
            Self::V1 => 7,
            Self::V2 => 9,
        }
    }

    /// Lowest charge rate the firmware generation accepts.
    pub fn min_amps(self) -> Centiamps {
        match self {
            Self::V1 => Centiamps::from_whole_amps(5),
            Self::V2 => Centiamps::from_whole_amps(6),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => f.write_str("1"),
            Self::V2 => f.write_str("2"),
        }
    }
}

/// The 7 or 9 byte command/status block of a heartbeat message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatData {
    bytes: heapless::Vec<u8, 9>,
}

impl HeartbeatData {
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut out = heapless::Vec::new();
        let _ = out.extend_from_slice(&bytes[..bytes.len().min(9)]);

        Self { bytes: out }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn status(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }

    /// Bytes 1..3: the amps limit a master commands, or the limit a slave
    /// echoes back.
    pub fn amps_limit(&self) -> Centiamps {
        match self.bytes.get(1..3) {
            Some(&[hi, lo]) => Centiamps::from_be_bytes([hi, lo]),
            _ => Centiamps::ZERO,
        }
    }

    /// Bytes 3..5: the amps a slave reports actually flowing.
    pub fn amps_actual(&self) -> Centiamps {
        match self.bytes.get(3..5) {
            Some(&[hi, lo]) => Centiamps::from_be_bytes([hi, lo]),
            _ => Centiamps::ZERO,
        }
    }
}

impl fmt::Display for HeartbeatData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            write!(f, "{:02X}", byte)?;
        }

        Ok(())
    }
}

/// Charger state codes carried in the first slave heartbeat byte.
///
/// Only the codes the controller acts on are named; everything else is
/// logged and left alone.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlaveChargeState {
    /// Plugged in but not drawing.
    Idle,
    /// Ready/plugged.
    Ready,
    /// Slave asking to stop: charge complete or declined.
    StopRequest,
    Charging,
    /// New limit acknowledged, slave is ramping.
    LimitAccepted,
    Other(u8),
}

impl From<u8> for SlaveChargeState {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Idle,
            0x04 => Self::Ready,
            0x05 => Self::StopRequest,
            0x08 => Self::Charging,
            0x09 => Self::LimitAccepted,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for SlaveChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Ready => f.write_str("ready"),
            Self::StopRequest => f.write_str("requesting stop"),
            Self::Charging => f.write_str("charging"),
            Self::LimitAccepted => f.write_str("limit accepted"),
            Self::Other(value) => write!(f, "state {:02X}", value),
        }
    }
}

/// Every message the controller understands, plus a catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `FC E1` broadcast: first half of a master's startup advertisement.
    MasterLinkReady1 { sender: TwcId, sign: Sign },
    /// `FB E2` broadcast: second half of a master's startup advertisement.
    MasterLinkReady2 { sender: TwcId, sign: Sign },
    /// `FD E2`: a slave advertising itself for bonding, every 10 s until a
    /// master heartbeats it.
    SlaveLinkReady {
        sender: TwcId,
        sign: Sign,
        max_amps: Centiamps,
        version: ProtocolVersion,
    },
    /// `FB E0`: per-slave command from a master.
    MasterHeartbeat {
        sender: TwcId,
        receiver: TwcId,
        data: HeartbeatData,
    },
    /// `FD E0`: per-slave status, sent only in response to a master
    /// heartbeat.
    SlaveHeartbeat {
        sender: TwcId,
        receiver: TwcId,
        data: HeartbeatData,
    },
    /// `FB EB`: master asking for the kWh/voltage report.
    VoltageRequest { sender: TwcId, receiver: TwcId },
    /// `FD EB`: lifetime kWh counter plus per-phase line voltages.
    VoltageReport {
        sender: TwcId,
        kwh_total: u32,
        volts: [u16; 3],
    },
    /// `FD EE`: last 7 characters of the plugged vehicle's VIN, all zeroes
    /// when unavailable.
    VinReport { sender: TwcId, vin: [u8; 7] },
    /// `FC 1D`: sent three times every two hours by an idle master.
    /// Observational only.
    IdlePing,
    Unknown { bytes: heapless::Vec<u8, FRAME_MAX> },
}

impl Message {
    /// Decode a checksum-stripped payload.
    ///
    /// Never fails: anything unrecognized becomes [`Message::Unknown`] for
    /// the dispatcher to log.
    pub fn parse(payload: &[u8]) -> Self {
        let unknown = || Message::Unknown {
            bytes: heapless::Vec::from_slice(payload).unwrap_or_default(),
        };

        if payload.len() < 2 {
            return unknown();
        }

        let id_at = |offset: usize| TwcId([payload[offset], payload[offset + 1]]);

        match (payload[0], payload[1]) {
            (0xFC, 0xE1) if payload.len() >= 5 => Message::MasterLinkReady1 {
                sender: id_at(2),
                sign: Sign(payload[4]),
            },
            (0xFB, 0xE2) if payload.len() >= 5 => Message::MasterLinkReady2 {
                sender: id_at(2),
                sign: Sign(payload[4]),
            },
            (0xFD, 0xE2) if payload.len() >= 7 => {
                let Some(version) = ProtocolVersion::from_payload_len(payload.len()) else {
                    return unknown();
                };

                Message::SlaveLinkReady {
                    sender: id_at(2),
                    sign: Sign(payload[4]),
                    max_amps: Centiamps::from_be_bytes([payload[5], payload[6]]),
                    version,
                }
            }
            (0xFB, 0xE0) if payload.len() >= 13 => Message::MasterHeartbeat {
                sender: id_at(2),
                receiver: id_at(4),
                data: HeartbeatData::from_slice(&payload[6..]),
            },
            (0xFD, 0xE0) if payload.len() >= 13 => Message::SlaveHeartbeat {
                sender: id_at(2),
                receiver: id_at(4),
                data: HeartbeatData::from_slice(&payload[6..]),
            },
            (0xFB, 0xEB) if payload.len() >= 6 => Message::VoltageRequest {
                sender: id_at(2),
                receiver: id_at(4),
            },
            (0xFD, 0xEB) if payload.len() >= 14 => Message::VoltageReport {
                sender: id_at(2),
                kwh_total: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                volts: [
                    u16::from_be_bytes([payload[8], payload[9]]),
                    u16::from_be_bytes([payload[10], payload[11]]),
                    u16::from_be_bytes([payload[12], payload[13]]),
                ],
            },
            (0xFD, 0xEE) if payload.len() >= 11 => {
                let mut vin = [0u8; 7];
                vin.copy_from_slice(&payload[4..11]);

                Message::VinReport {
                    sender: id_at(2),
                    vin,
                }
            }
            (0xFC, 0x1D) => Message::IdlePing,
            _ => unknown(),
        }
    }

    /// The raw two byte type, for capture filtering.
    pub fn type_of(payload: &[u8]) -> Option<(u8, u8)> {
        match payload {
            [a, b, ..] => Some((*a, *b)),
            _ => None,
        }
    }
}

/// An unframed, unchecksummed TX payload.
pub type Payload = heapless::Vec<u8, FRAME_MAX>;

fn pad_to(payload: &mut Payload, len: usize) {
    while payload.len() < len {
        let _ = payload.push(0x00);
    }

    payload.truncate(len);
}

fn header(type_bytes: [u8; 2], sender: TwcId) -> Payload {
    let mut payload = Payload::new();
    let _ = payload.extend_from_slice(&type_bytes);
    let _ = payload.extend_from_slice(&sender.0);

    payload
}

/// `FC E1` master link-ready broadcast.
pub fn master_linkready1(id: TwcId, sign: Sign) -> Payload {
    let mut payload = header([0xFC, 0xE1], id);
    let _ = payload.push(sign.0);
    pad_to(&mut payload, 13);

    payload
}

/// `FB E2` master link-ready broadcast.
pub fn master_linkready2(id: TwcId, sign: Sign) -> Payload {
    let mut payload = header([0xFB, 0xE2], id);
    let _ = payload.push(sign.0);
    pad_to(&mut payload, 13);

    payload
}

/// `FD E2` slave link-ready advertisement.
pub fn slave_linkready(
    id: TwcId,
    sign: Sign,
    max_amps: Centiamps,
    version: ProtocolVersion,
) -> Payload {
    let mut payload = header([0xFD, 0xE2], id);
    let _ = payload.push(sign.0);
    let _ = payload.extend_from_slice(&max_amps.to_be_bytes());
    pad_to(&mut payload, version.payload_len());

    payload
}

/// `FB E0` master heartbeat carrying a raw command block.
pub fn master_heartbeat(
    sender: TwcId,
    receiver: TwcId,
    data: &HeartbeatData,
    version: ProtocolVersion,
) -> Payload {
    let mut payload = header([0xFB, 0xE0], sender);
    let _ = payload.extend_from_slice(&receiver.0);
    let _ = payload.extend_from_slice(data.as_bytes());
    pad_to(&mut payload, version.payload_len());

    payload
}

/// `FD E0` slave heartbeat.
pub fn slave_heartbeat(
    sender: TwcId,
    receiver: TwcId,
    data: &HeartbeatData,
    version: ProtocolVersion,
) -> Payload {
    let mut payload = header([0xFD, 0xE0], sender);
    let _ = payload.extend_from_slice(&receiver.0);
    let _ = payload.extend_from_slice(data.as_bytes());
    pad_to(&mut payload, version.payload_len());

    payload
}

/// `FB EB` kWh/voltage query. Protocol 2 only.
pub fn voltage_request(sender: TwcId, receiver: TwcId) -> Payload {
    let mut payload = header([0xFB, 0xEB], sender);
    let _ = payload.extend_from_slice(&receiver.0);
    pad_to(&mut payload, ProtocolVersion::V2.payload_len());

    payload
}

/// `FD EB` kWh/voltage report. Protocol 2 only.
pub fn voltage_report(sender: TwcId, kwh_total: u32, volts: [u16; 3]) -> Payload {
    let mut payload = header([0xFD, 0xEB], sender);
    let _ = payload.extend_from_slice(&kwh_total.to_be_bytes());

    for phase in volts {
        let _ = payload.extend_from_slice(&phase.to_be_bytes());
    }

    pad_to(&mut payload, ProtocolVersion::V2.payload_len());

    payload
}

/// `FB EE` VIN query. Protocol 2 only.
pub fn vin_request(sender: TwcId, receiver: TwcId) -> Payload {
    let mut payload = header([0xFB, 0xEE], sender);
    let _ = payload.extend_from_slice(&receiver.0);
    pad_to(&mut payload, ProtocolVersion::V2.payload_len());

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_slave_linkready_v1() {
        let payload = [0xFD, 0xE2, 0xAB, 0xCD, 0x77, 0x1F, 0x40, 0, 0, 0, 0, 0, 0];

        let parsed = Message::parse(&payload);

        assert_eq!(
            parsed,
            Message::SlaveLinkReady {
                sender: TwcId([0xAB, 0xCD]),
                sign: Sign(0x77),
                max_amps: Centiamps(8000),
                version: ProtocolVersion::V1,
            }
        );
    }

    #[test]
    fn parse_slave_linkready_v2_from_length() {
        let payload = [
            0xFD, 0xE2, 0xAB, 0xCD, 0x77, 0x0C, 0x80, 0, 0, 0, 0, 0, 0, 0, 0,
        ];

        match Message::parse(&payload) {
            Message::SlaveLinkReady {
                max_amps, version, ..
            } => {
                assert_eq!(max_amps, Centiamps(3200));
                assert_eq!(version, ProtocolVersion::V2);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn parse_slave_heartbeat_fields() {
        let payload = [
            0xFD, 0xE0, 0xAB, 0xCD, 0x77, 0x77, 0x08, 0x09, 0x60, 0x09, 0x4B, 0, 0,
        ];

        match Message::parse(&payload) {
            Message::SlaveHeartbeat {
                sender,
                receiver,
                data,
            } => {
                assert_eq!(sender, TwcId([0xAB, 0xCD]));
                assert_eq!(receiver, TwcId([0x77, 0x77]));
                assert_eq!(SlaveChargeState::from(data.status()), SlaveChargeState::Charging);
                assert_eq!(data.amps_limit(), Centiamps(2400));
                assert_eq!(data.amps_actual(), Centiamps(2379));
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn parse_voltage_report() {
        let payload = [
            0xFD, 0xEB, 0x77, 0x77, 0x00, 0x00, 0x00, 0x38, 0x00, 0xE6, 0x00, 0xF1, 0x00, 0xE8,
            0x00,
        ];

        assert_eq!(
            Message::parse(&payload),
            Message::VoltageReport {
                sender: TwcId([0x77, 0x77]),
                kwh_total: 56,
                volts: [230, 241, 232],
            }
        );
    }

    #[test]
    fn unknown_kept_verbatim() {
        let payload = [0xFC, 0x19, 0x01, 0x02, 0x03, 0, 0, 0, 0, 0, 0, 0, 0];

        match Message::parse(&payload) {
            Message::Unknown { bytes } => assert_eq!(bytes.as_slice(), &payload[..]),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn linkready_broadcast_layout() {
        let payload = master_linkready1(TwcId([0x77, 0x77]), Sign(0x77));

        assert_eq!(
            payload.as_slice(),
            &[0xFC, 0xE1, 0x77, 0x77, 0x77, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn heartbeat_padded_per_version() {
        let data = HeartbeatData::from_slice(&[0x09, 0x09, 0x60, 0, 0, 0, 0]);

        let v1 = master_heartbeat(
            TwcId([0x77, 0x77]),
            TwcId([0xAB, 0xCD]),
            &data,
            ProtocolVersion::V1,
        );
        let v2 = master_heartbeat(
            TwcId([0x77, 0x77]),
            TwcId([0xAB, 0xCD]),
            &data,
            ProtocolVersion::V2,
        );

        assert_eq!(v1.len(), 13);
        assert_eq!(v2.len(), 15);
        assert_eq!(&v1[..9], &[0xFB, 0xE0, 0x77, 0x77, 0xAB, 0xCD, 0x09, 0x09, 0x60]);
    }
}
