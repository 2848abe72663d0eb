//! Local IPC with the web interface.
//!
//! Message-oriented over a Unix datagram socket. Clients bind their own
//! socket and send requests to ours; replies go back to the sender's
//! path. Each message is a 6 byte header — `time: u32` then `id: u16`,
//! both little-endian — followed by an ASCII command or response body.
//! Bodies longer than 290 bytes are split: the first reply datagram
//! carries a single packet-count byte, followed by that many
//! continuation datagrams of up to 290 bytes each.

use std::io;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::Path;

/// Longest body a single datagram carries.
pub const MAX_BODY: usize = 290;

const HEADER_LEN: usize = 6;

/// A request from the web interface, with enough addressing to reply.
#[derive(Debug)]
pub struct WebRequest {
    pub time: u32,
    pub id: u16,
    pub body: Vec<u8>,
    reply_to: SocketAddr,
}

/// The bound server end.
pub struct WebIpc {
    socket: UnixDatagram,
}

impl WebIpc {
    pub fn open(path: &str) -> io::Result<Self> {
        // A stale socket file from an unclean shutdown would block the
        // bind.
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }

        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;

        Ok(Self { socket })
    }

    /// Pick up one pending request, if any.
    pub fn poll(&self) -> Option<WebRequest> {
        let mut buf = [0u8; 1024];

        let (len, reply_to) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                log::warn!("IPC receive failed: {}", e);

                return None;
            }
        };

        if len < HEADER_LEN {
            log::warn!("IPC request shorter than its header ({} bytes)", len);

            return None;
        }

        Some(WebRequest {
            time: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            id: u16::from_le_bytes([buf[4], buf[5]]),
            body: buf[HEADER_LEN..len].to_vec(),
            reply_to,
        })
    }

    fn send(&self, request: &WebRequest, body: &[u8]) -> io::Result<()> {
        let Some(path) = request.reply_to.as_pathname() else {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "requester socket has no path to reply to",
            ));
        };

        let mut datagram = Vec::with_capacity(HEADER_LEN + body.len());
        datagram.extend_from_slice(&request.time.to_le_bytes());
        datagram.extend_from_slice(&request.id.to_le_bytes());
        datagram.extend_from_slice(body);

        self.socket.send_to(&datagram, path).map(|_| ())
    }

    /// Reply to a request, splitting oversized bodies into continuation
    /// packets.
    pub fn respond(&self, request: &WebRequest, body: &str) {
        let bytes = body.as_bytes();

        let result = if bytes.len() <= MAX_BODY {
            self.send(request, bytes)
        } else {
            let packets: Vec<&[u8]> = bytes.chunks(MAX_BODY).take(u8::MAX as usize).collect();

            self.send(request, &[packets.len() as u8]).and_then(|()| {
                packets
                    .iter()
                    .try_for_each(|packet| self.send(request, packet))
            })
        };

        if let Err(e) = result {
            log::warn!("can't reply to web interface: {}", e);
        }
    }
}

/// Every command the web interface may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebCommand {
    GetStatus,
    SetNonScheduledAmps(i32),
    SetScheduledAmps {
        amps: i32,
        start_minutes: Option<u16>,
        end_minutes: Option<u16>,
        days: u8,
    },
    SetResumeGreenTime(Option<u16>),
    ChargeNow,
    ChargeNowCancel,
    SendTwcMsg(Vec<u8>),
    GetLastTwcResponse,
    CarApiCredentials {
        email: String,
        password: String,
    },
    /// Raw heartbeat payload override; empty clears it.
    SetMasterHeartbeatData(Vec<u8>),
    SetDebugLevel(i32),
    DumpState,
    Unknown(Vec<u8>),
}

/// Decode an ASCII command body.
pub fn parse_command(body: &[u8]) -> WebCommand {
    let unknown = || WebCommand::Unknown(body.to_vec());

    let Ok(text) = core::str::from_utf8(body) else {
        return unknown();
    };

    match text {
        "getStatus" => return WebCommand::GetStatus,
        "chargeNow" => return WebCommand::ChargeNow,
        "chargeNowCancel" => return WebCommand::ChargeNowCancel,
        "getLastTWCMsgResponse" => return WebCommand::GetLastTwcResponse,
        "dumpState" => return WebCommand::DumpState,
        _ => {}
    }

    if let Some(rest) = text.strip_prefix("setNonScheduledAmps=") {
        if let Ok(amps) = rest.trim().parse() {
            return WebCommand::SetNonScheduledAmps(amps);
        }
    } else if let Some(rest) = text.strip_prefix("setScheduledAmps=") {
        if let Some(command) = parse_scheduled(rest) {
            return command;
        }
    } else if let Some(rest) = text.strip_prefix("setResumeTrackGreenEnergyTime=") {
        if let Some(minutes) = parse_hhmm(rest.trim()) {
            return WebCommand::SetResumeGreenTime(minutes);
        }
    } else if let Some(rest) = text.strip_prefix("sendTWCMsg=") {
        if let Some(bytes) = parse_hex(rest.trim()) {
            return WebCommand::SendTwcMsg(bytes);
        }
    } else if let Some(rest) = text.strip_prefix("carApiEmailPassword=") {
        if let Some((email, password)) = rest.split_once('\n') {
            return WebCommand::CarApiCredentials {
                email: email.to_owned(),
                password: password.to_owned(),
            };
        }
    } else if let Some(rest) = text.strip_prefix("setMasterHeartbeatData=") {
        return WebCommand::SetMasterHeartbeatData(parse_hex(rest.trim()).unwrap_or_default());
    } else if let Some(rest) = text.strip_prefix("setDebugLevel=") {
        if let Ok(level) = rest.trim().parse() {
            return WebCommand::SetDebugLevel(level);
        }
    }

    unknown()
}

/// `<amps>\nstartTime=HH:MM\nendTime=HH:MM\ndays=<bitmap>`
fn parse_scheduled(rest: &str) -> Option<WebCommand> {
    let mut lines = rest.lines();

    let amps = lines.next()?.trim().parse().ok()?;
    let start = lines.next()?.strip_prefix("startTime=")?;
    let end = lines.next()?.strip_prefix("endTime=")?;
    let days = lines.next()?.strip_prefix("days=")?.trim().parse().ok()?;

    Some(WebCommand::SetScheduledAmps {
        amps,
        start_minutes: parse_hhmm(start)?,
        end_minutes: parse_hhmm(end)?,
        days,
    })
}

/// `HH:MM` to minutes after midnight. A negative hour means "unset" and
/// yields `Some(None)`; malformed text yields `None`.
fn parse_hhmm(text: &str) -> Option<Option<u16>> {
    let (hours, minutes) = text.trim().split_once(':')?;

    let hours: i32 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;

    if hours < 0 {
        return Some(None);
    }

    Some(Some((hours as u16 * 60 + minutes).min(24 * 60)))
}

/// Minutes after midnight as `HH:MM`; `-1:00` when unset, matching what
/// the web interface has always displayed for "no time configured".
pub fn fmt_hhmm(minutes: Option<u16>) -> String {
    match minutes {
        Some(m) => format!("{:02}:{:02}", m / 60, m % 60),
        None => "-1:00".to_owned(),
    }
}

/// Decode the leading run of hex digits into bytes.
fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let run: String = text.chars().take_while(char::is_ascii_hexdigit).collect();

    if run.is_empty() || run.len() % 2 != 0 {
        return None;
    }

    run.as_bytes()
        .chunks(2)
        .map(|pair| u8::from_str_radix(core::str::from_utf8(pair).ok()?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_exact_commands() {
        assert_eq!(parse_command(b"getStatus"), WebCommand::GetStatus);
        assert_eq!(parse_command(b"chargeNow"), WebCommand::ChargeNow);
        assert_eq!(parse_command(b"chargeNowCancel"), WebCommand::ChargeNowCancel);
    }

    #[test]
    fn parses_scheduled_block() {
        let body = b"setScheduledAmps=24\nstartTime=22:30\nendTime=06:00\ndays=31";

        assert_eq!(
            parse_command(body),
            WebCommand::SetScheduledAmps {
                amps: 24,
                start_minutes: Some(22 * 60 + 30),
                end_minutes: Some(6 * 60),
                days: 31,
            }
        );
    }

    #[test]
    fn negative_hour_means_unset() {
        assert_eq!(parse_hhmm("-1:00"), Some(None));
        assert_eq!(parse_hhmm("07:30"), Some(Some(450)));
        assert_eq!(parse_hhmm("garbage"), None);

        assert_eq!(fmt_hhmm(None), "-1:00");
        assert_eq!(fmt_hhmm(Some(450)), "07:30");
    }

    #[test]
    fn hex_payloads_decode() {
        assert_eq!(
            parse_command(b"sendTWCMsg=FBE0771f"),
            WebCommand::SendTwcMsg(vec![0xFB, 0xE0, 0x77, 0x1F])
        );
        assert_eq!(parse_command(b"sendTWCMsg=XYZ"), WebCommand::Unknown(b"sendTWCMsg=XYZ".to_vec()));
        assert_eq!(
            parse_command(b"setMasterHeartbeatData="),
            WebCommand::SetMasterHeartbeatData(Vec::new())
        );
    }

    #[test]
    fn credentials_split_on_newline() {
        assert_eq!(
            parse_command(b"carApiEmailPassword=me@example.com\nhunter2"),
            WebCommand::CarApiCredentials {
                email: "me@example.com".to_owned(),
                password: "hunter2".to_owned(),
            }
        );
    }

    #[test]
    fn request_reply_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let server_path = dir.path().join("server.sock");
        let client_path = dir.path().join("client.sock");

        let server = WebIpc::open(server_path.to_str().unwrap()).unwrap();
        let client = UnixDatagram::bind(&client_path).unwrap();

        let mut request = Vec::new();
        request.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        request.extend_from_slice(&7u16.to_le_bytes());
        request.extend_from_slice(b"getStatus");

        client.send_to(&request, &server_path).unwrap();

        let received = server.poll().expect("request pending");

        assert_eq!(received.time, 0xDEADBEEF);
        assert_eq!(received.id, 7);
        assert_eq!(received.body, b"getStatus");

        server.respond(&received, "12.34`56.78");

        let mut buf = [0u8; 1024];
        let len = client.recv(&mut buf).unwrap();

        assert_eq!(&buf[..6], &request[..6]);
        assert_eq!(&buf[6..len], b"12.34`56.78");
    }

    #[test]
    fn long_bodies_packetize() {
        let dir = tempfile::tempdir().unwrap();
        let server_path = dir.path().join("server.sock");
        let client_path = dir.path().join("client.sock");

        let server = WebIpc::open(server_path.to_str().unwrap()).unwrap();
        let client = UnixDatagram::bind(&client_path).unwrap();

        let mut request = Vec::new();
        request.extend_from_slice(&1u32.to_le_bytes());
        request.extend_from_slice(&2u16.to_le_bytes());
        request.extend_from_slice(b"dumpState");

        client.send_to(&request, &server_path).unwrap();
        let received = server.poll().unwrap();

        let body = "x".repeat(MAX_BODY * 2 + 10);
        server.respond(&received, &body);

        let mut buf = [0u8; 1024];

        let len = client.recv(&mut buf).unwrap();
        assert_eq!(len, 7);
        assert_eq!(buf[6], 3, "three continuation packets");

        let mut reassembled = String::new();

        for _ in 0..3 {
            let len = client.recv(&mut buf).unwrap();
            reassembled.push_str(core::str::from_utf8(&buf[6..len]).unwrap());
        }

        assert_eq!(reassembled, body);
    }

    #[test]
    fn empty_poll_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let server = WebIpc::open(dir.path().join("s.sock").to_str().unwrap()).unwrap();

        assert!(server.poll().is_none());
    }
}
