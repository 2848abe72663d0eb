//! SLIP-style wire framing.
//!
//! Frames are delimited by `0xC0` at both ends. A literal `0xC0` inside a
//! frame is sent as `0xDB 0xDC` and a literal `0xDB` as `0xDB 0xDD`. The
//! final body byte is an 8 bit additive checksum over every body byte
//! *except the first*, computed before escaping.
//!
//! Known frames unescape to exactly 14 (protocol 1) or 16 (protocol 2)
//! bytes including the checksum. Chargers ignore anything after a frame's
//! final `0xC0`, and so does [`FrameReader`]: noise between frames is
//! skipped, and a `0xC0` seen before a full-length frame has accumulated
//! restarts reception.

use crate::error::FrameError;
use std::time::{Duration, Instant};

const DELIMITER: u8 = 0xC0;
const ESCAPE: u8 = 0xDB;
const ESC_DELIMITER: u8 = 0xDC;
const ESC_ESCAPE: u8 = 0xDD;

/// Longest unescaped frame, checksum included.
pub const FRAME_MAX: usize = 16;

/// Longest on-wire frame: every body byte escaped, plus both delimiters.
pub const WIRE_MAX: usize = FRAME_MAX * 2 + 2;

/// A partial frame older than this is dropped so reception can restart.
pub const PARTIAL_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// 8 bit sum of all payload bytes except the first.
pub fn checksum(payload: &[u8]) -> u8 {
    payload
        .iter()
        .skip(1)
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frame a payload for transmission: append the checksum, escape, and wrap
/// in delimiters.
///
/// The payload must not already contain a checksum byte.
pub fn encode(payload: &[u8]) -> Result<heapless::Vec<u8, WIRE_MAX>, FrameError> {
    if payload.len() >= FRAME_MAX {
        return Err(FrameError::TooLong);
    }

    let mut wire = heapless::Vec::new();

    // Infallible: WIRE_MAX accounts for worst-case expansion.
    let _ = wire.push(DELIMITER);

    let cs = checksum(payload);

    for &byte in payload.iter().chain(core::iter::once(&cs)) {
        match byte {
            DELIMITER => {
                let _ = wire.push(ESCAPE);
                let _ = wire.push(ESC_DELIMITER);
            }
            ESCAPE => {
                let _ = wire.push(ESCAPE);
                let _ = wire.push(ESC_ESCAPE);
            }
            other => {
                let _ = wire.push(other);
            }
        }
    }

    let _ = wire.push(DELIMITER);

    Ok(wire)
}

/// Unescape and validate a complete on-wire frame, returning the payload
/// with the verified checksum stripped.
pub fn decode(wire: &[u8]) -> Result<heapless::Vec<u8, FRAME_MAX>, FrameError> {
    let body = wire
        .strip_prefix(&[DELIMITER])
        .and_then(|rest| rest.strip_suffix(&[DELIMITER]))
        .ok_or(FrameError::Delimiter)?;

    let mut unescaped = heapless::Vec::<u8, FRAME_MAX>::new();
    let mut bytes = body.iter().copied();

    while let Some(byte) = bytes.next() {
        let out = if byte == ESCAPE {
            match bytes.next() {
                Some(ESC_DELIMITER) => DELIMITER,
                Some(ESC_ESCAPE) => ESCAPE,
                // An impossible escape sequence. The charger firmware
                // carries on regardless, substituting the escape byte
                // itself, so mirror that rather than aborting mid-stream.
                Some(other) => {
                    log::trace!(
                        "escape byte {:02X} followed by invalid {:02X}, substituting",
                        ESCAPE,
                        other
                    );

                    ESCAPE
                }
                None => ESCAPE,
            }
        } else {
            byte
        };

        unescaped
            .push(out)
            .map_err(|_| FrameError::Length(body.len()))?;
    }

    if unescaped.len() != 14 && unescaped.len() != 16 {
        return Err(FrameError::Length(unescaped.len()));
    }

    let expected = unescaped[unescaped.len() - 1];
    let computed = checksum(&unescaped[..unescaped.len() - 1]);

    if computed != expected {
        return Err(FrameError::Checksum { expected, computed });
    }

    unescaped.truncate(unescaped.len() - 1);

    Ok(unescaped)
}

/// Byte-at-a-time frame accumulator with resynchronization.
///
/// Feeds on raw serial bytes. Yields the escaped on-wire bytes of each
/// complete frame; callers pass those to [`decode`].
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: heapless::Vec<u8, WIRE_MAX>,
    ignored: usize,
    last_byte_at: Option<Instant>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when no partial frame is buffered, i.e. it is safe to
    /// transmit without clobbering an inbound frame.
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty()
    }

    /// Feed one received byte. Returns a complete raw frame when the
    /// closing delimiter of a full-length frame arrives.
    pub fn push(&mut self, byte: u8, now: Instant) -> Option<heapless::Vec<u8, WIRE_MAX>> {
        if self.buf.is_empty() && byte != DELIMITER {
            // Garbage between frames is expected on a bus without
            // termination resistors.
            self.ignored += 1;

            return None;
        }

        if !self.buf.is_empty() && self.buf.len() < 15 && byte == DELIMITER {
            // Delimiter before a full-length frame accumulated: either we
            // started listening mid-frame or the line corrupted. Restart
            // reception at this byte.
            log::trace!(
                "delimiter after only {} bytes, restarting frame",
                self.buf.len()
            );

            self.buf.clear();
        }

        if self.buf.push(byte).is_err() {
            log::warn!("frame buffer overflow without closing delimiter, resynchronizing");

            self.buf.clear();
            self.last_byte_at = None;

            return None;
        }

        self.last_byte_at = Some(now);

        if self.buf.len() >= 16 && byte == DELIMITER {
            if self.ignored > 0 {
                log::trace!("skipped {} bytes between frames", self.ignored);

                self.ignored = 0;
            }

            self.last_byte_at = None;

            return Some(core::mem::take(&mut self.buf));
        }

        None
    }

    /// Drop a stalled partial frame. Returns `true` if one was dropped.
    pub fn expire_partial(&mut self, now: Instant) -> bool {
        let Some(last) = self.last_byte_at else {
            return false;
        };

        if !self.buf.is_empty() && now.duration_since(last) >= PARTIAL_FRAME_TIMEOUT {
            log::trace!("partial frame of {} bytes timed out", self.buf.len());

            self.buf.clear();
            self.ignored = 0;
            self.last_byte_at = None;

            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(reader: &mut FrameReader, bytes: &[u8]) -> Vec<heapless::Vec<u8, WIRE_MAX>> {
        let now = Instant::now();

        bytes.iter().filter_map(|b| reader.push(*b, now)).collect()
    }

    #[test]
    fn escapes_round_trip() {
        let payload = [
            0xFB, 0xE0, 0x77, 0x77, 0xAB, 0xCD, 0x00, 0xC0, 0x00, 0xDB, 0x00, 0x00, 0x00,
        ];

        let wire = encode(&payload).unwrap();

        assert!(wire.windows(2).any(|w| w == [ESCAPE, ESC_DELIMITER]));
        assert!(wire.windows(2).any(|w| w == [ESCAPE, ESC_ESCAPE]));
        // Delimiters only ever appear at the very ends.
        assert_eq!(
            wire[1..wire.len() - 1]
                .iter()
                .filter(|b| **b == DELIMITER)
                .count(),
            0
        );

        assert_eq!(decode(&wire).unwrap().as_slice(), &payload[..]);
    }

    #[test]
    fn checksum_excludes_first_byte() {
        // First byte is deliberately huge to prove it is skipped.
        assert_eq!(checksum(&[0xFF, 0x01, 0x02]), 0x03);
    }

    #[test]
    fn corrupt_checksum_rejected() {
        let payload = [0xFD, 0xE2, 0xAB, 0xCD, 0x77, 0x1F, 0x40, 0, 0, 0, 0, 0, 0];
        let mut wire = encode(&payload).unwrap();

        let len = wire.len();
        wire[len - 2] ^= 0xFF;

        assert!(matches!(
            decode(&wire),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn invalid_escape_substitutes_escape_byte() {
        let payload = [0xFD, 0xE2, 0xAB, 0xCD, 0xDB, 0x1F, 0x40, 0, 0, 0, 0, 0, 0];
        let mut wire = encode(&payload).unwrap();

        // Corrupt the second half of the DB DD escape pair. The decoder
        // substitutes a lone DB, which restores the original payload.
        let pos = wire
            .windows(2)
            .position(|w| w == [ESCAPE, ESC_ESCAPE])
            .unwrap();
        wire[pos + 1] = 0x99;

        assert_eq!(decode(&wire).unwrap().as_slice(), &payload[..]);
    }

    #[test]
    fn bad_length_rejected() {
        let wire = encode(&[0xFD, 0xE2, 0xAB]).unwrap();

        assert_eq!(decode(&wire), Err(FrameError::Length(4)));
    }

    #[test]
    fn reader_skips_noise_between_frames() {
        let payload = [0xFD, 0xE2, 0xAB, 0xCD, 0x77, 0x1F, 0x40, 0, 0, 0, 0, 0, 0];
        let wire = encode(&payload).unwrap();

        let mut stream = vec![0xFE, 0x00, 0x12];
        stream.extend_from_slice(&wire);

        let mut reader = FrameReader::new();
        let frames = feed(&mut reader, &stream);

        assert_eq!(frames.len(), 1);
        assert_eq!(decode(&frames[0]).unwrap().as_slice(), &payload[..]);
        assert!(reader.is_idle());
    }

    #[test]
    fn reader_restarts_on_early_delimiter() {
        let payload = [0xFD, 0xE2, 0xAB, 0xCD, 0x77, 0x1F, 0x40, 0, 0, 0, 0, 0, 0];
        let wire = encode(&payload).unwrap();

        // A truncated frame followed immediately by a good one. The good
        // frame's opening delimiter doubles as the restart point.
        let mut stream = wire[..6].to_vec();
        stream.extend_from_slice(&wire);

        let mut reader = FrameReader::new();
        let frames = feed(&mut reader, &stream);

        assert_eq!(frames.len(), 1);
        assert_eq!(decode(&frames[0]).unwrap().as_slice(), &payload[..]);
    }

    #[test]
    fn partial_frame_expires() {
        let mut reader = FrameReader::new();
        let start = Instant::now();

        reader.push(DELIMITER, start);
        reader.push(0xFD, start);

        assert!(!reader.is_idle());
        assert!(!reader.expire_partial(start + Duration::from_millis(500)));
        assert!(reader.expire_partial(start + Duration::from_secs(3)));
        assert!(reader.is_idle());
    }
}
