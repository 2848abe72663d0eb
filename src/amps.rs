//! Fixed-point amperage.
//!
//! Every amp value the protocol carries is an unsigned big-endian count of
//! centiamps (hundredths of an ampere), e.g. `0x1F40` = 80.00 A. The
//! internal representation stays integral so repeated sums and splits never
//! drift; only display formatting produces a decimal.

use core::fmt;
use core::iter::Sum;
use core::ops::{Add, AddAssign, Sub};

/// An amperage in hundredths of an ampere.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Centiamps(pub u32);

impl Centiamps {
    pub const ZERO: Self = Self(0);

    pub const fn from_whole_amps(amps: u32) -> Self {
        Self(amps * 100)
    }

    /// Parse the two big-endian bytes used by link-ready and heartbeat
    /// payloads.
    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u32::from(u16::from_be_bytes(bytes)))
    }

    /// The two big-endian wire bytes. Values above `655.35` A cannot occur
    /// on a real bus and are saturated.
    pub fn to_be_bytes(self) -> [u8; 2] {
        (self.0.min(u32::from(u16::MAX)) as u16).to_be_bytes()
    }

    /// Convert a power figure to amps at the given line voltage, rounding
    /// down to the centiamp.
    pub fn from_watts(watts: f64, volts: u32) -> Self {
        if watts <= 0.0 || volts == 0 {
            return Self::ZERO;
        }

        Self(((watts * 100.0) / f64::from(volts)) as u32)
    }

    pub fn from_amps_f64(amps: f64) -> Self {
        if amps <= 0.0 {
            return Self::ZERO;
        }

        Self((amps * 100.0).round() as u32)
    }

    pub fn as_amps_f64(self) -> f64 {
        f64::from(self.0) / 100.0
    }

    pub fn watts_at(self, volts: u32) -> f64 {
        self.as_amps_f64() * f64::from(volts)
    }

    /// Round down to one decimal place of amps.
    pub fn floor_tenth(self) -> Self {
        Self(self.0 - self.0 % 10)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Equal split, rounding down. A zero divisor yields zero rather than
    /// a panic path in the bus loop.
    pub const fn div(self, divisor: u32) -> Self {
        if divisor == 0 {
            return Self::ZERO;
        }

        Self(self.0 / divisor)
    }

    pub fn clamp(self, lo: Self, hi: Self) -> Self {
        Self(self.0.clamp(lo.0, hi.0))
    }
}

impl Add for Centiamps {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Centiamps {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Centiamps {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Centiamps {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Centiamps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_round_trip() {
        let amps = Centiamps::from_be_bytes([0x1F, 0x40]);

        assert_eq!(amps, Centiamps(8000));
        assert_eq!(amps.to_be_bytes(), [0x1F, 0x40]);
        assert_eq!(amps.to_string(), "80.00");
    }

    #[test]
    fn spike_values_encode() {
        // The two spike-override amperages as they appear on the wire.
        assert_eq!(Centiamps::from_whole_amps(21).to_be_bytes(), [0x08, 0x34]);
        assert_eq!(Centiamps::from_whole_amps(16).to_be_bytes(), [0x06, 0x40]);
    }

    #[test]
    fn watts_to_amps_at_line_voltage() {
        // 15360 W at 240 V is exactly 64 A.
        assert_eq!(Centiamps::from_watts(15360.0, 240), Centiamps(6400));
        // Fractions round down, never up.
        assert_eq!(Centiamps::from_watts(100.0, 240), Centiamps(41));
        assert_eq!(Centiamps::from_watts(-100.0, 240), Centiamps::ZERO);
        assert_eq!(Centiamps(3000).watts_at(240), 7200.0);
    }

    #[test]
    fn floor_to_tenth_rounds_down() {
        assert_eq!(Centiamps(2119).floor_tenth(), Centiamps(2110));
        assert_eq!(Centiamps(666).floor_tenth(), Centiamps(660));
        assert_eq!(Centiamps(3000).floor_tenth(), Centiamps(3000));
    }

    #[test]
    fn split_is_integral_and_rounds_down() {
        let total = Centiamps::from_whole_amps(60);

        assert_eq!(total.div(2), Centiamps(3000));
        // 20 A over three outlets is 6.66 A each, floored.
        assert_eq!(Centiamps::from_whole_amps(20).div(3), Centiamps(666));
        assert_eq!(total.div(0), Centiamps::ZERO);
    }

    #[test]
    fn sums_and_ordering() {
        let offers = [Centiamps(3000), Centiamps(2400), Centiamps::ZERO];

        assert_eq!(offers.iter().copied().sum::<Centiamps>(), Centiamps(5400));
        assert!(Centiamps(600) < Centiamps(601));
        assert!(Centiamps::ZERO.is_zero());
    }

    #[test]
    fn clamp_bounds_an_offer() {
        let min = Centiamps::from_whole_amps(6);
        let max = Centiamps::from_whole_amps(40);

        assert_eq!(Centiamps(500).clamp(min, max), min);
        assert_eq!(Centiamps(4100).clamp(min, max), max);
        assert_eq!(Centiamps(2400).clamp(min, max), Centiamps(2400));
    }
}
