//! Time-related types based on the DW1000's system time

use core::ops::{Add, Div, Mul, Sub};

use serde::{Deserialize, Serialize};

/// The maximum value of 40-bit system time stamps.
pub const TIME_MAX: i64 = 0xff_ffff_ffff;

/// The wrap modulus of the 40-bit system time counter: 2^40.
pub const TIME_OVERFLOW: i64 = 0x100_0000_0000;

/// Length of a raw timestamp field, as read from the chip's registers.
pub const LEN_STAMP: usize = 5;

/// Time resolution of a single counter unit, in microseconds (~15.65 ps).
pub const TIME_RES_US: f32 = 0.000_015_650_040_064_103;

/// Distance a radio wave travels during one counter unit, in meters.
///
/// Speed of light multiplied by the per-unit time resolution.
pub const DISTANCE_PER_UNIT_M: f32 = 0.004_691_763_978_615_9;

/// Counter units per microsecond, kept as an exact integer ratio.
///
/// One microsecond corresponds to 63897.6 units (499.2 MHz * 128), so the
/// conversion is done as `us * 638976 / 10` to stay in integer arithmetic.
const UNITS_PER_10_US: i64 = 638_976;

/// A value of the DW1000's 40-bit system time counter
///
/// Covers both instants (register snapshots) and the intervals between them;
/// the ranging arithmetic freely mixes the two, just like the chip itself
/// does. The value is stored in an `i64` so that a subtraction across the
/// counter rollover can go negative without losing information. Such a
/// result stays negative until [`wrap`] is called on it; callers that
/// subtract timestamps which may straddle the rollover must wrap the result
/// themselves. This two-step contract is deliberate: wrapping an interval
/// that is legitimately negative (a reply time, say, fed in the wrong order)
/// would silently corrupt it, so the normalization point is explicit.
///
/// [`wrap`]: #method.wrap
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[repr(C)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from a raw counter value
    ///
    /// The given value must fit in a 40-bit timestamp, so:
    /// 0 <= `value` <= 2^40 - 1
    ///
    /// Returns `Some(...)`, if `value` is within the valid range, `None` if
    /// it isn't.
    pub fn new(value: i64) -> Option<Self> {
        if (0..=TIME_MAX).contains(&value) {
            Some(Timestamp(value))
        } else {
            None
        }
    }

    /// Creates a timestamp from the 5-byte little-endian register layout
    pub fn from_bytes(data: &[u8; LEN_STAMP]) -> Self {
        let mut value: i64 = 0;
        for (i, byte) in data.iter().enumerate() {
            value |= (*byte as i64) << (i * 8);
        }
        Timestamp(value)
    }

    /// Creates a timestamp representing the given number of microseconds
    ///
    /// Used for user-specified delays, like the reply delay of a delayed
    /// transmission. The result is reduced modulo 2^40.
    pub fn from_micros(us: u32) -> Self {
        Timestamp((us as i64 * UNITS_PER_10_US / 10) % TIME_OVERFLOW)
    }

    /// Returns the raw counter value
    pub fn value(&self) -> i64 {
        self.0
    }

    /// Serializes the timestamp into the 5-byte little-endian register layout
    ///
    /// The value is truncated to 40 bits, so a wrapped-around sum serializes
    /// to the value the counter will actually hold.
    pub fn to_bytes(&self) -> [u8; LEN_STAMP] {
        let mut data = [0; LEN_STAMP];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = ((self.0 >> (i * 8)) & 0xff) as u8;
        }
        data
    }

    /// Normalizes a negative value into the positive wrap range
    ///
    /// Adds 2^40 if the value is negative; leaves it untouched otherwise.
    /// Must be applied to the result of a subtraction whenever the counter
    /// may have rolled over between the two operands.
    pub fn wrap(self) -> Self {
        if self.0 < 0 {
            Timestamp(self.0 + TIME_OVERFLOW)
        } else {
            self
        }
    }

    /// Multiplies two timestamps, checking for `i64` overflow
    ///
    /// The products of the ranging formula can exceed 64 bits if the
    /// intervals are in the order of seconds, which only happens when an
    /// exchange has gone badly wrong; the caller turns `None` into a
    /// protocol failure instead of computing garbage.
    pub fn checked_mul(self, rhs: Timestamp) -> Option<Timestamp> {
        self.0.checked_mul(rhs.0).map(Timestamp)
    }

    /// Returns the represented time as seconds
    pub fn as_seconds(&self) -> f32 {
        self.0 as f32 * TIME_RES_US * 1e-6
    }

    /// Returns the represented time as the distance light travels in it,
    /// in meters
    pub fn as_meters(&self) -> f32 {
        self.0 as f32 * DISTANCE_PER_UNIT_M
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timestamp) -> Self::Output {
        Timestamp(self.0 + rhs.0)
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    /// Subtracts two timestamps
    ///
    /// The result may be negative if the counter rolled over between the two
    /// operands; see [`Timestamp::wrap`].
    fn sub(self, rhs: Timestamp) -> Self::Output {
        Timestamp(self.0 - rhs.0)
    }
}

impl Mul<i64> for Timestamp {
    type Output = Timestamp;

    fn mul(self, rhs: i64) -> Self::Output {
        Timestamp(self.0 * rhs)
    }
}

impl Div<i64> for Timestamp {
    type Output = Timestamp;

    fn div(self, rhs: i64) -> Self::Output {
        Timestamp(self.0 / rhs)
    }
}

impl Div for Timestamp {
    type Output = Timestamp;

    fn div(self, rhs: Timestamp) -> Self::Output {
        Timestamp(self.0 / rhs.0)
    }
}
