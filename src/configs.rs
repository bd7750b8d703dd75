//! Configuration types and protocol constants

use ieee802154::mac::PanId;

/// Maximum number of peer devices tracked by a [`DeviceRegistry`]
///
/// Kept small on purpose; the registry lives in a statically sized buffer to
/// fit the memory budget of the microcontrollers this runs on.
///
/// [`DeviceRegistry`]: ../device/struct.DeviceRegistry.html
pub const MAX_DEVICES: usize = 4;

/// Size of the frame buffers used by the ranging engine
///
/// Large enough for the longest protocol frame (RANGE: 9-byte short MAC
/// header, kind byte, three 5-byte timestamps).
pub const MAX_FRAME_LEN: usize = 32;

/// Default delay between receiving a message and sending the reply, in
/// microseconds
///
/// The same value must be in effect on both sides of an exchange.
pub const DEFAULT_REPLY_DELAY_US: u32 = 7000;

/// Default watchdog period after which a silent exchange is reset, in
/// milliseconds
pub const DEFAULT_RESET_PERIOD_MS: u32 = 250;

/// Default window without any frame from a device after which it is
/// considered inactive, in milliseconds
pub const DEFAULT_INACTIVITY_TIME_MS: u32 = 1000;

/// Default network identifier carried in short and long MAC frames
pub const DEFAULT_PAN_ID: PanId = PanId(0xDECA);

/// The PRF value
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PulseRepetitionFrequency {
    /// 16 megahertz
    Mhz16,
    /// 64 megahertz
    Mhz64,
}

impl Default for PulseRepetitionFrequency {
    fn default() -> Self {
        PulseRepetitionFrequency::Mhz16
    }
}

/// Protocol timing and network configuration of a ranging engine
///
/// These are fixed for the lifetime of the engine; neither the reply delay
/// nor the reset period can be adjusted per exchange.
#[derive(Clone, Copy, Debug)]
pub struct RangingConfig {
    /// Network identifier written into outgoing frames
    pub pan_id: PanId,
    /// Delay between receiving a message and the scheduled reply transmission
    pub reply_delay_us: u32,
    /// Watchdog period; a role with no sent/received activity for this long
    /// resets itself
    pub reset_period_ms: u32,
    /// Devices without activity for this long are evicted from the registry
    pub inactivity_timeout_ms: u32,
}

impl Default for RangingConfig {
    fn default() -> Self {
        RangingConfig {
            pan_id: DEFAULT_PAN_ID,
            reply_delay_us: DEFAULT_REPLY_DELAY_US,
            reset_period_ms: DEFAULT_RESET_PERIOD_MS,
            inactivity_timeout_ms: DEFAULT_INACTIVITY_TIME_MS,
        }
    }
}
