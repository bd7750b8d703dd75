//! Peer device records and the fixed-capacity device registry

use heapless::Vec;

use crate::configs::{DEFAULT_REPLY_DELAY_US, MAX_DEVICES};
use crate::mac::{ExtendedAddress, ShortAddress};
use crate::time::Timestamp;

/// One other radio in the network
///
/// Holds the peer's addresses, the per-exchange timestamps captured while
/// ranging against it, and the result of the last completed exchange. The
/// timestamp fields are public because the ranging engine fills them in
/// piecemeal over the course of an exchange.
#[derive(Clone, Debug)]
pub struct Device {
    long_address: ExtendedAddress,
    short_address: ShortAddress,
    reply_delay_us: u32,
    last_activity_ms: u64,

    /// When the tag sent its POLL (tag clock)
    pub time_poll_sent: Timestamp,
    /// When the anchor received the POLL (anchor clock)
    pub time_poll_received: Timestamp,
    /// When the anchor sent its POLL_ACK (anchor clock)
    pub time_poll_ack_sent: Timestamp,
    /// When the tag received the POLL_ACK (tag clock)
    pub time_poll_ack_received: Timestamp,
    /// When the tag sent its RANGE (tag clock)
    pub time_range_sent: Timestamp,
    /// When the anchor received the RANGE (anchor clock)
    pub time_range_received: Timestamp,

    range_m: f32,
    rx_power_dbm: f32,
    fp_power_dbm: f32,
    quality: f32,
}

impl Device {
    /// Creates a record for a device known by both its addresses
    pub fn new(long_address: ExtendedAddress, short_address: ShortAddress) -> Self {
        Device {
            long_address,
            short_address,
            reply_delay_us: DEFAULT_REPLY_DELAY_US,
            last_activity_ms: 0,
            time_poll_sent: Timestamp::default(),
            time_poll_received: Timestamp::default(),
            time_poll_ack_sent: Timestamp::default(),
            time_poll_ack_received: Timestamp::default(),
            time_range_sent: Timestamp::default(),
            time_range_received: Timestamp::default(),
            range_m: 0.0,
            rx_power_dbm: 0.0,
            fp_power_dbm: 0.0,
            quality: 0.0,
        }
    }

    /// Creates a record for a device only known by its short address
    ///
    /// Used by a tag that learned an anchor from a ranging initiation, which
    /// carries only the anchor's short address.
    pub fn with_short_address(short_address: ShortAddress) -> Self {
        Device::new(ExtendedAddress(0), short_address)
    }

    /// The device's 8-byte globally unique address
    pub fn long_address(&self) -> ExtendedAddress {
        self.long_address
    }

    /// The device's 2-byte network-local address
    pub fn short_address(&self) -> ShortAddress {
        self.short_address
    }

    /// The reply delay used when answering this device, in microseconds
    pub fn reply_delay_us(&self) -> u32 {
        self.reply_delay_us
    }

    /// Sets the reply delay used when answering this device
    pub fn set_reply_delay_us(&mut self, reply_delay_us: u32) {
        self.reply_delay_us = reply_delay_us;
    }

    /// The last computed range to this device, in meters
    pub fn range(&self) -> f32 {
        self.range_m
    }

    /// The receive power of the last exchange, in dBm
    pub fn rx_power(&self) -> f32 {
        self.rx_power_dbm
    }

    /// The first-path power of the last exchange, in dBm
    pub fn first_path_power(&self) -> f32 {
        self.fp_power_dbm
    }

    /// The receive quality of the last exchange
    pub fn quality(&self) -> f32 {
        self.quality
    }

    pub(crate) fn set_range(&mut self, range_m: f32) {
        self.range_m = range_m;
    }

    pub(crate) fn set_rx_power(&mut self, rx_power_dbm: f32) {
        self.rx_power_dbm = rx_power_dbm;
    }

    pub(crate) fn set_first_path_power(&mut self, fp_power_dbm: f32) {
        self.fp_power_dbm = fp_power_dbm;
    }

    pub(crate) fn set_quality(&mut self, quality: f32) {
        self.quality = quality;
    }

    /// Records activity from this device at the given wall-clock time
    pub fn note_activity(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    /// Whether the device has been silent for longer than `timeout_ms`
    pub fn is_inactive(&self, now_ms: u64, timeout_ms: u32) -> bool {
        now_ms.saturating_sub(self.last_activity_ms) > timeout_ms as u64
    }
}

/// Why a device could not be added to the registry
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistryError {
    /// A record with a matching address already exists
    Duplicate,
    /// The registry already holds [`MAX_DEVICES`] records
    ///
    /// [`MAX_DEVICES`]: ../configs/constant.MAX_DEVICES.html
    CapacityExhausted,
}

/// Fixed-capacity table of the peer devices we range against
///
/// Records are kept in insertion order and searched linearly; the capacity
/// is the compile-time constant [`MAX_DEVICES`]. A full registry rejects
/// further insertions, it never overwrites.
///
/// [`MAX_DEVICES`]: ../configs/constant.MAX_DEVICES.html
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device, MAX_DEVICES>,
}

impl DeviceRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        DeviceRegistry { devices: Vec::new() }
    }

    /// Finds the device with the given short address
    pub fn find(&mut self, short_address: ShortAddress) -> Option<&mut Device> {
        self.devices
            .iter_mut()
            .find(|device| device.short_address() == short_address)
    }

    /// Adds a device, unless a matching record already exists
    ///
    /// With `match_by_short` set, an existing record counts as a duplicate
    /// when its short address matches; otherwise the long address is
    /// compared. Duplicates and insertion into a full registry are rejected
    /// without modifying the table.
    pub fn add(&mut self, device: Device, match_by_short: bool) -> Result<(), RegistryError> {
        let duplicate = self.devices.iter().any(|existing| {
            if match_by_short {
                existing.short_address() == device.short_address()
            } else {
                existing.long_address() == device.long_address()
            }
        });
        if duplicate {
            return Err(RegistryError::Duplicate);
        }

        self.devices
            .push(device)
            .map_err(|_| RegistryError::CapacityExhausted)
    }

    /// Returns the device at `index`, in insertion order
    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    /// Number of devices currently registered
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Removes all devices
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Evicts all devices that have been silent for longer than `timeout_ms`
    ///
    /// Calls `on_evicted` for each removed device. Insertion order of the
    /// remaining records is preserved.
    pub fn remove_inactive(
        &mut self,
        now_ms: u64,
        timeout_ms: u32,
        mut on_evicted: impl FnMut(&Device),
    ) {
        let mut index = 0;
        while index < self.devices.len() {
            if self.devices[index].is_inactive(now_ms, timeout_ms) {
                let device = self.devices.remove(index);
                on_evicted(&device);
            } else {
                index += 1;
            }
        }
    }
}
