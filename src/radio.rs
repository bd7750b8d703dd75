//! The boundary to the register-level radio driver
//!
//! The ranging protocol itself never touches the SPI bus. Everything it
//! needs from the chip is captured by [`RadioTransport`], and the interrupt
//! side of the driver communicates with the cooperative protocol loop
//! through the [`RadioEvents`] flags.
//!
//! [`RadioTransport`]: trait.RadioTransport.html
//! [`RadioEvents`]: struct.RadioEvents.html

use core::sync::atomic::{AtomicBool, Ordering};

use crate::configs::PulseRepetitionFrequency;
use crate::time::Timestamp;

/// The transmit/receive/timestamp primitives of the radio
///
/// Implemented by the register-level driver. The call sequences the engine
/// uses are the chip's own: a transmission is `new_transmit`, optionally
/// `set_delay`, `set_data`, `start_transmit`; reception is `new_receive`,
/// `receive_permanently`, `start_receive`, and `get_data` once the receive
/// interrupt fired.
pub trait RadioTransport {
    /// Error type of the underlying driver
    type Error;

    /// Prepares a new transmission, canceling any ongoing operation
    fn new_transmit(&mut self) -> Result<(), Self::Error>;

    /// Stages the frame to be transmitted
    fn set_data(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Schedules the transmission `delay` after the current system time
    ///
    /// Returns the absolute timestamp at which the frame will leave the
    /// antenna, so the exact send time is known before the frame payload is
    /// finalized.
    fn set_delay(&mut self, delay: Timestamp) -> Result<Timestamp, Self::Error>;

    /// Starts the prepared transmission
    fn start_transmit(&mut self) -> Result<(), Self::Error>;

    /// Prepares a new reception, canceling any ongoing operation
    fn new_receive(&mut self) -> Result<(), Self::Error>;

    /// Makes the receiver re-arm itself after every received frame
    fn receive_permanently(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Starts the prepared reception
    fn start_receive(&mut self) -> Result<(), Self::Error>;

    /// Copies the most recently received frame into `buffer`
    ///
    /// Returns the frame length.
    fn get_data(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error>;

    /// The antenna timestamp of the last transmitted frame
    fn transmit_timestamp(&mut self) -> Result<Timestamp, Self::Error>;

    /// The antenna timestamp of the last received frame
    fn receive_timestamp(&mut self) -> Result<Timestamp, Self::Error>;

    /// The current value of the system time counter
    fn system_timestamp(&mut self) -> Result<Timestamp, Self::Error>;

    /// Estimated receive power of the last received frame, in dBm
    fn receive_power(&mut self) -> Result<f32, Self::Error>;

    /// Estimated first-path power of the last received frame, in dBm
    fn first_path_power(&mut self) -> Result<f32, Self::Error>;

    /// Receive quality indicator of the last received frame
    fn receive_quality(&mut self) -> Result<f32, Self::Error>;

    /// The pulse repetition frequency the receiver is configured for
    fn pulse_frequency(&mut self) -> PulseRepetitionFrequency;
}

/// Event flags between the radio interrupt and the protocol loop
///
/// The interrupt handler is the single producer: it inspects the chip's
/// status register and calls the matching `signal_*` method, nothing more.
/// [`RangingEngine::poll`] is the single consumer and drains the flags with
/// an atomic swap, servicing a pending "sent" strictly before a pending
/// "received" so a received frame can never be attributed to a send that
/// has not been accounted for yet.
///
/// Designed to live in a `static`, which is what allows the interrupt
/// handler to reach it:
///
/// ```
/// use dw1000_twr::RadioEvents;
///
/// static EVENTS: RadioEvents = RadioEvents::new();
///
/// // in the radio interrupt handler:
/// EVENTS.signal_sent();
/// ```
///
/// [`RangingEngine::poll`]: ../ranging/struct.RangingEngine.html#method.poll
#[derive(Debug)]
pub struct RadioEvents {
    sent: AtomicBool,
    received: AtomicBool,
    receive_error: AtomicBool,
    receive_timeout: AtomicBool,
}

impl RadioEvents {
    /// Creates a new set of flags, all clear
    pub const fn new() -> Self {
        RadioEvents {
            sent: AtomicBool::new(false),
            received: AtomicBool::new(false),
            receive_error: AtomicBool::new(false),
            receive_timeout: AtomicBool::new(false),
        }
    }

    /// Signals that a frame transmission completed
    pub fn signal_sent(&self) {
        self.sent.store(true, Ordering::Release);
    }

    /// Signals that a frame was received
    pub fn signal_received(&self) {
        self.received.store(true, Ordering::Release);
    }

    /// Signals a receiver error (FCS, PHY header, sync loss)
    pub fn signal_receive_error(&self) {
        self.receive_error.store(true, Ordering::Release);
    }

    /// Signals a receiver frame-wait timeout
    pub fn signal_receive_timeout(&self) {
        self.receive_timeout.store(true, Ordering::Release);
    }

    pub(crate) fn take_sent(&self) -> bool {
        self.sent.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_received(&self) -> bool {
        self.received.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_receive_error(&self) -> bool {
        self.receive_error.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_receive_timeout(&self) -> bool {
        self.receive_timeout.swap(false, Ordering::AcqRel)
    }
}

impl Default for RadioEvents {
    fn default() -> Self {
        RadioEvents::new()
    }
}
