//! Two-way ranging protocol stack for the Decawave DW1000 UWB transceiver
//!
//! This crate implements the discovery and ranging protocol that is commonly
//! run on top of the DW1000: tags announce themselves with a blink frame,
//! anchors answer with a ranging initiation, and the two then repeatedly
//! execute the poll / poll-ack / range / range-report exchange. The distance
//! is derived from the four intervals of that exchange using the asymmetric
//! double-sided formula described in the DW1000 user manual, section 12.3,
//! and corrected for the signal-level-dependent range bias (APS011).
//!
//! The register-level radio driver is not part of this crate. All hardware
//! access goes through the [`RadioTransport`] trait, which mirrors the
//! transmit/receive/timestamp primitives of the chip, and through
//! [`RadioEvents`], a set of atomic flags that the radio's interrupt handler
//! signals and the cooperative [`RangingEngine::poll`] loop drains.
//!
//! A typical application creates one [`RangingEngine`] per radio, wires the
//! radio interrupt to the event flags, and then calls `poll` from its main
//! loop with a millisecond clock:
//!
//! ```ignore
//! static EVENTS: RadioEvents = RadioEvents::new();
//!
//! let mut engine = RangingEngine::anchor(radio, &EVENTS, long_addr, short_addr, config);
//! engine.start(clock.now_ms())?;
//!
//! loop {
//!     engine.poll(clock.now_ms(), &mut observer)?;
//! }
//! ```
//!
//! Protocol notifications (new range measurement, discovered device, evicted
//! device) are delivered through the [`RangingObserver`] trait.
//!
//! [`RadioTransport`]: radio/trait.RadioTransport.html
//! [`RadioEvents`]: radio/struct.RadioEvents.html
//! [`RangingEngine::poll`]: ranging/struct.RangingEngine.html#method.poll
//! [`RangingEngine`]: ranging/struct.RangingEngine.html
//! [`RangingObserver`]: ranging/trait.RangingObserver.html

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

pub mod configs;
pub mod device;
pub mod mac;
pub mod radio;
pub mod range_bias;
pub mod ranging;
pub mod time;

pub use crate::{
    configs::{PulseRepetitionFrequency, RangingConfig},
    device::{Device, DeviceRegistry, RegistryError},
    mac::{FrameClass, Framer, MessageKind},
    radio::{RadioEvents, RadioTransport},
    ranging::{RangingEngine, RangingObserver, Role},
    time::Timestamp,
};
