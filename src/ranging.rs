//! The two-way ranging state machine
//!
//! One [`RangingEngine`] drives one radio in either the tag or the anchor
//! role. The tag initiates: it blinks, waits to be invited by an anchor's
//! ranging initiation, and then cycles through poll / poll-ack / range /
//! range-report exchanges. The anchor listens permanently, answers blinks,
//! and computes the time of flight when a cycle completes, reporting the
//! result back to the tag.
//!
//! The engine never blocks. [`RangingEngine::poll`] must be called
//! frequently from the application's main loop; each call services the
//! watchdog, drains the event flags the radio interrupt raised, and makes
//! at most one step of protocol progress. Recovery from lost frames or a
//! silent peer is time-based: if neither a sent nor a received event was
//! serviced for the configured reset period, the role starts its cycle
//! over.
//!
//! [`RangingEngine`]: struct.RangingEngine.html
//! [`RangingEngine::poll`]: struct.RangingEngine.html#method.poll

use core::convert::TryFrom;

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, error, info, warn};

#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, error, info, warn};

use crate::configs::{RangingConfig, MAX_FRAME_LEN};
use crate::device::{Device, DeviceRegistry, RegistryError};
use crate::mac::{
    self, ExtendedAddress, Framer, MessageKind, RangeReportPayload, ShortAddress, LONG_MAC_LEN,
    RANGE_PAYLOAD_LEN, RANGE_REPORT_PAYLOAD_LEN, SHORT_PAYLOAD,
};
use crate::radio::{RadioEvents, RadioTransport};
use crate::range_bias::range_bias_cm;
use crate::time::{Timestamp, LEN_STAMP};

/// The role an engine plays in the ranging protocol
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Mobile node; initiates discovery and ranging cycles
    Tag,
    /// Fixed node; listens permanently and computes ranges
    Anchor,
}

/// Protocol notifications delivered by [`RangingEngine::poll`]
///
/// All methods default to doing nothing, so an implementation only has to
/// name the events it cares about. The unit type is the null observer for
/// applications that poll the registry instead.
///
/// [`RangingEngine::poll`]: struct.RangingEngine.html#method.poll
pub trait RangingObserver {
    /// A ranging cycle completed; the device record holds the fresh range
    fn on_new_range(&mut self, device: &Device) {
        let _ = device;
    }

    /// An unknown tag announced itself with a blink (anchor role)
    fn on_blink_device(&mut self, device: &Device) {
        let _ = device;
    }

    /// An anchor invited us and was registered (tag role)
    fn on_new_device(&mut self, device: &Device) {
        let _ = device;
    }

    /// A device was evicted after its inactivity timeout
    fn on_inactive_device(&mut self, device: &Device) {
        let _ = device;
    }
}

impl RangingObserver for () {}

/// Why a time-of-flight computation was abandoned
///
/// The anchor answers the affected exchange with RANGE_FAILED instead of a
/// report; the tag then starts the cycle over.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TofError {
    /// An interval product exceeded the 64-bit headroom; the captured
    /// timestamps cannot belong to one coherent exchange
    ProductOverflow,
    /// All four intervals are zero
    DegenerateExchange,
}

/// Computes the time of flight from the six timestamps of a completed
/// exchange
///
/// Uses the asymmetric double-sided formula (DW1000 user manual, section
/// 12.3.2):
///
/// ```text
/// tof = (round1 * round2 - reply1 * reply2)
///     / (round1 + round2 + reply1 + reply2)
/// ```
///
/// The four intervals are wrapped differences, so the formula is immune to
/// the 40-bit counter rolling over mid-exchange, and the asymmetric form
/// cancels the first-order clock offset between the two devices.
pub fn compute_tof_asymmetric(device: &Device) -> Result<Timestamp, TofError> {
    let round1 = (device.time_poll_ack_received - device.time_poll_sent).wrap();
    let reply1 = (device.time_poll_ack_sent - device.time_poll_received).wrap();
    let round2 = (device.time_range_received - device.time_poll_ack_sent).wrap();
    let reply2 = (device.time_range_sent - device.time_poll_ack_received).wrap();

    let rounds = round1
        .checked_mul(round2)
        .ok_or(TofError::ProductOverflow)?;
    let replies = reply1
        .checked_mul(reply2)
        .ok_or(TofError::ProductOverflow)?;

    // Each interval is below 2^40, so the sum cannot overflow an i64.
    let sum = round1 + round2 + reply1 + reply2;
    if sum.value() == 0 {
        return Err(TofError::DegenerateExchange);
    }

    Ok((rounds - replies) / sum)
}

/// The ranging protocol state machine for one radio
///
/// Owns the radio, borrows the event flags shared with the radio interrupt,
/// and tracks the peers it ranges against in a [`DeviceRegistry`]. Multiple
/// engines (one per radio) can coexist in a process; there is no global
/// state.
///
/// [`DeviceRegistry`]: ../device/struct.DeviceRegistry.html
pub struct RangingEngine<'e, R: RadioTransport> {
    radio: R,
    events: &'e RadioEvents,
    role: Role,
    config: RangingConfig,
    framer: Framer,
    registry: DeviceRegistry,
    own_long: ExtendedAddress,
    own_short: ShortAddress,
    expected: MessageKind,
    protocol_failed: bool,
    last_activity_ms: u64,
    last_tx: Option<(MessageKind, ShortAddress)>,
    buffer: [u8; MAX_FRAME_LEN],
}

impl<'e, R: RadioTransport> RangingEngine<'e, R> {
    /// Creates a tag engine
    pub fn tag(
        radio: R,
        events: &'e RadioEvents,
        own_long: ExtendedAddress,
        own_short: ShortAddress,
        config: RangingConfig,
    ) -> Self {
        Self::new(radio, events, Role::Tag, own_long, own_short, config)
    }

    /// Creates an anchor engine
    pub fn anchor(
        radio: R,
        events: &'e RadioEvents,
        own_long: ExtendedAddress,
        own_short: ShortAddress,
        config: RangingConfig,
    ) -> Self {
        Self::new(radio, events, Role::Anchor, own_long, own_short, config)
    }

    fn new(
        radio: R,
        events: &'e RadioEvents,
        role: Role,
        own_long: ExtendedAddress,
        own_short: ShortAddress,
        config: RangingConfig,
    ) -> Self {
        let expected = match role {
            Role::Tag => MessageKind::PollAck,
            Role::Anchor => MessageKind::Poll,
        };
        RangingEngine {
            radio,
            events,
            role,
            config,
            framer: Framer::new(),
            registry: DeviceRegistry::new(),
            own_long,
            own_short,
            expected,
            protocol_failed: false,
            last_activity_ms: 0,
            last_tx: None,
            buffer: [0; MAX_FRAME_LEN],
        }
    }

    /// Arms the receiver and, for a tag, announces the device
    ///
    /// Must be called once before the first [`poll`].
    ///
    /// [`poll`]: #method.poll
    pub fn start(&mut self, now_ms: u64) -> Result<(), R::Error> {
        self.receiver()?;
        if self.role == Role::Tag {
            self.transmit_blink()?;
        }
        self.note_activity(now_ms);
        Ok(())
    }

    /// The role this engine was created with
    pub fn role(&self) -> Role {
        self.role
    }

    /// This device's long address
    pub fn long_address(&self) -> ExtendedAddress {
        self.own_long
    }

    /// This device's short address
    pub fn short_address(&self) -> ShortAddress {
        self.own_short
    }

    /// The message kind the state machine expects to receive next
    pub fn expected_message(&self) -> MessageKind {
        self.expected
    }

    /// The peer devices currently known
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Shared access to the underlying radio
    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Exclusive access to the underlying radio
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Destroys the engine and returns the radio
    pub fn free(self) -> R {
        self.radio
    }

    /// Runs one epoch of protocol work
    ///
    /// Checks the watchdog, evicts inactive devices, and services the event
    /// flags raised by the radio interrupt since the last call, a pending
    /// "sent" strictly before a pending "received". Never blocks; call this
    /// frequently with a monotonic millisecond clock.
    pub fn poll<O: RangingObserver>(
        &mut self,
        now_ms: u64,
        observer: &mut O,
    ) -> Result<(), R::Error> {
        let sent = self.events.take_sent();
        let received = self.events.take_received();
        let receive_fault = self.events.take_receive_error() | self.events.take_receive_timeout();

        if !sent && !received {
            self.check_for_reset(now_ms)?;
        }

        self.sweep_inactive(now_ms, observer);

        if receive_fault {
            // Stay in the current expected state; just make sure the
            // receiver is listening again.
            debug!("receive fault, re-arming receiver");
            self.radio.start_receive()?;
        }

        if sent {
            self.handle_sent(now_ms)?;
        }

        if received {
            self.handle_received(now_ms, observer)?;
        }

        Ok(())
    }

    fn note_activity(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    fn check_for_reset(&mut self, now_ms: u64) -> Result<(), R::Error> {
        if now_ms.saturating_sub(self.last_activity_ms) <= self.config.reset_period_ms as u64 {
            return Ok(());
        }

        match self.role {
            Role::Anchor => {
                debug!("watchdog reset, listening for polls again");
                self.expected = MessageKind::Poll;
                self.receiver()?;
            }
            Role::Tag => {
                debug!("watchdog reset, re-announcing");
                self.expected = MessageKind::PollAck;
                self.registry.clear();
                self.transmit_blink()?;
            }
        }
        self.note_activity(now_ms);
        Ok(())
    }

    fn sweep_inactive<O: RangingObserver>(&mut self, now_ms: u64, observer: &mut O) {
        let timeout = self.config.inactivity_timeout_ms;
        self.registry
            .remove_inactive(now_ms, timeout, |device| {
                observer.on_inactive_device(device)
            });
    }

    /// Handles a completed transmission
    ///
    /// For the messages whose antenna timestamp feeds the range computation
    /// (POLL and RANGE on the tag, POLL_ACK on the anchor), reads the
    /// transmit timestamp and stores it in the record of the device the
    /// frame went to.
    fn handle_sent(&mut self, now_ms: u64) -> Result<(), R::Error> {
        let (kind, destination) = match self.last_tx {
            Some(last_tx) => last_tx,
            None => return Ok(()),
        };

        match (self.role, kind) {
            (Role::Tag, MessageKind::Poll)
            | (Role::Tag, MessageKind::Range)
            | (Role::Anchor, MessageKind::PollAck) => {}
            _ => return Ok(()),
        }

        let timestamp = self.radio.transmit_timestamp()?;
        match self.registry.find(destination) {
            Some(device) => {
                match kind {
                    MessageKind::Poll => device.time_poll_sent = timestamp,
                    // Overwrites the scheduled send time with the antenna
                    // timestamp the chip actually latched.
                    MessageKind::Range => device.time_range_sent = timestamp,
                    MessageKind::PollAck => device.time_poll_ack_sent = timestamp,
                    _ => unreachable!(),
                }
            }
            None => {
                warn!("sent to unknown device {}", destination.0);
                return Ok(());
            }
        }
        self.note_activity(now_ms);
        Ok(())
    }

    fn handle_received<O: RangingObserver>(
        &mut self,
        now_ms: u64,
        observer: &mut O,
    ) -> Result<(), R::Error> {
        let mut frame = [0; MAX_FRAME_LEN];
        let len = self.radio.get_data(&mut frame)?.min(MAX_FRAME_LEN);
        let frame = &frame[..len];

        match mac::classify(frame) {
            mac::FrameClass::Blink => self.handle_blink(frame, now_ms, observer),
            mac::FrameClass::LongMac => self.handle_ranging_init(frame, now_ms, observer),
            mac::FrameClass::ShortMac => self.handle_short_frame(frame, now_ms, observer),
            mac::FrameClass::Invalid => {
                debug!("dropping malformed frame of {} bytes", len);
                Ok(())
            }
        }
    }

    /// A tag announced itself; only meaningful for an anchor
    fn handle_blink<O: RangingObserver>(
        &mut self,
        frame: &[u8],
        now_ms: u64,
        observer: &mut O,
    ) -> Result<(), R::Error> {
        if self.role != Role::Anchor {
            return Ok(());
        }
        let (tag_long, tag_short) = match mac::decode_blink(frame) {
            Some(addresses) => addresses,
            None => return Ok(()),
        };

        let mut device = Device::new(tag_long, tag_short);
        device.set_reply_delay_us(self.config.reply_delay_us);
        device.note_activity(now_ms);

        match self.registry.add(device, false) {
            Ok(()) => {
                debug!("blink: registered tag {}", tag_short.0);
                if let Some(device) = self.registry.find(tag_short) {
                    observer.on_blink_device(device);
                }
            }
            Err(RegistryError::Duplicate) => {
                debug!("blink from already known tag {}", tag_short.0);
            }
            Err(RegistryError::CapacityExhausted) => {
                warn!("blink from {} but the registry is full", tag_short.0);
                return Ok(());
            }
        }

        // Invite the tag to range, also when it was already known; a
        // re-blink means the tag restarted discovery.
        self.expected = MessageKind::Poll;
        self.transmit_ranging_init(tag_long, tag_short)?;
        self.note_activity(now_ms);
        Ok(())
    }

    /// An anchor invited us to range; only meaningful for a tag
    fn handle_ranging_init<O: RangingObserver>(
        &mut self,
        frame: &[u8],
        now_ms: u64,
        observer: &mut O,
    ) -> Result<(), R::Error> {
        if self.role != Role::Tag {
            return Ok(());
        }
        let anchor_short = match mac::decode_long(frame, self.own_long) {
            Some(source) => source,
            None => {
                debug!("ranging init not for us");
                return Ok(());
            }
        };
        if mac::message_kind(frame, mac::FrameClass::LongMac) != Some(MessageKind::RangingInit) {
            debug!("unexpected long frame kind {}", frame[LONG_MAC_LEN]);
            return Ok(());
        }

        let mut device = Device::with_short_address(anchor_short);
        device.set_reply_delay_us(self.config.reply_delay_us);
        device.note_activity(now_ms);

        match self.registry.add(device, true) {
            Ok(()) => {
                debug!("ranging init: registered anchor {}", anchor_short.0);
                if let Some(device) = self.registry.find(anchor_short) {
                    observer.on_new_device(device);
                }
                self.transmit_poll(anchor_short)?;
                self.note_activity(now_ms);
            }
            Err(RegistryError::Duplicate) => {
                debug!("ranging init from already known anchor {}", anchor_short.0);
            }
            Err(RegistryError::CapacityExhausted) => {
                warn!(
                    "ranging init from {} but the registry is full",
                    anchor_short.0
                );
            }
        }
        Ok(())
    }

    fn handle_short_frame<O: RangingObserver>(
        &mut self,
        frame: &[u8],
        now_ms: u64,
        observer: &mut O,
    ) -> Result<(), R::Error> {
        let source = match mac::decode_short(frame, self.own_short) {
            Some(source) => source,
            None => {
                debug!("short frame not for us");
                return Ok(());
            }
        };
        let kind = match mac::message_kind(frame, mac::FrameClass::ShortMac) {
            Some(kind) => kind,
            None => {
                debug!("dropping frame with unknown kind byte");
                return Ok(());
            }
        };

        match self.registry.find(source) {
            Some(device) => device.note_activity(now_ms),
            None => {
                warn!("dropping {:?} from unknown device {}", kind, source.0);
                return Ok(());
            }
        }

        match self.role {
            Role::Anchor => self.anchor_dispatch(frame, kind, source, now_ms, observer),
            Role::Tag => self.tag_dispatch(frame, kind, source, now_ms, observer),
        }
    }

    fn anchor_dispatch<O: RangingObserver>(
        &mut self,
        frame: &[u8],
        kind: MessageKind,
        source: ShortAddress,
        now_ms: u64,
        observer: &mut O,
    ) -> Result<(), R::Error> {
        if kind != self.expected {
            // Out of sequence; remembered until the next POLL restarts the
            // exchange cleanly.
            self.protocol_failed = true;
        }

        match kind {
            MessageKind::Poll => {
                // A POLL always starts a fresh exchange, so it resynchronizes
                // instead of failing.
                self.protocol_failed = false;
                debug!("received POLL from {}", source.0);

                let timestamp = self.radio.receive_timestamp()?;
                if let Some(device) = self.registry.find(source) {
                    device.time_poll_received = timestamp;
                }
                self.expected = MessageKind::Range;
                self.transmit_poll_ack(source)?;
                self.note_activity(now_ms);
            }
            MessageKind::Range => {
                debug!("received RANGE from {}", source.0);
                self.expected = MessageKind::Poll;

                let report = self.finish_exchange(frame, source)?;
                match report {
                    Some((range_m, rx_power_dbm)) => {
                        self.transmit_range_report(source, range_m, rx_power_dbm)?;
                        if let Some(device) = self.registry.find(source) {
                            observer.on_new_range(device);
                        }
                    }
                    None => self.transmit_range_failed(source)?,
                }
                self.note_activity(now_ms);
            }
            _ => {}
        }
        Ok(())
    }

    /// Processes a RANGE frame and computes the corrected range
    ///
    /// Returns the range and RX power to report, or `None` if the exchange
    /// failed and RANGE_FAILED should go out instead.
    fn finish_exchange(
        &mut self,
        frame: &[u8],
        source: ShortAddress,
    ) -> Result<Option<(f32, f32)>, R::Error> {
        // The receive timestamp is recorded even when the exchange already
        // failed, so the device record stays coherent for the next cycle.
        let range_received = self.radio.receive_timestamp()?;
        if let Some(device) = self.registry.find(source) {
            device.time_range_received = range_received;
        }

        if self.protocol_failed {
            return Ok(None);
        }
        if frame.len() < SHORT_PAYLOAD + RANGE_PAYLOAD_LEN {
            warn!("RANGE frame of {} bytes is too short", frame.len());
            return Ok(None);
        }

        let rx_power_dbm = self.radio.receive_power()?;
        let fp_power_dbm = self.radio.first_path_power()?;
        let quality = self.radio.receive_quality()?;
        let prf = self.radio.pulse_frequency();

        let device = match self.registry.find(source) {
            Some(device) => device,
            None => return Ok(None),
        };
        device.time_poll_sent = read_timestamp(frame, SHORT_PAYLOAD);
        device.time_poll_ack_received = read_timestamp(frame, SHORT_PAYLOAD + LEN_STAMP);
        device.time_range_sent = read_timestamp(frame, SHORT_PAYLOAD + 2 * LEN_STAMP);

        let tof = match compute_tof_asymmetric(device) {
            Ok(tof) => tof,
            Err(_) => {
                warn!("implausible timestamps from {}", source.0);
                return Ok(None);
            }
        };

        let range_m = tof.as_meters() - range_bias_cm(rx_power_dbm, prf) / 100.0;
        device.set_range(range_m);
        device.set_rx_power(rx_power_dbm);
        device.set_first_path_power(fp_power_dbm);
        device.set_quality(quality);

        debug!("range to {}: {} m", source.0, range_m);
        Ok(Some((range_m, rx_power_dbm)))
    }

    fn tag_dispatch<O: RangingObserver>(
        &mut self,
        frame: &[u8],
        kind: MessageKind,
        source: ShortAddress,
        now_ms: u64,
        observer: &mut O,
    ) -> Result<(), R::Error> {
        if kind != self.expected {
            // Desync; restart the cycle with a fresh POLL.
            debug!("expected {:?}, got {:?}; re-polling", self.expected, kind);
            self.expected = MessageKind::PollAck;
            self.transmit_poll(source)?;
            return Ok(());
        }

        match kind {
            MessageKind::PollAck => {
                debug!("received POLL_ACK from {}", source.0);
                let timestamp = self.radio.receive_timestamp()?;
                if let Some(device) = self.registry.find(source) {
                    device.time_poll_ack_received = timestamp;
                }
                self.expected = MessageKind::RangeReport;
                self.transmit_range(source)?;
                self.note_activity(now_ms);
            }
            MessageKind::RangeReport => {
                self.expected = MessageKind::PollAck;

                let payload = frame.get(SHORT_PAYLOAD..SHORT_PAYLOAD + RANGE_REPORT_PAYLOAD_LEN);
                let report = payload
                    .and_then(|payload| {
                        ssmarshal::deserialize::<RangeReportPayload>(payload).ok()
                    })
                    .map(|(report, _)| report);

                match report {
                    Some(report) => {
                        debug!(
                            "received RANGE_REPORT from {}: {} m",
                            source.0, report.range_m
                        );
                        if let Some(device) = self.registry.find(source) {
                            device.set_range(report.range_m);
                            device.set_rx_power(report.rx_power_dbm);
                            observer.on_new_range(device);
                        }
                    }
                    None => warn!("malformed RANGE_REPORT from {}", source.0),
                }

                self.transmit_poll(source)?;
                self.note_activity(now_ms);
            }
            MessageKind::RangeFailed => {
                debug!("received RANGE_FAILED from {}; re-polling", source.0);
                self.expected = MessageKind::PollAck;
                self.transmit_poll(source)?;
                self.note_activity(now_ms);
            }
            _ => {}
        }
        Ok(())
    }

    /// Arms the receiver in permanent mode
    fn receiver(&mut self) -> Result<(), R::Error> {
        self.radio.new_receive()?;
        self.radio.receive_permanently(true)?;
        self.radio.start_receive()
    }

    fn transmit_blink(&mut self) -> Result<(), R::Error> {
        let len = self
            .framer
            .encode_blink(&mut self.buffer, self.own_long, self.own_short);
        self.last_tx = Some((MessageKind::Blink, ShortAddress(0xFFFF)));

        self.radio.new_transmit()?;
        self.radio.set_data(&self.buffer[..len])?;
        self.radio.start_transmit()
    }

    fn transmit_ranging_init(
        &mut self,
        destination_long: ExtendedAddress,
        destination_short: ShortAddress,
    ) -> Result<(), R::Error> {
        let len = self.framer.encode_long_frame(
            &mut self.buffer,
            self.config.pan_id,
            destination_long,
            self.own_short,
            MessageKind::RangingInit,
        );
        self.last_tx = Some((MessageKind::RangingInit, destination_short));

        self.radio.new_transmit()?;
        self.radio.set_data(&self.buffer[..len])?;
        self.radio.start_transmit()
    }

    fn transmit_poll(&mut self, destination: ShortAddress) -> Result<(), R::Error> {
        let len = self.framer.encode_short_frame(
            &mut self.buffer,
            self.config.pan_id,
            destination,
            self.own_short,
            MessageKind::Poll,
        );
        self.last_tx = Some((MessageKind::Poll, destination));

        self.radio.new_transmit()?;
        self.radio.set_data(&self.buffer[..len])?;
        self.radio.start_transmit()
    }

    /// Sends POLL_ACK delayed by the device's reply delay
    ///
    /// The delay makes the anchor's send time deterministic relative to the
    /// poll reception, which the tag's side of the formula relies on.
    fn transmit_poll_ack(&mut self, destination: ShortAddress) -> Result<(), R::Error> {
        let reply_delay_us = self
            .registry
            .find(destination)
            .map(|device| device.reply_delay_us())
            .unwrap_or(self.config.reply_delay_us);

        let len = self.framer.encode_short_frame(
            &mut self.buffer,
            self.config.pan_id,
            destination,
            self.own_short,
            MessageKind::PollAck,
        );
        self.last_tx = Some((MessageKind::PollAck, destination));

        self.radio.new_transmit()?;
        self.radio.set_delay(Timestamp::from_micros(reply_delay_us))?;
        self.radio.set_data(&self.buffer[..len])?;
        self.radio.start_transmit()
    }

    /// Sends RANGE with the tag's three timestamps embedded
    ///
    /// The transmission is delayed so its send time is known up front; that
    /// scheduled timestamp goes into the payload before the frame is staged.
    fn transmit_range(&mut self, destination: ShortAddress) -> Result<(), R::Error> {
        let reply_delay_us = self
            .registry
            .find(destination)
            .map(|device| device.reply_delay_us())
            .unwrap_or(self.config.reply_delay_us);

        let mut len = self.framer.encode_short_frame(
            &mut self.buffer,
            self.config.pan_id,
            destination,
            self.own_short,
            MessageKind::Range,
        );

        self.radio.new_transmit()?;
        let range_sent = self
            .radio
            .set_delay(Timestamp::from_micros(reply_delay_us))?;

        if let Some(device) = self.registry.find(destination) {
            device.time_range_sent = range_sent;
            write_timestamp(&mut self.buffer, SHORT_PAYLOAD, device.time_poll_sent);
            write_timestamp(
                &mut self.buffer,
                SHORT_PAYLOAD + LEN_STAMP,
                device.time_poll_ack_received,
            );
            write_timestamp(
                &mut self.buffer,
                SHORT_PAYLOAD + 2 * LEN_STAMP,
                device.time_range_sent,
            );
        }
        len += RANGE_PAYLOAD_LEN;
        self.last_tx = Some((MessageKind::Range, destination));

        self.radio.set_data(&self.buffer[..len])?;
        self.radio.start_transmit()
    }

    fn transmit_range_report(
        &mut self,
        destination: ShortAddress,
        range_m: f32,
        rx_power_dbm: f32,
    ) -> Result<(), R::Error> {
        let mut len = self.framer.encode_short_frame(
            &mut self.buffer,
            self.config.pan_id,
            destination,
            self.own_short,
            MessageKind::RangeReport,
        );

        let report = RangeReportPayload {
            range_m,
            rx_power_dbm,
        };
        match ssmarshal::serialize(&mut self.buffer[len..], &report) {
            Ok(written) => len += written,
            Err(_) => {
                error!("failed to serialize range report");
                return self.transmit_range_failed(destination);
            }
        }
        self.last_tx = Some((MessageKind::RangeReport, destination));

        self.radio.new_transmit()?;
        self.radio.set_data(&self.buffer[..len])?;
        self.radio.start_transmit()
    }

    fn transmit_range_failed(&mut self, destination: ShortAddress) -> Result<(), R::Error> {
        let len = self.framer.encode_short_frame(
            &mut self.buffer,
            self.config.pan_id,
            destination,
            self.own_short,
            MessageKind::RangeFailed,
        );
        self.last_tx = Some((MessageKind::RangeFailed, destination));

        self.radio.new_transmit()?;
        self.radio.set_data(&self.buffer[..len])?;
        self.radio.start_transmit()
    }
}

fn read_timestamp(frame: &[u8], offset: usize) -> Timestamp {
    let mut raw = [0; LEN_STAMP];
    raw.copy_from_slice(&frame[offset..offset + LEN_STAMP]);
    Timestamp::from_bytes(&raw)
}

fn write_timestamp(buffer: &mut [u8], offset: usize, timestamp: Timestamp) {
    buffer[offset..offset + LEN_STAMP].copy_from_slice(&timestamp.to_bytes());
}
