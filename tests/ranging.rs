//! Scenario tests for the ranging state machine
//!
//! Drives a tag or anchor engine against a scripted mock radio: frames from
//! the peer are placed in the mock's receive buffer, the corresponding event
//! flag is raised, and the engine's `poll` is called the way an application
//! main loop would.

use std::convert::{Infallible, TryInto};

use dw1000_twr::configs::{DEFAULT_PAN_ID, DEFAULT_REPLY_DELAY_US, MAX_FRAME_LEN};
use dw1000_twr::mac::{self, ExtendedAddress, ShortAddress, RANGE_PAYLOAD_LEN, SHORT_PAYLOAD};
use dw1000_twr::ranging::compute_tof_asymmetric;
use dw1000_twr::range_bias::range_bias_cm;
use dw1000_twr::time::LEN_STAMP;
use dw1000_twr::{
    Device, FrameClass, Framer, MessageKind, PulseRepetitionFrequency, RadioEvents,
    RadioTransport, RangingConfig, RangingEngine, RangingObserver, Timestamp,
};

const ANCHOR_LONG: ExtendedAddress = ExtendedAddress(0xDECA_0000_0000_00A1);
const ANCHOR_SHORT: ShortAddress = ShortAddress(0x00A1);
const TAG_LONG: ExtendedAddress = ExtendedAddress(0xDECA_0000_0000_0071);
const TAG_SHORT: ShortAddress = ShortAddress(0x0071);

fn ts(value: i64) -> Timestamp {
    Timestamp::new(value).unwrap()
}

/// A scripted stand-in for the register-level radio driver
#[derive(Debug)]
struct MockRadio {
    /// Every frame passed to `start_transmit`, in order
    tx_frames: Vec<Vec<u8>>,
    /// The delay that was configured for each transmission, if any
    tx_delays: Vec<Option<Timestamp>>,
    staged: Vec<u8>,
    pending_delay: Option<Timestamp>,
    /// The frame `get_data` will return
    rx_frame: Vec<u8>,
    /// What `set_delay` reports as the scheduled send time
    scheduled_tx: Timestamp,
    tx_timestamp: Timestamp,
    rx_timestamp: Timestamp,
    sys_time: Timestamp,
    rx_power: f32,
    fp_power: f32,
    quality: f32,
    prf: PulseRepetitionFrequency,
    receive_starts: usize,
    permanent_rx: bool,
}

impl MockRadio {
    fn new() -> Self {
        MockRadio {
            tx_frames: Vec::new(),
            tx_delays: Vec::new(),
            staged: Vec::new(),
            pending_delay: None,
            rx_frame: Vec::new(),
            scheduled_tx: ts(0),
            tx_timestamp: ts(0),
            rx_timestamp: ts(0),
            sys_time: ts(0),
            rx_power: -80.0,
            fp_power: -82.0,
            quality: 1.0,
            prf: PulseRepetitionFrequency::Mhz16,
            receive_starts: 0,
            permanent_rx: false,
        }
    }

    fn last_tx_kind(&self) -> Option<MessageKind> {
        let frame = self.tx_frames.last()?;
        mac::message_kind(frame, mac::classify(frame))
    }
}

impl RadioTransport for MockRadio {
    type Error = Infallible;

    fn new_transmit(&mut self) -> Result<(), Infallible> {
        self.staged.clear();
        Ok(())
    }

    fn set_data(&mut self, data: &[u8]) -> Result<(), Infallible> {
        self.staged = data.to_vec();
        Ok(())
    }

    fn set_delay(&mut self, delay: Timestamp) -> Result<Timestamp, Infallible> {
        self.pending_delay = Some(delay);
        Ok(self.scheduled_tx)
    }

    fn start_transmit(&mut self) -> Result<(), Infallible> {
        self.tx_frames.push(self.staged.clone());
        self.tx_delays.push(self.pending_delay.take());
        Ok(())
    }

    fn new_receive(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    fn receive_permanently(&mut self, enabled: bool) -> Result<(), Infallible> {
        self.permanent_rx = enabled;
        Ok(())
    }

    fn start_receive(&mut self) -> Result<(), Infallible> {
        self.receive_starts += 1;
        Ok(())
    }

    fn get_data(&mut self, buffer: &mut [u8]) -> Result<usize, Infallible> {
        let len = self.rx_frame.len().min(buffer.len());
        buffer[..len].copy_from_slice(&self.rx_frame[..len]);
        Ok(len)
    }

    fn transmit_timestamp(&mut self) -> Result<Timestamp, Infallible> {
        Ok(self.tx_timestamp)
    }

    fn receive_timestamp(&mut self) -> Result<Timestamp, Infallible> {
        Ok(self.rx_timestamp)
    }

    fn system_timestamp(&mut self) -> Result<Timestamp, Infallible> {
        Ok(self.sys_time)
    }

    fn receive_power(&mut self) -> Result<f32, Infallible> {
        Ok(self.rx_power)
    }

    fn first_path_power(&mut self) -> Result<f32, Infallible> {
        Ok(self.fp_power)
    }

    fn receive_quality(&mut self) -> Result<f32, Infallible> {
        Ok(self.quality)
    }

    fn pulse_frequency(&mut self) -> PulseRepetitionFrequency {
        self.prf
    }
}

/// Records every notification for later inspection
#[derive(Debug, Default)]
struct Recorder {
    new_ranges: Vec<(u16, f32)>,
    blink_devices: Vec<u16>,
    new_devices: Vec<u16>,
    inactive_devices: Vec<u16>,
}

impl RangingObserver for Recorder {
    fn on_new_range(&mut self, device: &Device) {
        self.new_ranges.push((device.short_address().0, device.range()));
    }

    fn on_blink_device(&mut self, device: &Device) {
        self.blink_devices.push(device.short_address().0);
    }

    fn on_new_device(&mut self, device: &Device) {
        self.new_devices.push(device.short_address().0);
    }

    fn on_inactive_device(&mut self, device: &Device) {
        self.inactive_devices.push(device.short_address().0);
    }
}

fn anchor_engine(events: &RadioEvents) -> RangingEngine<'_, MockRadio> {
    RangingEngine::anchor(
        MockRadio::new(),
        events,
        ANCHOR_LONG,
        ANCHOR_SHORT,
        RangingConfig::default(),
    )
}

fn tag_engine(events: &RadioEvents) -> RangingEngine<'_, MockRadio> {
    RangingEngine::tag(
        MockRadio::new(),
        events,
        TAG_LONG,
        TAG_SHORT,
        RangingConfig::default(),
    )
}

/// Hands a frame to the engine as if the receive interrupt had fired
fn receive_frame(
    engine: &mut RangingEngine<'_, MockRadio>,
    events: &RadioEvents,
    frame: &[u8],
    rx_timestamp: Timestamp,
) {
    engine.radio_mut().rx_frame = frame.to_vec();
    engine.radio_mut().rx_timestamp = rx_timestamp;
    events.signal_received();
}

fn blink_frame(framer: &mut Framer) -> Vec<u8> {
    let mut buffer = [0; MAX_FRAME_LEN];
    let len = framer.encode_blink(&mut buffer, TAG_LONG, TAG_SHORT);
    buffer[..len].to_vec()
}

fn short_frame(
    framer: &mut Framer,
    destination: ShortAddress,
    source: ShortAddress,
    kind: MessageKind,
) -> Vec<u8> {
    let mut buffer = [0; MAX_FRAME_LEN];
    let len = framer.encode_short_frame(&mut buffer, DEFAULT_PAN_ID, destination, source, kind);
    buffer[..len].to_vec()
}

fn range_frame(
    framer: &mut Framer,
    poll_sent: Timestamp,
    poll_ack_received: Timestamp,
    range_sent: Timestamp,
) -> Vec<u8> {
    let mut frame = short_frame(framer, ANCHOR_SHORT, TAG_SHORT, MessageKind::Range);
    frame.extend_from_slice(&poll_sent.to_bytes());
    frame.extend_from_slice(&poll_ack_received.to_bytes());
    frame.extend_from_slice(&range_sent.to_bytes());
    assert_eq!(frame.len(), SHORT_PAYLOAD + RANGE_PAYLOAD_LEN);
    frame
}

#[test]
fn anchor_discovery_and_full_exchange() {
    let events = RadioEvents::new();
    let mut anchor = anchor_engine(&events);
    let mut observer = Recorder::default();
    let mut tag = Framer::new();

    anchor.start(0).unwrap();
    assert_eq!(anchor.radio().receive_starts, 1);
    assert!(anchor.radio().permanent_rx);

    // The tag announces itself; the anchor must register it and answer with
    // a ranging initiation addressed to the tag's long address.
    receive_frame(&mut anchor, &events, &blink_frame(&mut tag), ts(100));
    anchor.poll(10, &mut observer).unwrap();

    assert_eq!(anchor.registry().len(), 1);
    assert_eq!(observer.blink_devices, [TAG_SHORT.0]);
    assert_eq!(anchor.radio().last_tx_kind(), Some(MessageKind::RangingInit));
    let init = anchor.radio().tx_frames.last().unwrap().clone();
    assert_eq!(mac::classify(&init), FrameClass::LongMac);
    assert_eq!(mac::decode_long(&init, TAG_LONG), Some(ANCHOR_SHORT));
    assert_eq!(anchor.expected_message(), MessageKind::Poll);

    // POLL starts the exchange; the anchor replies with a delayed POLL_ACK.
    let poll = short_frame(&mut tag, ANCHOR_SHORT, TAG_SHORT, MessageKind::Poll);
    receive_frame(&mut anchor, &events, &poll, ts(1200));
    anchor.poll(20, &mut observer).unwrap();

    assert_eq!(anchor.radio().last_tx_kind(), Some(MessageKind::PollAck));
    assert_eq!(
        anchor.radio().tx_delays.last().unwrap(),
        &Some(Timestamp::from_micros(DEFAULT_REPLY_DELAY_US))
    );
    assert_eq!(anchor.expected_message(), MessageKind::Range);

    // The POLL_ACK leaves the antenna; its timestamp is captured.
    anchor.radio_mut().tx_timestamp = ts(1300);
    events.signal_sent();
    anchor.poll(30, &mut observer).unwrap();

    // RANGE closes the exchange. Tag-side timestamps are embedded in the
    // payload, anchor-side ones were captured along the way.
    let range = range_frame(&mut tag, ts(1000), ts(5000), ts(9000));
    anchor.radio_mut().rx_power = -77.0;
    receive_frame(&mut anchor, &events, &range, ts(9300));
    anchor.poll(40, &mut observer).unwrap();

    assert_eq!(anchor.radio().last_tx_kind(), Some(MessageKind::RangeReport));
    assert_eq!(anchor.expected_message(), MessageKind::Poll);

    // The reported range must be the closed-form asymmetric formula on the
    // six timestamps, bias-corrected for the RX power.
    let tof = (4000 * 8000 - 100 * 4000) / (4000 + 8000 + 100 + 4000);
    let expected_range = ts(tof).as_meters()
        - range_bias_cm(-77.0, PulseRepetitionFrequency::Mhz16) / 100.0;

    let report = anchor.radio().tx_frames.last().unwrap().clone();
    let reported = f32::from_le_bytes(report[SHORT_PAYLOAD..SHORT_PAYLOAD + 4].try_into().unwrap());
    assert!((reported - expected_range).abs() < 1e-4);

    let reported_power =
        f32::from_le_bytes(report[SHORT_PAYLOAD + 4..SHORT_PAYLOAD + 8].try_into().unwrap());
    assert_eq!(reported_power, -77.0);

    assert_eq!(observer.new_ranges.len(), 1);
    assert_eq!(observer.new_ranges[0].0, TAG_SHORT.0);
    assert!((observer.new_ranges[0].1 - expected_range).abs() < 1e-4);

    // The device record agrees with the computation it was derived from.
    let device = anchor.registry().get(0).unwrap();
    assert_eq!(device.time_poll_received, ts(1200));
    assert_eq!(device.time_poll_ack_sent, ts(1300));
    assert_eq!(device.time_range_received, ts(9300));
    let tof = compute_tof_asymmetric(device).unwrap();
    assert_eq!(tof.value(), (4000 * 8000 - 100 * 4000) / 16_100);
}

#[test]
fn anchor_answers_out_of_sequence_range_with_range_failed() {
    let events = RadioEvents::new();
    let mut anchor = anchor_engine(&events);
    let mut observer = Recorder::default();
    let mut tag = Framer::new();

    anchor.start(0).unwrap();
    receive_frame(&mut anchor, &events, &blink_frame(&mut tag), ts(100));
    anchor.poll(10, &mut observer).unwrap();

    // RANGE while a POLL was expected: the exchange failed, but the anchor
    // must still answer so the tag can restart.
    let range = range_frame(&mut tag, ts(1000), ts(5000), ts(9000));
    receive_frame(&mut anchor, &events, &range, ts(9300));
    anchor.poll(20, &mut observer).unwrap();

    assert_eq!(anchor.radio().last_tx_kind(), Some(MessageKind::RangeFailed));
    assert_eq!(anchor.expected_message(), MessageKind::Poll);
    assert!(observer.new_ranges.is_empty());
}

#[test]
fn unknown_sender_is_dropped_without_reply() {
    let events = RadioEvents::new();
    let mut anchor = anchor_engine(&events);
    let mut observer = Recorder::default();
    let mut stranger = Framer::new();

    anchor.start(0).unwrap();
    let transmissions = anchor.radio().tx_frames.len();

    // Addressed to us, but the sender never blinked.
    let poll = short_frame(
        &mut stranger,
        ANCHOR_SHORT,
        ShortAddress(0xBEEF),
        MessageKind::Poll,
    );
    receive_frame(&mut anchor, &events, &poll, ts(500));
    anchor.poll(10, &mut observer).unwrap();

    assert_eq!(anchor.radio().tx_frames.len(), transmissions);
    assert_eq!(anchor.registry().len(), 0);
    assert_eq!(anchor.expected_message(), MessageKind::Poll);
}

#[test]
fn frames_for_other_devices_are_ignored() {
    let events = RadioEvents::new();
    let mut anchor = anchor_engine(&events);
    let mut observer = Recorder::default();
    let mut tag = Framer::new();

    anchor.start(0).unwrap();
    receive_frame(&mut anchor, &events, &blink_frame(&mut tag), ts(100));
    anchor.poll(10, &mut observer).unwrap();
    let transmissions = anchor.radio().tx_frames.len();

    // A poll from our known tag, but destined for some other anchor.
    let poll = short_frame(&mut tag, ShortAddress(0x0999), TAG_SHORT, MessageKind::Poll);
    receive_frame(&mut anchor, &events, &poll, ts(1200));
    anchor.poll(20, &mut observer).unwrap();

    assert_eq!(anchor.radio().tx_frames.len(), transmissions);
    assert_eq!(anchor.expected_message(), MessageKind::Poll);
}

#[test]
fn watchdog_resets_a_silent_anchor() {
    let events = RadioEvents::new();
    let mut anchor = anchor_engine(&events);
    let mut observer = Recorder::default();
    let mut tag = Framer::new();

    anchor.start(0).unwrap();
    receive_frame(&mut anchor, &events, &blink_frame(&mut tag), ts(100));
    anchor.poll(10, &mut observer).unwrap();
    let poll = short_frame(&mut tag, ANCHOR_SHORT, TAG_SHORT, MessageKind::Poll);
    receive_frame(&mut anchor, &events, &poll, ts(1200));
    anchor.poll(20, &mut observer).unwrap();
    assert_eq!(anchor.expected_message(), MessageKind::Range);

    let receive_starts = anchor.radio().receive_starts;

    // Just inside the reset period nothing happens.
    let reset_period = RangingConfig::default().reset_period_ms as u64;
    anchor.poll(20 + reset_period, &mut observer).unwrap();
    assert_eq!(anchor.expected_message(), MessageKind::Range);

    // One millisecond later the exchange is abandoned: back to expecting
    // POLL, receiver re-armed.
    anchor.poll(20 + reset_period + 1, &mut observer).unwrap();
    assert_eq!(anchor.expected_message(), MessageKind::Poll);
    assert_eq!(anchor.radio().receive_starts, receive_starts + 1);
}

#[test]
fn watchdog_resets_a_silent_tag_and_forces_rediscovery() {
    let events = RadioEvents::new();
    let mut tag = tag_engine(&events);
    let mut observer = Recorder::default();
    let mut anchor = Framer::new();

    tag.start(0).unwrap();
    assert_eq!(tag.radio().last_tx_kind(), Some(MessageKind::Blink));

    // The anchor invites us; the tag registers it and starts polling.
    let mut buffer = [0; MAX_FRAME_LEN];
    let len = anchor.encode_long_frame(
        &mut buffer,
        DEFAULT_PAN_ID,
        TAG_LONG,
        ANCHOR_SHORT,
        MessageKind::RangingInit,
    );
    receive_frame(&mut tag, &events, &buffer[..len], ts(100));
    tag.poll(10, &mut observer).unwrap();
    assert_eq!(tag.registry().len(), 1);
    assert_eq!(observer.new_devices, [ANCHOR_SHORT.0]);
    assert_eq!(tag.radio().last_tx_kind(), Some(MessageKind::Poll));

    // Silence for longer than the reset period: rediscovery from scratch.
    let reset_period = RangingConfig::default().reset_period_ms as u64;
    tag.poll(10 + reset_period + 1, &mut observer).unwrap();

    assert_eq!(tag.registry().len(), 0);
    assert_eq!(tag.radio().last_tx_kind(), Some(MessageKind::Blink));
    assert_eq!(tag.expected_message(), MessageKind::PollAck);
}

#[test]
fn tag_runs_a_full_ranging_cycle() {
    let events = RadioEvents::new();
    let mut tag = tag_engine(&events);
    let mut observer = Recorder::default();
    let mut anchor = Framer::new();

    tag.start(0).unwrap();

    let mut buffer = [0; MAX_FRAME_LEN];
    let len = anchor.encode_long_frame(
        &mut buffer,
        DEFAULT_PAN_ID,
        TAG_LONG,
        ANCHOR_SHORT,
        MessageKind::RangingInit,
    );
    receive_frame(&mut tag, &events, &buffer[..len], ts(100));
    tag.poll(10, &mut observer).unwrap();
    assert_eq!(tag.radio().last_tx_kind(), Some(MessageKind::Poll));

    // The POLL leaves the antenna.
    tag.radio_mut().tx_timestamp = ts(1000);
    events.signal_sent();
    tag.poll(20, &mut observer).unwrap();
    assert_eq!(tag.registry().get(0).unwrap().time_poll_sent, ts(1000));

    // POLL_ACK arrives; the tag must answer with a delayed RANGE whose
    // payload holds poll-sent, poll-ack-received, and the scheduled send
    // time obtained before the frame was finalized.
    tag.radio_mut().scheduled_tx = ts(9000);
    let poll_ack = short_frame(&mut anchor, TAG_SHORT, ANCHOR_SHORT, MessageKind::PollAck);
    receive_frame(&mut tag, &events, &poll_ack, ts(5000));
    tag.poll(30, &mut observer).unwrap();

    assert_eq!(tag.radio().last_tx_kind(), Some(MessageKind::Range));
    assert_eq!(tag.expected_message(), MessageKind::RangeReport);
    let range = tag.radio().tx_frames.last().unwrap().clone();
    assert_eq!(
        &range[SHORT_PAYLOAD..SHORT_PAYLOAD + LEN_STAMP],
        &ts(1000).to_bytes()[..]
    );
    assert_eq!(
        &range[SHORT_PAYLOAD + LEN_STAMP..SHORT_PAYLOAD + 2 * LEN_STAMP],
        &ts(5000).to_bytes()[..]
    );
    assert_eq!(
        &range[SHORT_PAYLOAD + 2 * LEN_STAMP..SHORT_PAYLOAD + 3 * LEN_STAMP],
        &ts(9000).to_bytes()[..]
    );

    // Once it actually leaves, the latched antenna timestamp wins.
    tag.radio_mut().tx_timestamp = ts(9002);
    events.signal_sent();
    tag.poll(40, &mut observer).unwrap();
    assert_eq!(tag.registry().get(0).unwrap().time_range_sent, ts(9002));

    // The anchor reports back; the tag stores the result and re-polls.
    let mut report = short_frame(&mut anchor, TAG_SHORT, ANCHOR_SHORT, MessageKind::RangeReport);
    report.extend_from_slice(&9.25f32.to_le_bytes());
    report.extend_from_slice(&(-78.0f32).to_le_bytes());
    receive_frame(&mut tag, &events, &report, ts(12_000));
    tag.poll(50, &mut observer).unwrap();

    assert_eq!(observer.new_ranges, [(ANCHOR_SHORT.0, 9.25)]);
    let device = tag.registry().get(0).unwrap();
    assert_eq!(device.range(), 9.25);
    assert_eq!(device.rx_power(), -78.0);
    assert_eq!(tag.radio().last_tx_kind(), Some(MessageKind::Poll));
    assert_eq!(tag.expected_message(), MessageKind::PollAck);
}

#[test]
fn tag_restarts_the_cycle_on_unexpected_messages() {
    let events = RadioEvents::new();
    let mut tag = tag_engine(&events);
    let mut observer = Recorder::default();
    let mut anchor = Framer::new();

    tag.start(0).unwrap();
    let mut buffer = [0; MAX_FRAME_LEN];
    let len = anchor.encode_long_frame(
        &mut buffer,
        DEFAULT_PAN_ID,
        TAG_LONG,
        ANCHOR_SHORT,
        MessageKind::RangingInit,
    );
    receive_frame(&mut tag, &events, &buffer[..len], ts(100));
    tag.poll(10, &mut observer).unwrap();

    // A RANGE_FAILED while POLL_ACK was expected is a desync; the tag goes
    // back to polling.
    let failed = short_frame(&mut anchor, TAG_SHORT, ANCHOR_SHORT, MessageKind::RangeFailed);
    receive_frame(&mut tag, &events, &failed, ts(2000));
    tag.poll(20, &mut observer).unwrap();

    assert_eq!(tag.radio().last_tx_kind(), Some(MessageKind::Poll));
    assert_eq!(tag.expected_message(), MessageKind::PollAck);
}

#[test]
fn receive_faults_re_arm_the_receiver() {
    let events = RadioEvents::new();
    let mut anchor = anchor_engine(&events);
    let mut observer = Recorder::default();

    anchor.start(0).unwrap();
    let receive_starts = anchor.radio().receive_starts;

    events.signal_receive_error();
    anchor.poll(10, &mut observer).unwrap();
    assert_eq!(anchor.radio().receive_starts, receive_starts + 1);
    assert_eq!(anchor.expected_message(), MessageKind::Poll);

    events.signal_receive_timeout();
    anchor.poll(20, &mut observer).unwrap();
    assert_eq!(anchor.radio().receive_starts, receive_starts + 2);
}

#[test]
fn inactive_devices_are_evicted_and_reported() {
    let events = RadioEvents::new();
    let mut anchor = anchor_engine(&events);
    let mut observer = Recorder::default();
    let mut tag = Framer::new();

    anchor.start(0).unwrap();
    receive_frame(&mut anchor, &events, &blink_frame(&mut tag), ts(100));
    anchor.poll(10, &mut observer).unwrap();
    assert_eq!(anchor.registry().len(), 1);

    // Keep the engine itself alive with sent events while the device stays
    // silent past its inactivity timeout.
    let timeout = RangingConfig::default().inactivity_timeout_ms as u64;
    events.signal_sent();
    anchor.poll(10 + timeout + 1, &mut observer).unwrap();

    assert_eq!(anchor.registry().len(), 0);
    assert_eq!(observer.inactive_devices, [TAG_SHORT.0]);
}
