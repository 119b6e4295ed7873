use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::frame::{Frame, MANUFACTURER_ID};
use crate::worker::Message;

/// Name the scan response carries, so receivers can filter on it.
pub const DEVICE_NAME: &str = "HT-MT";

/// Why an advertisement could not be started. Never fatal: each one becomes a broadcast state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("BLE permission pending")]
    PermissionMissing,
    #[error("Bluetooth disabled")]
    RadioOff,
    #[error("No Bluetooth adapter")]
    RadioAbsent,
    #[error("BLE advertising not supported")]
    AdvertiserUnavailable,
    #[error("Advertise error {0}")]
    HardwareStartFailure(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPower {
    UltraLow,
    Low,
    Medium,
    High,
}

/// How a frame is wrapped into an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseParams {
    pub mode: AdvertiseMode,
    pub tx_power: TxPower,
    pub connectable: bool,
    /// 0 = advertise until stopped
    pub timeout_ms: u32,
    /// Company id of the manufacturer specific data carrying the frame
    pub company_id: u16,
    /// Name sent in the scan response
    pub scan_response_name: Option<String>,
}

impl Default for AdvertiseParams {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::LowLatency,
            tx_power: TxPower::Medium,
            connectable: false,
            timeout_ms: 0,
            company_id: MANUFACTURER_ID,
            scan_response_name: Some(DEVICE_NAME.to_owned()),
        }
    }
}

/// What the radio reports back after it has been asked to do something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    /// The advertisement carrying the frame with this sequence is on air.
    AdvertiseStarted { sequence: u8 },
    /// The stack rejected the advertisement carrying the frame with this sequence.
    AdvertiseFailed { sequence: u8, code: i32 },
    PowerChanged { on: bool },
}

/// Delivers radio callbacks onto the broadcast worker.
#[derive(Clone)]
pub struct RadioEvents {
    tx: mpsc::UnboundedSender<Message>,
}

impl RadioEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: RadioEvent) {
        if self.tx.send(Message::Radio(event)).is_err() {
            log::debug!("Broadcast worker gone, dropping {event:?}");
        }
    }

    pub fn advertise_started(&self, sequence: u8) {
        self.send(RadioEvent::AdvertiseStarted { sequence })
    }

    pub fn advertise_failed(&self, sequence: u8, code: i32) {
        self.send(RadioEvent::AdvertiseFailed { sequence, code })
    }

    pub fn power_changed(&self, on: bool) {
        self.send(RadioEvent::PowerChanged { on })
    }
}

/// The platform advertiser.
///
/// A live advertisement cannot have its payload changed, so every tick the
/// broadcaster calls [`Radio::stop_advertising`] and then
/// [`Radio::start_advertising`] with the new frame. The outcome of a start is
/// reported later through [`RadioEvents`].
pub trait Radio: Send {
    /// Permission, adapter, power and advertiser checks, in that order.
    fn check_ready(&self) -> Result<(), RadioError>;

    fn start_advertising(&mut self, params: &AdvertiseParams, frame: &Frame);

    fn stop_advertising(&mut self);

    fn is_powered_on(&self) -> bool;

    /// Best effort, failures are ignored by the caller.
    fn set_name(&mut self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PowerState {
    Absent = 0,
    Off = 1,
    On = 2,
}

/// Adapter power state shared between whoever watches the adapter and the radio.
#[derive(Debug, Clone)]
pub struct RadioPower(Arc<AtomicU8>);

impl RadioPower {
    pub fn new(state: PowerState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> PowerState {
        match self.0.load(Ordering::Acquire) {
            0 => PowerState::Absent,
            1 => PowerState::Off,
            _ => PowerState::On,
        }
    }

    pub fn set(&self, state: PowerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// A radio that writes each advertisement to the log instead of putting it on air.
///
/// Useful on hosts without an advertising capable stack, and to watch what a
/// broadcaster would send.
pub struct ConsoleRadio {
    events: RadioEvents,
    power: RadioPower,
    on_air: Option<Frame>,
}

impl ConsoleRadio {
    pub fn new(events: RadioEvents, power: RadioPower) -> Self {
        Self { events, power, on_air: None }
    }

    pub fn on_air(&self) -> Option<&Frame> {
        self.on_air.as_ref()
    }
}

impl Radio for ConsoleRadio {
    fn check_ready(&self) -> Result<(), RadioError> {
        match self.power.get() {
            PowerState::Absent => Err(RadioError::RadioAbsent),
            PowerState::Off => Err(RadioError::RadioOff),
            PowerState::On => Ok(()),
        }
    }

    fn start_advertising(&mut self, params: &AdvertiseParams, frame: &Frame) {
        let h = hex::encode(frame.as_bytes());
        log::info!("TX: company=0x{:04X} seq={} 0x{h}", params.company_id, frame.sequence());
        self.on_air = Some(*frame);
        self.events.advertise_started(frame.sequence());
    }

    fn stop_advertising(&mut self) {
        if let Some(frame) = self.on_air.take() {
            log::debug!("TX stopped seq={}", frame.sequence());
        }
    }

    fn is_powered_on(&self) -> bool {
        self.power.get() == PowerState::On
    }
}

#[test]
fn test_console_radio_follows_power() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let power = RadioPower::new(PowerState::Absent);
    let mut radio = ConsoleRadio::new(RadioEvents::new(tx), power.clone());
    assert_eq!(radio.check_ready(), Err(RadioError::RadioAbsent));
    power.set(PowerState::Off);
    assert_eq!(radio.check_ready(), Err(RadioError::RadioOff));
    assert!(!radio.is_powered_on());
    power.set(PowerState::On);
    assert_eq!(radio.check_ready(), Ok(()));

    let frame = Frame::Legacy(hex_literal::hex!("01004d05d7001b1005"));
    radio.start_advertising(&AdvertiseParams::default(), &frame);
    assert_eq!(radio.on_air(), Some(&frame));
    match rx.try_recv() {
        Ok(Message::Radio(event)) => assert_eq!(event, RadioEvent::AdvertiseStarted { sequence: 5 }),
        _ => panic!("expected an advertise callback"),
    }
    radio.stop_advertising();
    assert_eq!(radio.on_air(), None);
}

#[test]
fn test_radio_error_messages() {
    assert_eq!(RadioError::HardwareStartFailure(3).to_string(), "Advertise error 3");
    assert_eq!(RadioError::RadioOff.to_string(), "Bluetooth disabled");
}
