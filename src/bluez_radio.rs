//! A [`Radio`] that advertises through BlueZ over D-Bus.
//!
//! Each frame is registered as its own broadcast advertisement. Dropping the
//! registration handle takes it off air, so stopping is just forgetting it.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use bluer::adv::{Advertisement, Type};
use bluer::{Adapter, ErrorKind, Session};
use tokio::sync::oneshot;

use crate::frame::Frame;
use crate::radio::{AdvertiseMode, AdvertiseParams, PowerState, Radio, RadioError, RadioEvents, RadioPower, TxPower};

// Same codes a mobile stack reports for rejected advertisements
const ADVERTISE_FAILED_DATA_TOO_LARGE: i32 = 1;
const ADVERTISE_FAILED_TOO_MANY_ADVERTISERS: i32 = 2;
const ADVERTISE_FAILED_ALREADY_STARTED: i32 = 3;
const ADVERTISE_FAILED_INTERNAL_ERROR: i32 = 4;
const ADVERTISE_FAILED_FEATURE_UNSUPPORTED: i32 = 5;

pub struct BluezRadio {
    adapter: Adapter,
    events: RadioEvents,
    power: RadioPower,
    advertiser: bool,
    /// Dropping this takes the current advertisement off air
    on_air: Option<oneshot::Sender<()>>,
}

impl BluezRadio {
    /// Connect to bluetoothd and use its default adapter.
    ///
    /// `power` is seeded from the adapter here and kept current by whoever watches it.
    pub async fn open(events: RadioEvents, power: RadioPower) -> anyhow::Result<Self> {
        let session = Session::new().await.context("connecting to bluetoothd")?;
        let adapter = session.default_adapter().await.context("no Bluetooth adapter")?;

        let powered = adapter.is_powered().await.context("reading adapter power")?;
        power.set(if powered { PowerState::On } else { PowerState::Off });

        let advertiser = match adapter.supported_advertising_instances().await {
            Ok(instances) => {
                log::debug!("{} supports {instances} advertising instances", adapter.name());
                true
            }
            Err(err) => {
                log::warn!("{} has no LE advertising manager: {err}", adapter.name());
                false
            }
        };
        log::info!("Advertising through {} ({})", adapter.name(), adapter.address().await?);

        Ok(Self { adapter, events, power, advertiser, on_air: None })
    }
}

impl Radio for BluezRadio {
    fn check_ready(&self) -> Result<(), RadioError> {
        match self.power.get() {
            PowerState::Absent => Err(RadioError::RadioAbsent),
            PowerState::Off => Err(RadioError::RadioOff),
            PowerState::On if !self.advertiser => Err(RadioError::AdvertiserUnavailable),
            PowerState::On => Ok(()),
        }
    }

    fn start_advertising(&mut self, params: &AdvertiseParams, frame: &Frame) {
        let (stop, stopped) = oneshot::channel::<()>();
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let advertisement = advertisement(params, frame);
        let sequence = frame.sequence();
        log::debug!("TX: seq={sequence} 0x{}", hex::encode(frame.as_bytes()));

        tokio::spawn(async move {
            match adapter.advertise(advertisement).await {
                Ok(handle) => {
                    events.advertise_started(sequence);
                    // Resolves once the sender is dropped by stop_advertising
                    let _ = stopped.await;
                    drop(handle);
                }
                Err(err) => {
                    log::debug!("BlueZ rejected seq {sequence}: {err}");
                    events.advertise_failed(sequence, error_code(&err.kind));
                }
            }
        });
        self.on_air = Some(stop);
    }

    fn stop_advertising(&mut self) {
        self.on_air = None;
    }

    fn is_powered_on(&self) -> bool {
        self.power.get() == PowerState::On
    }
}

/// The BlueZ advertisement carrying `frame`.
pub fn advertisement(params: &AdvertiseParams, frame: &Frame) -> Advertisement {
    let interval = interval(params.mode);
    Advertisement {
        advertisement_type: if params.connectable { Type::Peripheral } else { Type::Broadcast },
        manufacturer_data: BTreeMap::from([(params.company_id, frame.as_bytes().to_vec())]),
        local_name: params.scan_response_name.clone(),
        timeout: (params.timeout_ms > 0).then(|| Duration::from_millis(params.timeout_ms as u64)),
        min_interval: Some(interval),
        max_interval: Some(interval),
        tx_power: Some(tx_power_dbm(params.tx_power)),
        ..Default::default()
    }
}

fn interval(mode: AdvertiseMode) -> Duration {
    match mode {
        AdvertiseMode::LowLatency => Duration::from_millis(100),
        AdvertiseMode::Balanced => Duration::from_millis(250),
        AdvertiseMode::LowPower => Duration::from_millis(1000),
    }
}

fn tx_power_dbm(power: TxPower) -> i16 {
    match power {
        TxPower::UltraLow => -21,
        TxPower::Low => -15,
        TxPower::Medium => -7,
        TxPower::High => 1,
    }
}

fn error_code(kind: &ErrorKind) -> i32 {
    match kind {
        ErrorKind::InvalidLength => ADVERTISE_FAILED_DATA_TOO_LARGE,
        ErrorKind::AlreadyExists => ADVERTISE_FAILED_ALREADY_STARTED,
        ErrorKind::NotSupported => ADVERTISE_FAILED_FEATURE_UNSUPPORTED,
        ErrorKind::Failed => ADVERTISE_FAILED_TOO_MANY_ADVERTISERS,
        _ => ADVERTISE_FAILED_INTERNAL_ERROR,
    }
}

#[test]
fn test_advertisement_carries_frame_as_manufacturer_data() {
    let frame = Frame::Legacy(hex_literal::hex!("01004d05d7001b1005"));
    let adv = advertisement(&AdvertiseParams::default(), &frame);
    assert_eq!(adv.advertisement_type, Type::Broadcast);
    assert_eq!(adv.manufacturer_data.len(), 1);
    assert_eq!(adv.manufacturer_data[&0xFFFF], frame.as_bytes().to_vec());
    assert_eq!(adv.local_name.as_deref(), Some("HT-MT"));
    assert_eq!(adv.timeout, None);
    assert_eq!(adv.min_interval, Some(Duration::from_millis(100)));
    assert_eq!(adv.tx_power, Some(-7));
}

#[test]
fn test_advertisement_follows_params() {
    let params = AdvertiseParams {
        mode: AdvertiseMode::LowPower,
        tx_power: TxPower::High,
        connectable: true,
        timeout_ms: 3_000,
        company_id: 0x1234,
        scan_response_name: None,
    };
    let frame = Frame::Legacy(hex_literal::hex!("01004d05d7001b1005"));
    let adv = advertisement(&params, &frame);
    assert_eq!(adv.advertisement_type, Type::Peripheral);
    assert!(adv.manufacturer_data.contains_key(&0x1234));
    assert_eq!(adv.local_name, None);
    assert_eq!(adv.timeout, Some(Duration::from_secs(3)));
    assert_eq!(adv.max_interval, Some(Duration::from_millis(1000)));
    assert_eq!(adv.tx_power, Some(1));
}

#[test]
fn test_error_codes() {
    assert_eq!(error_code(&ErrorKind::InvalidLength), 1);
    assert_eq!(error_code(&ErrorKind::NotSupported), 5);
    assert_eq!(error_code(&ErrorKind::NotReady), 4);
}
