//! Broadcast a device's battery state over Bluetooth Low Energy advertisements.
//!
//! Every few seconds the power supply is sampled and packed into a small fixed
//! size frame, which is advertised as manufacturer specific data. Nearby
//! receivers (a dashboard tablet, a Raspberry Pi, a phone) can follow battery
//! level, charge state, temperature and voltage without ever connecting.
//!
//! There is no pairing, acknowledgement or encryption: anyone in range can read the frames.
//!
//! The pieces:
//!
//! - [`Sampler`] pulls a [`TelemetrySnapshot`] out of a [`TelemetrySource`]
//! - [`frame::encode`] packs it into a [`Frame`]
//! - [`Broadcaster`] is the state machine deciding when to sample and how to react to the radio
//! - [`Worker`] runs a broadcaster on a single task, driven through a [`BroadcastHandle`]
//! - [`Radio`] puts frames on air; `bluez_radio` does it through BlueZ on Linux, [`ConsoleRadio`] only logs them
//! - [`StatusPublisher`] forwards state changes to a [`SettingsStore`] and a [`StatusSink`]
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use batterycast::*;
//! # #[tokio::main]
//! # pub async fn main() {
//!     let worker = Worker::new();
//!     let radio = ConsoleRadio::new(worker.radio_events(), RadioPower::new(PowerState::On));
//!     let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::default());
//!     let (publisher, _fan_out) = StatusPublisher::spawn(store, Arc::new(LogStatusSink));
//!     let broadcaster = Broadcaster::new(Parts {
//!         sampler: Sampler::new(SysfsTelemetrySource::new()),
//!         radio: Box::new(radio),
//!         wake_lock: Box::new(LogWakeLock),
//!         publisher,
//!         layout: Layout::Versioned,
//!         params: AdvertiseParams::default(),
//!     });
//!     let (handle, _task) = worker.spawn(broadcaster);
//!     handle.start(1, 5).unwrap();
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     handle.stop().await.unwrap();
//! # }
//! ```

#[cfg(all(target_os = "linux", feature = "bluez"))]
pub mod bluez_radio;
pub mod frame;
mod publisher;
mod radio;
pub mod radio_watch;
pub mod receiver;
mod scheduler;
pub mod settings;
pub mod sysfs_source;
mod telemetry;
mod wake_lock;
mod worker;

pub use frame::{decode, encode, DecodedFrame, Frame, Layout};
pub use publisher::{LogStatusSink, Publication, StatusPublisher, StatusSink, StatusUpdate};
pub use radio::{
    AdvertiseMode, AdvertiseParams, ConsoleRadio, PowerState, Radio, RadioError, RadioEvent, RadioEvents,
    RadioPower, TxPower, DEVICE_NAME,
};
pub use scheduler::{BroadcastConfig, BroadcastState, BroadcastStatus, Broadcaster, Parts};
pub use settings::{FileSettingsStore, MemorySettingsStore, Settings, SettingsStore};
pub use sysfs_source::SysfsTelemetrySource;
pub use telemetry::{ChargeState, RawReading, Sampler, TelemetrySnapshot, TelemetrySource};
pub use wake_lock::{LogWakeLock, WakeLock, WakeLockGuard};
pub use worker::{BroadcastError, BroadcastHandle, Worker};
