//! Fans broadcast status out to the settings store and the status display.
//!
//! Publishing only enqueues. The store and the sink run on their own blocking
//! thread, so slow disks or displays never hold up the broadcast worker.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::scheduler::BroadcastState;
use crate::settings::SettingsStore;
use crate::telemetry::TelemetrySnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub state: BroadcastState,
    /// Empty unless the state is an error state
    pub error: String,
    pub timestamp_ms: i64,
    /// Last sampled reading, if any
    pub snapshot: Option<TelemetrySnapshot>,
}

impl StatusUpdate {
    /// One line summary for the status display.
    pub fn display_text(&self) -> String {
        if !self.error.is_empty() {
            return format!("TX: OFF | {}", self.error);
        }
        let tx = if self.state == BroadcastState::Advertising { "ON" } else { "OFF" };
        match &self.snapshot {
            Some(s) => {
                let charger = if s.full {
                    "FULL"
                } else if s.charging || s.plugged {
                    "ON"
                } else {
                    "OFF"
                };
                format!(
                    "{}% | {:.1} C | {} mV | Charger: {charger} | TX: {tx}",
                    s.percent,
                    s.temperature_c(),
                    s.voltage_mv
                )
            }
            None => format!("{} | TX: {tx}", self.state),
        }
    }
}

/// The user visible status display.
pub trait StatusSink: Send + Sync {
    fn show(&self, update: &StatusUpdate);
}

/// Shows the status in the log.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn show(&self, update: &StatusUpdate) {
        log::info!("[{}] {}", update.state, update.display_text());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
    Status(StatusUpdate),
    Config { device_id: u32, interval_sec: i64 },
    Running(bool),
}

#[derive(Clone)]
pub struct StatusPublisher {
    tx: mpsc::UnboundedSender<Publication>,
}

impl StatusPublisher {
    /// A publisher plus the receiving end, for hosts that do their own fan out.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Publication>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A publisher writing to `store` and `sink` on a blocking thread.
    ///
    /// The thread exits once every clone of the publisher is dropped.
    pub fn spawn(store: Arc<dyn SettingsStore>, sink: Arc<dyn StatusSink>) -> (Self, JoinHandle<()>) {
        let (publisher, mut rx) = Self::channel();
        let task = tokio::task::spawn_blocking(move || {
            while let Some(publication) = rx.blocking_recv() {
                deliver(store.as_ref(), sink.as_ref(), publication);
            }
        });
        (publisher, task)
    }

    pub fn publish(&self, update: StatusUpdate) {
        self.send(Publication::Status(update));
    }

    pub fn persist_config(&self, device_id: u32, interval_sec: i64) {
        self.send(Publication::Config { device_id, interval_sec });
    }

    pub fn set_running(&self, running: bool) {
        self.send(Publication::Running(running));
    }

    fn send(&self, publication: Publication) {
        if self.tx.send(publication).is_err() {
            log::warn!("Status publisher closed, dropping update");
        }
    }
}

/// Apply one publication. Failures are logged and otherwise ignored.
pub fn deliver(store: &dyn SettingsStore, sink: &dyn StatusSink, publication: Publication) {
    let result = match &publication {
        Publication::Status(update) => {
            sink.show(update);
            store.update(&mut |s| {
                s.ble_status = update.state.as_str().to_owned();
                s.ble_error = update.error.clone();
                s.ble_ts = update.timestamp_ms;
            })
        }
        Publication::Config { device_id, interval_sec } => store.update(&mut |s| {
            s.device_id = *device_id;
            s.interval_sec = *interval_sec;
        }),
        Publication::Running(running) => store.update(&mut |s| s.service_running = *running),
    };
    if let Err(err) = result {
        log::warn!("Failed to persist {publication:?}: {err:#}");
    }
}

#[cfg(test)]
fn snapshot() -> TelemetrySnapshot {
    TelemetrySnapshot {
        percent: 77,
        charge_state: crate::telemetry::ChargeState::Charging,
        charging: true,
        full: false,
        plugged: true,
        temperature_deci_c: 215,
        voltage_mv: 4123,
        captured_at_ms: 0,
    }
}

#[test]
fn test_display_text() {
    let mut update = StatusUpdate {
        state: BroadcastState::Advertising,
        error: String::new(),
        timestamp_ms: 0,
        snapshot: Some(snapshot()),
    };
    assert_eq!(update.display_text(), "77% | 21.5 C | 4123 mV | Charger: ON | TX: ON");

    update.state = BroadcastState::Starting;
    update.snapshot.as_mut().unwrap().full = true;
    assert_eq!(update.display_text(), "77% | 21.5 C | 4123 mV | Charger: FULL | TX: OFF");

    update.state = BroadcastState::RadioUnavailable;
    update.error = "Bluetooth disabled".into();
    assert_eq!(update.display_text(), "TX: OFF | Bluetooth disabled");

    let idle = StatusUpdate { state: BroadcastState::Stopped, error: String::new(), timestamp_ms: 0, snapshot: None };
    assert_eq!(idle.display_text(), "stopped | TX: OFF");
}

#[test]
fn test_deliver_writes_store_and_sink() {
    use crate::settings::MemorySettingsStore;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);
    impl StatusSink for Recorder {
        fn show(&self, update: &StatusUpdate) {
            self.0.lock().unwrap().push(update.display_text());
        }
    }

    let store = MemorySettingsStore::default();
    let sink = Recorder(Mutex::new(Vec::new()));
    deliver(&store, &sink, Publication::Config { device_id: 9, interval_sec: 10 });
    deliver(&store, &sink, Publication::Running(true));
    deliver(
        &store,
        &sink,
        Publication::Status(StatusUpdate {
            state: BroadcastState::HardwareError,
            error: "Advertise error 2".into(),
            timestamp_ms: 1234,
            snapshot: None,
        }),
    );

    let settings = store.load().unwrap();
    assert_eq!(settings.device_id, 9);
    assert_eq!(settings.interval_sec, 10);
    assert!(settings.service_running);
    assert_eq!(settings.ble_status, "hardware_error");
    assert_eq!(settings.ble_error, "Advertise error 2");
    assert_eq!(settings.ble_ts, 1234);
    assert_eq!(sink.0.lock().unwrap().as_slice(), ["TX: OFF | Advertise error 2"]);
}
