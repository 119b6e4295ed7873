//! The broadcast state machine.
//!
//! ```text
//!            start                 tick ok + started callback
//! Stopped ─────────► Starting ─────────────────────────► Advertising
//!    ▲                  │  tick: permission / radio off / absent    │
//!    │                  ├────────────────────► RadioUnavailable ◄────┤ radio off
//!    │                  │  failed callback                  │ radio on: tick now
//!    │                  └────────────────────► HardwareError ◄───────┘
//!    │ stop (from any running state, via Stopping)
//! ```
//!
//! Every tick samples, encodes, and restarts the advertisement with the new
//! frame, then waits the same fixed interval whatever the outcome.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::frame::{encode, Layout};
use crate::publisher::{StatusPublisher, StatusUpdate};
use crate::radio::{AdvertiseParams, Radio, RadioError, RadioEvent, DEVICE_NAME};
use crate::telemetry::{now_ms, Sampler, TelemetrySnapshot};
use crate::wake_lock::{WakeLock, WakeLockGuard};

pub const MIN_INTERVAL_SEC: i64 = 1;
pub const MAX_INTERVAL_SEC: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Stopped,
    Starting,
    Advertising,
    RadioUnavailable,
    HardwareError,
    Stopping,
}

impl BroadcastState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastState::Stopped => "stopped",
            BroadcastState::Starting => "starting",
            BroadcastState::Advertising => "advertising",
            BroadcastState::RadioUnavailable => "radio_unavailable",
            BroadcastState::HardwareError => "hardware_error",
            BroadcastState::Stopping => "stopping",
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self, BroadcastState::Stopped)
    }

    /// States in which ticks are taken.
    fn ticks(&self) -> bool {
        !matches!(self, BroadcastState::Stopped | BroadcastState::Stopping)
    }
}

impl fmt::Display for BroadcastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device id and interval as supplied by the caller. Sanitised on use, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    pub device_id: u32,
    pub interval_sec: i64,
}

impl BroadcastConfig {
    pub fn device_id(&self) -> u16 {
        (self.device_id & 0xFFFF) as u16
    }

    pub fn interval_sec(&self) -> i64 {
        self.interval_sec.clamp(MIN_INTERVAL_SEC, MAX_INTERVAL_SEC)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec() as u64)
    }
}

/// What `status()` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastStatus {
    pub state: BroadcastState,
    pub error_message: String,
    pub last_update_ms: i64,
    pub radio_power_on: bool,
    pub is_running: bool,
}

/// Collaborators a [`Broadcaster`] drives.
pub struct Parts {
    pub sampler: Sampler,
    pub radio: Box<dyn Radio>,
    pub wake_lock: Box<dyn WakeLock>,
    pub publisher: StatusPublisher,
    pub layout: Layout,
    pub params: AdvertiseParams,
}

/// The scheduler. Not thread safe by design of its callers: it is owned by a
/// single worker (see [`crate::worker`]) which feeds it every input in order.
pub struct Broadcaster {
    sampler: Sampler,
    radio: Box<dyn Radio>,
    wake_lock: Box<dyn WakeLock>,
    publisher: StatusPublisher,
    layout: Layout,
    params: AdvertiseParams,

    state: BroadcastState,
    error: String,
    last_update_ms: i64,
    config: BroadcastConfig,
    sequence: u8,
    /// Sequence of the frame whose start outcome is awaited
    pending: Option<u8>,
    last_snapshot: Option<TelemetrySnapshot>,
    next_tick: Option<Instant>,
    wake_guard: Option<WakeLockGuard>,
    hardware_failures: u32,
}

impl Broadcaster {
    pub fn new(parts: Parts) -> Self {
        Self {
            sampler: parts.sampler,
            radio: parts.radio,
            wake_lock: parts.wake_lock,
            publisher: parts.publisher,
            layout: parts.layout,
            params: parts.params,
            state: BroadcastState::Stopped,
            error: String::new(),
            last_update_ms: 0,
            config: BroadcastConfig {
                device_id: crate::settings::DEFAULT_DEVICE_ID,
                interval_sec: crate::settings::DEFAULT_INTERVAL_SEC,
            },
            sequence: 0,
            pending: None,
            last_snapshot: None,
            next_tick: None,
            wake_guard: None,
            hardware_failures: 0,
        }
    }

    pub fn state(&self) -> BroadcastState {
        self.state
    }

    pub fn config(&self) -> BroadcastConfig {
        self.config
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Sequence the next frame will carry
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Hardware rejections in a row. A warning is logged from the second one on.
    pub fn hardware_failures(&self) -> u32 {
        self.hardware_failures
    }

    /// When the timer fires next, if it is armed.
    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn status(&self) -> BroadcastStatus {
        BroadcastStatus {
            state: self.state,
            error_message: self.error.clone(),
            last_update_ms: self.last_update_ms,
            radio_power_on: self.radio.is_powered_on(),
            is_running: self.state.is_running(),
        }
    }

    /// Begin broadcasting, or reconfigure a running broadcast. The first tick is due immediately.
    pub fn start(&mut self, device_id: u32, interval_sec: i64, now: Instant) {
        self.config = BroadcastConfig { device_id, interval_sec };
        self.publisher.persist_config(device_id, self.config.interval_sec());

        if !self.state.is_running() {
            self.wake_guard = match self.wake_lock.acquire() {
                Ok(guard) => Some(guard),
                Err(err) => {
                    log::warn!("Wake lock not acquired: {err:#}");
                    None
                }
            };
            self.publisher.set_running(true);
        }
        self.apply_name();
        // Outcomes of frames submitted under the previous config no longer count
        self.pending = None;

        log::info!(
            "Starting broadcast: device id {} every {}s ({:?} layout)",
            self.config.device_id(),
            self.config.interval_sec(),
            self.layout
        );
        self.next_tick = Some(now);
        self.transition(BroadcastState::Starting, String::new());
    }

    /// Stop broadcasting. Once this returns no timer is armed and nothing is on air.
    pub fn stop(&mut self) {
        if !self.state.is_running() {
            return;
        }
        self.next_tick = None;
        self.transition(BroadcastState::Stopping, String::new());

        self.radio.stop_advertising();
        self.pending = None;
        self.wake_guard = None;
        self.hardware_failures = 0;

        self.publisher.set_running(false);
        log::info!("Broadcast stopped");
        self.transition(BroadcastState::Stopped, String::new());
    }

    /// The timer fired. Re-arms the timer whatever the outcome.
    pub fn on_tick(&mut self, now: Instant) {
        if !self.state.ticks() {
            return;
        }
        self.next_tick = Some(now + self.config.interval());
        self.advertise_once();
    }

    pub fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::AdvertiseStarted { sequence } => {
                if !self.is_pending(sequence) {
                    log::debug!("Ignoring stale start of seq {sequence}");
                    return;
                }
                self.pending = None;
                self.hardware_failures = 0;
                self.transition(BroadcastState::Advertising, String::new());
            }
            RadioEvent::AdvertiseFailed { sequence, code } => {
                if !self.is_pending(sequence) {
                    log::debug!("Ignoring stale failure of seq {sequence}: {code}");
                    return;
                }
                self.pending = None;
                self.hardware_failures += 1;
                if self.hardware_failures > 1 {
                    // No backoff: retried at the normal interval for as long as it keeps failing
                    log::warn!("Advertise rejected {} times in a row (code {code})", self.hardware_failures);
                }
                self.fail(RadioError::HardwareStartFailure(code));
            }
            RadioEvent::PowerChanged { on: false } => {
                if !self.state.ticks() {
                    return;
                }
                self.radio.stop_advertising();
                self.pending = None;
                self.fail(RadioError::RadioOff);
            }
            RadioEvent::PowerChanged { on: true } => {
                if self.state != BroadcastState::RadioUnavailable {
                    return;
                }
                log::info!("Radio powered on, retrying now");
                self.apply_name();
                self.advertise_once();
            }
        }
    }

    fn is_pending(&self, sequence: u8) -> bool {
        self.state.ticks() && self.pending == Some(sequence)
    }

    fn advertise_once(&mut self) {
        let snapshot = self.sampler.sample();
        let frame = encode(self.config.device_id, &snapshot, self.sequence as u32, self.layout);
        self.sequence = self.sequence.wrapping_add(1);
        self.last_snapshot = Some(snapshot);
        log::debug!("Encoded {frame:?}");

        if let Err(err) = self.radio.check_ready() {
            self.pending = None;
            self.fail(err);
            return;
        }
        self.radio.stop_advertising();
        self.radio.start_advertising(&self.params, &frame);
        self.pending = Some(frame.sequence());
        // State follows once the radio reports back; refresh the reading meanwhile
        self.publish();
    }

    fn fail(&mut self, err: RadioError) {
        let state = match err {
            RadioError::HardwareStartFailure(_) => BroadcastState::HardwareError,
            RadioError::PermissionMissing
            | RadioError::RadioOff
            | RadioError::RadioAbsent
            | RadioError::AdvertiserUnavailable => BroadcastState::RadioUnavailable,
        };
        self.transition(state, err.to_string());
    }

    fn apply_name(&mut self) {
        if let Err(err) = self.radio.set_name(DEVICE_NAME) {
            log::debug!("Could not rename adapter: {err:#}");
        }
    }

    fn transition(&mut self, state: BroadcastState, error: String) {
        if state != self.state || error != self.error {
            log::info!("Broadcast {} -> {}{}", self.state, state, if error.is_empty() { String::new() } else { format!(": {error}") });
        }
        self.state = state;
        self.error = error;
        self.publish();
    }

    fn publish(&mut self) {
        self.last_update_ms = now_ms();
        self.publisher.publish(StatusUpdate {
            state: self.state,
            error: self.error.clone(),
            timestamp_ms: self.last_update_ms,
            snapshot: self.last_snapshot.clone(),
        });
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        if self.state.is_running() {
            self.radio.stop_advertising();
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::frame::Frame;
    use crate::publisher::Publication;
    use crate::telemetry::{reading, ChargeState};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Start(Frame),
        Stop,
        Name(String),
    }

    #[derive(Default)]
    pub struct FakeRadioState {
        pub ready: Option<RadioError>,
        pub calls: Vec<Call>,
        pub powered: bool,
    }

    #[derive(Clone, Default)]
    pub struct FakeRadio(pub Arc<Mutex<FakeRadioState>>);

    impl FakeRadio {
        pub fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().calls.clone()
        }

        pub fn starts(&self) -> Vec<Frame> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Start(frame) => Some(frame),
                    _ => None,
                })
                .collect()
        }

        pub fn set_ready(&self, ready: Option<RadioError>) {
            self.0.lock().unwrap().ready = ready;
        }

        pub fn clear(&self) {
            self.0.lock().unwrap().calls.clear();
        }

        pub fn set_powered(&self, powered: bool) {
            self.0.lock().unwrap().powered = powered;
        }
    }

    impl Radio for FakeRadio {
        fn check_ready(&self) -> Result<(), RadioError> {
            match self.0.lock().unwrap().ready {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn start_advertising(&mut self, _params: &AdvertiseParams, frame: &Frame) {
            self.0.lock().unwrap().calls.push(Call::Start(*frame));
        }

        fn stop_advertising(&mut self) {
            self.0.lock().unwrap().calls.push(Call::Stop);
        }

        fn is_powered_on(&self) -> bool {
            self.0.lock().unwrap().powered
        }

        fn set_name(&mut self, name: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().calls.push(Call::Name(name.to_owned()));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    pub struct CountingWakeLock(pub Arc<Mutex<(u32, u32)>>);

    impl CountingWakeLock {
        pub fn held(&self) -> bool {
            let (acquired, released) = *self.0.lock().unwrap();
            acquired > released
        }

        pub fn counts(&self) -> (u32, u32) {
            *self.0.lock().unwrap()
        }
    }

    impl WakeLock for CountingWakeLock {
        fn acquire(&self) -> anyhow::Result<WakeLockGuard> {
            self.0.lock().unwrap().0 += 1;
            let counts = self.0.clone();
            Ok(WakeLockGuard::new(move || counts.lock().unwrap().1 += 1))
        }
    }

    pub struct Rig {
        pub broadcaster: Broadcaster,
        pub radio: FakeRadio,
        pub wake_lock: CountingWakeLock,
        pub published: tokio::sync::mpsc::UnboundedReceiver<Publication>,
    }

    impl Rig {
        pub fn new(layout: Layout) -> Self {
            let radio = FakeRadio::default();
            let wake_lock = CountingWakeLock::default();
            let (publisher, published) = StatusPublisher::channel();
            let broadcaster = Broadcaster::new(Parts {
                sampler: Sampler::new(|| Some(reading(77, ChargeState::Charging))),
                radio: Box::new(radio.clone()),
                wake_lock: Box::new(wake_lock.clone()),
                publisher,
                layout,
                params: AdvertiseParams::default(),
            });
            Self { broadcaster, radio, wake_lock, published }
        }

        pub fn states(&mut self) -> Vec<BroadcastState> {
            let mut states = Vec::new();
            while let Ok(publication) = self.published.try_recv() {
                if let Publication::Status(update) = publication {
                    if states.last() != Some(&update.state) {
                        states.push(update.state);
                    }
                }
            }
            states
        }

        pub fn drain(&mut self) -> Vec<Publication> {
            let mut all = Vec::new();
            while let Ok(publication) = self.published.try_recv() {
                all.push(publication);
            }
            all
        }
    }
}

#[cfg(test)]
use test_support::{Call, Rig};

#[test]
fn test_start_then_stop_before_tick() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 5, now);
    assert_eq!(rig.broadcaster.state(), BroadcastState::Starting);
    assert_eq!(rig.broadcaster.next_tick(), Some(now));
    assert!(rig.wake_lock.held());

    rig.broadcaster.stop();
    assert_eq!(rig.broadcaster.state(), BroadcastState::Stopped);
    assert_eq!(rig.broadcaster.next_tick(), None);
    assert!(rig.radio.starts().is_empty());
    assert!(!rig.wake_lock.held());
    assert_eq!(
        rig.states(),
        vec![BroadcastState::Starting, BroadcastState::Stopping, BroadcastState::Stopped]
    );
}

#[test]
fn test_tick_restarts_advertisement_and_rearms() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(7, 5, now);
    rig.radio.clear();

    rig.broadcaster.on_tick(now);
    assert_eq!(rig.broadcaster.next_tick(), Some(now + Duration::from_secs(5)));
    let calls = rig.radio.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], Call::Stop);
    match &calls[1] {
        Call::Start(frame) => {
            assert_eq!(frame.as_bytes(), hex::decode("07004d05fb00ac0f00").unwrap().as_slice());
        }
        other => panic!("unexpected call {other:?}"),
    }
    // Still starting until the radio confirms
    assert_eq!(rig.broadcaster.state(), BroadcastState::Starting);

    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 0 });
    assert_eq!(rig.broadcaster.state(), BroadcastState::Advertising);
    assert_eq!(rig.broadcaster.status().error_message, "");
}

#[test]
fn test_interval_is_clamped() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 0, now);
    rig.broadcaster.on_tick(now);
    assert_eq!(rig.broadcaster.next_tick(), Some(now + Duration::from_secs(1)));

    rig.broadcaster.start(1, 3600, now);
    rig.broadcaster.on_tick(now);
    assert_eq!(rig.broadcaster.next_tick(), Some(now + Duration::from_secs(60)));

    let persisted: Vec<_> = rig
        .drain()
        .into_iter()
        .filter(|p| matches!(p, crate::publisher::Publication::Config { .. }))
        .collect();
    assert_eq!(
        persisted,
        vec![
            crate::publisher::Publication::Config { device_id: 1, interval_sec: 1 },
            crate::publisher::Publication::Config { device_id: 1, interval_sec: 60 },
        ]
    );
}

#[test]
fn test_preflight_failures_map_to_radio_unavailable() {
    for err in [RadioError::PermissionMissing, RadioError::RadioOff, RadioError::RadioAbsent, RadioError::AdvertiserUnavailable] {
        let mut rig = Rig::new(Layout::Versioned);
        let now = Instant::now();
        rig.radio.set_ready(Some(err));
        rig.broadcaster.start(1, 5, now);
        rig.radio.clear();
        rig.broadcaster.on_tick(now);

        let status = rig.broadcaster.status();
        assert_eq!(status.state, BroadcastState::RadioUnavailable);
        assert_eq!(status.error_message, err.to_string());
        assert!(status.is_running);
        assert!(rig.radio.starts().is_empty());
        // The timer keeps running
        assert_eq!(rig.broadcaster.next_tick(), Some(now + Duration::from_secs(5)));
    }
}

#[test]
fn test_hardware_failure_retries_at_same_interval() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 10, now);
    rig.broadcaster.on_tick(now);
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseFailed { sequence: 0, code: 3 });
    assert_eq!(rig.broadcaster.state(), BroadcastState::HardwareError);
    assert_eq!(rig.broadcaster.status().error_message, "Advertise error 3");

    let later = now + Duration::from_secs(10);
    rig.broadcaster.on_tick(later);
    assert_eq!(rig.broadcaster.next_tick(), Some(later + Duration::from_secs(10)));
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 1 });
    assert_eq!(rig.broadcaster.state(), BroadcastState::Advertising);
}

#[test]
fn test_stale_callbacks_are_ignored() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 5, now);
    rig.broadcaster.on_tick(now);
    rig.broadcaster.on_tick(now + Duration::from_secs(5));

    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseFailed { sequence: 0, code: 1 });
    assert_eq!(rig.broadcaster.state(), BroadcastState::Starting);

    rig.broadcaster.stop();
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 1 });
    assert_eq!(rig.broadcaster.state(), BroadcastState::Stopped);
}

#[test]
fn test_late_start_after_failed_preflight_is_ignored() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 5, now);
    rig.broadcaster.on_tick(now);

    rig.radio.set_ready(Some(RadioError::PermissionMissing));
    rig.broadcaster.on_tick(now + Duration::from_secs(5));
    assert_eq!(rig.broadcaster.state(), BroadcastState::RadioUnavailable);

    // Outcome of the frame submitted before the failed tick
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 0 });
    let status = rig.broadcaster.status();
    assert_eq!(status.state, BroadcastState::RadioUnavailable);
    assert_eq!(status.error_message, "BLE permission pending");
}

#[test]
fn test_late_start_after_reconfigure_is_ignored() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 5, now);
    rig.broadcaster.on_tick(now);

    rig.broadcaster.start(2, 10, now + Duration::from_secs(1));
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 0 });
    assert_eq!(rig.broadcaster.state(), BroadcastState::Starting);

    rig.broadcaster.on_tick(now + Duration::from_secs(1));
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 1 });
    assert_eq!(rig.broadcaster.state(), BroadcastState::Advertising);
}

#[test]
fn test_hardware_failures_counted_until_success() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 5, now);
    for sequence in 0..3u8 {
        rig.broadcaster.on_tick(now + Duration::from_secs(5 * sequence as u64));
        rig.broadcaster.on_radio_event(RadioEvent::AdvertiseFailed { sequence, code: 4 });
    }
    assert_eq!(rig.broadcaster.hardware_failures(), 3);
    assert_eq!(rig.broadcaster.state(), BroadcastState::HardwareError);

    rig.broadcaster.on_tick(now + Duration::from_secs(15));
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 3 });
    assert_eq!(rig.broadcaster.hardware_failures(), 0);
}

#[test]
fn test_status_reports_radio_power() {
    let mut rig = Rig::new(Layout::Legacy);
    assert!(!rig.broadcaster.status().radio_power_on);
    rig.radio.set_powered(true);
    assert!(rig.broadcaster.status().radio_power_on);

    rig.broadcaster.start(1, 5, Instant::now());
    rig.radio.set_powered(false);
    let status = rig.broadcaster.status();
    assert!(!status.radio_power_on);
    assert!(status.is_running);
}

#[test]
fn test_radio_off_then_on_retries_immediately() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 30, now);
    rig.broadcaster.on_tick(now);
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 0 });
    assert_eq!(rig.broadcaster.state(), BroadcastState::Advertising);
    rig.radio.clear();

    rig.radio.set_ready(Some(RadioError::RadioOff));
    rig.broadcaster.on_radio_event(RadioEvent::PowerChanged { on: false });
    assert_eq!(rig.broadcaster.state(), BroadcastState::RadioUnavailable);
    assert_eq!(rig.broadcaster.status().error_message, "Bluetooth disabled");
    assert_eq!(rig.radio.calls(), vec![Call::Stop]);
    rig.radio.clear();

    rig.radio.set_ready(None);
    rig.broadcaster.on_radio_event(RadioEvent::PowerChanged { on: true });
    // Retried without waiting for the timer, which keeps its schedule
    assert_eq!(rig.radio.starts().len(), 1);
    assert_eq!(rig.broadcaster.next_tick(), Some(now + Duration::from_secs(30)));
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 1 });
    assert_eq!(rig.broadcaster.state(), BroadcastState::Advertising);
}

#[test]
fn test_power_on_while_advertising_is_ignored() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 5, now);
    rig.broadcaster.on_tick(now);
    rig.broadcaster.on_radio_event(RadioEvent::AdvertiseStarted { sequence: 0 });
    rig.radio.clear();
    rig.broadcaster.on_radio_event(RadioEvent::PowerChanged { on: true });
    assert!(rig.radio.calls().is_empty());
}

#[test]
fn test_power_events_while_stopped_are_ignored() {
    let mut rig = Rig::new(Layout::Legacy);
    rig.broadcaster.on_radio_event(RadioEvent::PowerChanged { on: false });
    rig.broadcaster.on_radio_event(RadioEvent::PowerChanged { on: true });
    assert_eq!(rig.broadcaster.state(), BroadcastState::Stopped);
    assert!(rig.radio.calls().is_empty());
}

#[test]
fn test_stop_is_idempotent() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 5, now);
    rig.broadcaster.on_tick(now);
    rig.broadcaster.stop();
    let once = rig.broadcaster.status();
    rig.drain();

    rig.broadcaster.stop();
    assert_eq!(rig.broadcaster.status(), once);
    assert!(rig.drain().is_empty());
    assert_eq!(rig.wake_lock.counts(), (1, 1));
}

#[test]
fn test_tick_after_stop_does_nothing() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 5, now);
    rig.broadcaster.stop();
    rig.radio.clear();
    rig.broadcaster.on_tick(now);
    assert!(rig.radio.calls().is_empty());
    assert_eq!(rig.broadcaster.next_tick(), None);
}

#[test]
fn test_sequence_wraps_after_256_ticks() {
    let mut rig = Rig::new(Layout::Versioned);
    let now = Instant::now();
    rig.broadcaster.start(1, 1, now);
    for _ in 0..257 {
        rig.broadcaster.on_tick(now);
    }
    let sequences: Vec<u8> = rig.radio.starts().iter().map(|f| f.sequence()).collect();
    assert_eq!(sequences.len(), 257);
    assert_eq!(sequences[0], 0);
    assert_eq!(sequences[255], 255);
    assert_eq!(sequences[256], 0);
    assert_eq!(rig.broadcaster.sequence(), 1);
}

#[test]
fn test_restart_while_running_keeps_wake_lock() {
    let mut rig = Rig::new(Layout::Legacy);
    let now = Instant::now();
    rig.broadcaster.start(1, 5, now);
    rig.broadcaster.on_tick(now);
    rig.broadcaster.start(2, 20, now + Duration::from_secs(1));
    assert_eq!(rig.broadcaster.state(), BroadcastState::Starting);
    assert_eq!(rig.broadcaster.next_tick(), Some(now + Duration::from_secs(1)));
    assert_eq!(rig.broadcaster.config().device_id(), 2);
    assert_eq!(rig.wake_lock.counts(), (1, 0));
}

#[test]
fn test_drop_releases_wake_lock() {
    let rig = Rig::new(Layout::Legacy);
    let wake_lock = rig.wake_lock.clone();
    let radio = rig.radio.clone();
    let mut broadcaster = rig.broadcaster;
    broadcaster.start(1, 5, Instant::now());
    drop(broadcaster);
    assert!(!wake_lock.held());
    assert_eq!(radio.calls().last(), Some(&Call::Stop));
}
