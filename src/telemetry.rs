use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Charge status as reported by the power supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChargeState {
    Charging,
    Discharging,
    Full,
    NotCharging,
    #[default]
    Unknown,
}

impl ChargeState {
    /// Human readable label, as shown on the status display.
    pub fn label(&self) -> &'static str {
        match self {
            ChargeState::Charging => "charging",
            ChargeState::Discharging => "discharging",
            ChargeState::Full => "full",
            ChargeState::NotCharging => "not charging",
            ChargeState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The values a power supply reports, before any normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReading {
    /// Charge level in units of `scale`. Negative when the source does not know.
    pub level: i32,
    /// Full scale of `level`. Usually 100.
    pub scale: i32,
    pub status: ChargeState,
    /// Whether any external supply is connected
    pub plugged: bool,
    /// Temperature in tenths of a degree Celsius
    pub temperature_deci_c: i32,
    pub voltage_mv: i32,
}

/// Somewhere live battery readings come from.
///
/// `None` means the source is unavailable right now. The sampler turns that
/// into a zeroed snapshot so the broadcast loop keeps running.
pub trait TelemetrySource: Send {
    fn read(&self) -> Option<RawReading>;
}

impl<F> TelemetrySource for F
where
    F: Fn() -> Option<RawReading> + Send,
{
    fn read(&self) -> Option<RawReading> {
        self()
    }
}

/// One sample of the power supply, taken on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Battery level in %. Not clamped, the encoder does that.
    pub percent: i32,
    pub charge_state: ChargeState,
    pub charging: bool,
    pub full: bool,
    pub plugged: bool,
    pub temperature_deci_c: i32,
    pub voltage_mv: i32,
    /// Wall clock time of the sample, ms since the unix epoch
    pub captured_at_ms: i64,
}

impl TelemetrySnapshot {
    /// The snapshot used when the source has nothing to offer.
    pub fn unavailable(captured_at_ms: i64) -> Self {
        Self {
            percent: 0,
            charge_state: ChargeState::Unknown,
            charging: false,
            full: false,
            plugged: false,
            temperature_deci_c: 0,
            voltage_mv: 0,
            captured_at_ms,
        }
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_deci_c as f64 / 10.0
    }
}

/// Pulls snapshots out of a [`TelemetrySource`].
pub struct Sampler {
    source: Box<dyn TelemetrySource>,
}

impl Sampler {
    pub fn new(source: impl TelemetrySource + 'static) -> Self {
        Self { source: Box::new(source) }
    }

    /// Take one snapshot. Never fails.
    pub fn sample(&self) -> TelemetrySnapshot {
        let now = now_ms();
        match self.source.read() {
            Some(raw) => Self::normalize(raw, now),
            None => {
                log::debug!("Telemetry source unavailable, sampling defaults");
                TelemetrySnapshot::unavailable(now)
            }
        }
    }

    fn normalize(raw: RawReading, captured_at_ms: i64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            percent: percent(raw.level, raw.scale),
            charge_state: raw.status,
            charging: raw.status == ChargeState::Charging,
            full: raw.status == ChargeState::Full,
            plugged: raw.plugged,
            temperature_deci_c: raw.temperature_deci_c,
            voltage_mv: raw.voltage_mv,
            captured_at_ms,
        }
    }
}

/// `floor(level * 100 / scale)`, or 0 when either value is unusable.
pub fn percent(level: i32, scale: i32) -> i32 {
    if scale > 0 && level >= 0 {
        (level as i64 * 100 / scale as i64) as i32
    } else {
        0
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn reading(level: i32, status: ChargeState) -> RawReading {
    RawReading {
        level,
        scale: 100,
        status,
        plugged: status == ChargeState::Charging,
        temperature_deci_c: 251,
        voltage_mv: 4012,
    }
}

#[test]
fn test_percent_from_level_and_scale() {
    assert_eq!(percent(77, 100), 77);
    assert_eq!(percent(3, 4), 75);
    assert_eq!(percent(2, 3), 66);
    assert_eq!(percent(-1, 100), 0);
    assert_eq!(percent(50, 0), 0);
    assert_eq!(percent(50, -10), 0);
    assert_eq!(percent(250, 200), 125);
}

#[test]
fn test_sample_unavailable_source() {
    let sampler = Sampler::new(|| None::<RawReading>);
    let before = now_ms();
    let snapshot = sampler.sample();
    assert_eq!(snapshot, TelemetrySnapshot { captured_at_ms: snapshot.captured_at_ms, ..TelemetrySnapshot::unavailable(0) });
    assert!(snapshot.captured_at_ms >= before);
}

#[test]
fn test_sample_derives_flags_from_status() {
    let sampler = Sampler::new(|| Some(reading(80, ChargeState::Full)));
    let snapshot = sampler.sample();
    assert_eq!(snapshot.percent, 80);
    assert!(snapshot.full);
    assert!(!snapshot.charging);
    assert!(!snapshot.plugged);

    let sampler = Sampler::new(|| Some(RawReading { plugged: true, ..reading(40, ChargeState::NotCharging) }));
    let snapshot = sampler.sample();
    assert!(!snapshot.charging);
    assert!(!snapshot.full);
    assert!(snapshot.plugged);
    assert_eq!(snapshot.charge_state.label(), "not charging");
}
