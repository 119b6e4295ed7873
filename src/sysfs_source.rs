//! Battery readings from the Linux power supply class.
//!
//! Every supply is a directory under `/sys/class/power_supply`. Batteries have
//! `type` = `Battery` and expose, among others:
//!
//! File          | Meaning
//! --------------|-----------------------------------------------
//! `capacity`    | charge level in %
//! `status`      | `Charging`, `Discharging`, `Full`, `Not charging` or `Unknown`
//! `temp`        | temperature in tenths of a degree Celsius (optional)
//! `voltage_now` | voltage in µV
//!
//! Mains and USB supplies expose `online`, which tells whether the device is plugged in.

use std::fs;
use std::path::{Path, PathBuf};

use crate::telemetry::{ChargeState, RawReading, TelemetrySource};

pub const DEFAULT_ROOT: &str = "/sys/class/power_supply";

pub struct SysfsTelemetrySource {
    root: PathBuf,
    battery: Option<String>,
}

impl SysfsTelemetrySource {
    /// Read from the first battery found under `/sys/class/power_supply`.
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT, None)
    }

    /// Read from `root`, optionally pinning a specific battery directory such as `BAT1`.
    pub fn with_root(root: impl Into<PathBuf>, battery: Option<String>) -> Self {
        Self { root: root.into(), battery }
    }

    fn battery_dir(&self) -> Option<PathBuf> {
        if let Some(name) = &self.battery {
            let dir = self.root.join(name);
            return dir.is_dir().then_some(dir);
        }
        self.supplies()
            .into_iter()
            .find(|dir| read_trimmed(&dir.join("type")).as_deref() == Some("Battery"))
    }

    fn supplies(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = match fs::read_dir(&self.root) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(err) => {
                log::debug!("Cannot list {}: {err}", self.root.display());
                return Vec::new();
            }
        };
        dirs.sort();
        dirs
    }

    fn external_power_online(&self) -> bool {
        self.supplies().iter().any(|dir| {
            let kind = read_trimmed(&dir.join("type"));
            kind.as_deref() != Some("Battery") && read_int(&dir.join("online")) == Some(1)
        })
    }
}

impl Default for SysfsTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SysfsTelemetrySource {
    fn read(&self) -> Option<RawReading> {
        let dir = self.battery_dir()?;
        let status = read_trimmed(&dir.join("status"))
            .map(|s| parse_status(&s))
            .unwrap_or_default();
        Some(RawReading {
            level: read_int(&dir.join("capacity")).unwrap_or(-1) as i32,
            scale: 100,
            status,
            plugged: status == ChargeState::Charging
                || status == ChargeState::Full
                || self.external_power_online(),
            temperature_deci_c: read_int(&dir.join("temp")).unwrap_or(0) as i32,
            voltage_mv: read_int(&dir.join("voltage_now"))
                .map(|uv| (uv / 1000) as i32)
                .unwrap_or(0),
        })
    }
}

fn parse_status(s: &str) -> ChargeState {
    match s {
        "Charging" => ChargeState::Charging,
        "Discharging" => ChargeState::Discharging,
        "Full" => ChargeState::Full,
        "Not charging" => ChargeState::NotCharging,
        _ => ChargeState::Unknown,
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_owned())
}

fn read_int(path: &Path) -> Option<i64> {
    read_trimmed(path)?.parse().ok()
}

#[cfg(test)]
fn write_supply(root: &Path, name: &str, files: &[(&str, &str)]) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    for (file, value) in files {
        fs::write(dir.join(file), format!("{value}\n")).unwrap();
    }
}

#[test]
fn test_read_battery_and_mains() {
    let root = tempfile::tempdir().unwrap();
    write_supply(root.path(), "AC", &[("type", "Mains"), ("online", "1")]);
    write_supply(
        root.path(),
        "BAT0",
        &[("type", "Battery"), ("capacity", "77"), ("status", "Not charging"), ("temp", "215"), ("voltage_now", "4123000")],
    );

    let reading = SysfsTelemetrySource::with_root(root.path(), None).read().unwrap();
    assert_eq!(
        reading,
        RawReading {
            level: 77,
            scale: 100,
            status: ChargeState::NotCharging,
            plugged: true,
            temperature_deci_c: 215,
            voltage_mv: 4123,
        }
    );
}

#[test]
fn test_missing_files_fall_back() {
    let root = tempfile::tempdir().unwrap();
    write_supply(root.path(), "BAT1", &[("type", "Battery")]);

    let reading = SysfsTelemetrySource::with_root(root.path(), Some("BAT1".into())).read().unwrap();
    assert_eq!(reading.level, -1);
    assert_eq!(reading.status, ChargeState::Unknown);
    assert!(!reading.plugged);
    assert_eq!(reading.voltage_mv, 0);
}

#[test]
fn test_no_battery() {
    let root = tempfile::tempdir().unwrap();
    write_supply(root.path(), "AC", &[("type", "Mains"), ("online", "0")]);
    assert_eq!(SysfsTelemetrySource::with_root(root.path(), None).read(), None);
    assert_eq!(SysfsTelemetrySource::with_root(root.path(), Some("BAT0".into())).read(), None);
}
