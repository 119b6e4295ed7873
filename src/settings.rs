//! Persisted settings and last known broadcast status.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PATH: &str = "batterycast.toml";
pub const DEFAULT_DEVICE_ID: u32 = 1;
pub const DEFAULT_INTERVAL_SEC: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device_id: u32,
    pub interval_sec: i64,
    /// Start broadcasting from `batterycast autostart`
    pub auto_start: bool,
    pub service_running: bool,
    pub ble_status: String,
    pub ble_error: String,
    /// When `ble_status` was last written, ms since the unix epoch
    pub ble_ts: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID,
            interval_sec: DEFAULT_INTERVAL_SEC,
            auto_start: false,
            service_running: false,
            ble_status: "unknown".to_owned(),
            ble_error: String::new(),
            ble_ts: 0,
        }
    }
}

pub trait SettingsStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Settings>;

    fn save(&self, settings: &Settings) -> anyhow::Result<()>;

    /// Load, modify, save.
    fn update(&self, f: &mut dyn FnMut(&mut Settings)) -> anyhow::Result<()> {
        let mut settings = self.load()?;
        f(&mut settings);
        self.save(&settings)
    }
}

/// Settings kept in a TOML file. A missing file reads as the defaults.
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> anyhow::Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading settings from {}", self.path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing settings in {}", self.path.display()))
    }

    fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let text = toml::to_string_pretty(settings)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        // Write then rename so a reader never sees half a file
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self { settings: Mutex::new(settings) }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> anyhow::Result<Settings> {
        let settings = self.settings.lock().map_err(|_| anyhow!("settings lock poisoned"))?;
        Ok(settings.clone())
    }

    fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let mut current = self.settings.lock().map_err(|_| anyhow!("settings lock poisoned"))?;
        *current = settings.clone();
        Ok(())
    }
}

#[test]
fn test_missing_file_reads_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSettingsStore::new(dir.path().join("nope.toml"));
    let settings = store.load().unwrap();
    assert_eq!(settings.device_id, 1);
    assert_eq!(settings.interval_sec, 5);
    assert!(!settings.auto_start);
}

#[test]
fn test_missing_keys_read_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    fs::write(&path, "auto_start = true\ndevice_id = 42\n").unwrap();
    let settings = FileSettingsStore::new(&path).load().unwrap();
    pretty_assertions::assert_eq!(
        settings,
        Settings { device_id: 42, auto_start: true, ..Settings::default() }
    );
}

#[test]
fn test_update_persists() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSettingsStore::new(dir.path().join("sub").join("settings.toml"));
    store
        .update(&mut |s| {
            s.interval_sec = 30;
            s.ble_status = "advertising".into();
        })
        .unwrap();
    let reloaded = FileSettingsStore::new(store.path()).load().unwrap();
    assert_eq!(reloaded.interval_sec, 30);
    assert_eq!(reloaded.ble_status, "advertising");
    assert_eq!(reloaded.device_id, 1);
}

#[test]
fn test_corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    fs::write(&path, "device_id = \"abc\"").unwrap();
    assert!(FileSettingsStore::new(&path).load().is_err());
}
