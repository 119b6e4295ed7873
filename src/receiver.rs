//! Passive receiver for broadcast frames.
//!
//! Scans for advertisements, picks out the manufacturer data carrying frames
//! and decodes them. Nothing is ever connected to.

use std::collections::HashMap;

use anyhow::anyhow;
use bluest::Adapter;
use futures_util::StreamExt;

use crate::frame::{decode, DecodedFrame, MANUFACTURER_ID};

const UNNAMED: &str = "UNNAMED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    Prefix(String),
    Exact(String),
}

impl NameMatch {
    fn matches(&self, name: &str) -> bool {
        if name == UNNAMED {
            return false;
        }
        match self {
            NameMatch::Prefix(prefix) => name.starts_with(prefix.as_str()),
            NameMatch::Exact(exact) => name == exact,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanFilter {
    pub company_id: u16,
    pub name: Option<NameMatch>,
    /// Report a device only when its sequence number changes
    pub only_on_change: bool,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self { company_id: MANUFACTURER_ID, name: None, only_on_change: true }
    }
}

/// A frame heard from some device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub name: String,
    pub device: String,
    pub rssi: Option<i16>,
    pub frame: DecodedFrame,
    pub raw: Vec<u8>,
}

impl Sighting {
    /// One log line, prefixed with `time`
    pub fn line(&self, time: &str) -> String {
        let rssi = self.rssi.map(|r| r.to_string()).unwrap_or_else(|| "N/A".to_owned());
        let f = &self.frame;
        format!(
            "{time} | {} | {} | RSSI {rssi} | id={} seq={} batt={}% temp={:.1}C volt={}mV flags={} | raw={}",
            self.name,
            self.device,
            f.device_id,
            f.sequence,
            f.percent,
            f.temperature_c(),
            f.voltage_mv,
            f.flags_text(),
            hex::encode(&self.raw),
        )
    }
}

/// Applies a [`ScanFilter`] to advertisements, remembering the last sequence seen per device.
pub struct FrameFilter {
    filter: ScanFilter,
    last_seq: HashMap<String, u8>,
}

impl FrameFilter {
    pub fn new(filter: ScanFilter) -> Self {
        Self { filter, last_seq: HashMap::new() }
    }

    pub fn accept(
        &mut self,
        device: &str,
        name: Option<&str>,
        rssi: Option<i16>,
        manufacturer_data: Option<(u16, &[u8])>,
    ) -> Option<Sighting> {
        let (company_id, payload) = manufacturer_data?;
        if company_id != self.filter.company_id {
            return None;
        }
        let name = name.filter(|n| !n.is_empty()).unwrap_or(UNNAMED);
        if let Some(name_match) = &self.filter.name {
            if !name_match.matches(name) {
                return None;
            }
        }
        let frame = match decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("{device}: {err}: {}", hex::encode(payload));
                return None;
            }
        };
        if self.filter.only_on_change && self.last_seq.insert(device.to_owned(), frame.sequence) == Some(frame.sequence) {
            return None;
        }
        Some(Sighting {
            name: name.to_owned(),
            device: device.to_owned(),
            rssi,
            frame,
            raw: payload.to_vec(),
        })
    }
}

/// Scan until the adapter stops reporting, handing every accepted frame to `on_frame`.
pub async fn scan(filter: ScanFilter, mut on_frame: impl FnMut(Sighting)) -> anyhow::Result<()> {
    let adapter = Adapter::default()
        .await
        .ok_or(anyhow!("Default adapter not found"))?;
    adapter.wait_available().await?;

    let mut frames = FrameFilter::new(filter);
    let mut advertisements = adapter.scan(&[]).await?;
    while let Some(found) = advertisements.next().await {
        let device = format!("{:?}", found.device.id());
        let name = match &found.adv_data.local_name {
            Some(name) => Some(name.clone()),
            None => found.device.name_async().await.ok(),
        };
        let manufacturer_data = found
            .adv_data
            .manufacturer_data
            .as_ref()
            .map(|m| (m.company_id, &m.data[..]));
        if let Some(sighting) = frames.accept(&device, name.as_deref(), found.rssi, manufacturer_data) {
            on_frame(sighting);
        }
    }

    Err(anyhow!("end of scan stream"))
}

#[cfg(test)]
fn payload() -> Vec<u8> {
    hex::decode("01004d05d7001b1005").unwrap()
}

#[test]
fn test_accept_decodes_matching_company() {
    let mut filter = FrameFilter::new(ScanFilter::default());
    let sighting = filter
        .accept("AA:BB", Some("HT-MT"), Some(-61), Some((0xFFFF, &payload()[..])))
        .unwrap();
    assert_eq!(sighting.frame.percent, 77);
    assert_eq!(
        sighting.line("12:00:00"),
        "12:00:00 | HT-MT | AA:BB | RSSI -61 | id=1 seq=5 batt=77% temp=21.5C volt=4123mV flags=0x05 (C=1 F=0 P=1) | raw=01004d05d7001b1005"
    );
}

#[test]
fn test_accept_rejects_other_companies_and_short_payloads() {
    let mut filter = FrameFilter::new(ScanFilter::default());
    assert_eq!(filter.accept("AA:BB", None, None, Some((0x004C, &payload()[..]))), None);
    assert_eq!(filter.accept("AA:BB", None, None, Some((0xFFFF, &[0x01u8, 0x02][..]))), None);
    assert_eq!(filter.accept("AA:BB", None, None, None), None);
}

#[test]
fn test_only_on_change() {
    let mut filter = FrameFilter::new(ScanFilter::default());
    assert!(filter.accept("AA:BB", None, None, Some((0xFFFF, &payload()[..]))).is_some());
    assert!(filter.accept("AA:BB", None, None, Some((0xFFFF, &payload()[..]))).is_none());
    // Another device with the same sequence is still new
    assert!(filter.accept("CC:DD", None, None, Some((0xFFFF, &payload()[..]))).is_some());

    let mut next = payload();
    next[8] = 6;
    assert!(filter.accept("AA:BB", None, None, Some((0xFFFF, &next[..]))).is_some());

    let mut every = FrameFilter::new(ScanFilter { only_on_change: false, ..ScanFilter::default() });
    assert!(every.accept("AA:BB", None, None, Some((0xFFFF, &payload()[..]))).is_some());
    assert!(every.accept("AA:BB", None, None, Some((0xFFFF, &payload()[..]))).is_some());
}

#[test]
fn test_name_filter() {
    let prefix = ScanFilter { name: Some(NameMatch::Prefix("HT-".into())), ..ScanFilter::default() };
    let mut filter = FrameFilter::new(prefix);
    assert!(filter.accept("1", Some("HT-MT"), None, Some((0xFFFF, &payload()[..]))).is_some());
    assert!(filter.accept("2", Some("Phone"), None, Some((0xFFFF, &payload()[..]))).is_none());
    assert!(filter.accept("3", None, None, Some((0xFFFF, &payload()[..]))).is_none());

    let exact = ScanFilter { name: Some(NameMatch::Exact("HT-MT".into())), ..ScanFilter::default() };
    let mut filter = FrameFilter::new(exact);
    assert!(filter.accept("1", Some("HT-MT2"), None, Some((0xFFFF, &payload()[..]))).is_none());
    assert!(filter.accept("1", Some("HT-MT"), None, Some((0xFFFF, &payload()[..]))).is_some());
}
