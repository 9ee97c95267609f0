//! Physical input sources
//!
//! Reads KEY events from evdev devices and feeds them to the router.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use evdev::{Device, EventType, InputEvent};

use crate::router::EventRouter;

/// Information about an input device
#[derive(Debug)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub vendor: u16,
    pub product: u16,
    pub keyboard: bool,
}

impl DeviceInfo {
    /// Get vendor:product string (e.g., "3434:0361")
    pub fn vendor_product(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// Enumerate all input devices
pub fn enumerate_devices() -> Result<Vec<DeviceInfo>> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev/input").context("Failed to read /dev/input")? {
        let path = entry?.path();

        // Only look at event* devices
        if !path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("event"))
            .unwrap_or(false)
        {
            continue;
        }

        match Device::open(&path) {
            Ok(device) => {
                let id = device.input_id();
                devices.push(DeviceInfo {
                    name: device.name().unwrap_or("Unknown").to_string(),
                    vendor: id.vendor(),
                    product: id.product(),
                    keyboard: has_keys(&device),
                    path,
                });
            }
            Err(e) => {
                tracing::debug!("Could not open {}: {}", path.display(), e);
            }
        }
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// Whether a device can produce key events at all
pub fn has_keys(device: &Device) -> bool {
    device.supported_events().contains(EventType::KEY)
        && device
            .supported_keys()
            .map(|keys| keys.iter().next().is_some())
            .unwrap_or(false)
}

/// Raw transition carried by `event`: `(pressed, code)`.
///
/// Kernel autorepeat (value 2) yields `None`; repeat is synthesized by the
/// router.
pub fn key_transition(event: &InputEvent) -> Option<(bool, u32)> {
    if event.event_type() != EventType::KEY {
        return None;
    }

    match event.value() {
        0 => Some((false, u32::from(event.code()))),
        1 => Some((true, u32::from(event.code()))),
        _ => None,
    }
}

/// Read `path` until the device goes away, routing every key transition
/// through `table` (or the default table).
pub async fn run_source(path: &Path, table: Option<&str>, grab: bool, router: EventRouter) -> Result<()> {
    let mut device =
        Device::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    if grab {
        device
            .grab()
            .with_context(|| format!("Failed to grab {}", path.display()))?;
    }

    tracing::info!(
        "Reading keys from {} ({}){}",
        path.display(),
        device.name().unwrap_or("Unknown"),
        if grab { ", grabbed" } else { "" }
    );

    let mut events = device
        .into_event_stream()
        .with_context(|| format!("Failed to stream events from {}", path.display()))?;

    loop {
        let event = events
            .next_event()
            .await
            .with_context(|| format!("Failed to read from {}", path.display()))?;

        let Some((pressed, code)) = key_transition(&event) else {
            continue;
        };

        if let Err(e) = router.key_event(pressed, code, table) {
            tracing::debug!("Key {:#x} from {} not routed: {}", code, path.display(), e);
        }
    }
}
