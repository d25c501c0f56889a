//! Device enumeration and selection

use std::path::{Path, PathBuf};

use anyhow::Result;
use evdev::Device;

/// Information about an input device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub vendor: u16,
    pub product: u16,
    pub is_keyboard: bool,
}

impl DeviceInfo {
    /// Get vendor:product string (e.g., "3434:0361")
    pub fn vendor_product(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor, self.product)
    }
}

fn is_event_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("event"))
        .unwrap_or(false)
}

/// Open every readable `/dev/input/event*` node, sorted by path.
pub fn open_devices() -> Result<Vec<(PathBuf, Device)>> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev/input")? {
        let path = entry?.path();
        if !is_event_node(&path) {
            continue;
        }

        match Device::open(&path) {
            Ok(device) => devices.push((path, device)),
            Err(e) => {
                tracing::debug!("Could not open {}: {}", path.display(), e);
            }
        }
    }

    devices.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(devices)
}

/// Enumerate all input devices
pub fn enumerate_devices() -> Result<Vec<DeviceInfo>> {
    Ok(open_devices()?
        .into_iter()
        .map(|(path, device)| {
            let id = device.input_id();
            DeviceInfo {
                name: device.name().unwrap_or("Unknown").to_string(),
                vendor: id.vendor(),
                product: id.product(),
                is_keyboard: is_keyboard(&device),
                path,
            }
        })
        .collect())
}

/// Check if a device is a keyboard
pub fn is_keyboard(device: &Device) -> bool {
    device
        .supported_events()
        .contains(evdev::EventType::KEY)
        && device
            .supported_keys()
            .map(|keys| keys.contains(evdev::Key::KEY_A))
            .unwrap_or(false)
}

/// Decide whether a keyboard named `name` should be captured.
///
/// Our own virtual device is never captured. An empty allow-list captures
/// every other keyboard.
pub fn should_capture(name: &str, allow_list: &[String], own_name: &str) -> bool {
    if name == own_name {
        return false;
    }
    allow_list.is_empty() || allow_list.iter().any(|allowed| allowed == name)
}
