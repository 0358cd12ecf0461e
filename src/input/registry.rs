//! Keyboard device discovery
//!
//! Parses the kernel's device listing (`/proc/bus/input/devices`) into
//! [`DeviceInfo`] records and keeps keyboard-class devices only: those whose
//! `EV` bitmask equals [`KEYBOARD_EV_SIGNATURE`] and which expose an
//! `eventN` handler.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::trace;

use super::reader::{open_event_stream, EventSource};
use crate::error::{Error, Result};

/// Default location of the kernel device listing
pub const DEFAULT_DEVICES_FILE: &str = "/proc/bus/input/devices";

/// Default directory holding `eventN` character devices
pub const DEFAULT_INPUT_DIR: &str = "/dev/input";

/// `EV` bitmask of a standard keyboard: SYN | KEY | MSC | LED | REP
pub const KEYBOARD_EV_SIGNATURE: u64 = 0x12_0013;

/// Stable identity of a physical input device
///
/// Two identities are equal iff bus, vendor, product and version all match.
/// The kernel-assigned `eventN` name is deliberately not part of it: it
/// changes across reconnects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceIdentity {
    pub bus: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x}:{:04x}:{:04x}",
            self.bus, self.vendor, self.product, self.version
        )
    }
}

/// One device section of the kernel listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub identity: DeviceIdentity,
    /// Display name (`N: Name="..."`)
    pub name: String,
    /// Physical topology path (`P: Phys=...`)
    pub phys: String,
    /// Handler list (`H: Handlers=...`)
    pub handlers: Vec<String>,
    /// Event type bitmask (`B: EV=...`)
    pub ev: u64,
    /// Event stream locator, e.g. `/dev/input/event3`
    pub event_path: PathBuf,
}

impl DeviceInfo {
    /// Whether the device advertises the standard keyboard capability set
    pub fn is_keyboard(&self) -> bool {
        self.ev == KEYBOARD_EV_SIGNATURE
    }
}

/// Source of the currently connected keyboard devices
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// List keyboard-class devices; fails with [`Error::Enumeration`]
    async fn list_keyboard_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Open the event stream of a listed device
    async fn open_events(&self, device: &DeviceInfo) -> io::Result<Box<dyn EventSource>> {
        let stream = open_event_stream(&device.event_path)?;
        Ok(Box::new(stream))
    }
}

/// Registry backed by the kernel's `/proc` listing
#[derive(Debug, Clone)]
pub struct ProcRegistry {
    devices_file: PathBuf,
    input_dir: PathBuf,
}

impl ProcRegistry {
    pub fn new(devices_file: impl Into<PathBuf>, input_dir: impl Into<PathBuf>) -> Self {
        Self {
            devices_file: devices_file.into(),
            input_dir: input_dir.into(),
        }
    }

    /// Every device with an event handler, keyboard or not
    pub async fn list_all_devices(&self) -> Result<Vec<DeviceInfo>> {
        let text = tokio::fs::read_to_string(&self.devices_file)
            .await
            .map_err(|source| Error::Enumeration {
                path: self.devices_file.clone(),
                source,
            })?;
        Ok(parse_devices(&text, &self.input_dir))
    }
}

impl Default for ProcRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICES_FILE, DEFAULT_INPUT_DIR)
    }
}

#[async_trait]
impl DeviceRegistry for ProcRegistry {
    async fn list_keyboard_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self.list_all_devices().await?;
        Ok(devices.into_iter().filter(DeviceInfo::is_keyboard).collect())
    }
}

/// Parse the whole listing; sections without identity or event handler are dropped
pub fn parse_devices(text: &str, input_dir: &Path) -> Vec<DeviceInfo> {
    text.split("\n\n")
        .filter(|section| !section.trim().is_empty())
        .filter_map(|section| parse_section(section, input_dir))
        .collect()
}

fn parse_section(section: &str, input_dir: &Path) -> Option<DeviceInfo> {
    let mut identity = None;
    let mut name = String::new();
    let mut phys = String::new();
    let mut handlers = Vec::new();
    let mut ev = 0;

    for line in section.lines() {
        let Some((tag, rest)) = line.split_once(": ") else {
            continue;
        };
        match tag {
            "I" => identity = parse_identity(rest),
            "N" => {
                name = rest
                    .trim_start_matches("Name=")
                    .trim()
                    .trim_matches('"')
                    .to_string();
            }
            "P" => phys = rest.trim_start_matches("Phys=").trim().to_string(),
            "H" => {
                handlers = rest
                    .trim_start_matches("Handlers=")
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
            }
            "B" => {
                if let Some(mask) = rest.strip_prefix("EV=") {
                    ev = u64::from_str_radix(mask.trim(), 16).unwrap_or(0);
                }
            }
            _ => {}
        }
    }

    let Some(identity) = identity else {
        trace!("Skipping device section without identification: {:?}", name);
        return None;
    };
    let handler = handlers.iter().find(|h| h.starts_with("event"))?;
    let event_path = input_dir.join(handler);

    Some(DeviceInfo {
        identity,
        name,
        phys,
        handlers,
        ev,
        event_path,
    })
}

/// `Bus=0003 Vendor=046d Product=c31c Version=0110`
fn parse_identity(rest: &str) -> Option<DeviceIdentity> {
    let mut bus = None;
    let mut vendor = None;
    let mut product = None;
    let mut version = None;

    for field in rest.split_whitespace() {
        let (key, value) = field.split_once('=')?;
        let value = u16::from_str_radix(value, 16).ok()?;
        match key {
            "Bus" => bus = Some(value),
            "Vendor" => vendor = Some(value),
            "Product" => product = Some(value),
            "Version" => version = Some(value),
            _ => {}
        }
    }

    Some(DeviceIdentity {
        bus: bus?,
        vendor: vendor?,
        product: product?,
        version: version?,
    })
}
