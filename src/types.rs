// Shared types module - Chip types, plugin status, device records and the station registry

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Supported I2C port-extender chips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipType {
    Pcf8574,
    Pcf8575,
    #[serde(alias = "mcp2308")]
    Mcp23008,
    Mcp23017,
}

impl ChipType {
    /// Order matches the chip-type selector on the settings page.
    pub const ALL: [ChipType; 4] = [
        ChipType::Pcf8574,
        ChipType::Pcf8575,
        ChipType::Mcp23008,
        ChipType::Mcp23017,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChipType::Pcf8574 => "pcf8574",
            ChipType::Pcf8575 => "pcf8575",
            ChipType::Mcp23008 => "mcp23008",
            ChipType::Mcp23017 => "mcp23017",
        }
    }

    /// Number of output pins, i.e. stations one chip can drive
    pub fn port_width(&self) -> usize {
        match self {
            ChipType::Pcf8574 | ChipType::Mcp23008 => 8,
            ChipType::Pcf8575 | ChipType::Mcp23017 => 16,
        }
    }

    pub fn port_mask(&self) -> u16 {
        match self.port_width() {
            8 => 0x00ff,
            _ => 0xffff,
        }
    }
}

impl fmt::Display for ChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pcf8574" => Ok(ChipType::Pcf8574),
            "pcf8575" => Ok(ChipType::Pcf8575),
            "mcp23008" | "mcp2308" => Ok(ChipType::Mcp23008),
            "mcp23017" => Ok(ChipType::Mcp23017),
            other => Err(format!("unsupported chip type: {}", other)),
        }
    }
}

// Plugin status shown in the settings page banner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PexStatus {
    Enabled,
    Disabled,
    Unconfigured,
}

impl PexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PexStatus::Enabled => "enabled",
            PexStatus::Disabled => "disabled",
            PexStatus::Unconfigured => "unconfigured",
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, PexStatus::Enabled)
    }
}

impl fmt::Display for PexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One port-extender chip and the half-open station range `[first, last)` it drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub bus_id: u8,
    pub hw_addr: u8,
    pub ic_type: ChipType,
    pub first: usize,
    pub last: usize,
    #[serde(default)]
    pub active_low: bool,  // Relay board switches on a low output
}

impl DeviceConfig {
    pub fn span(&self) -> usize {
        self.last.saturating_sub(self.first)
    }
}

// Ordered station names, indexable by station index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationRegistry {
    names: Vec<String>,
}

impl StationRegistry {
    pub fn new(names: Vec<String>) -> Self {
        StationRegistry { names }
    }

    /// SIP's default naming: S01, S02, ...
    pub fn with_default_names(count: usize) -> Self {
        StationRegistry {
            names: (1..=count).map(|n| format!("S{:02}", n)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Name of the station at `index`, or "Station N" (1-based) when the registry is shorter.
    pub fn name(&self, index: usize) -> String {
        match self.names.get(index) {
            Some(name) => name.clone(),
            None => format!("Station {}", index + 1),
        }
    }

    /// Human-readable label for a device span: "<name[first]> thru <name[last-1]>"
    pub fn span_label(&self, device: &DeviceConfig) -> String {
        let last = device.last.saturating_sub(1).max(device.first);
        format!("{} thru {}", self.name(device.first), self.name(last))
    }
}

impl Default for StationRegistry {
    fn default() -> Self {
        Self::with_default_names(8)
    }
}
