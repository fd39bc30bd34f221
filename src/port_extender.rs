// Port Extender Module - bus scanning, autoconfiguration and station-to-port mapping
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::io_devices::{BusProvider, DeviceError, IoExtender, SmBus};
use crate::pex_config::{PexConfig, NEEDS_CONFIG_MSG};
use crate::types::{ChipType, DeviceConfig, PexStatus};

// First and last I2C address selectable on MCP230xx and PCF857x parts
pub const SCAN_START: u8 = 0x20;
pub const SCAN_END: u8 = 0x27;
pub const MAX_DEVICES_PER_BUS: usize = (SCAN_END - SCAN_START + 1) as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("{stations} stations need {needed} {chip} devices, at most {} fit on one bus", MAX_DEVICES_PER_BUS)]
    TooManyStations { stations: usize, chip: ChipType, needed: usize },

    #[error("device {index} has an empty span [{first}, {last})")]
    EmptySpan { index: usize, first: usize, last: usize },

    #[error("device {index} spans {span} stations but a {chip} has {width} ports")]
    SpanTooWide { index: usize, span: usize, chip: ChipType, width: usize },

    #[error("device {index} starts at station {first}, expected {expected}")]
    NotContiguous { index: usize, first: usize, expected: usize },

    #[error("address 0x{addr:02X} is used twice on bus {bus}")]
    DuplicateAddress { bus: u8, addr: u8 },

    #[error("address 0x{addr:02X} is outside 0x{:02X}..=0x{:02X}", SCAN_START, SCAN_END)]
    AddressOutOfRange { addr: u8 },
}

#[derive(Debug, Error)]
pub enum PexError {
    #[error("PEX is {0}, outputs are only driven when enabled")]
    NotEnabled(PexStatus),

    #[error("PEX needs to be configured: {0}")]
    Layout(#[from] LayoutError),

    #[error("PEX needs to be configured for {stations} stations: {coverage}")]
    Incomplete { coverage: Coverage, stations: usize },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// How a valid device list lines up with the station registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    Complete,
    Partial { unmapped: usize },  // Trailing stations have no device
    Excess { unused: usize },     // Last device spans past the final station
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coverage::Complete => write!(f, "devices cover every station"),
            Coverage::Partial { unmapped } => write!(f, "{} station(s) have no device", unmapped),
            Coverage::Excess { unused } => write!(f, "devices span {} station(s) past the last one", unused),
        }
    }
}

/// Per-device result of mapping station values onto port words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceWrite {
    pub bus_id: u8,
    pub hw_addr: u8,
    pub word: u16,   // Bit set = station on
    pub value: u16,  // What was driven on the pins
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputReport {
    pub devices: Vec<DeviceWrite>,
    pub unmapped: usize,
}

/// Check the device list against the layout invariants and report coverage of `stations`.
pub fn validate_layout(devices: &[DeviceConfig], stations: usize) -> Result<Coverage, LayoutError> {
    let mut expected = 0;
    let mut seen: Vec<(u8, u8)> = Vec::with_capacity(devices.len());

    for (index, dev) in devices.iter().enumerate() {
        if dev.first >= dev.last {
            return Err(LayoutError::EmptySpan { index, first: dev.first, last: dev.last });
        }
        let width = dev.ic_type.port_width();
        if dev.span() > width {
            return Err(LayoutError::SpanTooWide {
                index,
                span: dev.span(),
                chip: dev.ic_type,
                width,
            });
        }
        if dev.first != expected {
            return Err(LayoutError::NotContiguous { index, first: dev.first, expected });
        }
        if !(SCAN_START..=SCAN_END).contains(&dev.hw_addr) {
            return Err(LayoutError::AddressOutOfRange { addr: dev.hw_addr });
        }
        if seen.contains(&(dev.bus_id, dev.hw_addr)) {
            return Err(LayoutError::DuplicateAddress { bus: dev.bus_id, addr: dev.hw_addr });
        }
        seen.push((dev.bus_id, dev.hw_addr));
        expected = dev.last;
    }

    Ok(match expected.cmp(&stations) {
        std::cmp::Ordering::Equal => Coverage::Complete,
        std::cmp::Ordering::Less => Coverage::Partial { unmapped: stations - expected },
        std::cmp::Ordering::Greater => Coverage::Excess { unused: expected - stations },
    })
}

/// Build a device list that covers `stations` with chips of one type.
///
/// Discovered addresses are used first, in ascending order; any devices still needed take the
/// lowest unused addresses from 0x20 up.
pub fn autogenerate_device_config(
    stations: usize,
    chip: ChipType,
    bus_id: u8,
    discovered: &[u8],
) -> Result<Vec<DeviceConfig>, LayoutError> {
    let width = chip.port_width();
    let needed = stations.div_ceil(width);
    if needed > MAX_DEVICES_PER_BUS {
        return Err(LayoutError::TooManyStations { stations, chip, needed });
    }

    let mut addrs: Vec<u8> = discovered
        .iter()
        .copied()
        .filter(|a| (SCAN_START..=SCAN_END).contains(a))
        .collect();
    addrs.sort_unstable();
    addrs.dedup();
    for addr in SCAN_START..=SCAN_END {
        if addrs.len() >= needed {
            break;
        }
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    Ok(addrs
        .into_iter()
        .take(needed)
        .enumerate()
        .map(|(i, hw_addr)| DeviceConfig {
            bus_id,
            hw_addr,
            ic_type: chip,
            first: i * width,
            last: ((i + 1) * width).min(stations),
            active_low: false,
        })
        .collect())
}

/// Pack station values into one word per device. Returns the words and the number of
/// trailing stations no device covers.
pub fn map_outputs(devices: &[DeviceConfig], values: &[bool]) -> (Vec<u16>, usize) {
    let mut covered = 0;
    let words = devices
        .iter()
        .map(|dev| {
            covered = covered.max(dev.last);
            let stop = dev.last.min(values.len());
            let mut word = 0u16;
            for i in dev.first..stop {
                let bit = i - dev.first;
                if values[i] && bit < 16 {
                    word |= 1 << bit;
                }
            }
            word
        })
        .collect();
    (words, values.len().saturating_sub(covered))
}

/// True when `devices` / `stations` differ from what was last initialized.
pub fn has_config_changed(
    applied: Option<&(Vec<DeviceConfig>, usize)>,
    devices: &[DeviceConfig],
    stations: usize,
) -> bool {
    match applied {
        Some((applied_devices, applied_stations)) => {
            applied_devices.as_slice() != devices || *applied_stations != stations
        }
        None => true,
    }
}

/// Hardware front end: picks the bus provider and remembers which layout is initialized.
pub struct PortExtender {
    hardware: Option<Arc<dyn BusProvider>>,
    demo: Arc<dyn BusProvider>,
    applied: Option<(Vec<DeviceConfig>, usize)>,
}

impl PortExtender {
    pub fn new(hardware: Option<Arc<dyn BusProvider>>, demo: Arc<dyn BusProvider>) -> Self {
        PortExtender { hardware, demo, applied: None }
    }

    pub fn bus_library_available(&self) -> bool {
        self.hardware.is_some()
    }

    fn open_bus(&self, bus_id: u8, demo: bool) -> Result<Box<dyn SmBus>, DeviceError> {
        if demo {
            return self.demo.open(bus_id);
        }
        self.hardware
            .as_ref()
            .ok_or(DeviceError::LibraryUnavailable)?
            .open(bus_id)
    }

    /// Scan the well known address range for port extenders.
    pub fn scan(&self, bus_id: u8, demo: bool) -> Result<Vec<u8>, DeviceError> {
        let mut bus = self.open_bus(bus_id, demo)?;
        let found: Vec<u8> = (SCAN_START..=SCAN_END).filter(|&a| bus.probe(a)).collect();
        debug!("PEX: scan of bus {} found {:02X?}", bus_id, found);
        Ok(found)
    }

    /// Use the ACK handshake to check that one device is reachable.
    pub fn verify_handshake(&self, bus_id: u8, addr: u8, demo: bool) -> Result<bool, DeviceError> {
        let mut bus = self.open_bus(bus_id, demo)?;
        Ok(bus.probe(addr))
    }

    /// Scan the default bus and regenerate the device list for `stations`.
    pub fn autoconfigure(&self, cfg: &mut PexConfig, stations: usize) -> Result<(), LayoutError> {
        let discovered = match self.scan(cfg.default_smbus, cfg.demo_mode) {
            Ok(found) => found,
            Err(e) => {
                warn!("PEX: autoconfigure scan failed, using default addresses: {}", e);
                Vec::new()
            }
        };

        cfg.dev_configs =
            autogenerate_device_config(stations, cfg.default_ic_type, cfg.default_smbus, &discovered)?;
        cfg.discovered_devices = discovered;
        cfg.num_sip_stations = stations;
        info!(
            "PEX: autoconfigured {} {} device(s) for {} stations",
            cfg.dev_configs.len(),
            cfg.default_ic_type,
            stations
        );
        Ok(())
    }

    /// Map station values onto the configured devices and drive their outputs.
    pub fn set_outputs(&mut self, cfg: &mut PexConfig, values: &[bool]) -> Result<OutputReport, PexError> {
        let result = self.try_set_outputs(cfg, values);
        if let Err(e) = &result {
            error_to_warning(cfg, e);
        }
        result
    }

    fn try_set_outputs(&mut self, cfg: &PexConfig, values: &[bool]) -> Result<OutputReport, PexError> {
        if !cfg.pex_status.is_enabled() {
            return Err(PexError::NotEnabled(cfg.pex_status));
        }
        let stations = values.len();
        let coverage = validate_layout(&cfg.dev_configs, stations)?;
        if coverage != Coverage::Complete {
            return Err(PexError::Incomplete { coverage, stations });
        }

        if has_config_changed(self.applied.as_ref(), &cfg.dev_configs, stations) {
            self.applied = None;
            for dev in &cfg.dev_configs {
                let mut bus = self.open_bus(dev.bus_id, cfg.demo_mode)?;
                IoExtender::from_device(dev).initialize(bus.as_mut())?;
            }
            self.applied = Some((cfg.dev_configs.clone(), stations));
        }

        let (words, unmapped) = map_outputs(&cfg.dev_configs, values);
        let mut devices = Vec::with_capacity(words.len());
        for (dev, word) in cfg.dev_configs.iter().zip(words) {
            let mut bus = self.open_bus(dev.bus_id, cfg.demo_mode)?;
            let value = IoExtender::from_device(dev).set_output(bus.as_mut(), word)?;
            if cfg.debug {
                info!("PEX: set_output 0x{:04X} for device 0x{:02X}", value, dev.hw_addr);
            } else {
                debug!("PEX: set_output 0x{:04X} for device 0x{:02X}", value, dev.hw_addr);
            }
            devices.push(DeviceWrite { bus_id: dev.bus_id, hw_addr: dev.hw_addr, word, value });
        }

        Ok(OutputReport { devices, unmapped })
    }

    /// Write one raw byte to a device (the settings page test form).
    pub fn write_test_byte(&self, bus_id: u8, addr: u8, value: u8, demo: bool) -> Result<(), DeviceError> {
        let mut bus = self.open_bus(bus_id, demo)?;
        bus.write(addr, &[value])
    }

    /// Forget the initialized layout so the next output pass re-initializes every device.
    pub fn reset(&mut self) {
        self.applied = None;
    }
}

fn error_to_warning(cfg: &mut PexConfig, e: &PexError) {
    match e {
        PexError::NotEnabled(_) => debug!("PEX: outputs skipped: {}", e),
        _ => warn!("PEX: failed to set outputs: {}", e),
    }
    cfg.warnmsg = NEEDS_CONFIG_MSG.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_devices::testing::RecordingProvider;
    use crate::io_devices::DemoProvider;

    fn device(addr: u8, chip: ChipType, first: usize, last: usize) -> DeviceConfig {
        DeviceConfig { bus_id: 1, hw_addr: addr, ic_type: chip, first, last, active_low: false }
    }

    fn extender(provider: &Arc<RecordingProvider>) -> PortExtender {
        let hardware: Arc<dyn BusProvider> = provider.clone();
        PortExtender::new(Some(hardware), Arc::new(DemoProvider))
    }

    fn enabled_config(devices: Vec<DeviceConfig>) -> PexConfig {
        let mut cfg = PexConfig::default();
        cfg.demo_mode = false;
        cfg.pex_status = PexStatus::Enabled;
        cfg.num_sip_stations = devices.last().map(|d| d.last).unwrap_or(0);
        cfg.dev_configs = devices;
        cfg
    }

    #[test]
    fn autogenerate_splits_stations_by_port_width() {
        let devices = autogenerate_device_config(20, ChipType::Mcp23017, 1, &[]).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!((devices[0].first, devices[0].last, devices[0].hw_addr), (0, 16, 0x20));
        assert_eq!((devices[1].first, devices[1].last, devices[1].hw_addr), (16, 20, 0x21));
        assert_eq!(validate_layout(&devices, 20), Ok(Coverage::Complete));
    }

    #[test]
    fn autogenerate_prefers_discovered_addresses() {
        let devices = autogenerate_device_config(24, ChipType::Pcf8574, 1, &[0x27, 0x25]).unwrap();
        let addrs: Vec<u8> = devices.iter().map(|d| d.hw_addr).collect();
        assert_eq!(addrs, vec![0x25, 0x27, 0x20]);
    }

    #[test]
    fn autogenerate_rejects_more_than_one_bus_worth() {
        let err = autogenerate_device_config(65, ChipType::Pcf8574, 1, &[]).unwrap_err();
        assert_eq!(
            err,
            LayoutError::TooManyStations { stations: 65, chip: ChipType::Pcf8574, needed: 9 }
        );
        assert!(autogenerate_device_config(0, ChipType::Pcf8574, 1, &[]).unwrap().is_empty());
    }

    #[test]
    fn validate_rejects_bad_layouts() {
        let gap = [device(0x20, ChipType::Pcf8574, 0, 8), device(0x21, ChipType::Pcf8574, 9, 12)];
        assert!(matches!(validate_layout(&gap, 12), Err(LayoutError::NotContiguous { index: 1, .. })));

        let overlap = [device(0x20, ChipType::Pcf8574, 0, 8), device(0x21, ChipType::Pcf8574, 4, 12)];
        assert!(matches!(validate_layout(&overlap, 12), Err(LayoutError::NotContiguous { .. })));

        let wide = [device(0x20, ChipType::Mcp23008, 0, 9)];
        assert!(matches!(validate_layout(&wide, 9), Err(LayoutError::SpanTooWide { width: 8, .. })));

        let empty = [device(0x20, ChipType::Mcp23008, 0, 0)];
        assert!(matches!(validate_layout(&empty, 0), Err(LayoutError::EmptySpan { .. })));

        let dup = [device(0x20, ChipType::Pcf8574, 0, 8), device(0x20, ChipType::Pcf8574, 8, 16)];
        assert_eq!(
            validate_layout(&dup, 16),
            Err(LayoutError::DuplicateAddress { bus: 1, addr: 0x20 })
        );
    }

    #[test]
    fn validate_reports_coverage() {
        let devices = [device(0x20, ChipType::Pcf8575, 0, 16)];
        assert_eq!(validate_layout(&devices, 16), Ok(Coverage::Complete));
        assert_eq!(validate_layout(&devices, 18), Ok(Coverage::Partial { unmapped: 2 }));
        assert_eq!(validate_layout(&devices, 10), Ok(Coverage::Excess { unused: 6 }));
    }

    #[test]
    fn map_outputs_sets_bit_per_station_in_span() {
        let devices = [
            device(0x20, ChipType::Pcf8574, 0, 8),
            device(0x21, ChipType::Pcf8574, 8, 12),
        ];
        let mut values = vec![false; 13];
        values[0] = true;
        values[7] = true;
        values[9] = true;
        values[12] = true;

        let (words, unmapped) = map_outputs(&devices, &values);
        assert_eq!(words, vec![0b1000_0001, 0b0000_0010]);
        assert_eq!(unmapped, 1);
    }

    #[test]
    fn has_config_changed_tracks_devices_and_station_count() {
        let devices = vec![device(0x20, ChipType::Pcf8574, 0, 8)];
        let applied = (devices.clone(), 8);
        assert!(has_config_changed(None, &devices, 8));
        assert!(!has_config_changed(Some(&applied), &devices, 8));
        assert!(has_config_changed(Some(&applied), &devices, 9));
    }

    #[test]
    fn set_outputs_initializes_once_then_writes_words() {
        let provider = Arc::new(RecordingProvider::new(&[0x20, 0x21]));
        let mut pex = extender(&provider);
        let mut cfg = enabled_config(vec![
            device(0x20, ChipType::Pcf8575, 0, 16),
            DeviceConfig { active_low: true, ..device(0x21, ChipType::Pcf8574, 16, 20) },
        ]);

        let mut values = vec![false; 20];
        values[1] = true;
        values[16] = true;
        let report = pex.set_outputs(&mut cfg, &values).unwrap();
        assert_eq!(report.unmapped, 0);
        assert_eq!(report.devices[0].value, 0x0002);
        assert_eq!(report.devices[1].word, 0x01);
        assert_eq!(report.devices[1].value, 0xfe);

        // Two init writes (one per PCF) plus two output writes
        assert_eq!(provider.writes().len(), 4);

        pex.set_outputs(&mut cfg, &values).unwrap();
        assert_eq!(provider.writes().len(), 6);
        assert!(cfg.warnmsg.is_empty());
    }

    #[test]
    fn set_outputs_refuses_when_not_enabled() {
        let provider = Arc::new(RecordingProvider::new(&[0x20]));
        let mut pex = extender(&provider);
        let mut cfg = enabled_config(vec![device(0x20, ChipType::Pcf8574, 0, 8)]);
        cfg.pex_status = PexStatus::Disabled;

        let err = pex.set_outputs(&mut cfg, &[false; 8]).unwrap_err();
        assert!(matches!(err, PexError::NotEnabled(PexStatus::Disabled)));
        assert_eq!(cfg.warnmsg, NEEDS_CONFIG_MSG);
        assert!(provider.writes().is_empty());
    }

    #[test]
    fn set_outputs_refuses_incomplete_layout() {
        let provider = Arc::new(RecordingProvider::new(&[0x20]));
        let mut pex = extender(&provider);
        let mut cfg = enabled_config(vec![device(0x20, ChipType::Pcf8574, 0, 8)]);

        let err = pex.set_outputs(&mut cfg, &[false; 16]).unwrap_err();
        assert!(matches!(
            err,
            PexError::Incomplete { coverage: Coverage::Partial { unmapped: 8 }, stations: 16 }
        ));
        assert!(err.to_string().contains("8 station(s) have no device"));
        assert_eq!(cfg.warnmsg, NEEDS_CONFIG_MSG);
    }

    #[test]
    fn hardware_mode_without_library_fails() {
        let pex = PortExtender::new(None, Arc::new(DemoProvider));
        assert!(!pex.bus_library_available());
        assert!(matches!(pex.scan(1, false), Err(DeviceError::LibraryUnavailable)));
        assert_eq!(pex.scan(1, true).unwrap(), vec![0x20, 0x25, 0x27]);
        assert!(pex.verify_handshake(1, 0x25, true).unwrap());
    }

    #[test]
    fn autoconfigure_uses_scan_results() {
        let provider = Arc::new(RecordingProvider::new(&[0x22, 0x24]));
        let pex = extender(&provider);
        let mut cfg = PexConfig::default();
        cfg.demo_mode = false;
        cfg.default_ic_type = ChipType::Mcp23008;

        pex.autoconfigure(&mut cfg, 12).unwrap();
        assert_eq!(cfg.discovered_devices, vec![0x22, 0x24]);
        assert_eq!(cfg.num_sip_stations, 12);
        assert_eq!(cfg.dev_configs.len(), 2);
        assert_eq!(cfg.dev_configs[1].hw_addr, 0x24);
        assert_eq!(cfg.dev_configs[1].last, 12);
    }
}
