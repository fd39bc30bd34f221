// IO Devices Module - I2C bus access and port-extender chip drivers
use embedded_hal::blocking::i2c;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{ChipType, DeviceConfig};

/// Addresses answered by the demo bus, so the UI has something to show off-Pi.
pub const DEMO_ADDRESSES: [u8; 3] = [0x20, 0x25, 0x27];

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("I2C library not available, rebuild with the `rpi` feature")]
    LibraryUnavailable,

    #[error("failed to open I2C bus {bus}: {message}")]
    Open { bus: u8, message: String },

    #[error("failed to write to the device 0x{addr:02X}: {message}")]
    Write { addr: u8, message: String },
}

mod reg {
    pub const MCP23017_IODIRA: u8 = 0x00;
    pub const MCP23017_IODIRB: u8 = 0x01;
    pub const MCP23017_GPIOA: u8 = 0x12;  // Word write starts here and continues into GPIOB
    pub const MCP23008_IODIR: u8 = 0x00;
    pub const MCP23008_GPIO: u8 = 0x09;
}

/// Minimal SMBus-style access needed by the plugin.
pub trait SmBus {
    fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), DeviceError>;

    /// True if a device ACKs its address.
    fn probe(&mut self, addr: u8) -> bool;
}

/// Opens buses by id. Buses are opened per operation and dropped right after.
pub trait BusProvider: Send + Sync {
    fn open(&self, bus_id: u8) -> Result<Box<dyn SmBus>, DeviceError>;
}

/// Adapter for any embedded-hal blocking I2C implementation
#[cfg_attr(not(feature = "rpi"), allow(dead_code))]
pub struct HalBus<I2C> {
    i2c: I2C,
}

#[cfg_attr(not(feature = "rpi"), allow(dead_code))]
impl<I2C> HalBus<I2C> {
    pub fn new(i2c: I2C) -> Self {
        HalBus { i2c }
    }
}

impl<E: fmt::Debug, I2C: i2c::Write<Error = E>> SmBus for HalBus<I2C> {
    fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), DeviceError> {
        self.i2c.write(addr, bytes).map_err(|e| DeviceError::Write {
            addr,
            message: format!("{:?}", e),
        })
    }

    fn probe(&mut self, addr: u8) -> bool {
        // Zero-length write: address byte only, succeeds on ACK
        self.i2c.write(addr, &[]).is_ok()
    }
}

// Demo bus - logs writes instead of touching hardware
pub struct DemoBus {
    bus_id: u8,
}

impl SmBus for DemoBus {
    fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), DeviceError> {
        info!("demo: bus {} write 0x{:02X} {:02X?}", self.bus_id, addr, bytes);
        Ok(())
    }

    fn probe(&mut self, addr: u8) -> bool {
        DEMO_ADDRESSES.contains(&addr)
    }
}

pub struct DemoProvider;

impl BusProvider for DemoProvider {
    fn open(&self, bus_id: u8) -> Result<Box<dyn SmBus>, DeviceError> {
        Ok(Box::new(DemoBus { bus_id }))
    }
}

#[cfg(feature = "rpi")]
pub struct RppalProvider;

#[cfg(feature = "rpi")]
impl BusProvider for RppalProvider {
    fn open(&self, bus_id: u8) -> Result<Box<dyn SmBus>, DeviceError> {
        let i2c = rppal::i2c::I2c::with_bus(bus_id).map_err(|e| DeviceError::Open {
            bus: bus_id,
            message: e.to_string(),
        })?;
        Ok(Box::new(HalBus::new(i2c)))
    }
}

/// Provider for real hardware, if compiled in.
#[cfg(feature = "rpi")]
pub fn hardware_provider() -> Option<Arc<dyn BusProvider>> {
    Some(Arc::new(RppalProvider))
}

#[cfg(not(feature = "rpi"))]
pub fn hardware_provider() -> Option<Arc<dyn BusProvider>> {
    None
}

/// Driver for one port-extender chip. Only output mode is supported.
///
/// MCP parts power up with every pin as an input, so `initialize` presets the output latch to
/// the "off" level first and only then programs the direction registers. PCF parts have no
/// direction register; their pins are weak pull-ups that a write of the off level parks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoExtender {
    pub addr: u8,
    pub chip: ChipType,
    pub active_low: bool,
}

impl IoExtender {
    pub fn new(chip: ChipType, addr: u8, active_low: bool) -> Self {
        IoExtender { addr, chip, active_low }
    }

    pub fn from_device(dev: &DeviceConfig) -> Self {
        Self::new(dev.ic_type, dev.hw_addr, dev.active_low)
    }

    /// Port value with every station off.
    pub fn off_value(&self) -> u16 {
        self.encode(0)
    }

    /// Translate a station word (bit set = on) into the value driven on the pins.
    pub fn encode(&self, word: u16) -> u16 {
        let value = if self.active_low { !word } else { word };
        value & self.chip.port_mask()
    }

    pub fn initialize(&self, bus: &mut dyn SmBus) -> Result<(), DeviceError> {
        self.write_port(bus, self.off_value())?;
        match self.chip {
            ChipType::Mcp23017 => {
                bus.write(self.addr, &[reg::MCP23017_IODIRA, 0x00])?;
                bus.write(self.addr, &[reg::MCP23017_IODIRB, 0x00])?;
            }
            ChipType::Mcp23008 => {
                bus.write(self.addr, &[reg::MCP23008_IODIR, 0x00])?;
            }
            ChipType::Pcf8574 | ChipType::Pcf8575 => {}
        }
        debug!("PEX: initialized {} at 0x{:02X}", self.chip, self.addr);
        Ok(())
    }

    /// Drive the outputs from a station word. Returns the value written to the pins.
    pub fn set_output(&self, bus: &mut dyn SmBus, word: u16) -> Result<u16, DeviceError> {
        let value = self.encode(word);
        self.write_port(bus, value)?;
        Ok(value)
    }

    fn write_port(&self, bus: &mut dyn SmBus, value: u16) -> Result<(), DeviceError> {
        let [lo, hi] = value.to_le_bytes();
        match self.chip {
            ChipType::Mcp23017 => bus.write(self.addr, &[reg::MCP23017_GPIOA, lo, hi]),
            ChipType::Mcp23008 => bus.write(self.addr, &[reg::MCP23008_GPIO, lo]),
            ChipType::Pcf8575 => bus.write(self.addr, &[lo, hi]),
            ChipType::Pcf8574 => bus.write(self.addr, &[lo]),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    pub type WriteLog = Arc<Mutex<Vec<(u8, Vec<u8>)>>>;

    // In-memory I2C that records writes; only `present` addresses ACK
    pub struct RecordingI2c {
        pub present: Vec<u8>,
        pub log: WriteLog,
    }

    impl i2c::Write for RecordingI2c {
        type Error = &'static str;

        fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), Self::Error> {
            if !self.present.contains(&address) {
                return Err("nack");
            }
            if !bytes.is_empty() {
                self.log.lock().unwrap().push((address, bytes.to_vec()));
            }
            Ok(())
        }
    }

    pub struct RecordingProvider {
        pub present: Vec<u8>,
        pub log: WriteLog,
    }

    impl RecordingProvider {
        pub fn new(present: &[u8]) -> Self {
            RecordingProvider {
                present: present.to_vec(),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
            self.log.lock().unwrap().clone()
        }
    }

    impl BusProvider for RecordingProvider {
        fn open(&self, _bus_id: u8) -> Result<Box<dyn SmBus>, DeviceError> {
            Ok(Box::new(HalBus::new(RecordingI2c {
                present: self.present.clone(),
                log: self.log.clone(),
            })))
        }
    }
}
