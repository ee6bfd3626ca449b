use std::fmt::Display;
use std::sync::Arc;

pub const MAX_CHIP_ADDRESS: u8 = 0x7F;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress {
    bus_id: u8,
    address: u8,
}

impl RegisterAddress {
    pub fn new(bus_id: u8, address: u8) -> Result<Self, BusError> {
        if address > MAX_CHIP_ADDRESS {
            return Err(BusError::InvalidAddress(address));
        }

        Ok(RegisterAddress { bus_id, address })
    }

    pub fn bus_id(&self) -> u8 {
        self.bus_id
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn resource_name(&self) -> String {
        format!("pcf8574_{}_{:#04x}", self.bus_id, self.address)
    }
}

impl Display for RegisterAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "i2c-{}@{:#04x}", self.bus_id, self.address)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum BusError {
    InvalidAddress(u8),
    InvalidBit(u8),
    BusNotFound(u8),
    ChannelBusy(u8),
    NotSupported,
    HardwareError(String),
}

impl Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&match self {
            BusError::InvalidAddress(address) => format!("invalid slave address: {:#04x}", address),
            BusError::InvalidBit(index) => format!("bit index {} is out of range 0..=7", index),
            BusError::BusNotFound(bus_id) => format!("I2C bus {} does not exist", bus_id),
            BusError::ChannelBusy(bus_id) => format!("I2C bus {} is busy", bus_id),
            BusError::NotSupported => "not supported".to_string(),
            BusError::HardwareError(msg) => format!("hardware error: {}", msg),
        })
    }
}

// implementations serialize access to the underlying bus themselves
pub trait RegisterBus: Send + Sync {
    fn read_byte(&self, address: u8) -> Result<u8, BusError>;
    fn write_byte(&self, address: u8, value: u8) -> Result<(), BusError>;
}

pub trait BusController: Send + Sync {
    fn name(&self) -> String;
    fn open_device(&mut self, address: &RegisterAddress) -> Result<Arc<dyn RegisterBus>, BusError>;
}

// Bus implementations
pub mod i2c_sysfs; // SysfsI2CBusController
