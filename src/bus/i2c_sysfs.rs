use super::{BusController, BusError, RegisterAddress, RegisterBus};
use crate::config::ConfigSectionBus;
use i2c_linux::I2c;
use log::debug;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs::File,
    io::{Error, Read, Write},
    os::fd::AsRawFd,
    path::Path,
    sync::Arc,
};

const I2C_CLASS_PATH: &str = "/sys/class/i2c-dev";
const I2C_DEVICE_PATH: &str = "/dev";

// helper methods for talking to single-register devices over I2C
pub fn write_command<T: Write + AsRawFd>(
    bus: &mut I2c<T>,
    address: u8,
    command: u8,
) -> Result<(), Error> {
    bus.smbus_set_slave_address(address as u16, false)?;
    bus.write_all(&[command])?;
    Ok(())
}

pub fn read_command<T: Read + AsRawFd>(bus: &mut I2c<T>, address: u8) -> Result<u8, Error> {
    let mut buf = [0u8; 1];
    bus.smbus_set_slave_address(address as u16, false)?;
    bus.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn sysfs_map_err(err: Error, default_err_msg: &str) -> BusError {
    BusError::HardwareError(format!("{}: {}", default_err_msg, err))
}

pub struct SysfsI2cBus {
    bus_id: u8,
    bus: Arc<Mutex<I2c<File>>>,
}

impl RegisterBus for SysfsI2cBus {
    fn read_byte(&self, address: u8) -> Result<u8, BusError> {
        let mut transaction = self.bus.lock();
        read_command(&mut transaction, address).map_err(|err| {
            sysfs_map_err(err, &format!("failed to read from {:#04x} on I2C bus {}", address, self.bus_id))
        })
    }

    fn write_byte(&self, address: u8, value: u8) -> Result<(), BusError> {
        let mut transaction = self.bus.lock();
        write_command(&mut transaction, address, value).map_err(|err| {
            sysfs_map_err(err, &format!("failed to write to {:#04x} on I2C bus {}", address, self.bus_id))
        })
    }
}

pub struct SysfsI2CBusController {
    allowed_buses: Vec<u8>,
    owned_buses: HashMap<u8, Arc<Mutex<I2c<File>>>>,
}

impl BusController for SysfsI2CBusController {
    fn name(&self) -> String {
        "i2c_sysfs".to_string()
    }

    fn open_device(&mut self, address: &RegisterAddress) -> Result<Arc<dyn RegisterBus>, BusError> {
        let bus = self.get(address.bus_id())?;
        Ok(Arc::new(SysfsI2cBus {
            bus_id: address.bus_id(),
            bus,
        }))
    }
}

impl SysfsI2CBusController {
    pub fn new(allowed_buses: Vec<u8>) -> Result<Self, BusError> {
        let path = Path::new(I2C_CLASS_PATH);
        if !path.exists() || !path.is_dir() {
            return Err(BusError::NotSupported);
        }

        Ok(SysfsI2CBusController {
            allowed_buses,
            owned_buses: HashMap::new(),
        })
    }

    pub fn from_config(config: &ConfigSectionBus) -> Result<Self, BusError> {
        Self::new(config.bus_ids.clone())
    }

    pub fn open(&mut self, bus_id: u8) -> Result<Arc<Mutex<I2c<File>>>, BusError> {
        if self.owned_buses.contains_key(&bus_id) {
            return Err(BusError::ChannelBusy(bus_id));
        }

        if !self.allowed_buses.contains(&bus_id) {
            return Err(BusError::BusNotFound(bus_id));
        }

        let bus = I2c::from_path(Path::new(I2C_DEVICE_PATH).join(format!("i2c-{}", bus_id)))
            .map_err(|err| sysfs_map_err(err, &format!("Internal sysfs error while opening I2C bus {}", bus_id)))?;

        debug!("Opened I2C bus {}", bus_id);
        let bus = Arc::new(Mutex::new(bus));
        self.owned_buses.insert(bus_id, bus.clone());
        Ok(bus)
    }

    pub fn get(&mut self, bus_id: u8) -> Result<Arc<Mutex<I2c<File>>>, BusError> {
        let bus = match self.owned_buses.get(&bus_id) {
            Some(bus) => bus.clone(),
            None => self.open(bus_id)?,
        };

        Ok(bus)
    }
}
