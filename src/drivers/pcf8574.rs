use crate::bus::{BusError, RegisterAddress, RegisterBus};
use log::debug;
use std::{fmt::Display, sync::Arc};

pub const PORT_WIDTH: usize = 8;

/// Packs a port view into the register byte. Index 0 is the most
/// significant bit, index 7 the least significant.
pub const fn pack(bits: [bool; PORT_WIDTH]) -> u8 {
    let mut value = 0u8;
    let mut i = 0;
    while i < PORT_WIDTH {
        if bits[i] {
            value |= bit_mask(i);
        }
        i += 1;
    }

    value
}

pub const fn unpack(value: u8) -> [bool; PORT_WIDTH] {
    let mut bits = [false; PORT_WIDTH];
    let mut i = 0;
    while i < PORT_WIDTH {
        bits[i] = value & bit_mask(i) != 0;
        i += 1;
    }

    bits
}

const fn bit_mask(index: usize) -> u8 {
    1 << (PORT_WIDTH - 1 - index)
}

pub struct Pcf8574 {
    bus: Arc<dyn RegisterBus>,
    address: RegisterAddress,
}

impl Pcf8574 {
    pub fn new(bus: Arc<dyn RegisterBus>, address: RegisterAddress) -> Self {
        Pcf8574 { bus, address }
    }

    pub fn address(&self) -> &RegisterAddress {
        &self.address
    }

    pub fn write_port(&self, bits: [bool; PORT_WIDTH]) -> Result<(), BusError> {
        let value = pack(bits);
        debug!("{}: writing port byte {:#010b}", self.address, value);
        self.bus.write_byte(self.address.address(), value)
    }

    pub fn read_port(&self) -> Result<[bool; PORT_WIDTH], BusError> {
        let value = self.bus.read_byte(self.address.address())?;
        Ok(unpack(value))
    }

    /// Read-modify-write of one bit straight on the chip. Not safe against
    /// concurrent writers to the same chip.
    pub fn set_single_bit(&self, index: u8, value: bool) -> Result<(), BusError> {
        if index as usize >= PORT_WIDTH {
            return Err(BusError::InvalidBit(index));
        }

        let current = self.bus.read_byte(self.address.address())?;
        let mask = bit_mask(index as usize);
        let new_state = if value { current | mask } else { current & !mask };
        self.bus.write_byte(self.address.address(), new_state)
    }
}

impl Display for Pcf8574 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCF8574({})", self.address)
    }
}
