//! PiJuice power-management HAT over I2C.
//!
//! Every read returns the requested bytes followed by an XOR checksum
//! (`0xFF ^ b0 ^ b1 ...`). The firmware sometimes clears bit 7 of the first
//! byte in transit, so a reply that fails the check is retried with that bit set.

use crate::hardware::DriverError;
use embedded_hal::i2c::I2c;
use linux_embedded_hal::I2cdev;
use std::path::PathBuf;

const CMD_STATUS: u8 = 0x40;
const CMD_CHARGE_LEVEL: u8 = 0x41;

const POWER_INPUT_NOT_PRESENT: u8 = 0;
const POWER_INPUT_PRESENT: u8 = 3;
const BATTERY_NOT_PRESENT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    pub charge_pct: u8,
    /// `None` when the supply is neither clearly present nor clearly absent.
    pub charging: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    battery_present: bool,
    charging: Option<bool>,
}

pub struct PiJuice {
    i2c_path: PathBuf,
    address: u8,
    i2c: Option<I2cdev>,
}

impl PiJuice {
    pub fn new(i2c_path: PathBuf, address: u8) -> Self {
        Self {
            i2c_path,
            address,
            i2c: None,
        }
    }

    /// `Ok(None)` when the HAT answers but reports no battery fitted.
    pub fn read(&mut self) -> Result<Option<BatteryReading>, DriverError> {
        let status = decode_status(self.command(CMD_STATUS)?);
        if !status.battery_present {
            return Ok(None);
        }
        let charge_pct = self.command(CMD_CHARGE_LEVEL)?.min(100);
        Ok(Some(BatteryReading {
            charge_pct,
            charging: status.charging,
        }))
    }

    fn command(&mut self, cmd: u8) -> Result<u8, DriverError> {
        let address = self.address;
        let mut i2c = match self.i2c.take() {
            Some(i2c) => i2c,
            None => I2cdev::new(&self.i2c_path).map_err(|err| DriverError::i2c(address, err))?,
        };
        let mut reply = [0_u8; 2];
        i2c.write_read(address, &[cmd], &mut reply)
            .map_err(|err| DriverError::i2c(address, err))?;
        self.i2c = Some(i2c);

        let payload = verified_payload(&reply).ok_or_else(|| {
            DriverError::Protocol(format!("контрольная сумма PiJuice не сошлась: {reply:02x?}"))
        })?;
        Ok(payload[0])
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0xFF, |acc, b| acc ^ b)
}

/// Payload of a `data.., checksum` reply, applying the bit 7 retry.
fn verified_payload(reply: &[u8]) -> Option<Vec<u8>> {
    let (&expected, data) = reply.split_last()?;
    if data.is_empty() {
        return None;
    }
    if checksum(data) == expected {
        return Some(data.to_vec());
    }
    let mut fixed = data.to_vec();
    fixed[0] |= 0x80;
    (checksum(&fixed) == expected).then_some(fixed)
}

fn decode_status(byte: u8) -> Status {
    let battery = (byte >> 2) & 0x03;
    let power_input = (byte >> 4) & 0x03;
    Status {
        battery_present: battery != BATTERY_NOT_PRESENT,
        charging: match power_input {
            POWER_INPUT_PRESENT => Some(true),
            POWER_INPUT_NOT_PRESENT => Some(false),
            _ => None,
        },
    }
}
