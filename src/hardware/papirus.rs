//! PaPiRus e-paper HAT.
//!
//! The HAT carries an LM75 temperature sensor on I2C (0x48 by default); a read
//! of its temperature register is the presence check. Frames go through the
//! EPD FUSE driver mounted at `/dev/epd`:
//!
//! - `panel`: read-only description, e.g. `EPD 2.0 200x96 COG 2 FILM 231`
//! - `temperature`: panel temperature in whole degrees, used for waveform timing
//! - `display`: packed 1bpp image, MSB first, set bit = black
//! - `command`: `U` full update, `P` partial update
//! - `error`: status of the last command, `OK` on success

use super::{DriverError, HardwareDriver, RefreshMode};
use crate::config::DisplayConfig;
use crate::layout::Bitmap;
use embedded_hal::i2c::I2c;
use linux_embedded_hal::I2cdev;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const LM75_TEMPERATURE_REGISTER: u8 = 0x00;

const COMMAND_FULL_UPDATE: &[u8] = b"U";
const COMMAND_PARTIAL_UPDATE: &[u8] = b"P";
const STATUS_OK: &str = "OK";

pub struct PapirusDriver {
    i2c_path: PathBuf,
    address: u8,
    epd_path: PathBuf,
    i2c: Option<I2cdev>,
    panel_size: Option<(u32, u32)>,
    temperature_c: Option<f32>,
}

impl PapirusDriver {
    pub fn new(cfg: &DisplayConfig) -> Self {
        Self {
            i2c_path: cfg.i2c_bus.clone(),
            address: cfg.i2c_address,
            epd_path: cfg.epd_path.clone(),
            i2c: None,
            panel_size: None,
            temperature_c: None,
        }
    }

    fn read_temperature(&mut self) -> Result<f32, DriverError> {
        let address = self.address;
        let mut i2c = match self.i2c.take() {
            Some(i2c) => i2c,
            None => I2cdev::new(&self.i2c_path).map_err(|err| DriverError::i2c(address, err))?,
        };

        let mut raw = [0_u8; 2];
        // On error the handle is dropped so the next probe reopens the adapter.
        i2c.write_read(address, &[LM75_TEMPERATURE_REGISTER], &mut raw)
            .map_err(|err| DriverError::i2c(address, err))?;
        self.i2c = Some(i2c);
        Ok(lm75_celsius(raw))
    }

    fn epd_file(&self, name: &str) -> PathBuf {
        self.epd_path.join(name)
    }

    fn write_epd(&self, name: &str, bytes: &[u8]) -> Result<(), DriverError> {
        let path = self.epd_file(name);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|err| DriverError::io(&path, err))?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|err| DriverError::io(&path, err))
    }

    fn read_epd(&self, name: &str) -> Result<String, DriverError> {
        let path = self.epd_file(name);
        fs::read_to_string(&path).map_err(|err| DriverError::io(&path, err))
    }
}

impl HardwareDriver for PapirusDriver {
    fn name(&self) -> &'static str {
        "papirus"
    }

    fn probe(&mut self) -> Result<(), DriverError> {
        let temperature = self.read_temperature()?;
        self.temperature_c = Some(temperature);

        let panel = self.read_epd("panel")?;
        let size = parse_panel_size(&panel)
            .ok_or_else(|| DriverError::Protocol(format!("неизвестная панель: {}", panel.trim())))?;
        if self.panel_size != Some(size) {
            debug!(panel = %panel.trim(), temperature_c = temperature, "параметры панели");
        }
        self.panel_size = Some(size);
        Ok(())
    }

    fn panel_size(&self) -> Option<(u32, u32)> {
        self.panel_size
    }

    fn write_frame(&mut self, bitmap: &Bitmap, mode: RefreshMode) -> Result<(), DriverError> {
        if let Some((width, height)) = self.panel_size {
            if (bitmap.width(), bitmap.height()) != (width, height) {
                return Err(DriverError::FrameSize {
                    width,
                    height,
                    got_width: bitmap.width(),
                    got_height: bitmap.height(),
                });
            }
        }

        if let Some(t) = self.temperature_c {
            self.write_epd("temperature", format!("{}", t.round() as i32).as_bytes())?;
        }
        self.write_epd("display", bitmap.as_bytes())?;
        let command = match mode {
            RefreshMode::Full => COMMAND_FULL_UPDATE,
            RefreshMode::Partial => COMMAND_PARTIAL_UPDATE,
        };
        self.write_epd("command", command)
    }

    fn read_frame_ack(&mut self) -> Result<(), DriverError> {
        let status = self.read_epd("error")?;
        match status.trim() {
            STATUS_OK => Ok(()),
            other => Err(DriverError::Rejected(other.to_string())),
        }
    }

    fn release(&mut self) {
        self.i2c = None;
    }
}

/// LM75 reports a 9-bit two's complement value in the top bits, 0.5 °C per step.
fn lm75_celsius(raw: [u8; 2]) -> f32 {
    f32::from(i16::from_be_bytes(raw) >> 7) * 0.5
}

/// Pulls `WIDTHxHEIGHT` out of the EPD FUSE panel description.
fn parse_panel_size(panel: &str) -> Option<(u32, u32)> {
    panel.split_whitespace().find_map(|token| {
        let (w, h) = token.split_once('x')?;
        Some((w.parse().ok()?, h.parse().ok()?))
    })
}

/// True when `path` looks like a mounted EPD FUSE directory.
pub fn epd_mounted(path: &Path) -> bool {
    path.join("panel").is_file() && path.join("command").exists()
}
