pub mod papirus;
pub mod pbm;

#[cfg(test)]
pub mod fake;

use crate::bus::BusHandle;
use crate::config::ProbeConfig;
use crate::layout::Bitmap;
use crate::state::{HardwareStatus, Presence};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Slow, clears ghosting.
    Full,
    /// Fast, redraws changed pixels only.
    Partial,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("ошибка ввода-вывода {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("ошибка I2C по адресу {address:#04x}: {message}")]
    I2c { address: u8, message: String },
    #[error("неверный ответ устройства: {0}")]
    Protocol(String),
    #[error("панель отклонила кадр: {0}")]
    Rejected(String),
    #[error("кадр {got_width}x{got_height} не совпадает с панелью {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
}

impl DriverError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn i2c(address: u8, err: impl std::fmt::Debug) -> Self {
        Self::I2c {
            address,
            message: format!("{err:?}"),
        }
    }
}

/// Capability set of a physical display bus. Calls are blocking; the caller
/// bounds them with [`BusHandle`].
pub trait HardwareDriver: Send + 'static {
    fn name(&self) -> &'static str;

    /// Checks that the panel answers. Must not change what the panel shows.
    fn probe(&mut self) -> Result<(), DriverError>;

    fn write_frame(&mut self, bitmap: &Bitmap, mode: RefreshMode) -> Result<(), DriverError>;

    /// Confirms that the last written frame was accepted.
    fn read_frame_ack(&mut self) -> Result<(), DriverError>;

    /// Panel resolution learned by the last successful `probe`, if the bus reports one.
    fn panel_size(&self) -> Option<(u32, u32)> {
        None
    }

    fn release(&mut self) {}
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// `base * 2^(failures - 1)`, clamped to the cap; zero before any failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

pub struct HardwareProbe<D> {
    bus: BusHandle<D>,
    driver_name: &'static str,
    status: HardwareStatus,
    panel_size: Option<(u32, u32)>,
    backoff: Backoff,
    failure_threshold: u32,
}

impl<D: HardwareDriver> HardwareProbe<D> {
    pub fn new(driver: D, cfg: &ProbeConfig, bus_timeout: Duration) -> Self {
        let driver_name = driver.name();
        Self {
            bus: BusHandle::new(driver, bus_timeout),
            driver_name,
            status: HardwareStatus::default(),
            panel_size: None,
            backoff: Backoff::new(cfg.backoff_base, cfg.backoff_cap),
            failure_threshold: cfg.failure_threshold,
        }
    }

    /// Never fails: every bus error counts as `Absent`.
    pub async fn detect(&mut self) -> Presence {
        let answer = self
            .bus
            .call("probe", |driver| {
                driver.probe()?;
                Ok(driver.panel_size())
            })
            .await;
        match answer {
            Ok(panel_size) => {
                if panel_size.is_some() {
                    self.panel_size = panel_size;
                }
                let previous = self.status.record_success();
                if previous != Presence::Present {
                    info!(driver = self.driver_name, "дисплей обнаружен");
                } else {
                    debug!(driver = self.driver_name, "дисплей на месте");
                }
                Presence::Present
            }
            Err(err) => {
                self.status.record_failure();
                warn!(
                    driver = self.driver_name,
                    failures = self.status.consecutive_failures,
                    threshold = self.failure_threshold,
                    error = %err,
                    "дисплей не отвечает"
                );
                Presence::Absent
            }
        }
    }

    pub fn status(&self) -> &HardwareStatus {
        &self.status
    }

    pub fn panel_size(&self) -> Option<(u32, u32)> {
        self.panel_size
    }

    pub fn backoff_delay(&self) -> Duration {
        self.backoff.delay_for(self.status.consecutive_failures)
    }

    pub fn failures_exhausted(&self) -> bool {
        self.status.consecutive_failures >= self.failure_threshold
    }

    /// The bus is lent out only while the panel is confirmed present.
    pub fn bus(&self) -> Option<&BusHandle<D>> {
        match self.status.presence {
            Presence::Present => Some(&self.bus),
            Presence::Unknown | Presence::Absent => None,
        }
    }

    pub fn release(self) {
        match self.bus.release() {
            Some(mut driver) => {
                driver.release();
                info!(driver = self.driver_name, "шина дисплея освобождена");
            }
            None => warn!(
                driver = self.driver_name,
                "шина занята зависшей операцией, освобождение отложено"
            ),
        }
    }
}
