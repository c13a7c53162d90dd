//! Exclusive, time-bounded access to a blocking bus device.
//!
//! Drivers are written against blocking `embedded-hal`/file APIs. Every call goes
//! through [`BusHandle::call`], which runs it on the blocking pool under
//! `tokio::time::timeout`. A call that is abandoned by the timeout keeps the device
//! locked until it returns; later calls fail with [`BusError::Busy`] rather than
//! entering the device concurrently.

use crate::hardware::DriverError;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("{op}: превышено время ожидания шины ({timeout:?})")]
    Timeout { op: &'static str, timeout: Duration },
    #[error("{op}: устройство занято незавершённой операцией")]
    Busy { op: &'static str },
    #[error("{op}: {source}")]
    Device {
        op: &'static str,
        source: DriverError,
    },
    #[error("{op}: рабочий поток шины завершился аварийно: {source}")]
    Worker {
        op: &'static str,
        source: JoinError,
    },
}

pub struct BusHandle<T> {
    device: Arc<Mutex<T>>,
    timeout: Duration,
}

impl<T: Send + 'static> BusHandle<T> {
    pub fn new(device: T, timeout: Duration) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            timeout,
        }
    }

    pub async fn call<R, F>(&self, op: &'static str, f: F) -> Result<R, BusError>
    where
        F: FnOnce(&mut T) -> Result<R, DriverError> + Send + 'static,
        R: Send + 'static,
    {
        let device = Arc::clone(&self.device);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = match device.try_lock() {
                Ok(guard) => guard,
                // A panicking driver call leaves no partial state worth protecting.
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return Err(BusError::Busy { op }),
            };
            f(&mut *guard).map_err(|source| BusError::Device { op, source })
        });

        match time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(source)) => Err(BusError::Worker { op, source }),
            Err(_elapsed) => Err(BusError::Timeout {
                op,
                timeout: self.timeout,
            }),
        }
    }

    /// Gives the device back. `None` while a timed-out call still holds it; the
    /// device is then dropped by that call once it returns.
    pub fn release(self) -> Option<T> {
        let mutex = Arc::try_unwrap(self.device).ok()?;
        Some(match mutex.into_inner() {
            Ok(device) => device,
            Err(poisoned) => poisoned.into_inner(),
        })
    }
}
