//! Headless sink: every frame replaces a binary PBM (P4) file.

use super::{DriverError, HardwareDriver, RefreshMode};
use crate::layout::Bitmap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

pub struct PbmDriver {
    path: PathBuf,
    expected_len: Option<u64>,
}

impl PbmDriver {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            expected_len: None,
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl HardwareDriver for PbmDriver {
    fn name(&self) -> &'static str {
        "pbm"
    }

    fn probe(&mut self) -> Result<(), DriverError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let meta = fs::metadata(&dir).map_err(|err| DriverError::io(&dir, err))?;
        if !meta.is_dir() || meta.permissions().readonly() {
            return Err(DriverError::Protocol(format!(
                "{} недоступен для записи",
                dir.display()
            )));
        }
        Ok(())
    }

    fn write_frame(&mut self, bitmap: &Bitmap, mode: RefreshMode) -> Result<(), DriverError> {
        let pbm = bitmap.to_pbm();
        let tmp = self.tmp_path();
        fs::write(&tmp, &pbm).map_err(|err| DriverError::io(&tmp, err))?;
        fs::rename(&tmp, &self.path).map_err(|err| DriverError::io(&self.path, err))?;
        self.expected_len = Some(pbm.len() as u64);
        debug!(path = %self.path.display(), ?mode, "кадр записан в PBM");
        Ok(())
    }

    fn read_frame_ack(&mut self) -> Result<(), DriverError> {
        let len = fs::metadata(&self.path)
            .map_err(|err| DriverError::io(&self.path, err))?
            .len();
        match self.expected_len {
            Some(expected) if expected == len => Ok(()),
            Some(expected) => Err(DriverError::Rejected(format!(
                "ожидалось {expected} байт, в файле {len}"
            ))),
            None => Err(DriverError::Rejected("кадр ещё не записан".to_string())),
        }
    }
}
