//! In-memory driver for exercising the probe, renderer and scheduler without a bus.

use super::{DriverError, HardwareDriver, RefreshMode};
use crate::layout::Bitmap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub struct FakeState {
    /// Scripted probe answers, consumed front first; `present` applies after.
    pub probe_script: VecDeque<bool>,
    pub present: bool,
    pub fail_writes: bool,
    /// Reported after a successful probe; frames of any other size are rejected.
    pub panel_size: Option<(u32, u32)>,
    pub probes: usize,
    pub writes: Vec<RefreshMode>,
    pub acks: usize,
    pub last_frame: Option<Bitmap>,
    pub released: bool,
}

pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub fn new() -> (Self, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState {
            probe_script: VecDeque::new(),
            present: true,
            fail_writes: false,
            panel_size: None,
            probes: 0,
            writes: Vec::new(),
            acks: 0,
            last_frame: None,
            released: false,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl HardwareDriver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn probe(&mut self) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.probes += 1;
        let answer = state.probe_script.pop_front().unwrap_or(state.present);
        if answer {
            Ok(())
        } else {
            Err(DriverError::i2c(0x48, "NACK"))
        }
    }

    fn write_frame(&mut self, bitmap: &Bitmap, mode: RefreshMode) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(DriverError::Rejected("write failed".to_string()));
        }
        if let Some((width, height)) = state.panel_size {
            if (bitmap.width(), bitmap.height()) != (width, height) {
                return Err(DriverError::FrameSize {
                    width,
                    height,
                    got_width: bitmap.width(),
                    got_height: bitmap.height(),
                });
            }
        }
        state.writes.push(mode);
        state.last_frame = Some(bitmap.clone());
        Ok(())
    }

    fn read_frame_ack(&mut self) -> Result<(), DriverError> {
        self.state.lock().unwrap().acks += 1;
        Ok(())
    }

    fn panel_size(&self) -> Option<(u32, u32)> {
        self.state.lock().unwrap().panel_size
    }

    fn release(&mut self) {
        self.state.lock().unwrap().released = true;
    }
}
