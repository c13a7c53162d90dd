use crate::bus::{BusError, BusHandle};
use crate::hardware::{HardwareDriver, RefreshMode};
use crate::layout::DisplayFrame;
use crate::state::RefreshState;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed(RefreshMode),
    /// Same content as the panel already shows and no full refresh due.
    Skipped,
}

/// Pushes frames to the panel and decides between partial and full refresh.
pub struct DisplayRenderer {
    full_refresh_period: u32,
    state: RefreshState,
}

impl DisplayRenderer {
    pub fn new(full_refresh_period: u32) -> Self {
        Self {
            full_refresh_period,
            state: RefreshState::default(),
        }
    }

    pub fn refresh_state(&self) -> &RefreshState {
        &self.state
    }

    /// The panel may show anything now; the next flush is full.
    pub fn invalidate(&mut self) {
        self.state.invalidate();
    }

    /// `RefreshState` only changes once the panel has acknowledged the frame.
    pub async fn flush<D: HardwareDriver>(
        &mut self,
        frame: DisplayFrame,
        bus: &BusHandle<D>,
    ) -> Result<FlushOutcome, BusError> {
        let full_due = self.state.full_refresh_due(self.full_refresh_period);
        if !full_due && self.state.last_content_hash == Some(frame.content_hash) {
            debug!(hash = frame.content_hash, "кадр не изменился, обновление пропущено");
            return Ok(FlushOutcome::Skipped);
        }

        let mode = if full_due {
            RefreshMode::Full
        } else {
            RefreshMode::Partial
        };
        let DisplayFrame {
            bitmap,
            content_hash,
        } = frame;

        bus.call("write_frame", move |driver| {
            driver.write_frame(&bitmap, mode)?;
            driver.read_frame_ack()
        })
        .await?;

        self.state.record_flush(content_hash, mode);
        debug!(?mode, hash = content_hash, "кадр выведен");
        Ok(FlushOutcome::Flushed(mode))
    }
}
