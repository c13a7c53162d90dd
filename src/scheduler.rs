//! Probe, then sample -> layout -> flush on a fixed period until told to stop
//! or the panel is gone for good.

use crate::collectors::Sampler;
use crate::hardware::{HardwareDriver, HardwareProbe};
use crate::layout::LayoutEngine;
use crate::render::{DisplayRenderer, FlushOutcome};
use crate::state::Presence;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    HardwareAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Probing,
    Running,
    Draining,
    Stopped(StopReason),
}

enum RunExit {
    Shutdown,
    Lost,
}

pub struct Scheduler<D, S> {
    probe: HardwareProbe<D>,
    sampler: S,
    layout: LayoutEngine,
    renderer: DisplayRenderer,
    interval: Duration,
    reprobe_every: u32,
    phase: Phase,
}

impl<D: HardwareDriver, S: Sampler> Scheduler<D, S> {
    pub fn new(
        probe: HardwareProbe<D>,
        sampler: S,
        layout: LayoutEngine,
        renderer: DisplayRenderer,
        interval: Duration,
        reprobe_every: u32,
    ) -> Self {
        Self {
            probe,
            sampler,
            layout,
            renderer,
            interval,
            reprobe_every,
            phase: Phase::Starting,
        }
    }

    /// Runs until shutdown is requested or the failure threshold is reached.
    /// The bus is released on every path out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> StopReason {
        let reason = self.drive(&mut shutdown).await;
        if reason == StopReason::Shutdown {
            self.enter(Phase::Draining);
        }
        self.probe.release();
        info!(phase = ?Phase::Stopped(reason), "планировщик остановлен");
        reason
    }

    async fn drive(&mut self, shutdown: &mut watch::Receiver<bool>) -> StopReason {
        loop {
            self.enter(Phase::Probing);
            if let Err(reason) = self.probe_until_present(shutdown).await {
                return reason;
            }

            self.fit_layout();
            self.renderer.invalidate();
            self.enter(Phase::Running);
            match self.run_until_lost(shutdown).await {
                RunExit::Shutdown => return StopReason::Shutdown,
                RunExit::Lost => warn!("дисплей пропал, возвращаемся к обнаружению"),
            }
        }
    }

    async fn probe_until_present(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), StopReason> {
        loop {
            if self.probe.status().presence == Presence::Absent {
                if self.probe.failures_exhausted() {
                    error!(
                        failures = self.probe.status().consecutive_failures,
                        "дисплей так и не ответил, останавливаемся"
                    );
                    return Err(StopReason::HardwareAbsent);
                }
                let delay = self.probe.backoff_delay();
                debug!(?delay, "пауза перед повторной проверкой дисплея");
                if or_shutdown(time::sleep(delay), shutdown).await.is_none() {
                    return Err(StopReason::Shutdown);
                }
            }
            if *shutdown.borrow() {
                return Err(StopReason::Shutdown);
            }
            if self.probe.detect().await == Presence::Present {
                return Ok(());
            }
        }
    }

    async fn run_until_lost(&mut self, shutdown: &mut watch::Receiver<bool>) -> RunExit {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles_since_probe = 0_u32;
        let mut reprobe_pending = false;

        loop {
            if or_shutdown(ticker.tick(), shutdown).await.is_none() {
                info!("получен сигнал остановки, цикл завершён");
                return RunExit::Shutdown;
            }

            if reprobe_pending || cycles_since_probe >= self.reprobe_every {
                cycles_since_probe = 0;
                reprobe_pending = false;
                if self.probe.detect().await != Presence::Present {
                    return RunExit::Lost;
                }
                self.fit_layout();
            }

            let snapshot = self.sampler.sample().await;
            let frame = self.layout.render(&snapshot);
            let Some(bus) = self.probe.bus() else {
                return RunExit::Lost;
            };
            match self.renderer.flush(frame, bus).await {
                Ok(FlushOutcome::Flushed(mode)) => debug!(
                    ?mode,
                    since_full = self.renderer.refresh_state().cycles_since_full_refresh,
                    "дисплей обновлён"
                ),
                Ok(FlushOutcome::Skipped) => {}
                Err(err) => {
                    warn!(error = %err, "не удалось обновить дисплей, перепроверим на следующем цикле");
                    reprobe_pending = true;
                }
            }
            cycles_since_probe = cycles_since_probe.saturating_add(1);
        }
    }

    /// Rebuilds the layout when the panel reports a different resolution.
    fn fit_layout(&mut self) {
        let Some((width, height)) = self.probe.panel_size() else {
            return;
        };
        if self.layout.size() == (width, height) {
            return;
        }
        info!(
            from = ?self.layout.size(),
            to = ?(width, height),
            "разметка подогнана под размер панели"
        );
        self.layout = LayoutEngine::new(width, height);
        self.renderer.invalidate();
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            info!(from = ?self.phase, to = ?phase, "смена фазы");
            self.phase = phase;
        }
    }
}

/// Awaits `fut` unless a stop is requested first. A dropped sender counts as a
/// stop request.
async fn or_shutdown<F: Future>(
    fut: F,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<F::Output> {
    if *shutdown.borrow_and_update() {
        return None;
    }
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow_and_update() {
                    return None;
                }
            }
            out = &mut fut => return Some(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::hardware::fake::{FakeDriver, FakeState};
    use crate::hardware::RefreshMode;
    use crate::state::SystemSnapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;

    struct CountingSampler {
        calls: Arc<AtomicUsize>,
        changing: bool,
    }

    impl Sampler for CountingSampler {
        async fn sample(&mut self) -> SystemSnapshot {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            SystemSnapshot {
                cpu_load_pct: Some(if self.changing { n as f64 } else { 5.0 }),
                ..SystemSnapshot::empty(SystemTime::UNIX_EPOCH)
            }
        }
    }

    struct Harness {
        scheduler: Scheduler<FakeDriver, CountingSampler>,
        state: Arc<Mutex<FakeState>>,
        calls: Arc<AtomicUsize>,
    }

    fn harness(threshold: u32, reprobe_every: u32, changing: bool) -> Harness {
        let (driver, state) = FakeDriver::new();
        let probe_cfg = ProbeConfig {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            failure_threshold: threshold,
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            HardwareProbe::new(driver, &probe_cfg, Duration::from_secs(2)),
            CountingSampler {
                calls: Arc::clone(&calls),
                changing,
            },
            LayoutEngine::new(200, 96),
            DisplayRenderer::new(10),
            Duration::from_secs(10),
            reprobe_every,
        );
        Harness {
            scheduler,
            state,
            calls,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_never_appears() {
        let h = harness(5, 30, true);
        h.state.lock().unwrap().present = false;
        let (_tx, rx) = watch::channel(false);

        let started = time::Instant::now();
        assert_eq!(h.scheduler.run(rx).await, StopReason::HardwareAbsent);

        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        let state = h.state.lock().unwrap();
        assert_eq!(state.probes, 5);
        assert!(state.writes.is_empty());
        assert!(state.released);
        // 1 + 2 + 4 + 8 seconds of backoff between the five probes.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn hot_unplug_mid_run() {
        let h = harness(3, 2, true);
        {
            let mut state = h.state.lock().unwrap();
            state.probe_script.extend([true, true, false, false, false]);
            state.present = false;
        }
        let (_tx, rx) = watch::channel(false);

        assert_eq!(h.scheduler.run(rx).await, StopReason::HardwareAbsent);

        let state = h.state.lock().unwrap();
        assert_eq!(state.probes, 5);
        assert_eq!(
            state.writes,
            vec![
                RefreshMode::Full,
                RefreshMode::Partial,
                RefreshMode::Partial,
                RefreshMode::Partial,
            ]
        );
        assert_eq!(h.calls.load(Ordering::SeqCst), 4);
        assert!(state.released);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_and_releases() {
        let h = harness(5, 30, true);
        let (tx, rx) = watch::channel(false);

        let (reason, _) = tokio::join!(h.scheduler.run(rx), async {
            time::sleep(Duration::from_secs(35)).await;
            tx.send(true).expect("отправка сигнала");
        });

        assert_eq!(reason, StopReason::Shutdown);
        assert_eq!(h.calls.load(Ordering::SeqCst), 4);
        let state = h.state.lock().unwrap();
        assert_eq!(state.writes.len(), 4);
        assert_eq!(state.acks, 4);
        assert!(state.released);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let h = harness(5, 30, true);
        h.state.lock().unwrap().present = false;
        let (tx, rx) = watch::channel(false);

        let (reason, _) = tokio::join!(h.scheduler.run(rx), async {
            time::sleep(Duration::from_millis(2_500)).await;
            tx.send(true).expect("отправка сигнала");
        });

        assert_eq!(reason, StopReason::Shutdown);
        let state = h.state.lock().unwrap();
        assert_eq!(state.probes, 2);
        assert!(state.released);
    }

    #[tokio::test(start_paused = true)]
    async fn static_content_is_written_once() {
        let h = harness(5, 30, false);
        let (tx, rx) = watch::channel(false);

        let (reason, _) = tokio::join!(h.scheduler.run(rx), async {
            time::sleep(Duration::from_secs(55)).await;
            tx.send(true).expect("отправка сигнала");
        });

        assert_eq!(reason, StopReason::Shutdown);
        assert_eq!(h.calls.load(Ordering::SeqCst), 6);
        assert_eq!(h.state.lock().unwrap().writes, vec![RefreshMode::Full]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_triggers_reprobe_next_cycle() {
        let h = harness(5, 30, true);
        h.state.lock().unwrap().fail_writes = true;
        let (tx, rx) = watch::channel(false);

        let (reason, _) = tokio::join!(h.scheduler.run(rx), async {
            time::sleep(Duration::from_secs(25)).await;
            tx.send(true).expect("отправка сигнала");
        });

        assert_eq!(reason, StopReason::Shutdown);
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        let state = h.state.lock().unwrap();
        // Initial probe plus one after each of the first two failed flushes.
        assert_eq!(state.probes, 3);
        assert!(state.writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn layout_follows_detected_panel_size() {
        let h = harness(5, 30, false);
        h.state.lock().unwrap().panel_size = Some((264, 176));
        let (tx, rx) = watch::channel(false);

        let (reason, _) = tokio::join!(h.scheduler.run(rx), async {
            time::sleep(Duration::from_secs(5)).await;
            tx.send(true).expect("отправка сигнала");
        });

        assert_eq!(reason, StopReason::Shutdown);
        let state = h.state.lock().unwrap();
        assert_eq!(state.writes, vec![RefreshMode::Full]);
        let frame = state.last_frame.as_ref().expect("кадр выведен");
        assert_eq!((frame.width(), frame.height()), (264, 176));
        assert_eq!(state.probes, 1);
    }
}
