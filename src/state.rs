use crate::hardware::RefreshMode;
use std::time::SystemTime;

/// One sampling pass worth of host health data. `None` means the source could
/// not be read during this pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSnapshot {
    pub captured_at: SystemTime,
    pub host_name: Option<String>,
    pub cpu_temperature_c: Option<f64>,
    pub cpu_load_pct: Option<f64>,
    pub mem_used_bytes: Option<u64>,
    pub mem_total_bytes: Option<u64>,
    pub disk_free_bytes: Option<u64>,
    pub disk_total_bytes: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub battery_pct: Option<u8>,
    pub battery_charging: Option<bool>,
    pub load_average: Option<LoadAverage>,
    pub ip_address: Option<String>,
    pub net_sent_bytes: Option<u64>,
    pub net_recv_bytes: Option<u64>,
    pub wifi_ssid: Option<String>,
    pub tailscale: Option<TailscaleStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailscaleStatus {
    Up(String),
    Down,
}

impl SystemSnapshot {
    #[cfg(test)]
    pub fn empty(captured_at: SystemTime) -> Self {
        Self {
            captured_at,
            host_name: None,
            cpu_temperature_c: None,
            cpu_load_pct: None,
            mem_used_bytes: None,
            mem_total_bytes: None,
            disk_free_bytes: None,
            disk_total_bytes: None,
            uptime_seconds: None,
            battery_pct: None,
            battery_charging: None,
            load_average: None,
            ip_address: None,
            net_sent_bytes: None,
            net_recv_bytes: None,
            wifi_ssid: None,
            tailscale: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presence {
    #[default]
    Unknown,
    Present,
    Absent,
}

#[derive(Debug, Clone, Default)]
pub struct HardwareStatus {
    pub presence: Presence,
    pub consecutive_failures: u32,
}

impl HardwareStatus {
    /// Returns the presence seen before this probe.
    pub fn record_success(&mut self) -> Presence {
        let previous = self.presence;
        self.presence = Presence::Present;
        self.consecutive_failures = 0;
        previous
    }

    pub fn record_failure(&mut self) -> Presence {
        let previous = self.presence;
        self.presence = Presence::Absent;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        previous
    }
}

/// What the panel currently shows, as far as the renderer knows.
#[derive(Debug, Clone, Default)]
pub struct RefreshState {
    pub cycles_since_full_refresh: u32,
    pub last_content_hash: Option<u32>,
}

impl RefreshState {
    /// A full refresh is due on the first flush, and whenever another partial
    /// refresh would reach `period`.
    pub fn full_refresh_due(&self, period: u32) -> bool {
        self.last_content_hash.is_none()
            || self.cycles_since_full_refresh.saturating_add(1) >= period
    }

    pub fn record_flush(&mut self, content_hash: u32, mode: RefreshMode) {
        self.last_content_hash = Some(content_hash);
        match mode {
            RefreshMode::Full => self.cycles_since_full_refresh = 0,
            RefreshMode::Partial => {
                self.cycles_since_full_refresh = self.cycles_since_full_refresh.saturating_add(1)
            }
        }
    }

    /// Forget the panel contents, e.g. after it was unplugged.
    pub fn invalidate(&mut self) {
        self.last_content_hash = None;
        self.cycles_since_full_refresh = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_status_transitions() {
        let mut status = HardwareStatus::default();
        assert_eq!(status.presence, Presence::Unknown);

        assert_eq!(status.record_failure(), Presence::Unknown);
        assert_eq!(status.record_failure(), Presence::Absent);
        assert_eq!(status.consecutive_failures, 2);

        assert_eq!(status.record_success(), Presence::Absent);
        assert_eq!(status.presence, Presence::Present);
        assert_eq!(status.consecutive_failures, 0);

        assert_eq!(status.record_failure(), Presence::Present);
        assert_eq!(status.consecutive_failures, 1);
    }

    #[test]
    fn first_flush_is_always_full() {
        let state = RefreshState::default();
        assert!(state.full_refresh_due(10));
        assert!(state.full_refresh_due(1));
    }

    #[test]
    fn every_period_th_flush_is_full() {
        let mut state = RefreshState::default();
        state.record_flush(1, RefreshMode::Full);

        let mut modes = Vec::new();
        for hash in 2..=21 {
            let mode = if state.full_refresh_due(10) {
                RefreshMode::Full
            } else {
                RefreshMode::Partial
            };
            state.record_flush(hash, mode);
            assert!(state.cycles_since_full_refresh < 10);
            modes.push(mode);
        }

        let fulls: Vec<usize> = modes
            .iter()
            .enumerate()
            .filter(|(_, m)| **m == RefreshMode::Full)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(fulls, vec![9, 19]);
    }

    #[test]
    fn period_of_one_means_full_refresh_only() {
        let mut state = RefreshState::default();
        state.record_flush(1, RefreshMode::Full);
        assert!(state.full_refresh_due(1));
    }

    #[test]
    fn invalidate_forces_full_refresh() {
        let mut state = RefreshState::default();
        state.record_flush(7, RefreshMode::Full);
        state.record_flush(8, RefreshMode::Partial);
        assert!(!state.full_refresh_due(10));

        state.invalidate();
        assert!(state.full_refresh_due(10));
        assert_eq!(state.last_content_hash, None);
    }
}
