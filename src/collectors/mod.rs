pub mod battery;
pub mod network;
pub mod system;

use crate::bus::{BusError, BusHandle};
use crate::config::Config;
use crate::state::SystemSnapshot;
use battery::PiJuice;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use sysinfo::{System, SystemExt};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("нет данных: {0}")]
    Unavailable(String),
    #[error("ошибка чтения {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("не удалось разобрать {what}: {input:?}")]
    Parse { what: &'static str, input: String },
    #[error("команда {program} завершилась с ошибкой: {message}")]
    Command {
        program: &'static str,
        message: String,
    },
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Source of one snapshot per cycle.
#[allow(async_fn_in_trait)]
pub trait Sampler {
    /// Never fails; unreadable sources leave their fields absent.
    async fn sample(&mut self) -> SystemSnapshot;
}

/// Remembers which sources are currently failing so that a lost source is
/// reported once rather than on every cycle.
#[derive(Debug, Default)]
pub struct SourceHealth {
    lost: HashSet<&'static str>,
}

impl SourceHealth {
    pub fn track<T>(&mut self, source: &'static str, result: Result<T, SensorError>) -> Option<T> {
        match result {
            Ok(value) => {
                if self.lost.remove(source) {
                    info!(source, "источник метрики снова доступен");
                }
                Some(value)
            }
            Err(err) => {
                if self.lost.insert(source) {
                    warn!(source, error = %err, "источник метрики недоступен");
                } else {
                    debug!(source, error = %err, "источник метрики всё ещё недоступен");
                }
                None
            }
        }
    }

    #[cfg(test)]
    pub fn is_lost(&self, source: &str) -> bool {
        self.lost.contains(source)
    }
}

pub struct MetricsCollector {
    system: System,
    cfg: crate::config::MetricsConfig,
    battery: Option<BusHandle<PiJuice>>,
    health: SourceHealth,
    cpu_baseline: bool,
    command_timeout: Duration,
}

impl MetricsCollector {
    pub fn new(cfg: &Config) -> Self {
        let battery = cfg.battery.enabled.then(|| {
            BusHandle::new(
                PiJuice::new(cfg.battery.i2c_bus.clone(), cfg.battery.i2c_address),
                cfg.bus_timeout,
            )
        });
        Self {
            system: System::new(),
            cfg: cfg.metrics.clone(),
            battery,
            health: SourceHealth::default(),
            cpu_baseline: false,
            command_timeout: cfg.bus_timeout,
        }
    }

    async fn sample_battery(&mut self) -> (Option<u8>, Option<bool>) {
        let Some(bus) = &self.battery else {
            return (None, None);
        };
        let result = bus
            .call("battery", |pijuice| pijuice.read())
            .await
            .map_err(SensorError::from)
            .and_then(|reading| {
                reading.ok_or_else(|| SensorError::Unavailable("батарея не подключена".to_string()))
            });
        match self.health.track("battery", result) {
            Some(reading) => (Some(reading.charge_pct), reading.charging),
            None => (None, None),
        }
    }
}

impl Sampler for MetricsCollector {
    async fn sample(&mut self) -> SystemSnapshot {
        system::refresh(&mut self.system);
        let captured_at = SystemTime::now();

        // sysinfo needs two refreshes before usage means anything.
        let cpu_load_pct = if self.cpu_baseline {
            Some(system::cpu_load(&self.system))
        } else {
            self.cpu_baseline = true;
            None
        };

        let health = &mut self.health;
        let sys = &self.system;
        let host_name = health.track("host_name", system::host_name(sys));
        let cpu_temperature_c = health.track(
            "cpu_temperature",
            system::cpu_temperature(sys, &self.cfg.thermal_zone),
        );
        let memory = health.track("memory", system::memory(sys));
        let disk = health.track("disk", system::disk(sys, &self.cfg.disk_mount));
        let uptime_seconds = health.track("uptime", system::uptime(sys));
        let load_average = health.track("load_average", system::load_average(sys));
        let net_totals = health.track("network_totals", system::network_totals(sys));

        let addresses = health.track(
            "addresses",
            network::interface_addresses(self.command_timeout).await,
        );
        let ip_address = addresses
            .as_deref()
            .and_then(|a| network::primary_address(a, &self.cfg.tailscale_iface));
        let tailscale = addresses
            .as_deref()
            .map(|a| network::tailscale_status(a, &self.cfg.tailscale_iface));
        let wifi_ssid = if self.cfg.wifi {
            health.track("wifi", network::wifi_ssid(self.command_timeout).await)
        } else {
            None
        };

        let (battery_pct, battery_charging) = self.sample_battery().await;

        SystemSnapshot {
            captured_at,
            host_name,
            cpu_temperature_c,
            cpu_load_pct,
            mem_used_bytes: memory.map(|(used, _)| used),
            mem_total_bytes: memory.map(|(_, total)| total),
            disk_free_bytes: disk.map(|(free, _)| free),
            disk_total_bytes: disk.map(|(_, total)| total),
            uptime_seconds,
            battery_pct,
            battery_charging,
            load_average,
            ip_address,
            net_sent_bytes: net_totals.map(|(sent, _)| sent),
            net_recv_bytes: net_totals.map(|(_, recv)| recv),
            wifi_ssid,
            tailscale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_source_is_tracked_until_it_recovers() {
        let mut health = SourceHealth::default();
        assert_eq!(health.track("wifi", Ok(1)), Some(1));
        assert!(!health.is_lost("wifi"));

        let failed: Result<u32, _> = Err(SensorError::Unavailable("нет".to_string()));
        assert_eq!(health.track("wifi", failed), None);
        assert!(health.is_lost("wifi"));
        let failed: Result<u32, _> = Err(SensorError::Unavailable("нет".to_string()));
        assert_eq!(health.track("wifi", failed), None);
        assert!(health.is_lost("wifi"));

        assert_eq!(health.track("wifi", Ok(2)), Some(2));
        assert!(!health.is_lost("wifi"));
    }

    #[tokio::test]
    async fn first_sample_has_no_cpu_load() {
        let mut cfg = Config::default();
        cfg.battery.enabled = false;
        cfg.metrics.wifi = false;
        let mut collector = MetricsCollector::new(&cfg);

        let first = collector.sample().await;
        assert_eq!(first.cpu_load_pct, None);
        assert_eq!(first.battery_pct, None);
        assert_eq!(first.wifi_ssid, None);

        let second = collector.sample().await;
        assert!(second.cpu_load_pct.is_some());
        assert!(second.captured_at >= first.captured_at);
    }

    #[tokio::test]
    async fn unreachable_battery_leaves_fields_absent() {
        let dir = tempfile::tempdir().expect("временный каталог");
        let mut cfg = Config::default();
        cfg.battery.i2c_bus = dir.path().join("i2c-missing");
        cfg.metrics.wifi = false;
        let mut collector = MetricsCollector::new(&cfg);

        let snap = collector.sample().await;
        assert_eq!(snap.battery_pct, None);
        assert_eq!(snap.battery_charging, None);
        assert!(collector.health.is_lost("battery"));
    }
}
