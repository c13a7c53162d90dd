use super::SensorError;
use crate::state::LoadAverage;
use std::fs;
use std::path::Path;
use sysinfo::{ComponentExt, CpuExt, DiskExt, NetworkExt, NetworksExt, System, SystemExt};
use tracing::debug;

const LOOPBACK_IFACE: &str = "lo";

pub fn refresh(system: &mut System) {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_disks_list();
    system.refresh_disks();
    system.refresh_networks_list();
    system.refresh_networks();
    system.refresh_components_list();
    system.refresh_components();
}

pub fn cpu_load(system: &System) -> f64 {
    f64::from(system.global_cpu_info().cpu_usage())
}

pub fn host_name(system: &System) -> Result<String, SensorError> {
    system
        .host_name()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| SensorError::Unavailable("имя хоста".to_string()))
}

/// `(used, total)` in bytes.
pub fn memory(system: &System) -> Result<(u64, u64), SensorError> {
    let total = system.total_memory();
    if total == 0 {
        return Err(SensorError::Unavailable("объём памяти".to_string()));
    }
    Ok((system.used_memory(), total))
}

/// `(free, total)` in bytes for the filesystem mounted at `mount`.
pub fn disk(system: &System, mount: &Path) -> Result<(u64, u64), SensorError> {
    system
        .disks()
        .iter()
        .find(|d| d.mount_point() == mount)
        .map(|d| (d.available_space(), d.total_space()))
        .filter(|(_, total)| *total > 0)
        .ok_or_else(|| SensorError::Unavailable(format!("диск {}", mount.display())))
}

pub fn uptime(system: &System) -> Result<u64, SensorError> {
    match system.uptime() {
        0 => Err(SensorError::Unavailable("время работы".to_string())),
        seconds => Ok(seconds),
    }
}

pub fn load_average(system: &System) -> Result<LoadAverage, SensorError> {
    let load = system.load_average();
    if [load.one, load.five, load.fifteen]
        .iter()
        .any(|v| !v.is_finite() || *v < 0.0)
    {
        return Err(SensorError::Unavailable("средняя нагрузка".to_string()));
    }
    Ok(LoadAverage {
        one: load.one,
        five: load.five,
        fifteen: load.fifteen,
    })
}

/// `(sent, received)` bytes summed over every interface except loopback.
pub fn network_totals(system: &System) -> Result<(u64, u64), SensorError> {
    let mut seen = false;
    let mut sent = 0_u64;
    let mut recv = 0_u64;
    for (iface, data) in system.networks().iter() {
        if iface == LOOPBACK_IFACE {
            continue;
        }
        seen = true;
        sent = sent.saturating_add(data.total_transmitted());
        recv = recv.saturating_add(data.total_received());
    }
    if !seen {
        return Err(SensorError::Unavailable("сетевые интерфейсы".to_string()));
    }
    Ok((sent, recv))
}

/// Thermal zone file first, then any sysinfo component that looks like the SoC.
pub fn cpu_temperature(system: &System, thermal_zone: &Path) -> Result<f64, SensorError> {
    match read_thermal_zone(thermal_zone) {
        Ok(celsius) => Ok(celsius),
        Err(err) => {
            debug!(path = %thermal_zone.display(), error = %err, "термозона недоступна, пробуем sysinfo");
            system
                .components()
                .iter()
                .find(|c| {
                    let label = c.label().to_lowercase();
                    (label.contains("cpu") || label.contains("soc")) && c.temperature() > 0.0
                })
                .map(|c| f64::from(c.temperature()))
                .ok_or(err)
        }
    }
}

fn read_thermal_zone(path: &Path) -> Result<f64, SensorError> {
    let raw = fs::read_to_string(path).map_err(|source| SensorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_millidegrees(&raw).ok_or_else(|| SensorError::Parse {
        what: "температура термозоны",
        input: raw.trim().to_string(),
    })
}

/// `thermal_zone*/temp` is always in millidegrees Celsius.
fn parse_millidegrees(raw: &str) -> Option<f64> {
    let celsius = raw.trim().parse::<f64>().ok()? / 1000.0;
    celsius.is_finite().then_some(celsius)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thermal_values_are_millidegrees() {
        assert_eq!(parse_millidegrees("45200\n"), Some(45.2));
        assert_eq!(parse_millidegrees("1000"), Some(1.0));
        assert_eq!(parse_millidegrees("500"), Some(0.5));
        assert_eq!(parse_millidegrees("-5000"), Some(-5.0));
        assert_eq!(parse_millidegrees("n/a"), None);
    }

    #[test]
    fn thermal_zone_file_is_preferred() {
        let dir = tempfile::tempdir().expect("временный каталог");
        let path = dir.path().join("temp");
        fs::write(&path, "48312\n").expect("запись");
        let celsius = cpu_temperature(&System::new(), &path).expect("температура");
        assert!((celsius - 48.312).abs() < 1e-9);
    }

    #[test]
    fn unreadable_thermal_zone_reports_the_path() {
        let dir = tempfile::tempdir().expect("временный каталог");
        let err = read_thermal_zone(&dir.path().join("missing")).expect_err("ожидалась ошибка");
        assert!(matches!(err, SensorError::Io { .. }));

        let path = dir.path().join("temp");
        fs::write(&path, "hot").expect("запись");
        assert!(matches!(
            read_thermal_zone(&path),
            Err(SensorError::Parse { .. })
        ));
    }

    #[test]
    fn readings_from_a_live_system_are_sane() {
        let mut system = System::new();
        refresh(&mut system);
        if let Ok((used, total)) = memory(&system) {
            assert!(used <= total);
        }
        if let Ok((free, total)) = disk(&system, Path::new("/")) {
            assert!(free <= total);
        }
    }
}
