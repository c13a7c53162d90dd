use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_interval", with = "duration_str")]
    pub interval: Duration,
    #[serde(default = "default_full_refresh_period")]
    pub full_refresh_period: u32,
    #[serde(default = "default_reprobe_every_cycles")]
    pub reprobe_every_cycles: u32,
    #[serde(default = "default_bus_timeout", with = "duration_str")]
    pub bus_timeout: Duration,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default = "default_backoff_base", with = "duration_str")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_cap", with = "duration_str")]
    pub backoff_cap: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// PaPiRus HAT: LM75 on I2C for presence, EPD FUSE filesystem for frames.
    Papirus,
    /// Binary PBM file, for running without a panel.
    Pbm,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    #[serde(default = "default_driver")]
    pub driver: DriverKind,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: PathBuf,
    #[serde(default = "default_display_address")]
    pub i2c_address: u8,
    #[serde(default = "default_epd_path")]
    pub epd_path: PathBuf,
    #[serde(default = "default_pbm_path")]
    pub pbm_path: PathBuf,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatteryConfig {
    #[serde(default = "default_battery_enabled")]
    pub enabled: bool,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: PathBuf,
    #[serde(default = "default_battery_address")]
    pub i2c_address: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_thermal_zone")]
    pub thermal_zone: PathBuf,
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,
    #[serde(default = "default_wifi")]
    pub wifi: bool,
    #[serde(default = "default_tailscale_iface")]
    pub tailscale_iface: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            full_refresh_period: default_full_refresh_period(),
            reprobe_every_cycles: default_reprobe_every_cycles(),
            bus_timeout: default_bus_timeout(),
            probe: ProbeConfig::default(),
            display: DisplayConfig::default(),
            battery: BatteryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            i2c_bus: default_i2c_bus(),
            i2c_address: default_display_address(),
            epd_path: default_epd_path(),
            pbm_path: default_pbm_path(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            enabled: default_battery_enabled(),
            i2c_bus: default_i2c_bus(),
            i2c_address: default_battery_address(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            thermal_zone: default_thermal_zone(),
            disk_mount: default_disk_mount(),
            wifi: default_wifi(),
            tailscale_iface: default_tailscale_iface(),
        }
    }
}

/// Values taken from the command line or environment; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub interval: Option<Duration>,
    pub full_refresh_period: Option<u32>,
    pub backoff_base: Option<Duration>,
    pub backoff_cap: Option<Duration>,
    pub failure_threshold: Option<u32>,
    pub driver: Option<DriverKind>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        Ok(cfg)
    }

    /// Loads the file when one is given, otherwise starts from defaults, then
    /// applies overrides and validates the merged result.
    pub fn resolve(
        path: Option<&Path>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        cfg.apply_overrides(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(v) = overrides.interval {
            self.interval = v;
        }
        if let Some(v) = overrides.full_refresh_period {
            self.full_refresh_period = v;
        }
        if let Some(v) = overrides.backoff_base {
            self.probe.backoff_base = v;
        }
        if let Some(v) = overrides.backoff_cap {
            self.probe.backoff_cap = v;
        }
        if let Some(v) = overrides.failure_threshold {
            self.probe.failure_threshold = v;
        }
        if let Some(v) = overrides.driver {
            self.display.driver = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval < Duration::from_secs(1) {
            return Err(ConfigError::Validation(
                "interval должен быть >= 1s".to_string(),
            ));
        }
        if self.full_refresh_period < 1 {
            return Err(ConfigError::Validation(
                "full_refresh_period должно быть >= 1".to_string(),
            ));
        }
        if self.reprobe_every_cycles < 1 {
            return Err(ConfigError::Validation(
                "reprobe_every_cycles должно быть >= 1".to_string(),
            ));
        }
        if self.bus_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "bus_timeout должен быть > 0".to_string(),
            ));
        }
        if self.bus_timeout >= self.interval {
            return Err(ConfigError::Validation(
                "bus_timeout должен быть меньше interval".to_string(),
            ));
        }

        validate_probe(&self.probe)?;
        validate_display(&self.display)?;
        validate_battery(&self.battery)?;
        validate_metrics(&self.metrics)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_probe(cfg: &ProbeConfig) -> Result<(), ConfigError> {
    if cfg.backoff_base.is_zero() {
        return Err(ConfigError::Validation(
            "probe.backoff_base должен быть > 0".to_string(),
        ));
    }
    if cfg.backoff_cap < cfg.backoff_base {
        return Err(ConfigError::Validation(
            "probe.backoff_cap должен быть >= probe.backoff_base".to_string(),
        ));
    }
    if cfg.failure_threshold < 1 {
        return Err(ConfigError::Validation(
            "probe.failure_threshold должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_display(cfg: &DisplayConfig) -> Result<(), ConfigError> {
    if !(1..=MAX_PANEL_SIDE).contains(&cfg.width) || !(1..=MAX_PANEL_SIDE).contains(&cfg.height)
    {
        return Err(ConfigError::Validation(format!(
            "display.width и display.height должны быть в диапазоне 1..{MAX_PANEL_SIDE}"
        )));
    }
    match cfg.driver {
        DriverKind::Papirus => {
            if cfg.epd_path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "display.epd_path не должен быть пустым".to_string(),
                ));
            }
            if cfg.i2c_bus.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "display.i2c_bus не должен быть пустым".to_string(),
                ));
            }
            if cfg.i2c_address > MAX_I2C_ADDRESS {
                return Err(ConfigError::Validation(
                    "display.i2c_address должен быть 7-битным адресом".to_string(),
                ));
            }
        }
        DriverKind::Pbm => {
            if cfg.pbm_path.file_name().is_none() {
                return Err(ConfigError::Validation(
                    "display.pbm_path должен указывать на файл".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn validate_battery(cfg: &BatteryConfig) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    if cfg.i2c_bus.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "battery.i2c_bus не должен быть пустым".to_string(),
        ));
    }
    if cfg.i2c_address > MAX_I2C_ADDRESS {
        return Err(ConfigError::Validation(
            "battery.i2c_address должен быть 7-битным адресом".to_string(),
        ));
    }
    Ok(())
}

fn validate_metrics(cfg: &MetricsConfig) -> Result<(), ConfigError> {
    if !cfg.disk_mount.is_absolute() {
        return Err(ConfigError::Validation(
            "metrics.disk_mount должен быть абсолютным путём".to_string(),
        ));
    }
    if cfg.tailscale_iface.trim().is_empty() {
        return Err(ConfigError::Validation(
            "metrics.tailscale_iface не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

const MAX_PANEL_SIDE: u32 = 1024;
const MAX_I2C_ADDRESS: u8 = 0x7F;

const fn default_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_full_refresh_period() -> u32 {
    10
}

const fn default_reprobe_every_cycles() -> u32 {
    30
}

const fn default_bus_timeout() -> Duration {
    Duration::from_secs(2)
}

const fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

const fn default_backoff_cap() -> Duration {
    Duration::from_secs(60)
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_driver() -> DriverKind {
    DriverKind::Papirus
}

fn default_i2c_bus() -> PathBuf {
    PathBuf::from("/dev/i2c-1")
}

const fn default_display_address() -> u8 {
    0x48
}

fn default_epd_path() -> PathBuf {
    PathBuf::from("/dev/epd")
}

fn default_pbm_path() -> PathBuf {
    PathBuf::from("/tmp/papirusd.pbm")
}

const fn default_width() -> u32 {
    200
}

const fn default_height() -> u32 {
    96
}

const fn default_battery_enabled() -> bool {
    true
}

const fn default_battery_address() -> u8 {
    0x14
}

fn default_thermal_zone() -> PathBuf {
    PathBuf::from("/sys/class/thermal/thermal_zone0/temp")
}

fn default_disk_mount() -> PathBuf {
    PathBuf::from("/")
}

const fn default_wifi() -> bool {
    true
}

fn default_tailscale_iface() -> String {
    "tailscale0".to_string()
}

/// Durations are written the humantime way in YAML: `10s`, `1m 30s`, `500ms`.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("конфигурация по умолчанию должна быть валидной");
        assert_eq!(cfg.interval, Duration::from_secs(10));
        assert_eq!(cfg.full_refresh_period, 10);
        assert_eq!(cfg.probe.failure_threshold, 5);
        assert_eq!(cfg.display.i2c_address, 0x48);
        assert_eq!(cfg.battery.i2c_address, 0x14);
    }

    #[test]
    fn example_file_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("разбор примера");
        cfg.validate().expect("пример должен быть валидным");
        assert_eq!(cfg.display.driver, DriverKind::Papirus);
        assert_eq!(cfg.probe.backoff_cap, Duration::from_secs(60));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: Config = serde_yaml::from_str("interval: 30s\nprobe:\n  failure_threshold: 8\n")
            .expect("разбор частичного файла");
        cfg.validate().expect("валидация");
        assert_eq!(cfg.interval, Duration::from_secs(30));
        assert_eq!(cfg.probe.failure_threshold, 8);
        assert_eq!(cfg.probe.backoff_base, Duration::from_secs(1));
        assert_eq!(cfg.display.width, 200);
    }

    #[test]
    fn malformed_duration_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("временный файл");
        writeln!(file, "interval: soon").expect("запись");
        let err = Config::load_from_file(file.path()).expect_err("ожидалась ошибка разбора");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load_from_file("/nonexistent/papirusd.yaml")
            .expect_err("ожидалась ошибка чтения");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = Config::default();
        cfg.full_refresh_period = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.probe.backoff_cap = Duration::from_millis(500);
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.probe.failure_threshold = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.interval = Duration::from_millis(200);
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.display.i2c_address = 0x80;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn overrides_win_over_file_and_are_validated() {
        let mut file = tempfile::NamedTempFile::new().expect("временный файл");
        writeln!(file, "interval: 20s\nfull_refresh_period: 4").expect("запись");

        let overrides = ConfigOverrides {
            interval: Some(Duration::from_secs(5)),
            driver: Some(DriverKind::Pbm),
            ..ConfigOverrides::default()
        };
        let cfg = Config::resolve(Some(file.path()), &overrides).expect("слияние");
        assert_eq!(cfg.interval, Duration::from_secs(5));
        assert_eq!(cfg.full_refresh_period, 4);
        assert_eq!(cfg.display.driver, DriverKind::Pbm);

        let bad = ConfigOverrides {
            failure_threshold: Some(0),
            ..ConfigOverrides::default()
        };
        assert!(matches!(
            Config::resolve(None, &bad),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn override_can_repair_an_invalid_file_value() {
        let mut file = tempfile::NamedTempFile::new().expect("временный файл");
        writeln!(file, "interval: 500ms").expect("запись");

        let overrides = ConfigOverrides {
            interval: Some(Duration::from_secs(30)),
            ..ConfigOverrides::default()
        };
        let cfg = Config::resolve(Some(file.path()), &overrides).expect("слияние");
        assert_eq!(cfg.interval, Duration::from_secs(30));

        assert!(matches!(
            Config::resolve(Some(file.path()), &ConfigOverrides::default()),
            Err(ConfigError::Validation(_))
        ));
    }
}
