mod bus;
mod collectors;
mod config;
mod hardware;
mod layout;
mod render;
mod scheduler;
mod state;

use clap::Parser;
use collectors::MetricsCollector;
use config::{Config, ConfigOverrides, DriverKind};
use hardware::papirus::{epd_mounted, PapirusDriver};
use hardware::pbm::PbmDriver;
use hardware::{HardwareDriver, HardwareProbe};
use layout::LayoutEngine;
use render::DisplayRenderer;
use scheduler::{Scheduler, StopReason};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG_INVALID: i32 = 2;
const EXIT_HARDWARE_ABSENT: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "papirusd")]
#[command(version)]
#[command(about = "Состояние Raspberry Pi на e-paper дисплее PaPiRus")]
struct Cli {
    /// YAML configuration file; built-in defaults when omitted.
    #[arg(long, env = "PAPIRUSD_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
    /// Poll interval, e.g. `10s`.
    #[arg(long, env = "PAPIRUSD_INTERVAL", value_parser = humantime::parse_duration)]
    interval: Option<Duration>,
    /// Every N-th flush is a full refresh.
    #[arg(long, env = "PAPIRUSD_FULL_REFRESH_PERIOD")]
    full_refresh_period: Option<u32>,
    #[arg(long, env = "PAPIRUSD_BACKOFF_BASE", value_parser = humantime::parse_duration)]
    backoff_base: Option<Duration>,
    #[arg(long, env = "PAPIRUSD_BACKOFF_CAP", value_parser = humantime::parse_duration)]
    backoff_cap: Option<Duration>,
    #[arg(long, env = "PAPIRUSD_FAILURE_THRESHOLD")]
    failure_threshold: Option<u32>,
    #[arg(long, env = "PAPIRUSD_DRIVER", value_enum)]
    driver: Option<DriverKind>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            interval: self.interval,
            full_refresh_period: self.full_refresh_period,
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
            failure_threshold: self.failure_threshold,
            driver: self.driver,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::resolve(cli.config.as_deref(), &cli.overrides()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    };

    info!(
        driver = ?cfg.display.driver,
        interval = %humantime::format_duration(cfg.interval),
        full_refresh_period = cfg.full_refresh_period,
        failure_threshold = cfg.probe.failure_threshold,
        width = cfg.display.width,
        height = cfg.display.height,
        "papirusd запущен"
    );

    let shutdown_rx = match install_signal_handlers() {
        Ok(rx) => rx,
        Err(err) => {
            error!(error = %err, "не удалось установить обработчики сигналов");
            std::process::exit(EXIT_FATAL);
        }
    };

    let reason = match cfg.display.driver {
        DriverKind::Papirus => {
            if !epd_mounted(&cfg.display.epd_path) {
                warn!(
                    path = %cfg.display.epd_path.display(),
                    "EPD FUSE не смонтирован, кадры не дойдут до панели"
                );
            }
            run(PapirusDriver::new(&cfg.display), &cfg, shutdown_rx).await
        }
        DriverKind::Pbm => run(PbmDriver::new(cfg.display.pbm_path.clone()), &cfg, shutdown_rx).await,
    };

    let code = match reason {
        StopReason::Shutdown => EXIT_OK,
        StopReason::HardwareAbsent => EXIT_HARDWARE_ABSENT,
    };
    info!(code, "papirusd завершён");
    std::process::exit(code);
}

async fn run<D: HardwareDriver>(
    driver: D,
    cfg: &Config,
    shutdown: watch::Receiver<bool>,
) -> StopReason {
    let probe = HardwareProbe::new(driver, &cfg.probe, cfg.bus_timeout);
    let scheduler = Scheduler::new(
        probe,
        MetricsCollector::new(cfg),
        LayoutEngine::new(cfg.display.width, cfg.display.height),
        DisplayRenderer::new(cfg.full_refresh_period),
        cfg.interval,
        cfg.reprobe_every_cycles,
    );
    scheduler.run(shutdown).await
}

/// SIGINT and SIGTERM both flip the shutdown flag once.
fn install_signal_handlers() -> std::io::Result<watch::Receiver<bool>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("получен SIGINT, выполняется остановка"),
            _ = sigterm.recv() => info!("получен SIGTERM, выполняется остановка"),
        }
        let _ = shutdown_tx.send(true);
    });

    Ok(shutdown_rx)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
