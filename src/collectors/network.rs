//! Addresses and Wi-Fi state from the usual Linux tools.

use super::SensorError;
use crate::state::TailscaleStatus;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub iface: String,
    pub address: String,
}

pub async fn interface_addresses(timeout: Duration) -> Result<Vec<InterfaceAddress>, SensorError> {
    let stdout = run("ip", &["-4", "-o", "addr", "show"], timeout).await?;
    Ok(parse_ip_addr(&stdout))
}

pub async fn wifi_ssid(timeout: Duration) -> Result<String, SensorError> {
    let ssid = run("iwgetid", &["-r"], timeout).await?;
    let ssid = ssid.trim();
    if ssid.is_empty() {
        return Err(SensorError::Unavailable("нет подключения к Wi-Fi".to_string()));
    }
    Ok(ssid.to_string())
}

/// First IPv4 address that is neither loopback nor on the tunnel interface.
pub fn primary_address(addresses: &[InterfaceAddress], tunnel_iface: &str) -> Option<String> {
    addresses
        .iter()
        .find(|a| a.iface != "lo" && a.iface != tunnel_iface && !a.address.starts_with("127."))
        .map(|a| a.address.clone())
}

pub fn tailscale_status(addresses: &[InterfaceAddress], iface: &str) -> TailscaleStatus {
    addresses
        .iter()
        .find(|a| a.iface == iface)
        .map(|a| TailscaleStatus::Up(a.address.clone()))
        .unwrap_or(TailscaleStatus::Down)
}

/// Parses `ip -4 -o addr show`, one address per line:
/// `2: wlan0    inet 192.168.1.20/24 brd 192.168.1.255 scope global wlan0\ ...`
fn parse_ip_addr(output: &str) -> Vec<InterfaceAddress> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let _index = tokens.next()?;
            let iface = tokens.next()?.trim_end_matches(':');
            if tokens.next()? != "inet" {
                return None;
            }
            let cidr = tokens.next()?;
            let address = cidr.split_once('/').map_or(cidr, |(addr, _)| addr);
            Some(InterfaceAddress {
                iface: iface.to_string(),
                address: address.to_string(),
            })
        })
        .collect()
}

async fn run(program: &'static str, args: &[&str], timeout: Duration) -> Result<String, SensorError> {
    run_at(Path::new(program), program, args, timeout).await
}

/// The child is killed if it has not finished within `timeout`.
async fn run_at(
    program: &Path,
    label: &'static str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, SensorError> {
    let child = Command::new(program).args(args).kill_on_drop(true).output();
    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| SensorError::Command {
            program: label,
            message: format!("нет ответа за {timeout:?}"),
        })?
        .map_err(|err| SensorError::Command {
            program: label,
            message: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(SensorError::Command {
            program: label,
            message: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
