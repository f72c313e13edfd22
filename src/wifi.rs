//! Wi-Fi association collaborator.
//!
//! The device is an access point; the host has to join its network before any
//! UDP traffic can flow. How that happens is platform specific, so the session
//! drives a [`WifiAdapter`] through [`associate_device`] and never touches the
//! network configuration itself.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DroneConfig;
use crate::events::{EventHub, StatusEvent};
use crate::{DroneError, Result};

/// Output line `netsh` prints when a connect request succeeded.
const NETSH_CONNECTED: &str = "Connection request was completed successfully.";

/// Upper bound on a single `netsh` invocation.
const NETSH_TIMEOUT: Duration = Duration::from_secs(15);

/// Platform network configuration used during `connect()`.
///
/// Every method may be called many times in a row; implementations should be
/// cheap to retry.
#[async_trait::async_trait]
pub trait WifiAdapter: Send + Sync {
    /// Names of the networks currently visible.
    async fn discover_networks(&self) -> Result<Vec<String>>;

    /// Join `name`. `Ok(false)` means the request was refused.
    async fn associate(&self, name: &str) -> Result<bool>;

    /// Cycle the adapter so the next scan is fresh.
    async fn reset(&self) -> Result<()> {
        Ok(())
    }
}

/// For hosts that are already on the device network.
#[derive(Debug, Clone)]
pub struct AssumeAssociated {
    ssid: String,
}

impl AssumeAssociated {
    /// `ssid` is reported as the only visible network and is always joined.
    pub fn new(ssid: impl Into<String>) -> Self {
        Self { ssid: ssid.into() }
    }
}

#[async_trait::async_trait]
impl WifiAdapter for AssumeAssociated {
    async fn discover_networks(&self) -> Result<Vec<String>> {
        Ok(vec![self.ssid.clone()])
    }

    async fn associate(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Windows `netsh` based adapter.
#[derive(Debug, Clone)]
pub struct NetshAdapter {
    interface: String,
    program: String,
    command_timeout: Duration,
}

impl NetshAdapter {
    /// `interface` is the adapter name as shown by `netsh interface show interface`.
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            program: "netsh".to_string(),
            command_timeout: NETSH_TIMEOUT,
        }
    }

    /// Adapter for the interface named by `config.adapter_name`.
    pub fn from_config(config: &DroneConfig) -> Self {
        Self::new(config.adapter_name.clone())
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(program = %self.program, ?args, "Running netsh");
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.command_timeout, output)
            .await
            .map_err(|_| DroneError::Timeout { duration: self.command_timeout })?
            .map_err(|e| DroneError::wifi_failed_with_source("failed to run netsh", Box::new(e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(DroneError::wifi_failed(format!(
                "netsh {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stdout.trim()
            )));
        }
        Ok(stdout)
    }
}

#[async_trait::async_trait]
impl WifiAdapter for NetshAdapter {
    async fn discover_networks(&self) -> Result<Vec<String>> {
        let output = self.run(&["wlan", "show", "network"]).await?;
        Ok(parse_ssid_list(&output))
    }

    async fn associate(&self, name: &str) -> Result<bool> {
        let name_arg = format!("name={name}");
        let interface_arg = format!("interface={}", self.interface);
        let output = self.run(&["wlan", "connect", &name_arg, &interface_arg]).await?;
        Ok(output.lines().any(|line| line.trim() == NETSH_CONNECTED))
    }

    async fn reset(&self) -> Result<()> {
        let name_arg = format!("name={}", self.interface);
        self.run(&["interface", "set", "interface", &name_arg, "admin=disabled"]).await?;
        self.run(&["interface", "set", "interface", &name_arg, "admin=enabled"]).await?;
        Ok(())
    }
}

/// Extract network names from `netsh wlan show network` output.
pub fn parse_ssid_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().split_once(':'))
        .filter(|(key, _)| key.trim().starts_with("SSID"))
        .map(|(_, name)| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Find and join the device network.
///
/// Retries without bound: first until a network starting with `prefix` shows
/// up, then until joining it succeeds. Adapter errors count as a miss. Every
/// wait observes `cancel`, which ends the search with
/// [`DroneError::Cancelled`].
pub async fn associate_device(
    adapter: &dyn WifiAdapter,
    prefix: &str,
    retry_delay: Duration,
    cancel: &CancellationToken,
    events: &EventHub,
) -> Result<String> {
    let mut attempt = 0u64;
    let ssid = loop {
        attempt += 1;
        events.status(StatusEvent::NetworkSearch { attempt });

        if let Err(e) = cancellable(cancel, adapter.reset()).await? {
            warn!(attempt, error = %e, "Wi-Fi adapter reset failed");
        }

        match cancellable(cancel, adapter.discover_networks()).await? {
            Ok(networks) => {
                if let Some(ssid) = networks.into_iter().find(|n| n.starts_with(prefix)) {
                    break ssid;
                }
                debug!(attempt, prefix, "Device network not visible");
            }
            Err(e) => warn!(attempt, error = %e, "Wi-Fi scan failed"),
        }

        pause(cancel, retry_delay).await?;
    };

    info!(%ssid, attempts = attempt, "Device network discovered");
    events.status(StatusEvent::NetworkDiscovered { ssid: ssid.clone() });

    loop {
        match cancellable(cancel, adapter.associate(&ssid)).await? {
            Ok(true) => break,
            Ok(false) => debug!(%ssid, "Association refused"),
            Err(e) => warn!(%ssid, error = %e, "Association failed"),
        }
        pause(cancel, retry_delay).await?;
    }

    info!(%ssid, "Associated with device network");
    events.status(StatusEvent::NetworkAssociated { ssid: ssid.clone() });
    Ok(ssid)
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DroneError::cancelled("wifi association")),
        out = fut => Ok(out),
    }
}

async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    cancellable(cancel, tokio::time::sleep(delay)).await
}
