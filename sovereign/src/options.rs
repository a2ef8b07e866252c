//! Orchestrator configuration.
//!
//! Defaults describe the stock device layout. Any subset can be overridden
//! from a TOML file; unknown keys are rejected so typos surface early.

use serde::{Deserialize, Serialize};
use sovereign_shared::errors::{SovereignError, SovereignResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SOVEREIGN_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SovereignOptions {
    pub device: DeviceOptions,
    pub network: NetworkOptions,
    pub identity: IdentityOptions,
    pub timing: TimingOptions,
    /// Base for relative local paths (build outputs, scripts, credentials).
    pub project_dir: PathBuf,
    /// Local credential file pushed to the device on deploy.
    pub credential_file: PathBuf,
    /// Local copy of the boot watchdog script.
    pub local_watchdog_script: PathBuf,
    /// Where the orchestrator keeps its own logs.
    pub state_dir: PathBuf,
}

impl Default for SovereignOptions {
    fn default() -> Self {
        Self {
            device: DeviceOptions::default(),
            network: NetworkOptions::default(),
            identity: IdentityOptions::default(),
            timing: TimingOptions::default(),
            project_dir: PathBuf::from("."),
            credential_file: PathBuf::from(".env"),
            local_watchdog_script: PathBuf::from("host/sovereign_start.sh"),
            state_dir: dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("sovereign"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceOptions {
    /// adb serial; `None` targets the only attached device.
    pub serial: Option<String>,
    pub root: String,
    /// Long-running daemon that supervises each guest.
    pub daemon_script: String,
    /// Directory whose scripts run at device boot.
    pub boot_service_dir: String,
    pub remote_credential_path: String,
    /// World-writable staging area used by pushes.
    pub staging_dir: String,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            serial: None,
            root: "/data/sovereign".to_string(),
            daemon_script: "/data/sovereign/sovereign_start.sh".to_string(),
            boot_service_dir: "/data/adb/service.d".to_string(),
            remote_credential_path: "/data/sovereign/.env".to_string(),
            staging_dir: "/data/local/tmp".to_string(),
        }
    }
}

impl DeviceOptions {
    /// Per-guest daemon log written by the supervisor script.
    pub fn daemon_log(&self, service: &str) -> String {
        format!("{}/daemon_{}.log", self.root, service)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkOptions {
    pub bridge: String,
    pub gateway_cidr: String,
    pub subnet: String,
    /// Interface carrying guest traffic off the device.
    pub uplink: String,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            bridge: "vm_bridge".to_string(),
            gateway_cidr: "192.168.100.1/24".to_string(),
            subnet: "192.168.100.0/24".to_string(),
            uplink: "wlan0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityOptions {
    pub tailscale_bin: String,
    pub api_base: String,
    pub api_key_env: String,
    /// `.env` files searched in order when the env var is unset.
    pub api_key_files: Vec<PathBuf>,
    pub manual_url: String,
}

impl Default for IdentityOptions {
    fn default() -> Self {
        let mut api_key_files = vec![
            PathBuf::from(".env"),
            PathBuf::from("sovereign/.env"),
            PathBuf::from("../sovereign/.env"),
        ];
        if let Some(home) = dirs::home_dir() {
            api_key_files.push(home.join("Projects/android/kernel/sovereign/.env"));
        }
        Self {
            tailscale_bin: "tailscale".to_string(),
            api_base: "https://api.tailscale.com/api/v2".to_string(),
            api_key_env: "TAILSCALE_API_KEY".to_string(),
            api_key_files,
            manual_url: "https://login.tailscale.com/admin/machines".to_string(),
        }
    }
}

/// Timings, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingOptions {
    pub poll_interval_ms: u64,
    pub process_grace_ms: u64,
    pub ready_settle_ms: u64,
    pub launch_settle_ms: u64,
    pub stop_wait_ms: u64,
    pub command_timeout_ms: u64,
    pub quick_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            process_grace_ms: 15_000,
            ready_settle_ms: 2_000,
            launch_settle_ms: 10_000,
            stop_wait_ms: 500,
            command_timeout_ms: 30_000,
            quick_timeout_ms: 5_000,
            probe_timeout_ms: 3_000,
        }
    }
}

impl TimingOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn process_grace(&self) -> Duration {
        Duration::from_millis(self.process_grace_ms)
    }

    pub fn ready_settle(&self) -> Duration {
        Duration::from_millis(self.ready_settle_ms)
    }

    pub fn launch_settle(&self) -> Duration {
        Duration::from_millis(self.launch_settle_ms)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn quick_timeout(&self) -> Duration {
        Duration::from_millis(self.quick_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl SovereignOptions {
    /// Resolve a local path against `project_dir`.
    pub fn local_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Load options from `path`, `$SOVEREIGN_CONFIG`, or the user config dir.
    ///
    /// An explicitly named file must exist. The implicit user config file is
    /// optional; when absent, defaults are returned.
    ///
    /// # Errors
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> SovereignResult<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let (path, required) = match explicit {
            Some(p) => (p, true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                return Err(SovereignError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path).map_err(|e| {
            SovereignError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let options = Self::from_toml(&raw).map_err(|e| match e {
            SovereignError::Config(msg) => {
                SovereignError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(options)
    }

    pub fn from_toml(raw: &str) -> SovereignResult<Self> {
        toml::from_str(raw).map_err(|e| SovereignError::Config(e.to_string()))
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sovereign").join("config.toml"))
}
