use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the platform config dir holding settings and the store.
pub const APP_DIR_NAME: &str = "BleTab";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bletab".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,
    #[serde(default)]
    pub known_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Patient lookup
    #[serde(default = "default_lookup_base_url")]
    pub lookup_base_url: String,
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
}

impl Settings {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_duration_secs: default_scan_duration_secs(),
            known_addresses: Vec::new(),
            last_connected_address: None,
            log_settings: LogSettings::default(),
            lookup_base_url: default_lookup_base_url(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
        }
    }
}

fn default_scan_duration_secs() -> u64 {
    10
}
fn default_lookup_base_url() -> String {
    "https://prescoipd.com/".to_string()
}
fn default_lookup_timeout_secs() -> u64 {
    30
}

/// Returns `<config dir>/BleTab`, creating it if needed.
pub fn app_config_dir() -> anyhow::Result<PathBuf> {
    let mut path = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    path.push(APP_DIR_NAME);
    fs::create_dir_all(&path)?;
    Ok(path)
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let mut settings_path = app_config_dir()?;
        settings_path.push("settings.json");
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit path, falling back to defaults.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Record a peripheral we connected to.
    pub fn remember_address(&mut self, address: &str) -> anyhow::Result<()> {
        if !self.settings.known_addresses.iter().any(|a| a == address) {
            self.settings.known_addresses.push(address.to_string());
        }
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}
