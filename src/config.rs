//! Server configuration.
//!
//! Loaded from a TOML file (`<config dir>/clilogger/config.toml` unless
//! overridden). Every field has a default, so a partial file is valid.
//! [`LiveConfig`] hands out whole snapshots; a reload swaps the snapshot
//! atomically and readers holding the old one are unaffected.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{LoggerError, Result};
use crate::protocol::{Entity, Identity, LevelMask, Severity};

/// Default service port: picked by the OS.
pub const DEFAULT_PORT: u16 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Least important severity still displayed
    pub log_level: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_port: Option<u16>,
    pub device_show: DeviceShow,
    /// Shared secret identities must present, when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// When non-empty, only these modules are displayed
    pub whitelist_modules: Vec<String>,
    pub blocklist_modules: Vec<String>,
    /// Device IDs that are always rejected
    pub blocked_devices: Vec<String>,
    pub device_aliases: Vec<DeviceAlias>,
    pub format: FormatConfig,
    pub logging_file: LoggingFile,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: Severity::Info,
            service_name: None,
            service_port: None,
            device_show: DeviceShow::default(),
            secret: None,
            whitelist_modules: Vec::new(),
            blocklist_modules: Vec::new(),
            blocked_devices: Vec::new(),
            device_aliases: Vec::new(),
            format: FormatConfig::default(),
            logging_file: LoggingFile::default(),
        }
    }
}

/// When to show the sending device's name next to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceShow {
    Always,
    Never,
    /// Only while more than one device is connected
    #[default]
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAlias {
    /// Device ID the alias applies to
    pub identifier: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    /// Line template with `{{time}}`, `{{flag}}`, `{{filename}}`, `{{line}}`,
    /// `{{function}}`, `{{message}}` and `{{device}}` placeholders
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// chrono format string for `{{time}}`
    pub time_format: String,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            template: None,
            time_format: "%H:%M:%S%.3f".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingFile {
    pub enabled: bool,
    /// Root of the per-day log directories; `~` is expanded
    pub directory: String,
}

impl Default for LoggingFile {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: "~/.config/clilogger/logs".to_string(),
        }
    }
}

/// How a module is treated by the display filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleMode {
    Whitelist,
    Default,
    Blocklist,
}

impl Configuration {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("clilogger").join("config.toml"))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| LoggerError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LoggerError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoggerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| LoggerError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Write the default configuration to `path` unless a file exists.
    /// Returns whether a file was written.
    pub fn save_default_if_missing(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::default().to_toml()?)?;
        tracing::info!(path = %path.display(), "Wrote default configuration");
        Ok(true)
    }

    /// Load `path`, first creating it with defaults when absent.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        Self::save_default_if_missing(path)?;
        Self::load(path)
    }

    pub fn level_mask(&self) -> LevelMask {
        LevelMask::up_to(self.log_level)
    }

    pub fn module_mode(&self, entity: &Entity) -> ModuleMode {
        let matches = |names: &[String]| {
            names.iter().filter(|n| !n.is_empty()).any(|name| {
                entity.module() == Some(name.as_str())
                    || entity.filename.as_deref() == Some(name.as_str())
            })
        };

        if matches(&self.blocklist_modules) {
            ModuleMode::Blocklist
        } else if matches(&self.whitelist_modules) {
            ModuleMode::Whitelist
        } else {
            ModuleMode::Default
        }
    }

    /// Whether an entry passes the severity and module filters.
    pub fn should_display(&self, entity: &Entity) -> bool {
        if !self.level_mask().allows(entity.severity) {
            return false;
        }
        let whitelisting = self.whitelist_modules.iter().any(|n| !n.is_empty());
        match self.module_mode(entity) {
            ModuleMode::Blocklist => false,
            ModuleMode::Whitelist => true,
            ModuleMode::Default => !whitelisting,
        }
    }

    /// Admission check for an identity. `Err` carries the rejection reason.
    pub fn check_identity(&self, identity: &Identity) -> std::result::Result<(), String> {
        if self
            .blocked_devices
            .iter()
            .any(|d| d == identity.device_id())
        {
            return Err(format!("device {} is blocked", identity.device_id()));
        }
        if let Some(secret) = self.secret.as_deref().filter(|s| !s.is_empty()) {
            if identity.secret() != Some(secret) {
                return Err("secret mismatch".to_string());
            }
        }
        Ok(())
    }

    pub fn alias_for(&self, device_id: &str) -> Option<&str> {
        self.device_aliases
            .iter()
            .find(|a| a.identifier == device_id)
            .map(|a| a.alias.as_str())
    }

    /// Display name for entries from `identity`, given how many identified
    /// sessions are connected.
    pub fn device_name(&self, identity: &Identity, identified_sessions: usize) -> Option<String> {
        let show = match self.device_show {
            DeviceShow::Always => true,
            DeviceShow::Never => false,
            DeviceShow::Auto => identified_sessions > 1,
        };
        show.then(|| identity.host_name().to_string())
    }
}

// =============================================================================
// Live configuration
// =============================================================================

/// Shared, reloadable configuration.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    tx: Arc<watch::Sender<Arc<Configuration>>>,
    path: Option<PathBuf>,
}

impl LiveConfig {
    pub fn new(config: Configuration, path: Option<PathBuf>) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self {
            tx: Arc::new(tx),
            path,
        }
    }

    /// The current configuration. Holding the snapshot never blocks a reload.
    pub fn snapshot(&self) -> Arc<Configuration> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn replace(&self, config: Configuration) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Re-read the backing file. On error the current snapshot is kept.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let config = Configuration::load(path)?;
        self.replace(config);
        tracing::info!(path = %path.display(), "Configuration reloaded");
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Configuration>> {
        self.tx.subscribe()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entity_from(filename: Option<&str>, severity: Severity) -> Entity {
        Entity::new("m", severity, 100).with_location(filename.map(str::to_string), None, None)
    }

    #[test]
    fn test_default_roundtrips_through_toml() {
        let config = Configuration::default();
        let text = config.to_toml().unwrap();
        assert_eq!(Configuration::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_file() {
        let config = Configuration::from_toml(
            r#"
            log_level = "debug"
            blocklist_modules = ["Foo"]
            device_show = "always"

            [[device_aliases]]
            identifier = "ABC"
            alias = "Kitchen iPad"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, Severity::Debug);
        assert_eq!(config.device_show, DeviceShow::Always);
        assert_eq!(config.alias_for("ABC"), Some("Kitchen iPad"));
        assert_eq!(config.alias_for("XYZ"), None);
        assert_eq!(config.format, FormatConfig::default());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let err = Configuration::from_toml("log_level = 7").unwrap_err();
        assert!(matches!(err, LoggerError::Config(_)));
    }

    #[test]
    fn test_blocklisted_module_hidden() {
        let config = Configuration {
            blocklist_modules: vec!["Foo".into()],
            ..Default::default()
        };
        assert!(!config.should_display(&entity_from(Some("Foo"), Severity::Error)));
        assert!(!config.should_display(&entity_from(Some("src/Foo.swift"), Severity::Info)));
        assert!(config.should_display(&entity_from(Some("Bar"), Severity::Info)));
        assert!(config.should_display(&entity_from(None, Severity::Info)));
    }

    #[test]
    fn test_whitelist_limits_display() {
        let config = Configuration {
            whitelist_modules: vec!["Net".into()],
            ..Default::default()
        };
        assert!(config.should_display(&entity_from(Some("Net.swift"), Severity::Info)));
        assert!(!config.should_display(&entity_from(Some("Disk.swift"), Severity::Info)));
        assert!(!config.should_display(&entity_from(None, Severity::Info)));
    }

    #[test]
    fn test_level_filter() {
        let config = Configuration {
            log_level: Severity::Warning,
            ..Default::default()
        };
        assert!(config.should_display(&entity_from(None, Severity::Error)));
        assert!(config.should_display(&entity_from(None, Severity::Warning)));
        assert!(!config.should_display(&entity_from(None, Severity::Info)));
    }

    #[test]
    fn test_check_identity() {
        let config = Configuration {
            blocked_devices: vec!["bad".into()],
            secret: Some("pw".into()),
            ..Default::default()
        };
        let good = Identity::new("h", "ok", Some("pw".into()));
        assert!(config.check_identity(&good).is_ok());
        assert!(config
            .check_identity(&Identity::new("h", "bad", Some("pw".into())))
            .unwrap_err()
            .contains("blocked"));
        assert!(config
            .check_identity(&Identity::new("h", "ok", None))
            .is_err());

        // No secret configured: any secret is accepted
        let open = Configuration::default();
        assert!(open.check_identity(&Identity::new("h", "ok", None)).is_ok());
    }

    #[test]
    fn test_device_name_policy() {
        let identity = Identity::new("desk", "d", None);
        let mut config = Configuration::default();
        assert_eq!(config.device_name(&identity, 1), None);
        assert_eq!(config.device_name(&identity, 2), Some("desk".into()));

        config.device_show = DeviceShow::Always;
        assert_eq!(config.device_name(&identity, 1), Some("desk".into()));
        config.device_show = DeviceShow::Never;
        assert_eq!(config.device_name(&identity, 5), None);
    }

    #[test]
    fn test_load_or_init_writes_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Configuration::load_or_init(&path).unwrap();
        assert_eq!(config, Configuration::default());
        assert!(path.exists());
        assert!(!Configuration::save_default_if_missing(&path).unwrap());
    }

    #[test]
    fn test_live_reload_swaps_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "log_level = \"info\"\n").unwrap();

        let live = LiveConfig::new(Configuration::load(&path).unwrap(), Some(path.clone()));
        let before = live.snapshot();
        let mut changes = live.subscribe();

        std::fs::write(&path, "log_level = \"error\"\n").unwrap();
        live.reload().unwrap();

        assert_eq!(before.log_level, Severity::Info);
        assert_eq!(live.snapshot().log_level, Severity::Error);
        assert!(changes.has_changed().unwrap());

        // A broken file keeps the current snapshot
        std::fs::write(&path, "log_level = [").unwrap();
        assert!(live.reload().is_err());
        assert_eq!(live.snapshot().log_level, Severity::Error);
    }
}
