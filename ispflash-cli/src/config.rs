//! Configuration file support for ispflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ISPFLASH_*)
//! 3. Local config file (./ispflash.toml or ./ispflash_ports.toml)
//! 4. Global config file (~/.config/ispflash/config.toml)

use {
    crate::CliError,
    directories::ProjectDirs,
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

const LOCAL_CONFIG: &str = "ispflash.toml";
const LOCAL_PORTS: &str = "ispflash_ports.toml";

/// USB-UART bridge remembered for port auto-selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Transfer baud rate for the UART bootloaders.
    pub baud: Option<u32>,
    /// USB vendor ID the bootloader or bridge must have.
    pub vid: Option<u16>,
    /// USB product ID the bootloader or bridge must have.
    pub pid: Option<u16>,
    /// Per-read timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Default bootloader family ("wch", "puya", "stm32", "stc", "stc-usb").
    pub family: Option<String>,
    /// Skip read-back verification by default.
    #[serde(default)]
    pub skip_verify: bool,
    /// Stay in the bootloader after flashing.
    #[serde(default)]
    pub no_run: bool,
    /// Use the early CH32V203 key exchange.
    #[serde(default)]
    pub legacy_key: bool,
    /// Oscillator frequency in Hz to trim STC parts to when flashing.
    pub trim: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    ///
    /// Unreadable files found by discovery are skipped with a warning.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_or_warn(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_or_warn(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        if let Some(ports_config) = Self::load_ports_config() {
            config.port = ports_config;
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike discovered files, an explicit path must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content).map_err(|e| {
            CliError::Config(format!("Failed to parse config file {}: {e}", path.display()))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn load_or_warn(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match Self::load_from_path(path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("{e}");
                None
            },
        }
    }

    /// Load ports configuration from ispflash_ports.toml.
    fn load_ports_config() -> Option<PortConfig> {
        let global = Self::global_config_dir().map(|dir| dir.join("ports.toml"));
        [Some(PathBuf::from(LOCAL_PORTS)), global]
            .into_iter()
            .flatten()
            .filter(|path| path.exists())
            .find_map(|path| {
                let content = fs::read_to_string(&path).ok()?;
                let config = toml::from_str(&content).ok()?;
                debug!("Loaded ports config from {}", path.display());
                Some(config)
            })
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ispflash").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        let conn = &mut self
            .port
            .connection;
        let theirs = other
            .port
            .connection;
        conn.serial = theirs
            .serial
            .or(conn.serial.take());
        conn.baud = theirs.baud.or(conn.baud);
        conn.vid = theirs.vid.or(conn.vid);
        conn.pid = theirs.pid.or(conn.pid);
        conn.timeout_ms = theirs
            .timeout_ms
            .or(conn.timeout_ms);
        self.port
            .usb_device
            .extend(
                other
                    .port
                    .usb_device,
            );

        let flash = &mut self.flash;
        flash.family = other
            .flash
            .family
            .or(flash.family.take());
        flash.trim = other.flash.trim.or(flash.trim);
        flash.skip_verify |= other
            .flash
            .skip_verify;
        flash.no_run |= other.flash.no_run;
        flash.legacy_key |= other
            .flash
            .legacy_key;
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        // Don't add duplicates
        if self
            .port
            .usb_device
            .contains(&device)
        {
            return Ok(());
        }

        // Try to save to local file first, fall back to global
        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.port
            .usb_device
            .push(device);

        let content = toml::to_string_pretty(&self.port)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::tempdir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_none());
        assert!(config.port.connection.vid.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(config.flash.family.is_none());
        assert!(!config.flash.skip_verify);
        assert!(!config.flash.no_run);
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x1A86,
            pid: 0x7523,
        };
        assert!(device.matches(0x1A86, 0x7523));
        assert!(!device.matches(0x1A86, 0x7522));
        assert!(!device.matches(0x10C4, 0x7523));
    }

    #[test]
    fn test_merge_prefers_other_values() {
        let mut base = Config::default();
        base.port.connection.baud = Some(115200);
        base.port.connection.serial = Some("/dev/ttyUSB0".to_string());

        let mut other = Config::default();
        other.port.connection.baud = Some(57600);
        other.flash.family = Some("stc".to_string());
        other.flash.trim = Some(24_000_000);

        base.merge(other);
        assert_eq!(base.port.connection.baud, Some(57600));
        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.flash.family.as_deref(), Some("stc"));
        assert_eq!(base.flash.trim, Some(24_000_000));
    }

    #[test]
    fn test_merge_keeps_flags_and_extends_devices() {
        let mut base = Config::default();
        base.flash.skip_verify = true;
        base.port.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });

        let mut other = Config::default();
        other.flash.legacy_key = true;
        other.port.usb_device.push(UsbDevice { vid: 0x10C4, pid: 0xEA60 });

        base.merge(other);
        assert!(base.flash.skip_verify);
        assert!(base.flash.legacy_key);
        assert_eq!(base.port.usb_device.len(), 2);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port.connection]
serial = "/dev/ttyUSB0"
baud = 57600
vid = 0x1a86
pid = 0x7523
timeout_ms = 2000

[[port.usb_device]]
vid = 6790
pid = 29987

[flash]
family = "puya"
skip_verify = true
trim = 24000000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.port.connection.baud, Some(57600));
        assert_eq!(config.port.connection.vid, Some(0x1A86));
        assert_eq!(config.port.connection.timeout_ms, Some(2000));
        assert_eq!(config.port.usb_device.len(), 1);
        assert_eq!(config.flash.family.as_deref(), Some("puya"));
        assert!(config.flash.skip_verify);
        assert_eq!(config.flash.trim, Some(24_000_000));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.connection.serial.is_none());
        assert!(config.flash.family.is_none());
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[port.connection]
serial = "/dev/ttyUSB1"
[flash]
family = "stm32"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.flash.family.as_deref(), Some("stm32"));
    }

    #[test]
    fn test_load_from_path_errors_are_config_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load_from_path(&missing),
            Err(CliError::Config(_))
        ));

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "[flash\nfamily =").unwrap();
        assert!(matches!(
            Config::load_from_path(&broken),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_global_config_path_names_the_tool() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("ispflash"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
