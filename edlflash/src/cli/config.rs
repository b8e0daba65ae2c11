//! Command-line interface configuration
//!
//! The project configuration lives in `edlflash.toml` and the remembered
//! serial ports in `edlflash_ports.toml`. Both are looked up in the current
//! directory, its parent and finally the user's configuration directory.

use std::{
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};
use serialport::UsbPortInfo;

use crate::{error::Error, firehose::FirehoseConfig};

const PROJECT_CONFIG_FILE: &str = "edlflash.toml";
const PORT_CONFIG_FILE: &str = "edlflash_ports.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
}

/// A configured, known USB device
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub vid: u16,
    /// USB Product ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub pid: u16,
}

fn deserialize_hex_to_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x");

    u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
}

fn serialize_u16_to_hex<S>(value: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{value:04x}"))
}

impl UsbDevice {
    /// Check if the given USB port matches this device
    pub fn matches(&self, port: &UsbPortInfo) -> bool {
        self.vid == port.vid && self.pid == port.pid
    }
}

/// Configuration for the project and the port
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Project configuration
    pub project_config: ProjectConfig,
    /// Port configuration
    pub port_config: PortConfig,
}

/// Project configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ProjectConfig {
    /// Firehose programmer uploaded when none is given on the command line
    #[serde(default)]
    pub programmer: Option<PathBuf>,
    /// Firehose session parameters
    #[serde(default)]
    pub firehose: FirehoseConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct PortConfig {
    /// Preferred serial port connection information
    #[serde(default)]
    pub connection: Connection,
    /// Preferred USB devices
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    /// Path of the file to save the configuration to
    #[serde(skip)]
    save_path: PathBuf,
}

impl Config {
    /// Load configuration from the configuration files
    pub fn load() -> Result<Self> {
        let project_config_file = Self::find_config_path(PROJECT_CONFIG_FILE)?;
        let port_config_file = Self::find_config_path(PORT_CONFIG_FILE)?;

        let raw_data = read_to_string(&project_config_file).unwrap_or_default();
        let project_config = Self::parse_project_config(&raw_data)
            .wrap_err_with(|| format!("Failed to parse {}", project_config_file.display()))?;
        debug!("Config: {:#?}", &project_config);

        let mut port_config = match read_to_string(&port_config_file) {
            Ok(data) => toml::from_str(&data)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to parse {}", port_config_file.display()))?,
            Err(_) => PortConfig::default(),
        };
        port_config.save_path = port_config_file;
        debug!("Port Config: {:#?}", &port_config);

        Ok(Config {
            project_config,
            port_config,
        })
    }

    fn parse_project_config(raw_data: &str) -> Result<ProjectConfig> {
        let toml_value = toml::from_str::<toml::Value>(raw_data)
            .unwrap_or_else(|_| toml::Value::Table(Default::default()));
        if let toml::Value::Table(top_level) = &toml_value {
            Self::validate_keys(top_level)?;
        }

        toml::from_str(raw_data).into_diagnostic()
    }

    /// Firehose settings must live in the `[firehose]` section
    fn validate_keys(top_level: &toml::map::Map<String, toml::Value>) -> Result<()> {
        let firehose_keys = toml::Value::try_from(FirehoseConfig::default())
            .ok()
            .and_then(|value| value.as_table().cloned())
            .unwrap_or_default();

        let misplaced = top_level
            .keys()
            .filter(|key| firehose_keys.contains_key(key.as_str()))
            .map(|key| format!("'{key}' should be under [firehose]!"))
            .collect::<Vec<_>>();

        if misplaced.is_empty() {
            Ok(())
        } else {
            Err(Error::MisplacedKey(misplaced.join(", ")).into())
        }
    }

    fn write_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
        let serialized = toml::to_string(config)
            .into_diagnostic()
            .wrap_err("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .into_diagnostic()
                .wrap_err("Failed to create config directory")?;
        }

        write(path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write config to {}", path.display()))
    }

    /// Save port configuration to the configuration file
    pub fn save_with<F: Fn(&mut PortConfig)>(&self, modify_fn: F) -> Result<()> {
        let mut copy = self.port_config.clone();
        modify_fn(&mut copy);

        Self::write_config(&copy, &self.port_config.save_path)
    }

    fn find_config_path(filename: &str) -> Result<PathBuf, Error> {
        let current_dir = std::env::current_dir()?;
        let local_config = current_dir.join(filename);
        if local_config.exists() {
            return Ok(local_config);
        }
        if let Some(parent_folder) = current_dir.parent() {
            let workspace_config = parent_folder.join(filename);
            if workspace_config.exists() {
                return Ok(workspace_config);
            }
        }

        let project_dirs = ProjectDirs::from("rs", "edl", "edlflash").ok_or(Error::NoConfigDir)?;
        Ok(project_dirs.config_dir().join(filename))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, Serialize)]
    struct TestData {
        #[serde(
            serialize_with = "serialize_u16_to_hex",
            deserialize_with = "deserialize_hex_to_u16"
        )]
        value: u16,
    }

    #[test]
    fn test_deserialize_hex_to_u16() {
        let result: Result<TestData, _> = toml::from_str(r#"value = "05c6""#);
        assert_eq!(result.unwrap().value, 0x05c6);

        let result: Result<TestData, _> = toml::from_str(r#"value = "0x9008""#);
        assert_eq!(result.unwrap().value, 0x9008);

        let result: Result<TestData, _> = toml::from_str(r#"value = "A1B2""#);
        assert_eq!(result.unwrap().value, 0xA1B2);

        let result: Result<TestData, _> = toml::from_str(r#"value = "gg""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_u16_to_hex() {
        let serialized = toml::to_string(&TestData { value: 0x5c6 }).unwrap();
        assert_eq!(serialized.trim(), r#"value = "05c6""#);
    }

    #[test]
    fn project_config_defaults() {
        let config = Config::parse_project_config("").unwrap();

        assert_eq!(config.programmer, None);
        assert_eq!(config.firehose, FirehoseConfig::default());
    }

    #[test]
    fn firehose_section() {
        let config = Config::parse_project_config(
            r#"
            programmer = "prog_firehose_ddr.elf"

            [firehose]
            memory_name = "eMMC"
            sector_size = 512
            fast_erase = false
            "#,
        )
        .unwrap();

        assert_eq!(
            config.programmer.as_deref(),
            Some(Path::new("prog_firehose_ddr.elf"))
        );
        assert_eq!(config.firehose.memory_name, "eMMC");
        assert_eq!(config.firehose.sector_size, 512);
        assert!(!config.firehose.fast_erase);
        assert_eq!(config.firehose.max_lun, 6);
    }

    #[test]
    fn misplaced_firehose_keys() {
        let result = Config::parse_project_config("sector_size = 512\n");
        assert!(result.is_err());
    }

    #[test]
    fn port_config() {
        let config: PortConfig = toml::from_str(
            r#"
            [connection]
            serial = "/dev/ttyUSB0"

            [[usb_device]]
            vid = "05c6"
            pid = "9008"
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(
            config.usb_device,
            vec![UsbDevice {
                vid: 0x05c6,
                pid: 0x9008
            }]
        );
    }
}
