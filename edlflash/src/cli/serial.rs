use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::{error, info};
use miette::{IntoDiagnostic, Result};
use serialport::{available_ports, SerialPortInfo, SerialPortType, UsbPortInfo};

use super::{config::Config, ConnectArgs};
use crate::{cli::config::UsbDevice, error::Error};

/// USB devices which are known to be Qualcomm devices in EDL mode
const KNOWN_DEVICES: &[UsbDevice] = &[
    UsbDevice {
        vid: 0x05c6,
        pid: 0x9008,
    }, // Qualcomm HS-USB QDLoader 9008
];

/// Pick the serial port to use
///
/// A port given on the command line wins over the configured one. Without
/// either the user is prompted, unless a single known device is connected.
pub fn get_serial_port_info(args: &ConnectArgs, config: &Config) -> Result<SerialPortInfo, Error> {
    let ports = detect_usb_serial_ports().unwrap_or_default();

    if let Some(serial) = &args.port {
        find_serial_port(&ports, serial)
    } else if let Some(serial) = &config.port_config.connection.serial {
        find_serial_port(&ports, serial)
    } else {
        let (port, matches) = select_serial_port(ports, config)?;

        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            if !matches {
                let remember = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt("Remember this serial port for future use?")
                    .interact_opt()?
                    .unwrap_or_default();

                if remember {
                    // Failing to save must not abort the session
                    if let Err(e) = config.save_with(|config| {
                        config.usb_device.push(UsbDevice {
                            vid: usb_info.vid,
                            pid: usb_info.pid,
                        })
                    }) {
                        error!("Failed to save config {:#}", e);
                    }
                }
            }
        }

        Ok(port)
    }
}

/// Find the port called `name`, comparing canonical paths where possible
fn find_serial_port(ports: &[SerialPortInfo], name: &str) -> Result<SerialPortInfo, Error> {
    #[cfg(not(target_os = "windows"))]
    let name = std::fs::canonicalize(name)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| name.to_owned());

    ports
        .iter()
        .find(|port| port.port_name.eq_ignore_ascii_case(&name))
        .cloned()
        .ok_or_else(|| Error::SerialNotFound(name.to_string()))
}

fn detect_usb_serial_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = available_ports().into_diagnostic()?;
    let ports = ports
        .into_iter()
        .filter(|port_info| {
            matches!(
                &port_info.port_type,
                SerialPortType::UsbPort(..) | SerialPortType::Unknown
            )
        })
        .collect::<Vec<_>>();

    Ok(ports)
}

fn select_serial_port(
    ports: Vec<SerialPortInfo>,
    config: &Config,
) -> Result<(SerialPortInfo, bool), Error> {
    let device_matches = |info| {
        config
            .port_config
            .usb_device
            .iter()
            .chain(KNOWN_DEVICES.iter())
            .any(|dev| dev.matches(info))
    };

    let known = ports
        .iter()
        .filter(|port| matches!(&port.port_type, SerialPortType::UsbPort(info) if device_matches(info)))
        .collect::<Vec<_>>();
    if let [port] = known.as_slice() {
        info!("Using {}, the only device in EDL mode", port.port_name);
        return Ok(((*port).to_owned(), true));
    }

    if ports.len() > 1 {
        println!(
            "Detected {} serial ports. Ports which match a device in EDL mode are highlighted.\n",
            ports.len()
        );

        let port_names = ports
            .iter()
            .map(|port_info| match &port_info.port_type {
                SerialPortType::UsbPort(info) => {
                    let formatted = if device_matches(info) {
                        port_info.port_name.as_str().bold()
                    } else {
                        port_info.port_name.as_str().reset()
                    };

                    match &info.product {
                        Some(product) => format!("{formatted} - {product}"),
                        None => formatted.to_string(),
                    }
                }
                _ => port_info.port_name.clone(),
            })
            .collect::<Vec<_>>();

        let index = Select::with_theme(&ColorfulTheme::default())
            .items(&port_names)
            .default(0)
            .interact_opt()?
            .ok_or(Error::Cancelled)?;

        let port_info = &ports[index];
        let matches = match &port_info.port_type {
            SerialPortType::UsbPort(usb_info) => device_matches(usb_info),
            _ => false,
        };

        Ok((port_info.to_owned(), matches))
    } else if let [port] = ports.as_slice() {
        let unknown = UsbPortInfo {
            vid: 0,
            pid: 0,
            serial_number: None,
            manufacturer: None,
            product: None,
        };
        let port_info = match &port.port_type {
            SerialPortType::UsbPort(info) => info,
            _ => &unknown,
        };

        if confirm_port(&port.port_name, port_info)? {
            Ok((port.to_owned(), false))
        } else {
            Err(Error::SerialNotFound(port.port_name.clone()))
        }
    } else {
        Err(Error::NoSerial)
    }
}

fn confirm_port(port_name: &str, port_info: &UsbPortInfo) -> Result<bool, Error> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(match &port_info.product {
            Some(product) => format!("Use serial port '{port_name}' - {product}?"),
            None => format!("Use serial port '{port_name}'?"),
        })
        .interact_opt()?
        .ok_or(Error::Cancelled)
}
