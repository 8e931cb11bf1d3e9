//! Interactive serial port selection.
//!
//! Used by the UART bootloader families. Candidates are narrowed by the
//! optional VID/PID filter, then:
//! - a single recognized bridge is taken without asking
//! - several candidates open a dialoguer picker
//! - non-interactive mode fails instead of prompting

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    ispflash::{DetectedPort, DeviceKind, Error as IspError, TransportKind, UsbFilter, detect_ports},
    log::{debug, error, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Restrict candidates to this VID/PID.
    pub filter: UsbFilter,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

fn select_non_interactive_port(
    selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    match selection_ports
        .len()
        .cmp(&1)
    {
        Ordering::Equal => single(selection_ports, config),
        Ordering::Greater => Err(usage_err(
            "Multiple serial ports found; pass --port to choose one",
        )),
        Ordering::Less => Err(IspError::DeviceNotFound.into()),
    }
}

fn single(ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    let port = ports
        .into_iter()
        .next()
        .ok_or(IspError::DeviceNotFound)?;
    Ok(SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    })
}

/// Serial candidates from the host, restricted by the filter.
fn serial_candidates(filter: UsbFilter) -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(|p| p.transport == TransportKind::Serial)
        .filter(|p| filter.matches_optional(p.vid, p.pid))
        .collect()
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config
        .port
        .connection
        .serial
    {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = serial_candidates(options.filter);
    if ports.is_empty() {
        return Err(IspError::DeviceNotFound.into());
    }

    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    // Known bridges first unless the user asks for all
    let selection_ports = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    match selection_ports
        .len()
        .cmp(&1)
    {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(selection_ports, config)
        },
        Ordering::Equal => {
            let selected = single(selection_ports, config)?;
            if selected.is_known && !options.confirm_port {
                info!(
                    "Auto-selected port: {} [{}]",
                    selected
                        .port
                        .name,
                    selected
                        .port
                        .device
                        .name()
                );
                Ok(selected)
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(selected.port)
            }
        },
        Ordering::Less => Err(IspError::DeviceNotFound.into()),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            cancelled()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("Prompt failed: {io_err}")),
    }
}

/// Find a port by name, keeping the name even when the host does not list it.
fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = detect_ports();

    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| {
            ports
                .iter()
                .find(|p| {
                    p.name
                        .eq_ignore_ascii_case(name)
                })
        });

    if let Some(port) = found {
        return SelectedPort {
            port: port.clone(),
            is_known: port
                .device
                .is_known(),
        };
    }

    SelectedPort {
        port: DetectedPort {
            name: name.to_string(),
            transport: TransportKind::Serial,
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        },
        is_known: false,
    }
}

/// Check if a port matches a known bridge (built-in table or config).
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port
        .device
        .is_known()
    {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name)
            .bold()
            .to_string()
    } else {
        port.name
            .clone()
    };

    let device_info = if port
        .device
        .is_known()
    {
        format!(
            " [{}]",
            style(
                port.device
                    .name()
            )
            .yellow()
        )
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!(
        "{}",
        style("Ports in bold are recognized USB-UART bridges").dim()
    );

    ports.sort_by_key(|p| !is_known_device(p, config));

    // Keep labels on one line in narrow terminals
    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let port_names: Vec<String> = ports
        .iter()
        .map(|port| {
            console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}")
                .into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the port of your programmer")
        .items(&port_names)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let index = selection.ok_or_else(cancelled)?;
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    let is_known = is_known_device(&port, config);
    Ok(SelectedPort { port, is_known })
}

/// Confirm use of a single unrecognized port.
fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use port {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled())
    }
}

/// Ask user if they want to remember this port's bridge.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config
        .port
        .usb_device
        .iter()
        .any(|device| device.matches(vid, pid))
    {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this USB device for automatic selection?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}
