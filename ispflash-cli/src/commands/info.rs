//! Chip info and port listing command implementations.

use {
    crate::{Cli, commands::flash::open_flasher, config::Config},
    anyhow::{Context, Result},
    console::style,
    ispflash::{
        ChipInfo, DetectedPort, Error as IspError, OptionBytes, TransportKind, auto_detect_port,
        detect_ports,
    },
    log::warn,
};

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn transport_name(transport: TransportKind) -> &'static str {
    match transport {
        TransportKind::Serial => "serial",
        TransportKind::Usb => "usb",
    }
}

fn port_json(p: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": p.name,
        "transport": transport_name(p.transport),
        "device": p.device.name(),
        "known": p.device.is_known(),
        "bootloader": p.device.is_bootloader(),
        "vid": p.vid,
        "pid": p.pid,
        "manufacturer": p.manufacturer,
        "product": p.product,
        "serial": p.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(port_json)
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports or USB bootloaders found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port
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
        } else {
            String::new()
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected serial port: {}",
            style("→")
                .green()
                .bold(),
            style(&auto_port.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}

/// What `info` gathered from the chip.
struct ChipReport {
    info: ChipInfo,
    uid: Option<Vec<u8>>,
    options: Option<OptionBytes>,
}

fn read_report(cli: &Cli, config: &mut Config) -> Result<(String, ChipReport)> {
    let (family, mut flasher) = open_flasher(cli, config)?;

    let result = flasher
        .connect()
        .map(|info| {
            let uid = match info.uid.clone() {
                Some(uid) => Some(uid),
                None => match flasher.read_uid() {
                    Ok(uid) => Some(uid),
                    Err(IspError::Unsupported(_)) => None,
                    Err(e) => {
                        warn!("Could not read the UID: {e}");
                        None
                    },
                },
            };
            let options = if info.locked {
                None
            } else {
                flasher
                    .read_options()
                    .map_err(|e| warn!("Could not read option bytes: {e}"))
                    .ok()
            };
            ChipReport { info, uid, options }
        });
    flasher.close();

    let report = result.context("Failed to identify the chip")?;
    Ok((family.to_string(), report))
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let (family, report) = read_report(cli, config)?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "family": family,
                "chip": serde_json::to_value(&report.info)?,
                "uid": report.uid.as_deref().map(hex),
                "options": report.options.as_ref().map(|o| serde_json::json!({
                    "bytes": hex(o.as_bytes()),
                    "decoded": o.to_string(),
                })),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let info = &report.info;
    println!("{}", style("Chip information").bold().underlined());
    println!("  Name:        {}", style(&info.name).cyan());
    println!("  ID:          0x{:04X}", info.id);
    println!("  Bootloader:  {} ({})", info.bootloader, info.variant);
    println!("  Code flash:  {} bytes", info.code_flash_size);
    if info.data_flash_size > 0 {
        println!("  Data flash:  {} bytes", info.data_flash_size);
    }
    if let Some(frequency) = info.osc_frequency {
        println!("  Oscillator:  {frequency} Hz");
    }
    if let Some(uid) = &report.uid {
        println!("  UID:         {}", hex(uid));
    }
    let protection = if info.locked {
        style("locked").red().to_string()
    } else {
        style("unlocked").green().to_string()
    };
    println!("  Protection:  {protection}");
    if let Some(options) = &report.options {
        println!("  Options:     {options}");
    }

    Ok(())
}
