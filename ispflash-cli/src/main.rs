//! ispflash CLI - flash microcontrollers through their factory ISP bootloaders.
//!
//! ## Features
//!
//! - Flash, erase and verify raw binary images
//! - Read chip identity, UID and option bytes
//! - Unlock/lock read protection and edit option bytes
//! - STC8 oscillator calibration
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand, ValueEnum},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    ispflash::{ConnectOptions, ProtocolFamily, ResetPinMode, UsbFilter},
    log::debug,
    std::{
        env, io,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    },
};

mod commands;
mod config;
mod serial;

use {
    config::Config,
    serial::{SerialOptions, ask_remember_port, select_serial_port},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Process exit codes.
mod exit {
    pub const FAILURE: u8 = 1;
    pub const USAGE: u8 = 2;
    pub const CONFIG: u8 = 3;
    pub const DEVICE: u8 = 4;
    pub const CANCELLED: u8 = 130;
}

/// Errors raised by the CLI itself, classified for the exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or a setup the user has to fix.
    #[error("{0}")]
    Usage(String),
    /// Configuration file could not be read or parsed.
    #[error("{0}")]
    Config(String),
    /// The user aborted a prompt or pressed Ctrl-C.
    #[error("{0}")]
    Cancelled(String),
}

/// ispflash - flash WCH, PUYA, STM32 and STC8 chips through their ISP bootloaders.
///
/// Environment variables:
///   ISPFLASH_PORT              - Default serial port
///   ISPFLASH_BAUD              - Transfer baud rate (UART families)
///   ISPFLASH_FAMILY            - Bootloader family (wch, puya, stm32, stc, stc-usb)
///   ISPFLASH_VID / ISPFLASH_PID - USB VID/PID filter (hex)
///   ISPFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "ispflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ISPFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for data transfer (UART families).
    #[arg(short, long, global = true, env = "ISPFLASH_BAUD")]
    baud: Option<u32>,

    /// Bootloader family [default: wch].
    #[arg(short, long, global = true, env = "ISPFLASH_FAMILY")]
    family: Option<Family>,

    /// Only use a device with this USB vendor ID (hex).
    #[arg(long, global = true, env = "ISPFLASH_VID", value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Only use a device with this USB product ID (hex).
    #[arg(long, global = true, env = "ISPFLASH_PID", value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Per-read timeout in milliseconds.
    #[arg(long, global = true, value_name = "MS")]
    timeout: Option<u64>,

    /// Use the key exchange of early CH32V203 bootloaders.
    #[arg(long, global = true)]
    legacy_key: bool,

    /// Stay in the bootloader instead of starting the application.
    #[arg(long, global = true)]
    no_run: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ISPFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Supported bootloader families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Family {
    /// WCH CH5xx/CH32 USB bootloader.
    Wch,
    /// PUYA PY32F0xx UART bootloader.
    Puya,
    /// STM32 C0/F0/G0/L0 UART bootloader.
    Stm32,
    /// STC8G/STC8H UART bootloader.
    Stc,
    /// STC8H8K*U USB-HID bootloader.
    StcUsb,
}

impl From<Family> for ProtocolFamily {
    fn from(family: Family) -> Self {
        match family {
            Family::Wch => Self::Wch,
            Family::Puya => Self::Puya,
            Family::Stm32 => Self::Stm32,
            Family::Stc => Self::Stc,
            Family::StcUsb => Self::StcUsb,
        }
    }
}

/// nRST pin function for `options --reset-pin`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ResetPin {
    /// Pin is a general purpose I/O.
    Gpio,
    /// Pin resets the chip.
    Reset,
}

impl From<ResetPin> for ResetPinMode {
    fn from(pin: ResetPin) -> Self {
        match pin {
            ResetPin::Gpio => Self::Gpio,
            ResetPin::Reset => Self::Reset,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Erase, write and verify a raw binary image.
    Flash {
        /// Path to the binary image.
        firmware: PathBuf,

        /// Skip read-back verification.
        #[arg(long)]
        no_verify: bool,

        /// Clear read protection first (erases the chip).
        #[arg(long)]
        unlock: bool,

        /// Enable read protection after flashing.
        #[arg(long)]
        lock: bool,

        /// Trim the STC oscillator to this frequency (e.g. 24MHz, 11.0592M).
        #[arg(long, value_parser = parse_frequency, value_name = "FREQ")]
        trim: Option<u32>,
    },

    /// Erase the code flash.
    Erase,

    /// Compare the chip's flash against a binary image.
    Verify {
        /// Path to the binary image.
        firmware: PathBuf,
    },

    /// Show chip identity, UID and option bytes.
    Info {
        /// Output in JSON format (machine-readable).
        #[arg(long)]
        json: bool,
    },

    /// Clear read protection (erases the chip).
    Unlock,

    /// Enable read protection.
    Lock,

    /// Show or edit option bytes.
    Options {
        /// Restore factory option bytes.
        #[arg(long)]
        reset_defaults: bool,

        /// Select the nRST pin function.
        #[arg(long, value_enum)]
        reset_pin: Option<ResetPin>,

        /// Make the BOOT0 pin select the boot source.
        #[arg(long)]
        enable_boot_pin: bool,
    },

    /// Calibrate the STC oscillator and store the result.
    Trim {
        /// Target frequency (e.g. 24MHz, 11.0592M, 22118400).
        #[arg(value_parser = parse_frequency)]
        frequency: u32,
    },

    /// List serial ports and USB bootloaders.
    ListPorts {
        /// Output in JSON format (machine-readable).
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected from $SHELL with --install).
        shell: Option<Shell>,

        /// Install completions into the shell's completion directory.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a hexadecimal u16 (with or without 0x prefix).
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex value '{s}': {e}"))
}

/// Parse a frequency in Hz, accepting `k`/`M` suffixes and an optional `Hz`.
fn parse_frequency(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let lower = trimmed.to_ascii_lowercase();
    let number = lower
        .strip_suffix("hz")
        .unwrap_or(&lower);
    let (digits, scale) = if let Some(n) = number.strip_suffix('m') {
        (n, 1_000_000.0)
    } else if let Some(n) = number.strip_suffix('k') {
        (n, 1_000.0)
    } else {
        (number, 1.0)
    };

    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("Invalid frequency '{trimmed}'"))?;
    let hz = (value * scale).round();
    if !(1.0..=f64::from(u32::MAX)).contains(&hz) {
        return Err(format!("Frequency '{trimmed}' out of range"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(hz as u32)
}

/// Map an error chain to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli) = cause.downcast_ref::<CliError>() {
            return match cli {
                CliError::Usage(_) => exit::USAGE,
                CliError::Config(_) => exit::CONFIG,
                CliError::Cancelled(_) => exit::CANCELLED,
            };
        }
        if let Some(e) = cause.downcast_ref::<ispflash::Error>() {
            return match e {
                ispflash::Error::Io(io) if io.kind() == io::ErrorKind::Interrupted => {
                    exit::CANCELLED
                },
                ispflash::Error::Config(_) => exit::CONFIG,
                e if e.is_device_missing() => exit::DEVICE,
                _ => exit::FAILURE,
            };
        }
    }
    if was_interrupted() {
        exit::CANCELLED
    } else {
        exit::FAILURE
    }
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version go to stdout and succeed
            let code = if err.use_stderr() { exit::USAGE } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        },
    };

    setup_logging(&cli);

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Ctrl-C handler not installed: {e}");
    }
    ispflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn setup_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "ispflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)?
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            firmware,
            no_verify,
            unlock,
            lock,
            trim,
        } => commands::flash::cmd_flash(
            cli,
            &mut config,
            &commands::flash::FlashArgs {
                firmware,
                verify: !*no_verify,
                unlock: *unlock,
                lock: *lock,
                trim: *trim,
            },
        ),
        Commands::Erase => commands::flash::cmd_erase(cli, &mut config),
        Commands::Verify { firmware } => commands::flash::cmd_verify(cli, &mut config, firmware),
        Commands::Info { json } => commands::info::cmd_info(cli, &mut config, *json),
        Commands::Unlock => commands::flash::cmd_protect(cli, &mut config, false),
        Commands::Lock => commands::flash::cmd_protect(cli, &mut config, true),
        Commands::Options {
            reset_defaults,
            reset_pin,
            enable_boot_pin,
        } => commands::flash::cmd_options(
            cli,
            &mut config,
            *reset_defaults,
            reset_pin.map(ResetPinMode::from),
            *enable_boot_pin,
        ),
        Commands::Trim { frequency } => commands::flash::cmd_trim(cli, &mut config, *frequency),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "Specify a shell type, e.g. `ispflash completions bash`, or use --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Resolve the bootloader family: command line, then config, then WCH.
pub(crate) fn resolve_family(cli: &Cli, config: &Config) -> Result<ProtocolFamily> {
    if let Some(family) = cli.family {
        return Ok(family.into());
    }
    match config
        .flash
        .family
        .as_deref()
    {
        Some(name) => ProtocolFamily::from_name(name).ok_or_else(|| {
            CliError::Config(format!("Unknown bootloader family in config: {name}")).into()
        }),
        None => Ok(ProtocolFamily::Wch),
    }
}

/// Whether the application should be started when done.
pub(crate) fn should_run(cli: &Cli, config: &Config) -> bool {
    !(cli.no_run || config.flash.no_run)
}

/// Build connection options from the command line and configuration.
pub(crate) fn connect_options(
    cli: &Cli,
    config: &mut Config,
    family: ProtocolFamily,
) -> Result<ConnectOptions> {
    let conn = &config
        .port
        .connection;
    let filter = UsbFilter {
        vid: cli.vid.or(conn.vid),
        pid: cli.pid.or(conn.pid),
    };
    let mut options = ConnectOptions::new()
        .with_filter(filter)
        .with_legacy_key(cli.legacy_key || config.flash.legacy_key);
    if let Some(baud) = cli.baud.or(conn.baud) {
        options = options.with_baud(baud);
    }
    if let Some(ms) = cli.timeout.or(conn.timeout_ms) {
        options = options.with_timeout(Duration::from_millis(ms));
    }

    if !family.is_usb() {
        options = options.with_port(get_port(cli, config, filter)?);
    }
    Ok(options)
}

/// Get serial port from CLI args or interactive selection.
fn get_port(cli: &Cli, config: &mut Config, filter: UsbFilter) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        filter,
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Offer to remember unrecognized bridges
    if !selected.is_known && !cli.non_interactive && std::io::IsTerminal::is_terminal(&io::stdin()) {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

#[cfg(test)]
mod cli_tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "ispflash",
            "--port",
            "/dev/ttyUSB0",
            "--family",
            "puya",
            "flash",
            "firmware.bin",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.family, Some(Family::Puya));
        assert!(cli.baud.is_none());
        assert!(matches!(cli.command, Commands::Flash { .. }));
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "ispflash",
            "flash",
            "fw.bin",
            "--no-verify",
            "--unlock",
            "--lock",
            "--trim",
            "24MHz",
        ])
        .unwrap();
        let Commands::Flash {
            firmware,
            no_verify,
            unlock,
            lock,
            trim,
        } = cli.command
        else {
            panic!("Expected Flash command");
        };
        assert_eq!(firmware.to_str().unwrap(), "fw.bin");
        assert!(no_verify);
        assert!(unlock);
        assert!(lock);
        assert_eq!(trim, Some(24_000_000));
    }

    #[test]
    fn test_cli_parse_global_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ispflash", "erase", "--vid", "0x1a86", "--pid", "55E0", "--no-run", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.vid, Some(0x1A86));
        assert_eq!(cli.pid, Some(0x55E0));
        assert!(cli.no_run);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Erase));
    }

    #[test]
    fn test_cli_parse_stc_usb_family() {
        let cli = Cli::try_parse_from(["ispflash", "-f", "stc-usb", "info", "--json"]).unwrap();
        assert_eq!(cli.family, Some(Family::StcUsb));
        assert_eq!(ProtocolFamily::from(Family::StcUsb), ProtocolFamily::StcUsb);
        assert!(matches!(cli.command, Commands::Info { json: true }));
    }

    #[test]
    fn test_cli_parse_options() {
        let cli = Cli::try_parse_from([
            "ispflash",
            "options",
            "--reset-pin",
            "gpio",
            "--enable-boot-pin",
        ])
        .unwrap();
        let Commands::Options {
            reset_defaults,
            reset_pin,
            enable_boot_pin,
        } = cli.command
        else {
            panic!("Expected Options command");
        };
        assert!(!reset_defaults);
        assert_eq!(reset_pin, Some(ResetPin::Gpio));
        assert_eq!(ResetPinMode::from(ResetPin::Gpio), ResetPinMode::Gpio);
        assert!(enable_boot_pin);
    }

    #[test]
    fn test_cli_rejects_unknown_family() {
        assert!(Cli::try_parse_from(["ispflash", "--family", "esp32", "erase"]).is_err());
    }

    #[test]
    fn test_cli_trim_requires_frequency() {
        assert!(Cli::try_parse_from(["ispflash", "trim"]).is_err());
        let cli = Cli::try_parse_from(["ispflash", "trim", "11.0592M"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Trim {
                frequency: 11_059_200
            }
        ));
    }

    #[test]
    fn test_parse_hex_u16() {
        assert_eq!(parse_hex_u16("0x4348"), Ok(0x4348));
        assert_eq!(parse_hex_u16("1A86"), Ok(0x1A86));
        assert_eq!(parse_hex_u16("0X34bf"), Ok(0x34BF));
        assert!(parse_hex_u16("0x12345").is_err());
        assert!(parse_hex_u16("zz").is_err());
    }

    #[test]
    fn test_parse_frequency() {
        assert_eq!(parse_frequency("24000000"), Ok(24_000_000));
        assert_eq!(parse_frequency("24MHz"), Ok(24_000_000));
        assert_eq!(parse_frequency("24m"), Ok(24_000_000));
        assert_eq!(parse_frequency("22.1184 MHz"), Ok(22_118_400));
        assert_eq!(parse_frequency("500kHz"), Ok(500_000));
        assert!(parse_frequency("fast").is_err());
        assert!(parse_frequency("0").is_err());
        assert!(parse_frequency("5000M").is_err());
    }

    #[test]
    fn test_resolve_family_order() {
        let cli = Cli::try_parse_from(["ispflash", "erase"]).unwrap();
        let mut config = Config::default();
        assert_eq!(resolve_family(&cli, &config).unwrap(), ProtocolFamily::Wch);

        config.flash.family = Some("stm32".to_string());
        assert_eq!(resolve_family(&cli, &config).unwrap(), ProtocolFamily::Stm32);

        let cli = Cli::try_parse_from(["ispflash", "-f", "stc", "erase"]).unwrap();
        assert_eq!(resolve_family(&cli, &config).unwrap(), ProtocolFamily::Stc);
    }

    #[test]
    fn test_resolve_family_bad_config_is_config_error() {
        let cli = Cli::try_parse_from(["ispflash", "erase"]).unwrap();
        let mut config = Config::default();
        config.flash.family = Some("avr".to_string());
        let err = resolve_family(&cli, &config).unwrap_err();
        assert_eq!(exit_code(&err), exit::CONFIG);
    }

    #[test]
    fn test_connect_options_for_usb_family_skip_port_selection() {
        let cli = Cli::try_parse_from([
            "ispflash", "--vid", "4348", "--timeout", "250", "--legacy-key", "erase",
        ])
        .unwrap();
        let mut config = Config::default();
        config.port.connection.pid = Some(0x55E0);

        let options = connect_options(&cli, &mut config, ProtocolFamily::Wch).unwrap();
        assert!(options.port.is_none());
        assert_eq!(options.filter.vid, Some(0x4348));
        assert_eq!(options.filter.pid, Some(0x55E0));
        assert_eq!(options.timeout, Some(Duration::from_millis(250)));
        assert!(options.legacy_key);
    }

    #[test]
    fn test_connect_options_explicit_serial_port() {
        let cli = Cli::try_parse_from([
            "ispflash",
            "--port",
            "/dev/ttyFAKE9",
            "--baud",
            "57600",
            "--non-interactive",
            "erase",
        ])
        .unwrap();
        let mut config = Config::default();
        let options = connect_options(&cli, &mut config, ProtocolFamily::Puya).unwrap();
        assert_eq!(options.port.as_deref(), Some("/dev/ttyFAKE9"));
        assert_eq!(options.baud, Some(57600));
    }

    #[test]
    fn test_should_run() {
        let cli = Cli::try_parse_from(["ispflash", "erase"]).unwrap();
        let mut config = Config::default();
        assert!(should_run(&cli, &config));
        config.flash.no_run = true;
        assert!(!should_run(&cli, &config));
    }

    #[test]
    fn test_exit_codes() {
        let usage: anyhow::Error = CliError::Usage("x".into()).into();
        assert_eq!(exit_code(&usage), exit::USAGE);

        let cancelled: anyhow::Error = CliError::Cancelled("x".into()).into();
        assert_eq!(exit_code(&cancelled), exit::CANCELLED);

        let missing = anyhow::Error::from(ispflash::Error::DeviceNotFound).context("connecting");
        assert_eq!(exit_code(&missing), exit::DEVICE);

        let unsupported: anyhow::Error = ispflash::Error::UnsupportedDevice { id: 0x42 }.into();
        assert_eq!(exit_code(&unsupported), exit::DEVICE);

        let interrupted: anyhow::Error = ispflash::Error::Io(io::Error::from(
            io::ErrorKind::Interrupted,
        ))
        .into();
        assert_eq!(exit_code(&interrupted), exit::CANCELLED);

        let other: anyhow::Error = ispflash::Error::LockedChip.into();
        assert_eq!(exit_code(&other), exit::FAILURE);
    }
}
