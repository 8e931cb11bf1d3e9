//! Flash, erase, verify and option byte command implementations.

use {
    crate::{
        Cli, CliError, config::Config, connect_options, resolve_family, should_run,
        use_fancy_output, was_interrupted,
    },
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    ispflash::{
        ChipInfo, Error as IspError, FlashImage, FlashPlan, Flasher, OptionEdit, PlanReport,
        ProtocolFamily, ResetPinMode, Stage,
    },
    std::path::Path,
};

/// Arguments of the `flash` command.
pub(crate) struct FlashArgs<'a> {
    pub firmware: &'a Path,
    pub verify: bool,
    pub unlock: bool,
    pub lock: bool,
    pub trim: Option<u32>,
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

fn status(cli: &Cli, icon: &str, message: &str) {
    if cli.quiet {
        return;
    }
    if use_fancy_output() {
        eprintln!("{} {message}", style(icon).cyan());
    } else {
        eprintln!("{message}");
    }
}

/// Progress bar on stderr, hidden in quiet or plain output.
pub(crate) fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

fn percent(done: usize, total: usize) -> u64 {
    if total == 0 {
        100
    } else {
        (done.min(total) * 100 / total) as u64
    }
}

/// Resolve the family and open a flasher for it.
pub(crate) fn open_flasher(
    cli: &Cli,
    config: &mut Config,
) -> Result<(ProtocolFamily, Box<dyn Flasher>)> {
    let family = resolve_family(cli, config)?;
    let options = connect_options(cli, config, family)?;
    match &options.port {
        Some(port) => status(cli, "🔌", &format!("Using {port} ({family})")),
        None => status(cli, "🔌", &format!("Looking for a {family} USB bootloader")),
    }
    let flasher = family
        .create_flasher(&options)
        .with_context(|| format!("Failed to open the {family} bootloader"))?;
    ensure_not_interrupted()?;
    Ok((family, flasher))
}

fn describe(info: &ChipInfo) -> String {
    format!(
        "{} (ID 0x{:04X}, bootloader {}, {} KiB flash)",
        info.name,
        info.id,
        info.bootloader,
        info.code_flash_size / 1024
    )
}

/// Run a plan with a progress bar and print what it did.
fn run_plan(cli: &Cli, config: &mut Config, plan: &FlashPlan) -> Result<PlanReport> {
    let (_, mut flasher) = open_flasher(cli, config)?;
    status(cli, "⏳", "Waiting for the bootloader...");

    let pb = progress_bar(cli);
    let mut current = None;
    let result = plan.execute(flasher.as_mut(), &mut |stage, done, total| {
        if current != Some(stage) {
            current = Some(stage);
            pb.set_message(stage.to_string());
            pb.set_position(0);
        }
        pb.set_position(percent(done, total));
    });

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            pb.abandon();
            ensure_not_interrupted()?;
            return Err(err.into());
        },
    };
    if current.is_some() {
        pb.finish_with_message("Done");
    } else {
        pb.finish_and_clear();
    }

    status(cli, "✓", &format!("Connected to {}", describe(&report.info)));
    if let Some(trim) = &report.trim {
        status(
            cli,
            "⚙",
            &format!(
                "Oscillator trimmed to {} Hz ({:+.3}%)",
                trim.frequency,
                trim.error * 100.0
            ),
        );
    }
    if report.verified {
        status(cli, "✓", "Verification passed");
    }
    if report.options_written {
        status(cli, "✓", "Option bytes written");
    }
    Ok(report)
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &mut Config, args: &FlashArgs<'_>) -> Result<()> {
    status(
        cli,
        "📦",
        &format!("Loading {}", args.firmware.display()),
    );
    let image = FlashImage::from_file(args.firmware)
        .with_context(|| format!("Failed to load firmware {}", args.firmware.display()))?;
    if image.is_empty() {
        return Err(CliError::Usage(format!("{} is empty", args.firmware.display())).into());
    }

    let mut plan = FlashPlan::new()
        .with_image(image)
        .with_verify(args.verify && !config.flash.skip_verify)
        .with_unlock(args.unlock)
        .with_lock(args.lock)
        .with_run(should_run(cli, config));
    if let Some(frequency) = args
        .trim
        .or(config.flash.trim)
    {
        plan = plan.with_trim(frequency);
    }

    run_plan(cli, config, &plan)?;
    status(cli, "🎉", "Flashing completed");
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &mut Config) -> Result<()> {
    let plan = FlashPlan::new()
        .with_erase(true)
        .with_run(should_run(cli, config));
    run_plan(cli, config, &plan)?;
    status(cli, "✓", "Erase completed");
    Ok(())
}

/// Unlock/lock command implementation.
pub(crate) fn cmd_protect(cli: &Cli, config: &mut Config, lock: bool) -> Result<()> {
    let plan = FlashPlan::new()
        .with_unlock(!lock)
        .with_lock(lock)
        .with_run(should_run(cli, config));
    run_plan(cli, config, &plan)?;
    if lock {
        status(cli, "🔒", "Read protection enabled");
    } else {
        status(cli, "🔓", "Read protection removed");
    }
    Ok(())
}

/// Trim command implementation.
pub(crate) fn cmd_trim(cli: &Cli, config: &mut Config, frequency: u32) -> Result<()> {
    let plan = FlashPlan::new()
        .with_trim(frequency)
        .with_run(should_run(cli, config));
    run_plan(cli, config, &plan)?;
    Ok(())
}

/// Edits requested on the `options` command line.
fn option_edits(
    reset_defaults: bool,
    reset_pin: Option<ResetPinMode>,
    enable_boot_pin: bool,
) -> Vec<OptionEdit> {
    let mut edits = Vec::new();
    if reset_defaults {
        edits.push(OptionEdit::ResetToDefaults);
    }
    if let Some(mode) = reset_pin {
        edits.push(OptionEdit::ResetPin(mode));
    }
    if enable_boot_pin {
        edits.push(OptionEdit::EnableBootPin);
    }
    edits
}

/// Options command implementation: show the block, or apply edits.
pub(crate) fn cmd_options(
    cli: &Cli,
    config: &mut Config,
    reset_defaults: bool,
    reset_pin: Option<ResetPinMode>,
    enable_boot_pin: bool,
) -> Result<()> {
    let edits = option_edits(reset_defaults, reset_pin, enable_boot_pin);
    if edits.is_empty() {
        return show_options(cli, config);
    }

    let plan = edits
        .into_iter()
        .fold(FlashPlan::new(), FlashPlan::with_option)
        .with_run(should_run(cli, config));
    let report = run_plan(cli, config, &plan)?;
    if !report.options_written {
        status(cli, "ℹ", "Option bytes already up to date");
    }
    Ok(())
}

fn show_options(cli: &Cli, config: &mut Config) -> Result<()> {
    let (_, mut flasher) = open_flasher(cli, config)?;
    let result = flasher
        .connect()
        .and_then(|info| {
            status(cli, "✓", &format!("Connected to {}", describe(&info)));
            flasher.read_options()
        });
    flasher.close();

    let options = result.context("Failed to read option bytes")?;
    println!("{options}");
    Ok(())
}

/// Verify command implementation.
pub(crate) fn cmd_verify(cli: &Cli, config: &mut Config, firmware: &Path) -> Result<()> {
    let image = FlashImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;

    let (family, mut flasher) = open_flasher(cli, config)?;
    if !flasher.supports_verify() {
        flasher.close();
        return Err(IspError::Unsupported(format!("{family} bootloaders cannot verify")).into());
    }

    let pb = progress_bar(cli);
    pb.set_message(Stage::Verify.to_string());
    let result = flasher
        .connect()
        .and_then(|info| {
            if info.locked {
                return Err(IspError::LockedChip);
            }
            flasher.verify(&image, &mut |done, total| pb.set_position(percent(done, total)))
        });
    flasher.close();

    match result {
        Ok(()) => {
            pb.finish_with_message("Done");
            status(cli, "✓", "Flash matches the image");
            Ok(())
        },
        Err(err) => {
            pb.abandon();
            ensure_not_interrupted()?;
            Err(err.into())
        },
    }
}
