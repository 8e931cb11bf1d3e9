//! Shell completion generation and installation.

use {
    crate::Cli,
    anyhow::{Context, Result},
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    console::style,
    directories::BaseDirs,
    std::{
        env, fs, io,
        path::{Path, PathBuf},
    },
};

/// Where a completion script goes and how the shell picks it up.
#[derive(Debug, PartialEq, Eq)]
struct InstallTarget {
    path: PathBuf,
    activation: String,
}

fn script(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    let name = cmd
        .get_name()
        .to_string();
    generate(shell, &mut cmd, name, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    script(shell, &mut io::stdout());
}

/// Parse a shell binary path into its `Shell` enum.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_stem()
        .and_then(|n| n.to_str())?;
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Detect the user's current shell from the environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

/// Install location below the user's home, data and config directories.
fn install_target(shell: Shell, home: &Path, data: &Path, config: &Path) -> Result<InstallTarget> {
    let bin = Cli::command()
        .get_name()
        .to_string();
    let target = match shell {
        Shell::Bash => {
            let path = data
                .join("bash-completion")
                .join("completions")
                .join(&bin);
            InstallTarget {
                activation: format!("source {}", path.display()),
                path,
            }
        },
        Shell::Zsh => InstallTarget {
            path: home
                .join(".zfunc")
                .join(format!("_{bin}")),
            activation: "fpath=(~/.zfunc $fpath); autoload -Uz compinit && compinit".to_string(),
        },
        Shell::Fish => InstallTarget {
            path: config
                .join("fish")
                .join("completions")
                .join(format!("{bin}.fish")),
            activation: "exec fish".to_string(),
        },
        Shell::Elvish => InstallTarget {
            path: config
                .join("elvish")
                .join("lib")
                .join(format!("{bin}.elv")),
            activation: format!("use {bin}"),
        },
        Shell::PowerShell => {
            let path = config
                .join("powershell")
                .join("completions")
                .join(format!("{bin}.ps1"));
            InstallTarget {
                activation: format!(". {}", path.display()),
                path,
            }
        },
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(target)
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             ispflash completions --install bash",
        )?,
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let target = install_target(shell, dirs.home_dir(), dirs.data_dir(), dirs.config_dir())?;

    let mut buf = Vec::new();
    script(shell, &mut buf);

    if let Some(parent) = target
        .path
        .parent()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&target.path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", target.path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓")
            .green()
            .bold(),
        style(shell).cyan(),
        style(target.path.display()).yellow()
    );
    eprintln!(
        "To activate them in this session: {}",
        style(&target.activation).cyan()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/opt/homebrew/bin/fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("elvish"), Some(Shell::Elvish));
        assert_eq!(shell_from_path("/usr/bin/pwsh"), Some(Shell::PowerShell));
    }

    #[test]
    fn test_shell_from_path_unknown() {
        assert_eq!(shell_from_path("/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_install_targets_use_binary_name() {
        let home = Path::new("/home/u");
        let data = Path::new("/home/u/.local/share");
        let config = Path::new("/home/u/.config");

        let bash = install_target(Shell::Bash, home, data, config).unwrap();
        assert_eq!(
            bash.path,
            Path::new("/home/u/.local/share/bash-completion/completions/ispflash")
        );
        assert!(bash.activation.starts_with("source "));

        let zsh = install_target(Shell::Zsh, home, data, config).unwrap();
        assert_eq!(zsh.path, Path::new("/home/u/.zfunc/_ispflash"));

        let fish = install_target(Shell::Fish, home, data, config).unwrap();
        assert_eq!(
            fish.path,
            Path::new("/home/u/.config/fish/completions/ispflash.fish")
        );

        let elvish = install_target(Shell::Elvish, home, data, config).unwrap();
        assert!(elvish.path.ends_with("elvish/lib/ispflash.elv"));

        let pwsh = install_target(Shell::PowerShell, home, data, config).unwrap();
        assert!(pwsh.path.ends_with("powershell/completions/ispflash.ps1"));
    }

    #[test]
    fn test_generated_script_mentions_subcommands() {
        let mut buf = Vec::new();
        script(Shell::Bash, &mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("ispflash"));
        assert!(text.contains("list-ports"));
        assert!(text.contains("trim"));
    }
}
