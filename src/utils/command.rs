//! Command execution utilities

use crate::utils::error::{Result, StorixError};
use std::process::{Command, Output, Stdio};
use tracing::{debug, warn};

/// Execute a command and return the output
pub fn run_command(program: &str, args: &[&str]) -> Result<Output> {
    debug!("Running: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorixError::CommandNotFound(program.to_string())
            } else {
                StorixError::Io(e)
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        warn!(
            "Command failed: {} {}\n  stderr: {}",
            program,
            args.join(" "),
            stderr.trim()
        );
        return Err(StorixError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr,
        });
    }

    Ok(output)
}

/// Execute a command and return stdout as string
pub fn run_command_output(program: &str, args: &[&str]) -> Result<String> {
    let output = run_command(program, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Execute a command, allowing it to fail (returns None on failure)
pub fn run_command_optional(program: &str, args: &[&str]) -> Option<String> {
    run_command_output(program, args).ok()
}

/// Check if a command succeeds without caring about its output
pub fn command_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Check if a command exists in PATH
pub fn command_exists(program: &str) -> bool {
    command_succeeds("which", &[program])
}

/// Log a command that would be run (for dry-run mode)
pub fn log_dry_run(program: &str, args: &[&str]) {
    println!("  [dry-run] {} {}", program, args.join(" "));
}

/// Wrapper for command execution that respects dry-run mode
#[derive(Debug, Clone)]
pub struct CommandRunner {
    dry_run: bool,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn run(&self, program: &str, args: &[&str]) -> Result<Option<Output>> {
        if crate::utils::signal::is_interrupted() {
            return Err(StorixError::Interrupted);
        }
        if self.dry_run {
            log_dry_run(program, args);
            Ok(None)
        } else {
            run_command(program, args).map(Some)
        }
    }

    /// Run an `lvm` sub-command (`lvm pvcreate ...`)
    pub fn lvm(&self, subcommand: &str, args: &[&str]) -> Result<Option<Output>> {
        let mut full = vec![subcommand];
        full.extend(args);
        self.run("lvm", &full)
    }

    /// Run a command regardless of interrupt state.
    /// Used for remount steps that must execute even after a signal.
    pub fn force_run(&self, program: &str, args: &[&str]) -> Result<Option<Output>> {
        if self.dry_run {
            log_dry_run(program, args);
            Ok(None)
        } else {
            run_command(program, args).map(Some)
        }
    }

    /// Run a command whose failure does not abort the operation.
    /// Returns false after logging the failure.
    pub fn run_or_warn(&self, program: &str, args: &[&str]) -> bool {
        match self.run(program, args) {
            Ok(_) => true,
            Err(e) => {
                warn!("{} {} failed, continuing: {}", program, args.join(" "), e);
                false
            }
        }
    }

    /// Wait for udev to finish processing device events
    pub fn settle(&self) -> bool {
        self.run_or_warn("udevadm", &["settle"])
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}
