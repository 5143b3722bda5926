use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use psgate_core::error::{PsgateError, Result};

/// Exit code the in-process self-destruct harness uses, matching the
/// conventional timeout(1) exit status.
pub const SELF_DESTRUCT_EXIT: i32 = 124;

/// Which interpreter family is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFlavor {
    /// pwsh / Windows PowerShell.
    PowerShell,
    /// A POSIX `sh -c` shell. Used by tests and environments without
    /// PowerShell; the self-destruct harness does not apply.
    Posix,
}

/// A located shell binary plus the argument recipe for running one
/// command under it.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub program: PathBuf,
    pub flavor: ShellFlavor,
}

impl ShellSpec {
    /// Locate a PowerShell binary, preferring PowerShell Core.
    pub fn detect() -> Result<Self> {
        for name in ["pwsh", "pwsh.exe", "powershell", "powershell.exe"] {
            if let Some(program) = find_in_path(name) {
                info!(program = %program.display(), "PowerShell binary located");
                return Ok(Self {
                    program,
                    flavor: ShellFlavor::PowerShell,
                });
            }
        }
        Err(PsgateError::SpawnFailed(
            "no PowerShell binary (pwsh or powershell) on PATH".into(),
        ))
    }

    /// A POSIX `sh` binary, for test harnesses.
    pub fn posix() -> Self {
        Self {
            program: PathBuf::from("/bin/sh"),
            flavor: ShellFlavor::Posix,
        }
    }

    /// Build the argument vector for one command. `self_destruct` arms
    /// the in-process exit timer (PowerShell flavor only).
    pub fn args(&self, command: &str, self_destruct: Option<Duration>) -> Vec<String> {
        match self.flavor {
            ShellFlavor::PowerShell => {
                let script = match self_destruct {
                    Some(after) => harnessed(command, after),
                    None => command.to_string(),
                };
                vec![
                    "-NoProfile".into(),
                    "-NonInteractive".into(),
                    "-NoLogo".into(),
                    "-ExecutionPolicy".into(),
                    "Bypass".into(),
                    "-Command".into(),
                    script,
                ]
            }
            ShellFlavor::Posix => vec!["-c".into(), command.to_string()],
        }
    }
}

/// Wrap a command so the spawned process exits itself with code 124
/// shortly before the external watchdog would fire.
fn harnessed(command: &str, after: Duration) -> String {
    format!(
        "$__gateTimer = New-Object System.Threading.Timer ([System.Threading.TimerCallback]{{ [Environment]::Exit({}) }}, $null, {}, -1); try {{ {} }} finally {{ $__gateTimer.Dispose() }}",
        SELF_DESTRUCT_EXIT,
        after.as_millis(),
        command
    )
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
