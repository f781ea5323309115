//! Boot-time scheduled task that restarts the watcher with `register`.

#[cfg(windows)]
use crate::config::BOOT_TASK_NAME;
use crate::error::BootTaskError;
use std::path::Path;

#[cfg(windows)]
const SCHTASKS: &str = "schtasks.exe";

/// Runs at startup as SYSTEM with the highest run level.
pub fn install_args(task_name: &str, exe: &Path) -> Vec<String> {
    let action = format!("\"{}\" register", exe.display());
    [
        "/Create", "/TN", task_name, "/TR", action.as_str(), "/SC", "ONSTART", "/RU", "SYSTEM", "/RL",
        "HIGHEST", "/F",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn remove_args(task_name: &str) -> Vec<String> {
    ["/Delete", "/TN", task_name, "/F"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg_attr(not(windows), allow(dead_code))]
fn query_args(task_name: &str) -> Vec<String> {
    ["/Query", "/TN", task_name]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg_attr(not(windows), allow(dead_code))]
fn failure_message(out: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr);
    let stdout = String::from_utf8_lossy(&out.stdout);
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    format!("{} ({})", text.trim(), out.status)
}

#[cfg(windows)]
fn schtasks(args: &[String]) -> Result<std::process::Output, BootTaskError> {
    tracing::debug!("{} {}", SCHTASKS, args.join(" "));
    Ok(std::process::Command::new(SCHTASKS).args(args).output()?)
}

#[cfg(windows)]
pub fn is_boot_task_installed() -> bool {
    schtasks(&query_args(BOOT_TASK_NAME))
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(windows)]
pub fn install_boot_task() -> Result<(), BootTaskError> {
    if is_boot_task_installed() {
        return Err(BootTaskError::AlreadyInstalled(BOOT_TASK_NAME.into()));
    }
    let exe = std::env::current_exe()?;
    let out = schtasks(&install_args(BOOT_TASK_NAME, &exe))?;
    if !out.status.success() {
        return Err(BootTaskError::Schtasks(failure_message(&out)));
    }
    tracing::info!("Installed boot task '{}' for {}", BOOT_TASK_NAME, exe.display());
    Ok(())
}

#[cfg(windows)]
pub fn remove_boot_task() -> Result<(), BootTaskError> {
    if !is_boot_task_installed() {
        return Err(BootTaskError::NotInstalled(BOOT_TASK_NAME.into()));
    }
    let out = schtasks(&remove_args(BOOT_TASK_NAME))?;
    if !out.status.success() {
        return Err(BootTaskError::Schtasks(failure_message(&out)));
    }
    tracing::info!("Removed boot task '{}'", BOOT_TASK_NAME);
    Ok(())
}

#[cfg(not(windows))]
pub fn is_boot_task_installed() -> bool {
    false
}
#[cfg(not(windows))]
pub fn install_boot_task() -> Result<(), BootTaskError> {
    Err(BootTaskError::Schtasks("unsupported platform".into()))
}
#[cfg(not(windows))]
pub fn remove_boot_task() -> Result<(), BootTaskError> {
    Err(BootTaskError::Schtasks("unsupported platform".into()))
}
