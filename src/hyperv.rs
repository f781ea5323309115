//! Hyper-V management through the `Hyper-V` PowerShell module.
//!
//! Every call is a short-lived `powershell.exe` run; the VM id is parsed as a
//! GUID first so nothing caller-controlled reaches the command line verbatim.

use crate::error::PlatformError;
use crate::platform::{VmHandle, VmPlatform};
use std::process::{Command, Output};
use uuid::Uuid;

const POWERSHELL: &str = "powershell.exe";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, Default)]
pub struct HyperVPowerShell;

impl HyperVPowerShell {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, call: &'static str, script: &str) -> Result<String, PlatformError> {
        let mut cmd = Command::new(POWERSHELL);
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", script]);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        let out = cmd.output().map_err(|source| PlatformError::Spawn {
            program: POWERSHELL,
            source,
        })?;
        check_output(call, out)
    }
}

fn parse_vm_id(id: &str) -> Result<Uuid, PlatformError> {
    Uuid::parse_str(id.trim_matches(|c| c == '{' || c == '}'))
        .map_err(|_| PlatformError::InvalidVmId(id.to_string()))
}

fn resolve_script(id: &Uuid) -> String {
    format!("(Get-VM -Id '{}' -ErrorAction Stop).Name", id.hyphenated())
}

fn set_checkpoints_script(id: &Uuid, enabled: bool) -> String {
    format!(
        "Set-VM -VM (Get-VM -Id '{}' -ErrorAction Stop) -AutomaticCheckpointsEnabled ${} -ErrorAction Stop",
        id.hyphenated(),
        enabled
    )
}

fn check_output(call: &'static str, out: Output) -> Result<String, PlatformError> {
    if out.status.success() {
        return Ok(String::from_utf8_lossy(&out.stdout).trim().to_string());
    }
    let stderr = String::from_utf8_lossy(&out.stderr);
    let message = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no error output")
        .to_string();
    Err(PlatformError::Call { call, message })
}

impl VmPlatform for HyperVPowerShell {
    fn resolve_vm_by_id(&self, id: &str) -> Result<VmHandle, PlatformError> {
        let uuid = parse_vm_id(id)?;
        match self.run("Get-VM", &resolve_script(&uuid)) {
            Ok(name) if !name.is_empty() => Ok(VmHandle {
                id: uuid.hyphenated().to_string(),
                name,
            }),
            Ok(_) => Err(PlatformError::NotFound(id.to_string())),
            Err(PlatformError::Call { message, .. })
                if message.to_ascii_lowercase().contains("unable to find") =>
            {
                Err(PlatformError::NotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn set_automatic_checkpoints(
        &self,
        handle: &VmHandle,
        enabled: bool,
    ) -> Result<(), PlatformError> {
        let uuid = parse_vm_id(&handle.id)?;
        self.run("Set-VM", &set_checkpoints_script(&uuid, enabled))
            .map(|_| ())
    }
}
