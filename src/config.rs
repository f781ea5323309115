use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Windows Event Log channel written by the Hyper-V management service.
pub const VMMS_ADMIN_CHANNEL: &str = "Microsoft-Windows-Hyper-V-VMMS-Admin";

/// "A new virtual machine was created" in the VMMS admin channel.
pub const VM_CREATED_EVENT_ID: u32 = 13002;

/// Position of the virtual machine id within the event's user data.
pub const VM_ID_PROPERTY_INDEX: usize = 1;

/// Name of the persisted subscription record, next to the executable.
pub const STATE_FILE_NAME: &str = "hvckpt-subscription.json";

/// Scheduled task used to re-register the watcher at boot.
pub const BOOT_TASK_NAME: &str = "HvCheckpointGuard";

/// Upper bound on checkpoint-disable actions running at the same time.
pub const MAX_CONCURRENT_ACTIONS: usize = 4;

/// Which log channel and event the watcher subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMatchCriteria {
    pub channel: &'static str,
    pub event_id: u32,
    pub vm_id_index: usize,
}

impl EventMatchCriteria {
    pub const fn vm_created() -> Self {
        Self {
            channel: VMMS_ADMIN_CHANNEL,
            event_id: VM_CREATED_EVENT_ID,
            vm_id_index: VM_ID_PROPERTY_INDEX,
        }
    }

    /// Structured XPath filter understood by the event log service.
    pub fn xpath_query(&self) -> String {
        format!("*[System[(EventID={})]]", self.event_id)
    }
}

impl Default for EventMatchCriteria {
    fn default() -> Self {
        Self::vm_created()
    }
}

#[derive(Debug, Clone)]
pub struct Paths {
    pub exe_dir: PathBuf,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
}

impl Paths {
    /// Lay out every path relative to `exe_dir`, logs included.
    pub fn in_dir(exe_dir: &Path) -> Self {
        Self {
            exe_dir: exe_dir.to_path_buf(),
            state_file: exe_dir.join(STATE_FILE_NAME),
            log_dir: exe_dir.join("logs"),
        }
    }
}

/// Directory that contains the running executable.
pub fn exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to determine executable path")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("Executable has no parent directory")
}

pub fn project_paths() -> Result<Paths> {
    let mut paths = Paths::in_dir(&exe_dir()?);
    // SYSTEM has a profile too, so this only falls back on unusual hosts.
    if let Some(dirs) = ProjectDirs::from("com", "Acme", "HvCheckpointGuard") {
        paths.log_dir = dirs.data_local_dir().join("logs");
    }
    Ok(paths)
}
