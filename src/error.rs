use std::io;
use thiserror::Error;

/// Failures writing or removing the persisted subscription record.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to serialize subscription record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Errors reported by the event log or the virtualization management layer.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("virtual machine {0} not found")]
    NotFound(String),
    #[error("'{0}' is not a valid virtual machine id")]
    InvalidVmId(String),
    #[error("no live subscription named '{0}'")]
    UnknownSubscription(String),
    #[error("{call} failed: {message}")]
    Call { call: &'static str, message: String },
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Subscription was created but the record could not be written.
#[derive(Debug, Error)]
#[error("subscription '{identifier}' is live but was not persisted: {source}")]
pub struct PersistenceWarning {
    pub identifier: String,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("already registered as '{identifier}'")]
    AlreadyRegistered { identifier: String },
    #[error("no active subscription")]
    NotRegistered,
    #[error("failed to create event subscription: {0}")]
    Subscribe(#[source] PlatformError),
    #[error("failed to cancel subscription '{identifier}': {source}")]
    Cancel {
        identifier: String,
        #[source]
        source: PlatformError,
    },
}

/// Per-event failures of the checkpoint-disable action.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("event {event_id} has no virtual machine id at property {index}")]
    MalformedEvent { event_id: u32, index: usize },
    #[error("could not resolve virtual machine {vm_id}: {source}")]
    VmResolution {
        vm_id: String,
        #[source]
        source: PlatformError,
    },
    #[error("disabling automatic checkpoints on {vm_id} failed: {source}")]
    Platform {
        vm_id: String,
        #[source]
        source: PlatformError,
    },
}

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("this command must be run from an elevated (administrator) prompt")]
    InsufficientPrivilege,
    #[error("failed to query process token: {0}")]
    TokenQuery(String),
}

#[derive(Debug, Error)]
pub enum BootTaskError {
    #[error("boot task '{0}' is already installed")]
    AlreadyInstalled(String),
    #[error("boot task '{0}' is not installed")]
    NotInstalled(String),
    #[error("schtasks.exe failed: {0}")]
    Schtasks(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
