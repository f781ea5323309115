//! Capabilities the watcher consumes from the host: an event log that can push
//! matching entries to a handler, and the Hyper-V management layer.

use crate::config::EventMatchCriteria;
use crate::error::PlatformError;
use std::sync::Arc;

/// One delivered event log entry, reduced to what the action needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_id: u32,
    /// User data values in declaration order. `None` for null or non-string values.
    pub properties: Vec<Option<String>>,
}

impl EventRecord {
    pub fn new(event_id: u32, properties: Vec<Option<String>>) -> Self {
        Self {
            event_id,
            properties,
        }
    }

    /// Trimmed, non-empty string value at `index`.
    pub fn property(&self, index: usize) -> Option<&str> {
        self.properties
            .get(index)?
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Called once per matching event, from whatever thread the event source uses.
pub type EventHandler = Arc<dyn Fn(EventRecord) + Send + Sync>;

/// A watch that is currently delivering events.
pub trait LiveWatch: Send {
    /// Stop delivery. On error the watch must still be cancellable later.
    fn cancel(&mut self) -> Result<(), PlatformError>;
}

/// The host's log-watch facility.
pub trait EventSource: Send + Sync {
    /// Enable a watch for `criteria` and return without waiting for events.
    fn watch(
        &self,
        criteria: &EventMatchCriteria,
        handler: EventHandler,
    ) -> Result<Box<dyn LiveWatch>, PlatformError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub id: String,
    pub name: String,
}

/// Virtual machine management interface.
pub trait VmPlatform: Send + Sync {
    fn resolve_vm_by_id(&self, id: &str) -> Result<VmHandle, PlatformError>;
    fn set_automatic_checkpoints(
        &self,
        handle: &VmHandle,
        enabled: bool,
    ) -> Result<(), PlatformError>;
}

impl<T: VmPlatform + ?Sized> VmPlatform for Arc<T> {
    fn resolve_vm_by_id(&self, id: &str) -> Result<VmHandle, PlatformError> {
        (**self).resolve_vm_by_id(id)
    }

    fn set_automatic_checkpoints(
        &self,
        handle: &VmHandle,
        enabled: bool,
    ) -> Result<(), PlatformError> {
        (**self).set_automatic_checkpoints(handle, enabled)
    }
}
