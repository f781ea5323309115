use crate::error::ActionError;
use crate::platform::{EventRecord, VmPlatform};

/// Turns a "VM created" event into a single `AutomaticCheckpointsEnabled = false` write.
#[derive(Debug, Clone)]
pub struct CheckpointDisableAction<P> {
    platform: P,
    vm_id_index: usize,
}

impl<P: VmPlatform> CheckpointDisableAction<P> {
    pub fn new(platform: P, vm_id_index: usize) -> Self {
        Self {
            platform,
            vm_id_index,
        }
    }

    pub fn apply(&self, event: &EventRecord) -> Result<String, ActionError> {
        let vm_id = event
            .property(self.vm_id_index)
            .ok_or(ActionError::MalformedEvent {
                event_id: event.event_id,
                index: self.vm_id_index,
            })?;

        let handle =
            self.platform
                .resolve_vm_by_id(vm_id)
                .map_err(|source| ActionError::VmResolution {
                    vm_id: vm_id.to_string(),
                    source,
                })?;

        self.platform
            .set_automatic_checkpoints(&handle, false)
            .map_err(|source| ActionError::Platform {
                vm_id: vm_id.to_string(),
                source,
            })?;
        Ok(handle.name)
    }

    /// Apply and log the outcome. Nothing escapes to the event source.
    pub fn run(&self, event: &EventRecord) {
        match self.apply(event) {
            Ok(name) => tracing::info!("Disabled automatic checkpoints on '{}'", name),
            Err(e @ ActionError::MalformedEvent { .. }) => tracing::warn!("{}", e),
            Err(e) => tracing::error!("{}", e),
        }
    }
}
