//! Per-event task dispatch.
//!
//! The event log calls the handler on its own threads. Each delivery becomes a
//! tokio task that waits for a permit and then runs the blocking Hyper-V call
//! on the blocking pool, so a slow VM write never stalls event delivery.

use crate::action::CheckpointDisableAction;
use crate::platform::{EventHandler, EventRecord, VmPlatform};
use std::sync::Arc;
use tokio::{runtime::Handle, sync::Semaphore, task::JoinHandle};

pub struct ActionDispatcher<P> {
    runtime: Handle,
    permits: Arc<Semaphore>,
    action: Arc<CheckpointDisableAction<P>>,
}

impl<P: VmPlatform + 'static> ActionDispatcher<P> {
    pub fn new(
        runtime: Handle,
        action: CheckpointDisableAction<P>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            action: Arc::new(action),
        }
    }

    pub fn dispatch(&self, event: EventRecord) -> JoinHandle<()> {
        tracing::debug!(
            "Dispatching event {} ({} properties)",
            event.event_id,
            event.properties.len()
        );
        let permits = self.permits.clone();
        let action = self.action.clone();
        self.runtime.spawn(async move {
            // Closed only if the dispatcher is torn down mid-flight.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let task = tokio::task::spawn_blocking(move || action.run(&event));
            if let Err(e) = task.await {
                tracing::error!("Checkpoint action task failed: {}", e);
            }
        })
    }

    /// Handler to hand to the event source; each call spawns and detaches.
    pub fn handler(self: &Arc<Self>) -> EventHandler {
        let this = self.clone();
        Arc::new(move |event: EventRecord| {
            this.dispatch(event);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::platform::VmHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct SlowPlatform {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        writes: AtomicUsize,
    }

    impl VmPlatform for SlowPlatform {
        fn resolve_vm_by_id(&self, id: &str) -> Result<VmHandle, PlatformError> {
            Ok(VmHandle {
                id: id.to_string(),
                name: id.to_string(),
            })
        }

        fn set_automatic_checkpoints(
            &self,
            _handle: &VmHandle,
            _enabled: bool,
        ) -> Result<(), PlatformError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn vm_event(n: usize) -> EventRecord {
        EventRecord::new(13002, vec![Some(format!("vm{n}")), Some(format!("VM-{n}"))])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_of_events_is_bounded_and_all_handled() {
        let platform = Arc::new(SlowPlatform::default());
        let dispatcher = ActionDispatcher::new(
            Handle::current(),
            CheckpointDisableAction::new(platform.clone(), 1),
            2,
        );
        let tasks: Vec<_> = (0..6).map(|n| dispatcher.dispatch(vm_event(n))).collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(platform.writes.load(Ordering::SeqCst), 6);
        assert!(platform.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_can_be_called_from_foreign_threads() {
        let platform = Arc::new(SlowPlatform::default());
        let dispatcher = Arc::new(ActionDispatcher::new(
            Handle::current(),
            CheckpointDisableAction::new(platform.clone(), 1),
            4,
        ));
        let handler = dispatcher.handler();
        std::thread::spawn(move || {
            handler(vm_event(1));
            handler(EventRecord::new(13002, vec![]));
        })
        .join()
        .unwrap();

        for _ in 0..100 {
            if platform.writes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(platform.writes.load(Ordering::SeqCst), 1);
    }
}
