//! Lifecycle of the single "VM created" event subscription.
//!
//! A subscription counts as registered only when the persisted record names a
//! watch that is live in this process's [`SubscriberTable`]. Live watches die
//! with the process, so a record left behind by an earlier run is stale and is
//! reported as "not registered" rather than as an error.

use crate::config::EventMatchCriteria;
use crate::error::{LifecycleError, PersistenceWarning, PlatformError};
use crate::platform::{EventHandler, EventSource, LiveWatch};
use crate::state::{StateStore, SubscriptionRecord};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

/// Registry of the watches this process currently owns.
pub trait SubscriberTable: Send + Sync {
    fn contains(&self, identifier: &str) -> bool;
    /// Adopt a live watch and return the identifier it is filed under.
    fn insert(&self, watch: Box<dyn LiveWatch>) -> String;
    /// Cancel the named watch and drop it. A failed cancel keeps the entry.
    fn cancel(&self, identifier: &str) -> Result<(), PlatformError>;
}

/// In-memory subscriber table; identifiers are `job-<n>`.
pub struct ProcessSubscriberTable {
    next_id: AtomicU64,
    live: Mutex<HashMap<String, Box<dyn LiveWatch>>>,
}

impl ProcessSubscriberTable {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
            live: Mutex::new(HashMap::new()),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, Box<dyn LiveWatch>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessSubscriberTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberTable for ProcessSubscriberTable {
    fn contains(&self, identifier: &str) -> bool {
        self.live().contains_key(identifier)
    }

    fn insert(&self, watch: Box<dyn LiveWatch>) -> String {
        let identifier = format!("job-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live().insert(identifier.clone(), watch);
        identifier
    }

    fn cancel(&self, identifier: &str) -> Result<(), PlatformError> {
        let mut live = self.live();
        let watch = live
            .get_mut(identifier)
            .ok_or_else(|| PlatformError::UnknownSubscription(identifier.to_string()))?;
        watch.cancel()?;
        live.remove(identifier);
        Ok(())
    }
}

/// Outcome of a successful [`SubscriptionManager::register`].
#[derive(Debug)]
pub struct Registration {
    pub identifier: String,
    /// Set when the watch is live but the record could not be written.
    pub warning: Option<PersistenceWarning>,
}

pub struct SubscriptionManager {
    store: StateStore,
    source: Arc<dyn EventSource>,
    table: Arc<dyn SubscriberTable>,
    criteria: EventMatchCriteria,
    // Serializes check-then-act; holds the watch this manager opened, if any.
    lifecycle: Mutex<Option<String>>,
}

impl SubscriptionManager {
    pub fn new(
        store: StateStore,
        source: Arc<dyn EventSource>,
        table: Arc<dyn SubscriberTable>,
    ) -> Self {
        Self::with_criteria(store, source, table, EventMatchCriteria::default())
    }

    pub fn with_criteria(
        store: StateStore,
        source: Arc<dyn EventSource>,
        table: Arc<dyn SubscriberTable>,
        criteria: EventMatchCriteria,
    ) -> Self {
        Self {
            store,
            source,
            table,
            criteria,
            lifecycle: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Persisted record whose watch is still live, if any.
    fn active_record(&self) -> Option<SubscriptionRecord> {
        let record = self.store.load()?;
        if self.table.contains(&record.identifier) {
            Some(record)
        } else {
            tracing::info!(
                "Subscription record '{}' is stale (no live subscriber in this process)",
                record.identifier
            );
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_record().is_some()
    }

    pub fn register(&self, handler: EventHandler) -> Result<Registration, LifecycleError> {
        let mut owned = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.active_record() {
            return Err(LifecycleError::AlreadyRegistered {
                identifier: existing.identifier,
            });
        }
        // Covers a live watch whose record was never written.
        if let Some(identifier) = owned.as_ref().filter(|id| self.table.contains(id)) {
            return Err(LifecycleError::AlreadyRegistered {
                identifier: identifier.clone(),
            });
        }

        let watch = self
            .source
            .watch(&self.criteria, handler)
            .map_err(LifecycleError::Subscribe)?;
        let identifier = self.table.insert(watch);
        *owned = Some(identifier.clone());
        tracing::info!(
            "Subscribed to event {} on {} as '{}'",
            self.criteria.event_id,
            self.criteria.channel,
            identifier
        );

        let warning = match self.store.save(&SubscriptionRecord::new(identifier.clone())) {
            Ok(()) => None,
            Err(source) => {
                let warning = PersistenceWarning {
                    identifier: identifier.clone(),
                    source,
                };
                tracing::warn!("{}", warning);
                Some(warning)
            }
        };
        Ok(Registration {
            identifier,
            warning,
        })
    }

    /// Cancel the active subscription and remove its record.
    pub fn unregister(&self) -> Result<String, LifecycleError> {
        let mut owned = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.active_record().ok_or(LifecycleError::NotRegistered)?;

        self.table
            .cancel(&record.identifier)
            .map_err(|source| LifecycleError::Cancel {
                identifier: record.identifier.clone(),
                source,
            })?;

        // The watch is gone; a record that survives here is merely stale.
        if let Err(e) = self.store.clear() {
            tracing::warn!(
                "Subscription '{}' cancelled but its record was not removed: {}",
                record.identifier,
                e
            );
        }
        if owned.as_deref() == Some(record.identifier.as_str()) {
            *owned = None;
        }
        tracing::info!("Unsubscribed '{}'", record.identifier);
        Ok(record.identifier)
    }

    /// Cancel a watch by identifier, with or without a record naming it.
    ///
    /// The record is removed only when it names `identifier`.
    pub fn unregister_identifier(&self, identifier: &str) -> Result<(), LifecycleError> {
        let mut owned = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        self.table
            .cancel(identifier)
            .map_err(|source| LifecycleError::Cancel {
                identifier: identifier.to_string(),
                source,
            })?;
        if owned.as_deref() == Some(identifier) {
            *owned = None;
        }

        if self
            .store
            .load()
            .is_some_and(|record| record.identifier == identifier)
        {
            if let Err(e) = self.store.clear() {
                tracing::warn!(
                    "Subscription '{}' cancelled but its record was not removed: {}",
                    identifier,
                    e
                );
            }
        }
        tracing::info!("Unsubscribed '{}' by identifier", identifier);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::EventRecord;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingWatch {
        cancels: Arc<AtomicUsize>,
        fail: bool,
    }

    impl LiveWatch for CountingWatch {
        fn cancel(&mut self) -> Result<(), PlatformError> {
            if self.fail {
                return Err(PlatformError::Call {
                    call: "EvtClose",
                    message: "access denied".into(),
                });
            }
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSource {
        watches: AtomicUsize,
        cancels: Arc<AtomicUsize>,
        fail_cancel: bool,
        fail_watch: bool,
    }

    impl EventSource for FakeSource {
        fn watch(
            &self,
            _criteria: &EventMatchCriteria,
            _handler: EventHandler,
        ) -> Result<Box<dyn LiveWatch>, PlatformError> {
            if self.fail_watch {
                return Err(PlatformError::Call {
                    call: "EvtSubscribe",
                    message: "channel not found".into(),
                });
            }
            self.watches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingWatch {
                cancels: self.cancels.clone(),
                fail: self.fail_cancel,
            }))
        }
    }

    fn noop_handler() -> EventHandler {
        Arc::new(|_: EventRecord| {})
    }

    fn manager(dir: &TempDir, source: Arc<FakeSource>) -> SubscriptionManager {
        SubscriptionManager::new(
            StateStore::new(dir.path().join("state.json")),
            source,
            Arc::new(ProcessSubscriberTable::new()),
        )
    }

    #[test]
    fn register_then_unregister_round_trips_state() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        let mgr = manager(&dir, source.clone());
        assert!(!mgr.is_active());

        let reg = mgr.register(noop_handler()).unwrap();
        assert_eq!(reg.identifier, "job-1");
        assert!(reg.warning.is_none());
        assert!(mgr.is_active());
        assert_eq!(mgr.store().load().unwrap().identifier, "job-1");

        assert_eq!(mgr.unregister().unwrap(), "job-1");
        assert!(!mgr.is_active());
        assert!(!mgr.store().path().exists());
        assert_eq!(source.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_register_is_rejected_and_keeps_first() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        let mgr = manager(&dir, source.clone());
        mgr.register(noop_handler()).unwrap();

        let err = mgr.register(noop_handler()).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRegistered { ref identifier } if identifier == "job-1"));
        assert_eq!(source.watches.load(Ordering::SeqCst), 1);
        assert!(mgr.is_active());
    }

    #[test]
    fn unregister_when_inactive_leaves_stale_file_alone() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, Arc::new(FakeSource::default()));
        mgr.store().save(&SubscriptionRecord::new("job-9")).unwrap();
        let before = std::fs::metadata(mgr.store().path()).unwrap().modified().unwrap();

        assert!(matches!(mgr.unregister(), Err(LifecycleError::NotRegistered)));
        let after = std::fs::metadata(mgr.store().path()).unwrap().modified().unwrap();
        assert_eq!(before, after);
        assert_eq!(mgr.store().load().unwrap().identifier, "job-9");
    }

    #[test]
    fn failed_cancel_keeps_record_and_subscription() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource {
            fail_cancel: true,
            ..Default::default()
        });
        let mgr = manager(&dir, source);
        mgr.register(noop_handler()).unwrap();

        let err = mgr.unregister().unwrap_err();
        assert!(matches!(err, LifecycleError::Cancel { ref identifier, .. } if identifier == "job-1"));
        assert!(err.to_string().contains("job-1"));
        assert!(mgr.is_active());
        assert!(mgr.store().path().exists());
    }

    #[test]
    fn failed_watch_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource {
            fail_watch: true,
            ..Default::default()
        });
        let mgr = manager(&dir, source);
        assert!(matches!(
            mgr.register(noop_handler()),
            Err(LifecycleError::Subscribe(_))
        ));
        assert!(!mgr.store().path().exists());
        assert!(!mgr.is_active());
    }

    #[test]
    fn unwritable_state_is_a_warning_not_a_failure() {
        let dir = TempDir::new().unwrap();
        let table = Arc::new(ProcessSubscriberTable::new());
        let mgr = SubscriptionManager::new(
            StateStore::new(dir.path().join("missing").join("state.json")),
            Arc::new(FakeSource::default()),
            table.clone(),
        );

        let reg = mgr.register(noop_handler()).unwrap();
        let warning = reg.warning.expect("persistence warning");
        assert_eq!(warning.identifier, "job-1");
        assert!(table.contains("job-1"));
        // Without a record the manager cannot see its own watch.
        assert!(!mgr.is_active());
    }

    #[test]
    fn unpersisted_watch_blocks_register_and_cancels_by_identifier() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        let table = Arc::new(ProcessSubscriberTable::new());
        let mgr = SubscriptionManager::new(
            StateStore::new(dir.path().join("missing").join("state.json")),
            source.clone(),
            table.clone(),
        );
        let reg = mgr.register(noop_handler()).unwrap();
        assert!(reg.warning.is_some());

        assert!(matches!(mgr.unregister(), Err(LifecycleError::NotRegistered)));
        let err = mgr.register(noop_handler()).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRegistered { ref identifier } if identifier == "job-1"));
        assert_eq!(source.watches.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);

        mgr.unregister_identifier(&reg.identifier).unwrap();
        assert!(table.is_empty());
        assert_eq!(source.cancels.load(Ordering::SeqCst), 1);

        // Free again: the next watch gets a fresh identifier.
        assert_eq!(mgr.register(noop_handler()).unwrap().identifier, "job-2");
    }

    #[test]
    fn unregister_identifier_leaves_foreign_record_alone() {
        let dir = TempDir::new().unwrap();
        let table = Arc::new(ProcessSubscriberTable::new());
        let mgr = SubscriptionManager::new(
            StateStore::new(dir.path().join("state.json")),
            Arc::new(FakeSource::default()),
            table.clone(),
        );
        let reg = mgr.register(noop_handler()).unwrap();
        mgr.store().save(&SubscriptionRecord::new("job-77")).unwrap();

        mgr.unregister_identifier(&reg.identifier).unwrap();
        assert!(table.is_empty());
        assert_eq!(mgr.store().load().unwrap().identifier, "job-77");
    }

    #[test]
    fn unregister_identifier_removes_matching_record() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, Arc::new(FakeSource::default()));
        let reg = mgr.register(noop_handler()).unwrap();

        mgr.unregister_identifier(&reg.identifier).unwrap();
        assert!(!mgr.store().path().exists());
        assert!(!mgr.is_active());
        assert!(matches!(
            mgr.unregister_identifier("job-1"),
            Err(LifecycleError::Cancel { ref identifier, .. }) if identifier == "job-1"
        ));
    }

    #[test]
    fn table_cancel_of_unknown_identifier_fails() {
        let table = ProcessSubscriberTable::new();
        assert!(matches!(
            table.cancel("job-404"),
            Err(PlatformError::UnknownSubscription(id)) if id == "job-404"
        ));
    }

    #[test]
    fn concurrent_registers_yield_exactly_one_subscription() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        let mgr = Arc::new(manager(&dir, source.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                std::thread::spawn(move || mgr.register(noop_handler()).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(source.watches.load(Ordering::SeqCst), 1);
    }
}
