//! Autolock controller.
//!
//! The controller is a single tokio task that owns the cached status, the
//! configuration and the timer registry. Public requests, timer firings and
//! completions of backend calls all arrive as messages and are applied one
//! at a time, so "at most one armed timer per role" holds without locks.
//!
//! Backend calls run in their own tasks and report back with a completion
//! message. A slow or hung backend therefore never delays timer firings, and
//! two checks may be in flight at once: the last completion wins the status,
//! and the delayed lock is only armed when it is not armed already. A lock
//! call that never returns stalls only its own cycle; later checks still arm
//! the next lock.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{AutolockConfig, ConfigChange, ConfigDelta, ConfigError, ConfigKey, ConfigSource};
use crate::observer::{StatusObserver, StatusReport};
use crate::status::{compute_status, StatusLevel};
use crate::store::{Collection, CollectionId, SecretStore, StoreError};
use crate::timers::{TimerFired, TimerRegistry, TimerRole};
use crate::{AutolockError, Result};

const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Requests sent by [`AutolockHandle`]
enum Request {
    CheckNow,
    LockNow,
    LockCollection(CollectionId),
    UpdateConfig(ConfigDelta, oneshot::Sender<std::result::Result<(), ConfigError>>),
    Report(oneshot::Sender<StatusReport>),
    Config(oneshot::Sender<AutolockConfig>),
    LockDeadline(oneshot::Sender<Option<Instant>>),
    Shutdown(oneshot::Sender<()>),
}

/// Internal events produced by timers and background tasks
enum Event {
    Timer(TimerFired),
    CheckCompleted {
        seq: u64,
        result: std::result::Result<Vec<Collection>, StoreError>,
    },
    LockCompleted(std::result::Result<usize, StoreError>),
    LockOneCompleted {
        id: CollectionId,
        result: std::result::Result<(), StoreError>,
    },
    ConfigChanged(ConfigChange),
    ConfigResync,
}

impl From<TimerFired> for Event {
    fn from(fired: TimerFired) -> Self {
        Event::Timer(fired)
    }
}

/// State owned by the controller task
pub struct AutolockController {
    store: Arc<dyn SecretStore>,
    config_source: Arc<dyn ConfigSource>,
    observer: Arc<dyn StatusObserver>,
    config: AutolockConfig,
    report: StatusReport,
    visible: Option<bool>,
    /// Sequence number of the most recently started check
    check_seq: u64,
    /// Checks numbered below this started before the last lock completed
    check_floor: u64,
    /// Check started right after the last lock completed, if still pending
    lock_recheck: Option<u64>,
    timers: TimerRegistry<Event>,
    events: mpsc::UnboundedSender<Event>,
    config_forwarder: Option<JoinHandle<()>>,
}

impl AutolockController {
    /// Start the controller on the current tokio runtime.
    ///
    /// Reads the initial configuration from `config_source`, arms the
    /// periodic check, schedules a check right after activation and follows
    /// configuration changes until [`AutolockHandle::shutdown`] is called or
    /// every handle is dropped.
    pub fn spawn(
        store: Arc<dyn SecretStore>,
        config_source: Arc<dyn ConfigSource>,
        observer: Arc<dyn StatusObserver>,
    ) -> Result<AutolockHandle> {
        // Subscribe before reading so no change falls between the two
        let changes = config_source.subscribe();
        let initial = config_source.snapshot()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

        let mut controller = Self {
            store,
            config_source,
            observer,
            config: AutolockConfig::default(),
            report: StatusReport::initial(),
            visible: None,
            check_seq: 0,
            check_floor: 0,
            lock_recheck: None,
            timers: TimerRegistry::new(events_tx.clone()),
            events: events_tx.clone(),
            config_forwarder: None,
        };

        info!(
            check_interval = initial.check_interval_secs,
            lock_delay = initial.lock_delay_secs,
            ignored = initial.ignored_collections.len(),
            "Starting keyring autolock"
        );
        controller.apply_config(&ConfigDelta::from_config(&initial), true)?;
        controller.config_forwarder = Some(spawn_config_forwarder(changes, events_tx));

        tokio::spawn(controller.run(requests_rx, events_rx));

        Ok(AutolockHandle {
            requests: requests_tx,
        })
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                biased;

                request = requests.recv() => match request {
                    Some(request) => {
                        if let Some(reply) = self.handle_request(request) {
                            shutdown_reply = Some(reply);
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        self.stop();
        drop(events);
        drop(requests);
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Handle one request. Returns the reply channel when the request asks
    /// the controller to stop.
    fn handle_request(&mut self, request: Request) -> Option<oneshot::Sender<()>> {
        match request {
            Request::CheckNow => self.run_check(),
            Request::LockNow => self.run_lock(),
            Request::LockCollection(id) => self.run_lock_one(id),
            Request::UpdateConfig(delta, reply) => {
                let _ = reply.send(self.apply_config(&delta, false));
            }
            Request::Report(reply) => {
                let _ = reply.send(self.report.clone());
            }
            Request::Config(reply) => {
                let _ = reply.send(self.config.clone());
            }
            Request::LockDeadline(reply) => {
                let _ = reply.send(self.timers.deadline(TimerRole::DelayedLock));
            }
            Request::Shutdown(reply) => return Some(reply),
        }
        None
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Timer(fired) => {
                if !self.timers.fire(fired) {
                    return;
                }
                debug!(timer = %fired.role, "Timer fired");
                match fired.role {
                    TimerRole::PeriodicCheck | TimerRole::DeferredRecheck => self.run_check(),
                    TimerRole::DelayedLock => self.run_lock(),
                }
            }
            Event::CheckCompleted { seq, result } => self.finish_check(seq, result),
            Event::LockCompleted(result) => {
                match result {
                    Ok(count) => info!("Locked {} collections in the keyring", count),
                    Err(e) => error!(error = %e, "Failed to lock keyring"),
                }
                self.recheck_after_lock();
            }
            Event::LockOneCompleted { id, result } => {
                match result {
                    Ok(()) => info!(collection = %id, "Locked collection"),
                    Err(e) => error!(collection = %id, error = %e, "Failed to lock collection"),
                }
                self.recheck_after_lock();
            }
            Event::ConfigChanged(change) => {
                let applied = ConfigDelta::from_change(&change)
                    .and_then(|delta| self.apply_config(&delta, false));
                if let Err(e) = applied {
                    warn!(key = %change.key, error = %e, "Ignoring invalid configuration change");
                }
            }
            Event::ConfigResync => {
                let applied = self
                    .config_source
                    .snapshot()
                    .and_then(|config| self.apply_config(&ConfigDelta::from_config(&config), false));
                if let Err(e) = applied {
                    warn!(error = %e, "Failed to re-read configuration");
                }
            }
        }
    }

    /// Poll the store in the background; the result arrives as
    /// [`Event::CheckCompleted`].
    fn run_check(&mut self) {
        self.check_seq += 1;
        let seq = self.check_seq;
        let store = self.store.clone();
        let ignored = self.config.ignored_collections.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = poll_collections(store.as_ref(), &ignored).await;
            let _ = events.send(Event::CheckCompleted { seq, result });
        });
    }

    /// Check again after a lock, discarding checks that may have read the
    /// store before the lock took effect.
    fn recheck_after_lock(&mut self) {
        self.check_floor = self.check_seq + 1;
        self.run_check();
        self.lock_recheck = Some(self.check_seq);
    }

    fn finish_check(&mut self, seq: u64, result: std::result::Result<Vec<Collection>, StoreError>) {
        if seq < self.check_floor {
            debug!(seq, "Discarding check that started before the last lock");
            return;
        }

        let after_lock = self.lock_recheck == Some(seq);
        if after_lock {
            self.lock_recheck = None;
        }

        let collections = match result {
            Ok(collections) => collections,
            Err(e) => {
                warn!(error = %e, "Keyring check failed, retrying on next poll");
                return;
            }
        };

        let counts = compute_status(&collections, &self.config.ignored_collections);
        debug!(locked = counts.locked, total = counts.total, status = %counts.status, "Keyring checked");
        self.set_report(StatusReport::from_counts(counts, Utc::now()));

        // A check that raced the lock may have armed another one
        if after_lock && counts.status == StatusLevel::High {
            if self.timers.cancel(TimerRole::DelayedLock) {
                debug!("Keyring locked, dropping lock armed by a stale check");
            }
            return;
        }

        if counts.status != StatusLevel::High && !self.timers.is_armed(TimerRole::DelayedLock) {
            info!(
                status = %counts.status,
                lock_delay = self.config.lock_delay_secs,
                "Keyring unlocked, scheduling lock"
            );
            self.timers.schedule(TimerRole::DelayedLock, self.config.lock_delay());
        }
    }

    /// Lock every non-ignored collection, then check again
    fn run_lock(&mut self) {
        self.timers.cancel(TimerRole::DelayedLock);

        let store = self.store.clone();
        let ignored = self.config.ignored_collections.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = lock_collections(store.as_ref(), &ignored).await;
            let _ = events.send(Event::LockCompleted(result));
        });
    }

    fn run_lock_one(&mut self, id: CollectionId) {
        let store = self.store.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = lock_collection(store.as_ref(), &id).await;
            let _ = events.send(Event::LockOneCompleted { id, result });
        });
    }

    /// Validate and store `delta`, then bring the timers in line with it.
    /// With `reconcile_all`, every key is reconciled even if unchanged.
    fn apply_config(
        &mut self,
        delta: &ConfigDelta,
        reconcile_all: bool,
    ) -> std::result::Result<(), ConfigError> {
        let changed = self.config.apply(delta)?;
        let keys = if reconcile_all {
            ConfigKey::ALL.to_vec()
        } else {
            changed
        };

        for key in keys {
            debug!(key = %key, "Reconciling configuration");
            self.reconcile(key);
        }
        Ok(())
    }

    fn reconcile(&mut self, key: ConfigKey) {
        match key {
            ConfigKey::CheckInterval => {
                self.timers
                    .reschedule(TimerRole::PeriodicCheck, self.config.check_interval());
                self.request_check();
            }
            ConfigKey::LockDelay => {
                if self.timers.is_armed(TimerRole::DelayedLock) {
                    self.timers
                        .reschedule(TimerRole::DelayedLock, self.config.lock_delay());
                } else {
                    self.request_check();
                }
            }
            ConfigKey::IgnoredCollections => self.request_check(),
            ConfigKey::HideLocked => {
                self.update_visibility();
                self.request_check();
            }
        }
    }

    /// Ask for a check as soon as pending requests are handled. Repeated
    /// requests before it runs collapse into one.
    fn request_check(&mut self) {
        self.timers.schedule(TimerRole::DeferredRecheck, Duration::ZERO);
    }

    fn set_report(&mut self, report: StatusReport) {
        let previous = std::mem::replace(&mut self.report, report);
        if previous.status != self.report.status {
            info!(
                from = %previous.status,
                to = %self.report.status,
                locked = self.report.locked,
                total = self.report.total,
                "Keyring status changed"
            );
            self.observer.status_changed(&self.report);
            self.update_visibility();
        }
    }

    fn update_visibility(&mut self) {
        let visible = self.report.indicator_visible(self.config.hide_when_locked);
        if self.visible != Some(visible) {
            self.visible = Some(visible);
            self.observer.visibility_changed(visible);
        }
    }

    fn stop(&mut self) {
        self.timers.cancel_all();
        if let Some(forwarder) = self.config_forwarder.take() {
            forwarder.abort();
        }
        info!("Keyring autolock stopped");
    }
}

async fn poll_collections(
    store: &dyn SecretStore,
    ignored: &BTreeSet<CollectionId>,
) -> std::result::Result<Vec<Collection>, StoreError> {
    store.reset_connection().await?;
    store.list_collections(ignored).await
}

async fn lock_collections(
    store: &dyn SecretStore,
    ignored: &BTreeSet<CollectionId>,
) -> std::result::Result<usize, StoreError> {
    let collections = store.list_collections(ignored).await?;
    store.lock_all(&collections).await
}

async fn lock_collection(store: &dyn SecretStore, id: &str) -> std::result::Result<(), StoreError> {
    let collections = store.list_collections(&BTreeSet::new()).await?;
    let collection = collections
        .iter()
        .find(|c| c.id == id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    store.lock_one(collection).await
}

fn spawn_config_forwarder(
    mut changes: broadcast::Receiver<ConfigChange>,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match changes.recv().await {
                Ok(change) => Event::ConfigChanged(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed configuration changes, re-reading configuration");
                    Event::ConfigResync
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

/// Cloneable handle to a running [`AutolockController`]
#[derive(Clone)]
pub struct AutolockHandle {
    requests: mpsc::Sender<Request>,
}

impl AutolockHandle {
    async fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| AutolockError::ControllerStopped)
    }

    async fn query<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(request(tx)).await?;
        rx.await.map_err(|_| AutolockError::ControllerStopped)
    }

    /// Poll the keyring now
    pub async fn check_now(&self) -> Result<()> {
        self.send(Request::CheckNow).await
    }

    /// Lock every non-ignored collection now, cancelling any pending lock
    pub async fn lock_now(&self) -> Result<()> {
        self.send(Request::LockNow).await
    }

    /// Lock a single collection, ignored or not
    pub async fn lock_collection(&self, id: impl Into<CollectionId>) -> Result<()> {
        self.send(Request::LockCollection(id.into())).await
    }

    /// Validate and apply a configuration change
    pub async fn update_config(&self, delta: ConfigDelta) -> Result<()> {
        self.query(|reply| Request::UpdateConfig(delta, reply))
            .await?
            .map_err(AutolockError::from)
    }

    /// Most recent status report
    pub async fn report(&self) -> Result<StatusReport> {
        self.query(Request::Report).await
    }

    /// Configuration currently in effect
    pub async fn config(&self) -> Result<AutolockConfig> {
        self.query(Request::Config).await
    }

    /// When the pending automatic lock fires, if one is armed
    pub async fn lock_deadline(&self) -> Result<Option<Instant>> {
        self.query(Request::LockDeadline).await
    }

    /// Whether an automatic lock is armed
    pub async fn has_pending_lock(&self) -> Result<bool> {
        Ok(self.lock_deadline().await?.is_some())
    }

    /// Cancel every timer, stop following configuration and wait for the
    /// controller to exit. Backend calls already in flight are not aborted.
    pub async fn shutdown(&self) -> Result<()> {
        self.query(Request::Shutdown).await
    }
}
