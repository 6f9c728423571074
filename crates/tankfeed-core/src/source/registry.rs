//! Source registry and scheduler.
//!
//! The registry owns the configured sources and one watcher task per watched
//! source. Watchers publish through [`RegistryShared::emit`], which only lets
//! the current watcher of a still-registered source update state or send
//! events. Removing a source therefore discards any result still in flight.

use super::error_log::ErrorLog;
use super::watcher::{self, WatchContext};
use super::{ContentLoader, FormatChoice, SourceDescriptor, SourceEvent, SourceKind, StandardLoader};
use crate::config::RegistryConfig;
use crate::mapping::CanonicalRecord;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLifecycle {
    /// Registered but not watched
    Registered,
    /// Waiting for the next change or tick
    Watching,
    /// An ingestion cycle is running
    Ingesting,
    /// The last cycle failed; cleared by the next successful read
    Error,
    /// Removed from the registry
    Removed,
}

/// Answer to a status query for one source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub id: String,
    pub kind: SourceKind,
    pub location: String,
    pub format: FormatChoice,
    pub enabled: bool,
    pub state: SourceLifecycle,
    pub last_update: Option<DateTime<Utc>>,
    pub last_record_count: usize,
    pub error_count: u64,
    pub last_error_message: Option<String>,
}

/// Mutable per-source state shared between the registry and its watcher.
#[derive(Debug)]
pub(crate) struct SourceRuntime {
    pub state: SourceLifecycle,
    pub last_update: Option<DateTime<Utc>>,
    pub last_record_count: usize,
    pub latest: Option<Arc<Vec<CanonicalRecord>>>,
    pub errors: ErrorLog,
    pub consecutive_transient: u32,
}

struct WatcherHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    fn is_live(&self, generation: u64) -> bool {
        self.generation == generation && !self.cancel.is_cancelled()
    }
}

struct SourceEntry {
    descriptor: Arc<SourceDescriptor>,
    runtime: Mutex<SourceRuntime>,
    watcher: Option<WatcherHandle>,
}

impl SourceEntry {
    fn status(&self) -> SourceStatus {
        let rt = self.runtime.lock();
        let d = &self.descriptor;
        SourceStatus {
            id: d.id.clone(),
            kind: d.kind,
            location: d.location.clone(),
            format: d.format,
            enabled: d.enabled,
            state: rt.state,
            last_update: rt.last_update,
            last_record_count: rt.last_record_count,
            error_count: rt.errors.total(),
            last_error_message: rt.errors.last().map(|e| e.message.clone()),
        }
    }
}

/// State shared by the registry handle and its watcher tasks.
pub(crate) struct RegistryShared {
    config: RegistryConfig,
    loader: Arc<dyn ContentLoader>,
    sources: RwLock<HashMap<String, SourceEntry>>,
    running: AtomicBool,
    events: broadcast::Sender<SourceEvent>,
    generation: AtomicU64,
}

impl RegistryShared {
    /// Run `update` on the runtime of `id` and send the event it returns,
    /// provided the watcher of `generation` is still the live one. Returns
    /// false when the source was removed or its watcher replaced.
    pub(crate) fn emit(
        &self,
        id: &str,
        generation: u64,
        update: impl FnOnce(&mut SourceRuntime) -> Option<SourceEvent>,
    ) -> bool {
        let sources = self.sources.read();
        let Some(entry) = sources.get(id) else {
            return false;
        };
        if !entry.watcher.as_ref().is_some_and(|w| w.is_live(generation)) {
            return false;
        }

        let event = {
            let mut rt = entry.runtime.lock();
            update(&mut rt)
        };
        if let Some(event) = event {
            // No receivers is fine; events are not buffered for late subscribers.
            let _ = self.events.send(event);
        }
        true
    }
}

impl Drop for RegistryShared {
    fn drop(&mut self) {
        for entry in self.sources.get_mut().values_mut() {
            if let Some(handle) = entry.watcher.take() {
                handle.cancel.cancel();
                handle.task.abort();
            }
        }
    }
}

/// Owns the set of sources and their watchers.
///
/// Cloning yields another handle to the same registry. Watchers are spawned
/// on the current tokio runtime, so `start` and `add_source` must be called
/// from within one.
#[derive(Clone)]
pub struct SourceRegistry {
    inner: Arc<RegistryShared>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl SourceRegistry {
    /// Create a registry that reads through [`StandardLoader`].
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Ok(Self::with_loader(config, Arc::new(StandardLoader::new()?)))
    }

    /// Create a registry with a custom content loader.
    pub fn with_loader(config: RegistryConfig, loader: Arc<dyn ContentLoader>) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            inner: Arc::new(RegistryShared {
                config,
                loader,
                sources: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                events,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Register a source. Starts watching immediately when the registry is
    /// running and the source is enabled.
    pub fn add_source(&self, descriptor: SourceDescriptor) -> Result<()> {
        descriptor.validate()?;

        let mut sources = self.inner.sources.write();
        if sources.contains_key(&descriptor.id) {
            return Err(Error::Validation(format!(
                "source '{}' is already registered",
                descriptor.id
            )));
        }

        let id = descriptor.id.clone();
        let mut entry = SourceEntry {
            descriptor: Arc::new(descriptor),
            runtime: Mutex::new(SourceRuntime {
                state: SourceLifecycle::Registered,
                last_update: None,
                last_record_count: 0,
                latest: None,
                errors: ErrorLog::new(self.inner.config.error_log_capacity),
                consecutive_transient: 0,
            }),
            watcher: None,
        };

        if self.is_running() && entry.descriptor.enabled {
            self.spawn_watcher(&mut entry);
        }

        info!(
            source_id = %id,
            kind = %entry.descriptor.kind,
            location = %entry.descriptor.location,
            "Source registered"
        );
        sources.insert(id, entry);
        Ok(())
    }

    /// Remove a source, stopping its watcher and discarding any in-flight
    /// result. Returns false if no such source exists.
    pub fn remove_source(&self, id: &str) -> bool {
        let removed = self.inner.sources.write().remove(id);
        match removed {
            Some(mut entry) => {
                if let Some(handle) = entry.watcher.take() {
                    handle.cancel.cancel();
                    handle.task.abort();
                }
                entry.runtime.lock().state = SourceLifecycle::Removed;
                info!(source_id = %id, "Source removed");
                true
            }
            None => false,
        }
    }

    /// Start watching every enabled source.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Registry already running");
            return;
        }

        let mut sources = self.inner.sources.write();
        let mut started = 0;
        for entry in sources.values_mut() {
            if entry.descriptor.enabled && entry.watcher.is_none() {
                self.spawn_watcher(entry);
                started += 1;
            }
        }
        info!(sources = started, "Source registry started");
    }

    /// Stop every watcher, waiting up to `timeout` for the tasks to finish.
    pub async fn stop(&self, timeout: Duration) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut sources = self.inner.sources.write();
            sources
                .values_mut()
                .filter_map(|entry| {
                    entry.runtime.lock().state = SourceLifecycle::Registered;
                    entry.watcher.take().map(|handle| {
                        handle.cancel.cancel();
                        handle.task
                    })
                })
                .collect()
        };

        let count = handles.len();
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => info!(watchers = count, "Source registry stopped"),
            Err(_) => warn!(
                watchers = count,
                timeout_secs = timeout.as_secs(),
                "Timed out waiting for watchers to stop"
            ),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Receive data and error events from every source.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.inner.events.subscribe()
    }

    /// Status of every source, sorted by id.
    pub fn status(&self) -> Vec<SourceStatus> {
        let sources = self.inner.sources.read();
        let mut statuses: Vec<SourceStatus> = sources.values().map(SourceEntry::status).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn source_status(&self, id: &str) -> Option<SourceStatus> {
        self.inner.sources.read().get(id).map(SourceEntry::status)
    }

    /// Last successful batch of a source.
    pub fn latest_records(&self, id: &str) -> Option<Arc<Vec<CanonicalRecord>>> {
        let sources = self.inner.sources.read();
        let entry = sources.get(id)?;
        let latest = entry.runtime.lock().latest.clone();
        latest
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sources.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_watcher(&self, entry: &mut SourceEntry) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let ctx = WatchContext {
            shared: Arc::downgrade(&self.inner),
            descriptor: Arc::clone(&entry.descriptor),
            generation,
            cancel: cancel.clone(),
            config: self.inner.config.clone(),
            loader: Arc::clone(&self.inner.loader),
        };
        let task = tokio::spawn(watcher::run(ctx));
        entry.watcher = Some(WatcherHandle {
            generation,
            cancel,
            task,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::Url;
    use std::path::Path;

    /// Loader serving fixed content for every path and URL.
    struct StaticLoader(&'static str);

    #[async_trait]
    impl ContentLoader for StaticLoader {
        async fn read_file(&self, _path: &Path) -> Result<Vec<u8>> {
            Ok(self.0.as_bytes().to_vec())
        }

        async fn fetch(&self, _url: &Url, _timeout: Duration) -> Result<Vec<u8>> {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    /// Loader that always fails with the given I/O error kind.
    struct FailingLoader(std::io::ErrorKind);

    #[async_trait]
    impl ContentLoader for FailingLoader {
        async fn read_file(&self, _path: &Path) -> Result<Vec<u8>> {
            Err(std::io::Error::new(self.0, "read failed").into())
        }

        async fn fetch(&self, _url: &Url, _timeout: Duration) -> Result<Vec<u8>> {
            Err(std::io::Error::new(self.0, "fetch failed").into())
        }
    }

    fn registry(loader: impl ContentLoader + 'static) -> SourceRegistry {
        SourceRegistry::with_loader(RegistryConfig::default(), Arc::new(loader))
    }

    fn polled_file(id: &str) -> SourceDescriptor {
        SourceDescriptor::new(id, SourceKind::File, format!("/virtual/{}.csv", id))
            .with_polling(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_and_duplicate() {
        let registry = registry(StaticLoader("id\nA\n"));
        assert!(registry
            .add_source(SourceDescriptor::new("", SourceKind::File, "/x.csv"))
            .is_err());
        assert!(registry
            .add_source(SourceDescriptor::new("r", SourceKind::Remote, "ftp://host/x"))
            .is_err());
        assert!(registry.is_empty());

        registry.add_source(polled_file("a")).unwrap();
        let err = registry.add_source(polled_file("a")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_status_before_start() {
        let registry = registry(StaticLoader("id\nA\n"));
        registry.add_source(polled_file("b")).unwrap();
        registry.add_source(polled_file("a").disabled()).unwrap();

        let statuses = registry.status();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].id, "a");
        assert!(!statuses[0].enabled);
        assert_eq!(statuses[1].state, SourceLifecycle::Registered);
        assert!(registry.latest_records("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polled_source_emits_initial_batch() {
        let registry = registry(StaticLoader("id,level\nT1,10\nT2,20\n"));
        let mut events = registry.subscribe();
        registry.add_source(polled_file("yard")).unwrap();
        registry.start();

        let event = events.recv().await.unwrap();
        match event {
            SourceEvent::Data {
                source_id,
                records,
                metadata,
            } => {
                assert_eq!(source_id, "yard");
                assert_eq!(records.len(), 2);
                assert_eq!(metadata.row_count, 2);
                assert_eq!(metadata.origin, "/virtual/yard.csv");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let status = registry.source_status("yard").unwrap();
        assert_eq!(status.last_record_count, 2);
        assert!(status.last_update.is_some());
        assert_eq!(registry.latest_records("yard").unwrap().len(), 2);

        registry.stop(Duration::from_secs(1)).await;
        assert!(!registry.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_failure_recorded_and_reported() {
        let registry = registry(StaticLoader("[{\"id\": }"));
        let mut events = registry.subscribe();
        let descriptor = SourceDescriptor::new("bad", SourceKind::File, "/virtual/bad.json")
            .with_polling(Duration::from_secs(1));
        registry.add_source(descriptor).unwrap();
        registry.start();

        match events.recv().await.unwrap() {
            SourceEvent::Error {
                source_id, category, ..
            } => {
                assert_eq!(source_id, "bad");
                assert_eq!(category, "parse");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let status = registry.source_status("bad").unwrap();
        assert_eq!(status.state, SourceLifecycle::Error);
        assert_eq!(status.error_count, 1);
        assert!(status.last_error_message.unwrap().contains("json"));
        registry.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_reported_after_threshold() {
        let registry = registry(FailingLoader(std::io::ErrorKind::TimedOut));
        let mut events = registry.subscribe();
        registry.add_source(polled_file("flaky")).unwrap();
        registry.start();

        // Ticks 1 and 2 stay silent; tick 3 reaches the threshold.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(registry.source_status("flaky").unwrap().error_count, 0);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, SourceEvent::Error { .. }));
        assert_eq!(registry.source_status("flaky").unwrap().error_count, 1);
        registry.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_source_does_not_block_others() {
        struct SplitLoader;

        #[async_trait]
        impl ContentLoader for SplitLoader {
            async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
                if path.to_string_lossy().contains("bad") {
                    Ok(b"<open>".to_vec())
                } else {
                    Ok(b"id,level\nA,1\n".to_vec())
                }
            }

            async fn fetch(&self, _url: &Url, _timeout: Duration) -> Result<Vec<u8>> {
                unreachable!()
            }
        }

        let registry = registry(SplitLoader);
        let mut events = registry.subscribe();
        registry
            .add_source(
                SourceDescriptor::new("bad", SourceKind::File, "/virtual/bad.xml")
                    .with_polling(Duration::from_secs(1)),
            )
            .unwrap();
        registry.add_source(polled_file("good")).unwrap();
        registry.start();

        let mut saw_data = false;
        let mut saw_error = false;
        for _ in 0..2 {
            match events.recv().await.unwrap() {
                SourceEvent::Data { source_id, .. } => {
                    assert_eq!(source_id, "good");
                    saw_data = true;
                }
                SourceEvent::Error { source_id, .. } => {
                    assert_eq!(source_id, "bad");
                    saw_error = true;
                }
            }
        }
        assert!(saw_data && saw_error);
        registry.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_source_stops_events() {
        let registry = registry(StaticLoader("id\nA\n"));
        let mut events = registry.subscribe();
        registry.add_source(polled_file("gone")).unwrap();
        registry.start();

        assert!(matches!(events.recv().await.unwrap(), SourceEvent::Data { .. }));
        assert!(registry.remove_source("gone"));
        assert!(!registry.remove_source("gone"));
        assert!(registry.source_status("gone").is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_while_running_starts_watching() {
        let registry = registry(StaticLoader("id\nA\n"));
        let mut events = registry.subscribe();
        registry.start();
        registry.add_source(polled_file("late")).unwrap();

        assert_eq!(events.recv().await.unwrap().source_id(), "late");
        registry.stop(Duration::from_secs(1)).await;
        assert_eq!(
            registry.source_status("late").unwrap().state,
            SourceLifecycle::Registered
        );
    }
}
