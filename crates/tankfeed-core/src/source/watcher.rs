//! Per-source watcher tasks.
//!
//! One task runs per watched source. It performs an ingestion cycle when it
//! starts and then whenever the source changes, until its cancellation token
//! fires. Change events that arrive during a cycle are coalesced into a
//! single follow-up cycle.

use super::event::{truncate_origin, BatchMetadata, SourceEvent};
use super::registry::{RegistryShared, SourceLifecycle};
use super::remote::validate_destination;
use super::{ContentLoader, SourceDescriptor, SourceKind};
use crate::config::RegistryConfig;
use crate::pipeline::{self, ProcessedBatch};
use crate::{Error, Result};
use chrono::Utc;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a watcher task needs. Holds only a weak reference to the
/// registry so an abandoned registry shuts its tasks down.
pub(crate) struct WatchContext {
    pub shared: Weak<RegistryShared>,
    pub descriptor: Arc<SourceDescriptor>,
    pub generation: u64,
    pub cancel: CancellationToken,
    pub config: RegistryConfig,
    pub loader: Arc<dyn ContentLoader>,
}

/// How one ingestion cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Transient,
    Failed,
    Cancelled,
}

type Fingerprint = Option<(u64, Option<SystemTime>)>;

/// Entry point of a watcher task.
pub(crate) async fn run(ctx: WatchContext) {
    let id = ctx.descriptor.id.clone();
    info!(
        source_id = %id,
        kind = %ctx.descriptor.kind,
        polling = ctx.descriptor.polling,
        "Watcher started"
    );

    ctx.update(|rt| rt.state = SourceLifecycle::Watching);

    match ctx.descriptor.kind {
        SourceKind::File => watch_file(&ctx).await,
        SourceKind::Directory => watch_directory(&ctx).await,
        SourceKind::Remote => poll_remote(&ctx).await,
    }

    debug!(source_id = %id, "Watcher stopped");
}

impl WatchContext {
    fn poll_period(&self) -> Duration {
        self.descriptor
            .poll_period(self.config.default_poll_interval_ms)
    }

    /// Apply a runtime update if this watcher is still the live one.
    fn update(&self, f: impl FnOnce(&mut super::registry::SourceRuntime)) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.emit(&self.descriptor.id, self.generation, |rt| {
                f(rt);
                None
            }),
            None => false,
        }
    }

    /// Read, process and publish one file.
    async fn ingest_path(&self, path: &Path) -> Outcome {
        self.update(|rt| rt.state = SourceLifecycle::Ingesting);
        let started = Instant::now();

        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            read = self.loader.read_file(path) => read,
        };

        let result = read.and_then(|bytes| pipeline::process(&self.descriptor, Some(path), &bytes));
        self.finish(result, &path.display().to_string(), started)
    }

    /// Fetch, process and publish the remote document.
    async fn ingest_remote(&self) -> Outcome {
        self.update(|rt| rt.state = SourceLifecycle::Ingesting);
        let started = Instant::now();

        let url = match validate_destination(&self.descriptor.location) {
            Ok(url) => url,
            Err(e) => return self.finish(Err(e), &self.descriptor.location, started),
        };

        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            read = self.loader.fetch(&url, self.config.fetch_timeout()) => read,
        };

        let path = PathBuf::from(url.path());
        let result = read.and_then(|bytes| pipeline::process(&self.descriptor, Some(&path), &bytes));
        self.finish(result, url.as_str(), started)
    }

    fn finish(&self, result: Result<ProcessedBatch>, origin: &str, started: Instant) -> Outcome {
        if self.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        let Some(shared) = self.shared.upgrade() else {
            return Outcome::Cancelled;
        };
        let id = &self.descriptor.id;

        match result {
            Ok(batch) => {
                let metadata = BatchMetadata {
                    format: batch.format,
                    row_count: batch.records.len(),
                    columns: batch.columns,
                    origin: truncate_origin(origin),
                    duration_ms: started.elapsed().as_millis() as u64,
                    ingested_at: Utc::now(),
                };
                let records = Arc::new(batch.records);
                let count = records.len();

                let live = shared.emit(id, self.generation, |rt| {
                    rt.state = SourceLifecycle::Watching;
                    rt.last_update = Some(metadata.ingested_at);
                    rt.last_record_count = count;
                    rt.latest = Some(Arc::clone(&records));
                    rt.consecutive_transient = 0;
                    Some(SourceEvent::Data {
                        source_id: id.clone(),
                        records: Arc::clone(&records),
                        metadata: metadata.clone(),
                    })
                });

                if !live {
                    return Outcome::Cancelled;
                }
                debug!(source_id = %id, records = count, origin = %origin, "Ingestion cycle complete");
                Outcome::Success
            }
            Err(error) => self.record_failure(&shared, error, origin),
        }
    }

    fn record_failure(&self, shared: &RegistryShared, error: Error, origin: &str) -> Outcome {
        let id = &self.descriptor.id;
        let threshold = self.config.error_report_threshold.max(1);
        let transient = error.is_transient();
        let message = error.to_string();
        let mut outcome = if transient { Outcome::Transient } else { Outcome::Failed };

        let live = shared.emit(id, self.generation, |rt| {
            if transient {
                rt.consecutive_transient += 1;
                if rt.consecutive_transient < threshold {
                    rt.state = SourceLifecycle::Watching;
                    return None;
                }
            }
            rt.state = SourceLifecycle::Error;
            rt.errors.push(message.clone());
            Some(SourceEvent::Error {
                source_id: id.clone(),
                category: error.category().to_string(),
                error: message.clone(),
            })
        });

        if !live {
            outcome = Outcome::Cancelled;
        } else if transient {
            debug!(source_id = %id, origin = %origin, error = %message, "Transient ingestion failure");
        } else {
            warn!(source_id = %id, origin = %origin, error = %message, "Ingestion cycle failed");
        }
        outcome
    }
}

async fn watch_file(ctx: &WatchContext) {
    let path = PathBuf::from(&ctx.descriptor.location);

    if ctx.descriptor.polling {
        return poll_file(ctx, &path).await;
    }

    let Some(parent) = path.parent().map(Path::to_path_buf) else {
        return poll_file(ctx, &path).await;
    };
    let parent = if parent.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        parent
    };

    let file_name = path.file_name().map(|n| n.to_os_string());
    let filter = move |p: &Path| p.file_name().map(|n| n.to_os_string()) == file_name;

    // Subscribe before the initial read so no change slips in between.
    let events = fs_events(&parent);
    if ctx.ingest_path(&path).await == Outcome::Cancelled {
        return;
    }

    match events {
        Ok((watcher, rx)) => event_loop(ctx, watcher, rx, filter).await,
        Err(e) => {
            warn!(
                source_id = %ctx.descriptor.id,
                error = %e,
                "Cannot watch for changes, falling back to polling"
            );
            poll_file(ctx, &path).await;
        }
    }
}

async fn poll_file(ctx: &WatchContext, path: &Path) {
    let mut ticker = tokio::time::interval(ctx.poll_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut marker: Option<SystemTime> = None;

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let modified = modified_time(path).await;
        if modified.is_some() && modified == marker {
            continue;
        }

        match ctx.ingest_path(path).await {
            Outcome::Cancelled => return,
            Outcome::Transient => {}
            Outcome::Success | Outcome::Failed => marker = modified,
        }
    }
}

async fn watch_directory(ctx: &WatchContext) {
    let dir = PathBuf::from(&ctx.descriptor.location);
    let extensions: Vec<String> = ctx
        .descriptor
        .options
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();
    let filter = move |p: &Path| has_allowed_extension(p, &extensions);

    if ctx.descriptor.polling {
        return poll_directory(ctx, &dir, &filter).await;
    }

    let events = fs_events(&dir);
    match list_files(&dir, &filter).await {
        Ok(files) => {
            for file in files {
                if ctx.ingest_path(&file).await == Outcome::Cancelled {
                    return;
                }
            }
        }
        Err(e) => {
            let outcome = ctx.finish(Err(e), &dir.display().to_string(), Instant::now());
            if outcome == Outcome::Cancelled {
                return;
            }
        }
    }

    match events {
        Ok((watcher, rx)) => event_loop(ctx, watcher, rx, filter).await,
        Err(e) => {
            warn!(
                source_id = %ctx.descriptor.id,
                error = %e,
                "Cannot watch directory, falling back to polling"
            );
            poll_directory(ctx, &dir, &filter).await;
        }
    }
}

async fn poll_directory(ctx: &WatchContext, dir: &Path, filter: &(dyn Fn(&Path) -> bool + Send + Sync)) {
    let mut ticker = tokio::time::interval(ctx.poll_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut markers: HashMap<PathBuf, SystemTime> = HashMap::new();

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let files = match list_files(dir, filter).await {
            Ok(files) => files,
            Err(e) => {
                if ctx.finish(Err(e), &dir.display().to_string(), Instant::now()) == Outcome::Cancelled {
                    return;
                }
                continue;
            }
        };

        markers.retain(|path, _| files.contains(path));
        for file in files {
            let modified = modified_time(&file).await;
            if modified.is_some() && markers.get(&file).copied() == modified {
                continue;
            }
            match ctx.ingest_path(&file).await {
                Outcome::Cancelled => return,
                Outcome::Transient => {}
                Outcome::Success | Outcome::Failed => {
                    if let Some(m) = modified {
                        markers.insert(file, m);
                    }
                }
            }
        }
    }
}

async fn poll_remote(ctx: &WatchContext) {
    let mut ticker = tokio::time::interval(ctx.poll_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if ctx.ingest_remote().await == Outcome::Cancelled {
            return;
        }
    }
}

/// Wait for change events and ingest each changed path once it is stable.
/// The watcher must stay alive for as long as events are wanted.
async fn event_loop(
    ctx: &WatchContext,
    _watcher: RecommendedWatcher,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    filter: impl Fn(&Path) -> bool,
) {
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();

    loop {
        let first = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            next = rx.recv() => next,
        };
        let Some(first) = first else {
            warn!(source_id = %ctx.descriptor.id, "Change notifications stopped");
            return;
        };
        if filter(&first) {
            pending.insert(first);
        }
        if pending.is_empty() {
            continue;
        }

        if !settle(ctx, &mut rx, &mut pending, &filter).await {
            return;
        }

        for path in std::mem::take(&mut pending) {
            if ctx.ingest_path(&path).await == Outcome::Cancelled {
                return;
            }
        }
    }
}

/// Sample size and mtime of every pending path until none has changed for
/// the stability threshold. Events arriving meanwhile join the pending set.
/// Returns false when cancelled.
async fn settle(
    ctx: &WatchContext,
    rx: &mut mpsc::UnboundedReceiver<PathBuf>,
    pending: &mut BTreeSet<PathBuf>,
    filter: &impl Fn(&Path) -> bool,
) -> bool {
    let threshold = ctx.config.stability_threshold();
    let poll = ctx.config.stability_poll();

    let mut last = fingerprints(pending).await;
    let mut stable_since = Instant::now();

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return false,
            _ = tokio::time::sleep(poll) => {}
        }

        while let Ok(path) = rx.try_recv() {
            if filter(&path) {
                pending.insert(path);
            }
        }

        let current = fingerprints(pending).await;
        if current != last {
            last = current;
            stable_since = Instant::now();
        } else if stable_since.elapsed() >= threshold {
            return true;
        }
    }
}

async fn fingerprints(paths: &BTreeSet<PathBuf>) -> Vec<Fingerprint> {
    let mut prints = Vec::with_capacity(paths.len());
    for path in paths {
        let print = tokio::fs::metadata(path)
            .await
            .ok()
            .map(|m| (m.len(), m.modified().ok()));
        prints.push(print);
    }
    prints
}

async fn modified_time(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Start a non-recursive filesystem watcher on `dir` that forwards the paths
/// of created and modified entries.
fn fs_events(dir: &Path) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<PathBuf>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        }
    })
    .map_err(notify_error)?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(notify_error)?;
    Ok((watcher, rx))
}

fn notify_error(err: notify::Error) -> Error {
    match err.kind {
        notify::ErrorKind::Io(io) => Error::Io(io),
        notify::ErrorKind::PathNotFound => {
            Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "watch path not found"))
        }
        _ => Error::Io(std::io::Error::other(err.to_string())),
    }
}

/// Regular files in `dir` accepted by `filter`, sorted by path.
async fn list_files(dir: &Path, filter: &(dyn Fn(&Path) -> bool + Send + Sync)) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && filter(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| extensions.iter().any(|allowed| *allowed == e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_allowlist() {
        let allowed = vec!["csv".to_string(), "json".to_string()];
        assert!(has_allowed_extension(Path::new("/d/a.CSV"), &allowed));
        assert!(has_allowed_extension(Path::new("/d/b.json"), &allowed));
        assert!(!has_allowed_extension(Path::new("/d/c.xlsx"), &allowed));
        assert!(!has_allowed_extension(Path::new("/d/noext"), &allowed));
    }

    #[tokio::test]
    async fn test_list_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.csv", "a.json", "skip.bin"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.csv")).unwrap();

        let allowed = vec!["csv".to_string(), "json".to_string()];
        let filter = move |p: &Path| has_allowed_extension(p, &allowed);
        let files = list_files(dir.path(), &filter).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json", "b.csv"]);
    }

    #[tokio::test]
    async fn test_fingerprint_missing_file() {
        let mut set = BTreeSet::new();
        set.insert(PathBuf::from("/no/such/file.csv"));
        assert_eq!(fingerprints(&set).await, vec![None]);
    }
}
