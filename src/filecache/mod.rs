//! Debounced cache over a directory of policy files
//!
//! The cache keeps the bytes of every file it has read, keyed by file name.
//! Filesystem notifications mark entries dirty (or evict them on removal) and
//! schedule the registered callbacks through a per-name [`Debouncer`], so an
//! editor save that produces several events results in one callback once the
//! directory has been quiet for [`DEBOUNCE_DELAY`].
//!
//! Callbacks receive only the file name and re-read through [`FileCache::get`]
//! when they run, so they always observe the content current at fire time.
//!
//! # Example
//!
//! ```rust,ignore
//! let cache = FileCache::new("./policies", "*.rego")?;
//! cache.add_callback(Arc::new(|name| println!("{name} changed")));
//! cache.watch()?;
//! let lookup = cache.get("request.rego")?;
//! ```

pub mod debounce;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
pub use debounce::Debouncer;

/// Quiet period before callbacks fire for a changed file
pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Reload hook invoked with a file name
pub type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Kind of change reported for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Created or written
    Write,
    /// Removed or renamed away
    Remove,
}

/// Result of [`FileCache::get`]
#[derive(Debug, Clone)]
pub struct Lookup {
    /// File content, `None` when the file does not exist
    pub data: Option<Arc<[u8]>>,
    /// Whether this call observed a change since the previous read
    pub changed: bool,
}

struct CachedFile {
    data: Arc<[u8]>,
    dirty: bool,
}

struct Inner {
    folder: PathBuf,
    pattern: glob::Pattern,
    files: Mutex<HashMap<String, CachedFile>>,
    callbacks: Arc<RwLock<Vec<Callback>>>,
    debouncer: Debouncer,
    watcher: Mutex<Option<RecommendedWatcher>>,
    events: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to a watched directory
#[derive(Clone)]
pub struct FileCache {
    inner: Arc<Inner>,
}

impl FileCache {
    /// Cache files in `folder` whose names match `pattern`
    pub fn new(folder: impl Into<PathBuf>, pattern: &str) -> Result<Self> {
        Self::with_debounce(folder, pattern, DEBOUNCE_DELAY)
    }

    /// Same as [`FileCache::new`] with a custom quiet period
    pub fn with_debounce(
        folder: impl Into<PathBuf>,
        pattern: &str,
        delay: Duration,
    ) -> Result<Self> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| Error::Config(format!("invalid file pattern {pattern:?}: {e}")))?;

        let callbacks: Arc<RwLock<Vec<Callback>>> = Arc::new(RwLock::new(Vec::new()));
        let registered = Arc::clone(&callbacks);
        let fire: debounce::FireFn = Arc::new(move |name: String| {
            let callbacks = registered.read().clone();
            for callback in callbacks {
                let name = name.clone();
                tokio::task::spawn_blocking(move || callback(&name));
            }
        });

        Ok(Self {
            inner: Arc::new(Inner {
                folder: folder.into(),
                pattern,
                files: Mutex::new(HashMap::new()),
                callbacks,
                debouncer: Debouncer::new(delay, fire),
                watcher: Mutex::new(None),
                events: Mutex::new(None),
            }),
        })
    }

    /// Directory being cached
    pub fn folder(&self) -> &Path {
        &self.inner.folder
    }

    /// Whether `name` is selected by the file pattern
    pub fn matches(&self, name: &str) -> bool {
        self.inner.pattern.matches(name)
    }

    /// Register a hook run after a file changes
    pub fn add_callback(&self, callback: Callback) {
        self.inner.callbacks.write().push(callback);
    }

    /// Return the content of `name`, reading it from disk if it is unknown
    /// or dirty
    ///
    /// A missing file is not an error: it yields `data: None` and drops any
    /// cached entry.
    pub fn get(&self, name: &str) -> Result<Lookup> {
        let mut files = self.inner.files.lock();

        if let Some(file) = files.get(name) {
            if !file.dirty {
                return Ok(Lookup {
                    data: Some(Arc::clone(&file.data)),
                    changed: false,
                });
            }
        }

        let path = self.inner.folder.join(name);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let data: Arc<[u8]> = bytes.into();
                files.insert(
                    name.to_string(),
                    CachedFile {
                        data: Arc::clone(&data),
                        dirty: false,
                    },
                );
                debug!(name = %name, size = data.len(), "file read");
                Ok(Lookup {
                    data: Some(data),
                    changed: true,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let removed = files.remove(name).is_some();
                Ok(Lookup {
                    data: None,
                    changed: removed,
                })
            }
            Err(source) => Err(Error::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Record a change to `name` and schedule the callbacks
    pub fn invalidate(&self, name: &str, change: Change) {
        let known = {
            let mut files = self.inner.files.lock();
            match change {
                Change::Remove => files.remove(name).is_some(),
                Change::Write => match files.get_mut(name) {
                    Some(file) => {
                        file.dirty = true;
                        true
                    }
                    None => false,
                },
            }
        };

        if !known && change == Change::Write {
            info!(name = %name, "new file detected");
            let cache = self.clone();
            let name = name.to_string();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = cache.get(&name) {
                    warn!(name = %name, error = %e, "failed to read new file");
                }
            });
        }

        debug!(name = %name, ?change, "file invalidated");
        self.inner.debouncer.schedule(name);
    }

    /// Follow live changes, then run the callbacks for every matching file
    ///
    /// The watcher is registered before the directory is scanned, so an edit
    /// made while the initial callbacks run is still picked up. The initial
    /// pass runs synchronously so that callers observe every existing file
    /// before this returns. Must be called from within a Tokio runtime.
    pub fn watch(&self) -> Result<()> {
        let folder = &self.inner.folder;
        let io_err = |source| Error::Io {
            path: folder.display().to_string(),
            source,
        };
        std::fs::metadata(folder).map_err(io_err)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| Error::Internal(format!("failed to create file watcher: {e}")))?;
        watcher
            .watch(folder, RecursiveMode::NonRecursive)
            .map_err(|e| {
                Error::Internal(format!("failed to watch {}: {e}", folder.display()))
            })?;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let cache = FileCache { inner };
                match res {
                    Ok(event) => cache.handle_event(&event),
                    Err(e) => warn!(error = %e, "file watcher error"),
                }
            }
            debug!("file watcher stopped");
        });

        *self.inner.watcher.lock() = Some(watcher);
        if let Some(old) = self.inner.events.lock().replace(task) {
            old.abort();
        }

        let names = self.scan()?;
        let callbacks = self.inner.callbacks.read().clone();
        for name in &names {
            for callback in &callbacks {
                callback(name);
            }
        }

        info!(folder = %folder.display(), files = names.len(), "watching policy directory");
        Ok(())
    }

    /// Sorted names of the matching regular files in the folder
    fn scan(&self) -> Result<Vec<String>> {
        let folder = &self.inner.folder;
        let io_err = |source| Error::Io {
            path: folder.display().to_string(),
            source,
        };

        let mut names = Vec::new();
        for entry in std::fs::read_dir(folder).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.matches(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Stop watching and drop pending callbacks
    pub fn close(&self) {
        self.inner.watcher.lock().take();
        if let Some(task) = self.inner.events.lock().take() {
            task.abort();
        }
        self.inner.debouncer.cancel_all();
    }

    fn handle_event(&self, event: &Event) {
        for path in &event.paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !self.matches(name) {
                continue;
            }
            if let Some(change) = classify(&event.kind, path) {
                self.invalidate(name, change);
            }
        }
    }
}

fn classify(kind: &EventKind, path: &Path) -> Option<Change> {
    match kind {
        EventKind::Create(_) => Some(Change::Write),
        EventKind::Remove(_) => Some(Change::Remove),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        // Renames report both ends under the same kind; the path that still
        // exists is the destination.
        EventKind::Modify(ModifyKind::Name(_)) => Some(if path.exists() {
            Change::Write
        } else {
            Change::Remove
        }),
        EventKind::Modify(_) => Some(Change::Write),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache_in(dir: &TempDir) -> FileCache {
        FileCache::new(dir.path(), "*.rego").unwrap()
    }

    fn write(dir: &TempDir, name: &str, content: &str) {
        std::fs::write(dir.path().join(name), content).unwrap();
    }

    #[tokio::test]
    async fn test_get_reads_once_until_invalidated() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.rego", "package a");
        let cache = cache_in(&dir);

        let first = cache.get("a.rego").unwrap();
        assert!(first.changed);
        assert_eq!(&*first.data.unwrap(), b"package a");

        let second = cache.get("a.rego").unwrap();
        assert!(!second.changed);

        write(&dir, "a.rego", "package b");
        // Not invalidated yet, so the cached bytes are still served
        assert_eq!(&*cache.get("a.rego").unwrap().data.unwrap(), b"package a");

        cache.invalidate("a.rego", Change::Write);
        let third = cache.get("a.rego").unwrap();
        assert!(third.changed);
        assert_eq!(&*third.data.unwrap(), b"package b");

        assert!(!cache.get("a.rego").unwrap().changed);
        cache.close();
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);

        let lookup = cache.get("absent.rego").unwrap();
        assert!(lookup.data.is_none());
        assert!(!lookup.changed);
    }

    #[tokio::test]
    async fn test_remove_evicts_immediately() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.rego", "package a");
        let cache = cache_in(&dir);
        cache.get("a.rego").unwrap();

        std::fs::remove_file(dir.path().join("a.rego")).unwrap();
        cache.invalidate("a.rego", Change::Remove);

        let lookup = cache.get("a.rego").unwrap();
        assert!(lookup.data.is_none());
        cache.close();
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("dir.rego")).unwrap();
        let cache = cache_in(&dir);

        assert!(matches!(cache.get("dir.rego"), Err(Error::Io { .. })));
    }

    #[test]
    fn test_invalid_pattern() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            FileCache::new(dir.path(), "[*.rego"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_scans_matching_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "b.rego", "package b");
        write(&dir, "a.rego", "package a");
        write(&dir, "notes.txt", "ignored");
        std::fs::create_dir(dir.path().join("nested.rego")).unwrap();

        let cache = cache_in(&dir);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cache.add_callback(Arc::new(move |name: &str| sink.lock().push(name.to_string())));

        cache.watch().unwrap();
        assert_eq!(*seen.lock(), vec!["a.rego".to_string(), "b.rego".to_string()]);
        cache.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_edit_during_initial_scan_is_observed() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.rego", "package a");
        let cache = FileCache::with_debounce(dir.path(), "*.rego", Duration::from_millis(50))
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let path = dir.path().join("a.rego");
        let first = std::sync::atomic::AtomicBool::new(true);
        cache.add_callback(Arc::new(move |name: &str| {
            // Edit the file from inside the initial pass
            if first.swap(false, std::sync::atomic::Ordering::SeqCst) {
                std::fs::write(&path, "package edited").unwrap();
            }
            let _ = tx.send(name.to_string());
        }));

        cache.watch().unwrap();
        assert_eq!(rx.recv().await.unwrap(), "a.rego");

        let reload = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await;
        assert_eq!(reload.unwrap().unwrap(), "a.rego");
        assert_eq!(&*cache.get("a.rego").unwrap().data.unwrap(), b"package edited");
        cache.close();
    }

    #[tokio::test]
    async fn test_watch_missing_folder_fails() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path().join("missing"), "*.rego").unwrap();
        assert!(matches!(cache.watch(), Err(Error::Io { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_writes_fires_one_callback() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.rego", "package a");
        let cache = cache_in(&dir);
        cache.get("a.rego").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        cache.add_callback(Arc::new(move |name: &str| {
            let _ = tx.send(name.to_string());
        }));

        for _ in 0..3 {
            cache.invalidate("a.rego", Change::Write);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(DEBOUNCE_DELAY).await;

        assert_eq!(rx.recv().await.unwrap(), "a.rego");
        let again = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(again.is_err());
    }

    #[test]
    fn test_classify_events() {
        use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

        let dir = TempDir::new().unwrap();
        let present = dir.path().join("a.rego");
        std::fs::write(&present, "package a").unwrap();
        let gone = dir.path().join("b.rego");

        assert_eq!(
            classify(&EventKind::Create(CreateKind::File), &present),
            Some(Change::Write)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content)), &present),
            Some(Change::Write)
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File), &gone),
            Some(Change::Remove)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From)), &gone),
            Some(Change::Remove)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::To)), &present),
            Some(Change::Write)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)), &present),
            None
        );
    }
}
