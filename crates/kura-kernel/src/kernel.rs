//! The engine: namespace, block store, observer bus and replication wired
//! together behind one cheaply clonable handle.
//!
//! Namespace operations are synchronous and take effect immediately; their
//! events are then published in mutation order, even when observers mutate
//! the engine themselves. Persistence is one of those observers: it queues
//! inode writes for a background task, so the backend lags the in-memory state
//! until [`Kura::flush`] returns.
//!
//! Moving a directory updates memory atomically but reaches the backend as a
//! sequence of inode writes and deletes; a crash part way through can leave
//! both copies, never neither.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use kura_cas::{
    Backend, Blake3Hasher, BlockStore, ContentHasher, Digest, KvStore, MemoryBackend,
    SweepReport,
};

use crate::clock::Clock;
use crate::config::KuraConfig;
use crate::constants::{BLOCKS_STORE, INODES_STORE, TOMBSTONES_STORE};
use crate::flows::{FsBus, FsEvent, ObserverHandle, OpSource, Subscription, resolve_pattern};
use crate::path::{self, ROOT};
use crate::quota::QuotaReport;
use crate::sync::{MergeReport, Record, TxQueue, split_frame};
use crate::vfs::{
    FileContent, FileHandle, FsError, FsResult, Inode, Metainfo, Namespace, Tombstone,
};

/// Queued change for the persistence writer.
enum PersistOp {
    Put { path: String, inode: Inode },
    Delete { path: String, tombstone: Tombstone },
    Forget { path: String },
    Flush(oneshot::Sender<()>),
}

/// Events waiting to be published, in mutation order.
#[derive(Default)]
struct Outbox {
    queue: Mutex<VecDeque<FsEvent>>,
    draining: AtomicBool,
}

impl Outbox {
    fn push(&self, event: FsEvent) {
        self.queue.lock().push_back(event);
    }

    fn extend(&self, events: Vec<FsEvent>) {
        if !events.is_empty() {
            self.queue.lock().extend(events);
        }
    }

    /// Publish queued events until the queue is empty.
    ///
    /// One caller drains at a time; anyone arriving meanwhile (including an
    /// observer mutating from inside `publish`) leaves its events for the
    /// active drainer.
    fn pump(&self, bus: &FsBus) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let next = self.queue.lock().pop_front();
                match next {
                    Some(event) => {
                        bus.publish(event);
                    }
                    None => break,
                }
            }
            self.draining.store(false, Ordering::Release);
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }
}

#[derive(Default)]
struct Tasks {
    gc: Option<JoinHandle<()>>,
    tx: Option<JoinHandle<()>>,
}

struct Inner {
    config: KuraConfig,
    ns: RwLock<Namespace>,
    cwd: RwLock<String>,
    blocks: BlockStore,
    bus: FsBus,
    outbox: Outbox,
    clock: Clock,
    tx_queue: Arc<TxQueue>,
    /// Blocks merged from peers that get one collection pass of grace
    rx_grace: Mutex<HashSet<Digest>>,
    persist: mpsc::UnboundedSender<PersistOp>,
    ready: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for handle in [tasks.gc.take(), tasks.tx.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// A content-addressed virtual file system.
#[derive(Clone)]
pub struct Kura {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Kura {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kura")
            .field("inodes", &self.inner.ns.read().len())
            .field("blocks", &self.inner.blocks)
            .field("cwd", &*self.inner.cwd.read())
            .field("ready", &self.is_ready())
            .finish()
    }
}

async fn load_json<T: serde::de::DeserializeOwned>(
    store: &dyn KvStore,
    what: &str,
) -> FsResult<Vec<(String, T)>> {
    let mut out = Vec::new();
    for (key, value) in store.entries().await? {
        match serde_json::from_slice::<T>(&value) {
            Ok(parsed) => out.push((key, parsed)),
            Err(e) => warn!(key = %key, error = %e, "skipping malformed {what}"),
        }
    }
    Ok(out)
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
    inodes: Arc<dyn KvStore>,
    tombstones: Arc<dyn KvStore>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::Put { path, inode } => {
                let result = match serde_json::to_vec(&inode) {
                    Ok(json) => inodes.put(&path, json).await,
                    Err(e) => Err(kura_cas::CasError::codec(e.to_string())),
                };
                let cleared = tombstones.delete(&path).await;
                if let Err(e) = result.and(cleared) {
                    error!(path = %path, error = %e, "failed to persist inode");
                }
            }
            PersistOp::Delete { path, tombstone } => {
                let removed = inodes.delete(&path).await;
                let result = match serde_json::to_vec(&tombstone) {
                    Ok(json) => tombstones.put(&path, json).await,
                    Err(e) => Err(kura_cas::CasError::codec(e.to_string())),
                };
                if let Err(e) = removed.and(result) {
                    error!(path = %path, error = %e, "failed to persist deletion");
                }
            }
            PersistOp::Forget { path } => {
                if let Err(e) = tombstones.delete(&path).await {
                    error!(path = %path, error = %e, "failed to forget tombstone");
                }
            }
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("persistence writer stopped");
}

impl Kura {
    /// Engine over a fresh in-memory backend with default configuration.
    pub async fn in_memory() -> FsResult<Self> {
        Self::open(Arc::new(MemoryBackend::new()), KuraConfig::default()).await
    }

    /// Open an engine over `backend`, loading whatever it already holds.
    ///
    /// Must be called inside a Tokio runtime. Operations are available as
    /// soon as this returns; the initial garbage collection pass runs in the
    /// background and [`Kura::ready`] resolves once it is done.
    pub async fn open(backend: Arc<dyn Backend>, config: KuraConfig) -> FsResult<Self> {
        Self::open_with_hasher(backend, config, Arc::new(Blake3Hasher)).await
    }

    /// [`Kura::open`] with a custom content hasher.
    pub async fn open_with_hasher(
        backend: Arc<dyn Backend>,
        config: KuraConfig,
        hasher: Arc<dyn ContentHasher>,
    ) -> FsResult<Self> {
        config
            .validate()
            .map_err(|e| FsError::invalid_argument(e.to_string()))?;

        let inode_store = backend.open_store(INODES_STORE).await?;
        let tombstone_store = backend.open_store(TOMBSTONES_STORE).await?;
        let block_store = backend.open_store(BLOCKS_STORE).await?;

        let inodes = load_json::<Inode>(inode_store.as_ref(), "inode").await?;
        let tombstones = load_json::<Tombstone>(tombstone_store.as_ref(), "tombstone").await?;
        let ns = Namespace::from_parts(inodes, tombstones);
        let blocks = BlockStore::open(block_store, hasher).await?;

        let clock = Clock::new();
        clock.observe(ns.max_timestamp());
        info!(inodes = ns.len(), blocks = blocks.len(), "kura opened");

        let (persist, persist_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(persist_rx, inode_store, tombstone_store));

        let (ready, _) = watch::channel(false);
        let kura = Self {
            inner: Arc::new(Inner {
                bus: FsBus::new(config.bus_capacity),
                config,
                ns: RwLock::new(ns),
                cwd: RwLock::new(ROOT.to_string()),
                blocks,
                outbox: Outbox::default(),
                clock,
                tx_queue: Arc::new(TxQueue::new()),
                rx_grace: Mutex::new(HashSet::new()),
                persist,
                ready,
                tasks: Mutex::new(Tasks::default()),
            }),
        };
        kura.install_observers();
        kura.start();
        Ok(kura)
    }

    fn install_observers(&self) {
        let persist = self.inner.persist.clone();
        self.inner.bus.on("inode.*", move |msg| {
            let op = match &msg.payload {
                FsEvent::WriteInode { path, inode, .. } => PersistOp::Put {
                    path: path.clone(),
                    inode: inode.clone(),
                },
                FsEvent::DeleteInode {
                    path, tombstone, ..
                } => PersistOp::Delete {
                    path: path.clone(),
                    tombstone: *tombstone,
                },
                _ => return Ok(()),
            };
            persist
                .send(op)
                .map_err(|_| anyhow::anyhow!("persistence writer is gone"))
        });

        if self.inner.config.sync {
            let queue = self.inner.tx_queue.clone();
            self.inner.bus.on(">", move |msg| {
                queue.offer(&msg.payload);
                Ok(())
            });
        }
    }

    fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let kura = Kura { inner };
            if let Err(e) = kura.deduplicate().await {
                warn!(error = %e, "initial garbage collection failed");
            }
            kura.schedule_gc(kura.inner.config.gc_interval());
            kura.inner.ready.send_replace(true);
            debug!("kura ready");
        });
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Kura> {
        weak.upgrade().map(|inner| Kura { inner })
    }

    /// Engine configuration.
    pub fn config(&self) -> &KuraConfig {
        &self.inner.config
    }

    /// The underlying block store.
    pub fn blocks(&self) -> &BlockStore {
        &self.inner.blocks
    }

    // ========================================================================
    // Event plumbing
    // ========================================================================

    fn publish_pending(&self) {
        self.inner.outbox.pump(&self.inner.bus);
    }

    /// Run `op` against the namespace under the write lock, then publish the
    /// events it recorded.
    fn mutate<R>(&self, op: impl FnOnce(&mut Namespace, i64) -> R) -> R {
        let now = self.inner.clock.now();
        let result = {
            let mut ns = self.inner.ns.write();
            let result = op(&mut ns, now);
            self.inner.outbox.extend(ns.drain_events());
            result
        };
        self.publish_pending();
        result
    }

    /// Register a synchronous observer.
    ///
    /// `event` is an event name (`write-inode`) or a subject pattern
    /// (`inode.*`, `>`). Handler errors and panics are logged and swallowed.
    pub fn on<F>(&self, event: &str, handler: F) -> ObserverHandle<FsEvent>
    where
        F: Fn(&FsEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .bus
            .on(&resolve_pattern(event), move |msg| handler(&msg.payload))
    }

    /// Remove an observer by id.
    pub fn off(&self, id: u64) -> bool {
        self.inner.bus.off(id)
    }

    /// Publish an event to every matching observer and subscriber.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for storage events (`write-block`, `write-inode`,
    /// `delete-inode`): those only come from the engine's own mutations,
    /// since persistence and replication act on them.
    pub fn emit(&self, event: FsEvent) -> FsResult<()> {
        if event.is_storage() {
            return Err(FsError::invalid_argument(format!(
                "{} events cannot be emitted directly",
                event.kind()
            )));
        }
        self.publish(event);
        Ok(())
    }

    fn publish(&self, event: FsEvent) {
        self.inner.outbox.push(event);
        self.publish_pending();
    }

    /// Async subscription to events matching `event` (name or pattern).
    pub fn subscribe(&self, event: &str) -> Subscription<FsEvent> {
        self.inner.bus.subscribe(&resolve_pattern(event))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Returns true once startup has finished.
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until startup has finished.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Run `f` once startup has finished (immediately if it already has).
    pub fn onready<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_ready() {
            f();
            return;
        }
        let mut rx = self.inner.ready.subscribe();
        tokio::spawn(async move {
            if rx.wait_for(|ready| *ready).await.is_ok() {
                f();
            }
        });
    }

    /// Wait until every change so far has reached the backend.
    pub async fn flush(&self) -> FsResult<()> {
        let (done, wait) = oneshot::channel();
        self.inner
            .persist
            .send(PersistOp::Flush(done))
            .map_err(|_| FsError::Backend("persistence writer is gone".into()))?;
        wait.await
            .map_err(|_| FsError::Backend("persistence writer is gone".into()))
    }

    /// Stop background timers and flush pending writes.
    pub async fn close(&self) -> FsResult<()> {
        {
            let mut tasks = self.inner.tasks.lock();
            for handle in [tasks.gc.take(), tasks.tx.take()].into_iter().flatten() {
                handle.abort();
            }
        }
        self.flush().await?;
        info!("kura closed");
        Ok(())
    }

    // ========================================================================
    // Paths
    // ========================================================================

    /// Resolve `path` against the working directory.
    pub fn abspath(&self, path: &str) -> String {
        path::abspath(path, &self.inner.cwd.read())
    }

    /// Relative path from `target` (default: working directory) to `path`.
    pub fn relpath(&self, path: &str, target: Option<&str>) -> String {
        let target = match target {
            Some(t) => self.abspath(t),
            None => self.getcwd(),
        };
        path::relpath(&self.abspath(path), &target)
    }

    /// Current working directory.
    pub fn getcwd(&self) -> String {
        self.inner.cwd.read().clone()
    }

    /// Change the working directory.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `NotADirectory` for files.
    pub fn chdir(&self, path: &str) -> FsResult<()> {
        let path = self.abspath(path);
        match self.inner.ns.read().get(&path) {
            None => return Err(FsError::not_found(path)),
            Some(Inode::File { .. }) => return Err(FsError::not_a_directory(path)),
            Some(Inode::Dir { .. }) => {}
        }
        *self.inner.cwd.write() = path.clone();
        self.publish(FsEvent::ChangePath { path });
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns true if `path` is a regular file.
    pub fn is_file(&self, path: &str) -> bool {
        self.inner.ns.read().is_file(&self.abspath(path))
    }

    /// Returns true if `path` is a directory.
    pub fn is_dir(&self, path: &str) -> bool {
        self.inner.ns.read().is_dir(&self.abspath(path))
    }

    /// Copy of the inode at `path`.
    pub fn inode(&self, path: &str) -> Option<Inode> {
        self.inner.ns.read().get(&self.abspath(path)).cloned()
    }

    /// Sorted names in a directory (default: working directory).
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `NotADirectory` for files.
    pub fn listdir(&self, path: Option<&str>) -> FsResult<Vec<String>> {
        let path = match path {
            Some(p) => self.abspath(p),
            None => self.getcwd(),
        };
        let ns = self.inner.ns.read();
        match ns.get(&path) {
            None => Err(FsError::not_found(path)),
            Some(Inode::File { .. }) => Err(FsError::not_a_directory(path)),
            Some(Inode::Dir { .. }) => Ok(ns.children(&path)),
        }
    }

    /// Metadata of the inode at `path`, without its block list.
    pub fn metainfo(&self, path: &str) -> FsResult<Metainfo> {
        let path = self.abspath(path);
        let ns = self.inner.ns.read();
        let inode = ns.get(&path).ok_or_else(|| FsError::not_found(&path))?;
        Ok(Metainfo::new(path.clone(), inode))
    }

    /// Storage usage under `path`, or of every universe when `None`.
    pub fn quota(&self, path: Option<&str>) -> QuotaReport {
        let root = path.map(|p| self.abspath(p));
        self.inner.ns.read().quota(root.as_deref())
    }

    // ========================================================================
    // Tree operations
    // ========================================================================

    /// Create a directory, or refresh an existing one.
    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        let path = self.abspath(path);
        self.mutate(|ns, now| ns.mkdir(&path, now))
    }

    /// Remove a directory tree.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let path = self.abspath(path);
        self.mutate(|ns, now| ns.rmdir(&path, now))
    }

    /// Remove a file.
    pub fn rm(&self, path: &str) -> FsResult<()> {
        let path = self.abspath(path);
        self.mutate(|ns, now| ns.rm(&path, now))
    }

    /// Move a file or directory tree.
    pub fn move_path(&self, src: &str, dest: &str) -> FsResult<()> {
        let (src, dest) = (self.abspath(src), self.abspath(dest));
        self.mutate(|ns, now| ns.move_path(&src, &dest, now))
    }

    /// Copy a file or directory tree.
    pub fn copy_path(&self, src: &str, dest: &str) -> FsResult<()> {
        let (src, dest) = (self.abspath(src), self.abspath(dest));
        self.mutate(|ns, now| ns.copy(&src, &dest, now))
    }

    /// Make `dest` an exact copy of `src`.
    pub fn transfer(&self, src: &str, dest: &str) -> FsResult<()> {
        let (src, dest) = (self.abspath(src), self.abspath(dest));
        self.mutate(|ns, now| ns.transfer(&src, &dest, now))
    }

    /// Remove `path` and its descendants. Returns true if anything existed.
    pub fn delete_tree(&self, path: &str) -> bool {
        let path = self.abspath(path);
        self.mutate(|ns, now| ns.delete_tree(&path, now))
    }

    // ========================================================================
    // Universes
    // ========================================================================

    /// Root paths of every universe.
    pub fn list_universes(&self) -> Vec<String> {
        self.inner.ns.read().list_universes()
    }

    /// Replace universe `dest` with a copy of `src`.
    pub fn clone_universe(&self, src: &str, dest: &str) -> FsResult<()> {
        self.mutate(|ns, now| ns.clone_universe(src, dest, now))
    }

    /// Delete a universe. Returns true if anything existed.
    pub fn delete_universe(&self, name: &str) -> FsResult<bool> {
        self.mutate(|ns, now| ns.delete_universe(name, now))
    }

    // ========================================================================
    // Content
    // ========================================================================

    fn check_writable(ns: &Namespace, path: &str) -> FsResult<()> {
        if path::is_root(path) || ns.is_dir(path) {
            return Err(FsError::is_a_directory(path));
        }
        let parent = path::parent(path);
        if !ns.is_dir(&parent) {
            return Err(FsError::not_found(format!("parent directory not found: {parent}")));
        }
        Ok(())
    }

    /// Write a file, creating or replacing it.
    ///
    /// Content is split into `chunk_size` chunks (default: the configured
    /// block size); only chunks not already stored are written.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero chunk size, `IsADirectory` if a directory
    /// occupies `path`, `NotFound` if the parent is not a directory.
    #[tracing::instrument(name = "fs.write_file", skip(self, content))]
    pub async fn write_file(
        &self,
        path: &str,
        content: impl Into<FileContent>,
        chunk_size: Option<usize>,
    ) -> FsResult<()> {
        let path = self.abspath(path);
        let chunk_size = chunk_size.unwrap_or(self.inner.config.block_size);
        if chunk_size == 0 {
            return Err(FsError::invalid_argument("chunk size must be positive"));
        }
        Self::check_writable(&self.inner.ns.read(), &path)?;

        let (data, mime) = content.into().into_parts();
        let blocks = &self.inner.blocks;
        let _gate = blocks.write_gate().await;

        let mut digests = Vec::with_capacity(data.len().div_ceil(chunk_size));
        for piece in data.chunks(chunk_size) {
            let (digest, novel) = blocks.insert(piece).await?;
            if novel {
                self.inner.outbox.push(FsEvent::WriteBlock {
                    digest: digest.clone(),
                    chunk: Arc::from(piece),
                    source: OpSource::Local,
                });
            }
            digests.push(digest);
        }
        self.publish_pending();

        let size = data.len() as u64;
        debug!(path = %path, size, blocks = digests.len(), "write file");
        self.mutate(|ns, now| {
            // The namespace may have changed while blocks were stored
            Self::check_writable(ns, &path)?;
            let existing = ns.get(&path).map(Inode::cdate);
            let inode = Inode::file(
                existing.unwrap_or(now),
                now,
                size,
                digests,
                mime,
                Some(chunk_size as u64),
            );
            ns.set(&path, inode);
            let source = ns.source();
            ns.record(match existing {
                Some(_) => FsEvent::ChangeFile { path: path.clone(), source },
                None => FsEvent::CreateFile { path: path.clone(), source },
            });
            Ok(())
        })
    }

    /// Read a whole file.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `IsADirectory` for directories, `Io` if any
    /// referenced block is missing.
    pub async fn read_file(&self, path: &str) -> FsResult<FileHandle> {
        let path = self.abspath(path);
        let inode = self.inner.ns.read().get(&path).cloned();
        let (blocks, mime, mdate) = match inode {
            None => return Err(FsError::not_found(path)),
            Some(Inode::Dir { .. }) => return Err(FsError::is_a_directory(path)),
            Some(Inode::File {
                blocks, mime, mdate, ..
            }) => (blocks, mime, mdate),
        };

        let data = self.inner.blocks.read_many(&blocks).await?;
        self.publish(FsEvent::ReadFile { path: path.clone() });

        let (_, name) = path::split(&path);
        Ok(FileHandle {
            path,
            name,
            mime,
            last_modified: mdate,
            data,
        })
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Delete every stored block no inode references.
    ///
    /// A block merged from a peer survives the first pass after it arrived,
    /// so the frame carrying its inode has one collection interval to land.
    /// When a tombstone horizon is configured, older deletions are forgotten
    /// in the same pass.
    ///
    /// Returns `None` if a pass was already running.
    #[tracing::instrument(name = "gc.sweep", skip(self))]
    pub async fn deduplicate(&self) -> FsResult<Option<SweepReport>> {
        let inner = &self.inner;
        let mut spared: HashSet<Digest> = HashSet::new();
        let report = inner
            .blocks
            .collect_garbage(|| {
                spared = inner.rx_grace.lock().clone();
                let mut referenced = inner.ns.read().referenced_digests();
                referenced.extend(spared.iter().cloned());
                referenced
            })
            .await?;
        let Some(report) = report else {
            return Ok(None);
        };

        inner.rx_grace.lock().retain(|digest| !spared.contains(digest));
        debug!(
            scanned = report.scanned,
            removed = report.removed.len(),
            spared = spared.len(),
            "garbage collection pass"
        );
        if let Some(ttl) = inner.config.tombstone_ttl() {
            self.forget_tombstones(ttl)?;
        }
        Ok(Some(report))
    }

    /// Forget deletions older than `older_than`, in memory and in the
    /// backend. Returns how many were dropped.
    ///
    /// A peer that replays a change older than a forgotten deletion will
    /// resurrect the path, so the horizon must exceed the longest delay a
    /// frame can take.
    pub fn forget_tombstones(&self, older_than: Duration) -> FsResult<usize> {
        let horizon = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.inner.clock.now().saturating_sub(horizon);
        let forgotten = self.inner.ns.write().forget_tombstones(cutoff);
        for path in &forgotten {
            self.inner
                .persist
                .send(PersistOp::Forget { path: path.clone() })
                .map_err(|_| FsError::Backend("persistence writer is gone".into()))?;
        }
        if !forgotten.is_empty() {
            debug!(count = forgotten.len(), "forgot tombstones");
        }
        Ok(forgotten.len())
    }

    /// Replace the garbage collection timer. `None` stops it.
    pub fn schedule_gc(&self, interval: Option<Duration>) {
        let handle = interval.map(|period| {
            let weak = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(kura) = Self::upgrade(&weak) else {
                        break;
                    };
                    if let Err(e) = kura.deduplicate().await {
                        warn!(error = %e, "garbage collection failed");
                    }
                }
            })
        });
        if let Some(old) = std::mem::replace(&mut self.inner.tasks.lock().gc, handle) {
            old.abort();
        }
    }

    // ========================================================================
    // Replication
    // ========================================================================

    /// Number of records waiting to be sent.
    pub fn pending_tx(&self) -> usize {
        self.inner.tx_queue.len()
    }

    /// Pop the next outbound frame, if anything is queued.
    pub fn produce_frame(&self, frame_size: Option<usize>) -> Option<String> {
        let budget = frame_size.unwrap_or(self.inner.config.frame_size);
        self.inner.tx_queue.produce_frame(budget)
    }

    /// Start (or replace) the outbound producer.
    ///
    /// Every `interval` one frame of at most `frame_size` bytes is handed to
    /// `send`. A frame whose send fails is put back at the front of the queue.
    pub fn add_tx<F>(&self, send: F, interval: Option<Duration>, frame_size: Option<usize>)
    where
        F: Fn(String) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let period = interval.unwrap_or_else(|| self.inner.config.tx_interval());
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(kura) = Self::upgrade(&weak) else {
                    break;
                };
                let Some(frame) = kura.produce_frame(frame_size) else {
                    continue;
                };
                debug!(bytes = frame.len(), "sending replication frame");
                if let Err(e) = send(frame.clone()) {
                    warn!(error = %e, "replication send failed, requeueing");
                    kura.inner.tx_queue.requeue(&frame);
                }
            }
        });
        if let Some(old) = self.inner.tasks.lock().tx.replace(handle) {
            old.abort();
        }
    }

    /// Stop the outbound producer. Queued records stay queued.
    pub fn stop_tx(&self) {
        if let Some(old) = self.inner.tasks.lock().tx.take() {
            old.abort();
        }
    }

    /// Merge a frame received from a peer.
    ///
    /// Malformed and stale records are skipped; nothing here fails.
    #[tracing::instrument(name = "sync.push_rx", skip_all, fields(bytes = frame.len()))]
    pub async fn push_rx(&self, frame: &str) -> MergeReport {
        let blocks = &self.inner.blocks;
        let _gate = blocks.write_gate().await;
        let mut report = MergeReport::default();

        for raw in split_frame(frame) {
            let record = match Record::decode(raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "dropping malformed replication record");
                    report.ignored += 1;
                    continue;
                }
            };
            match record {
                Record::Block { digest, chunk } => {
                    if blocks.contains(&digest) {
                        report.ignored += 1;
                        continue;
                    }
                    if blocks.digest(&chunk) != digest {
                        warn!(digest = %digest, "dropping block whose content does not match its digest");
                        report.ignored += 1;
                        continue;
                    }
                    match blocks.put(&digest, &chunk).await {
                        Ok(true) => {
                            report.blocks += 1;
                            self.inner.rx_grace.lock().insert(digest.clone());
                            self.inner.outbox.push(FsEvent::WriteBlock {
                                digest,
                                chunk,
                                source: OpSource::Remote,
                            });
                        }
                        Ok(false) => report.ignored += 1,
                        Err(e) => {
                            warn!(digest = %digest, error = %e, "failed to store replicated block");
                            report.ignored += 1;
                        }
                    }
                }
                Record::Upsert { path, inode } => {
                    self.inner.clock.observe(inode.mdate());
                    if self.mutate(|ns, _| ns.merge_upsert(&path, inode)) {
                        report.upserts += 1;
                    } else {
                        report.ignored += 1;
                    }
                }
                Record::Tombstone { path, tombstone } => {
                    self.inner.clock.observe(tombstone.mtime);
                    if self.mutate(|ns, _| ns.merge_tombstone(&path, tombstone)) {
                        report.deletions += 1;
                    } else {
                        report.ignored += 1;
                    }
                }
            }
        }
        self.publish_pending();

        if report.changed() {
            debug!(?report, "merged replication frame");
        }
        report
    }

    /// Encode the whole state as frames: every block still referenced, every
    /// inode (parents first) and every remembered deletion.
    pub async fn snapshot_frames(&self, frame_size: Option<usize>) -> FsResult<Vec<String>> {
        let (inodes, mut tombstones) = {
            let ns = self.inner.ns.read();
            let inodes: Vec<(String, Inode)> = ns
                .iter()
                .filter(|(p, _)| p.as_str() != ROOT)
                .map(|(p, i)| (p.clone(), i.clone()))
                .collect();
            let tombstones: Vec<(String, Tombstone)> =
                ns.tombstones().map(|(p, t)| (p.clone(), *t)).collect();
            (inodes, tombstones)
        };
        tombstones.sort_by(|a, b| a.0.cmp(&b.0));

        let encode = |record: Record| {
            record
                .encode()
                .map_err(|e| FsError::other(format!("encode: {e}")))
        };
        let queue = TxQueue::new();
        let mut sent: HashSet<String> = HashSet::new();
        for (path, inode) in inodes {
            for digest in inode.blocks() {
                if !sent.insert(digest.clone()) {
                    continue;
                }
                let chunk = self
                    .inner
                    .blocks
                    .get(digest)
                    .await?
                    .ok_or_else(|| FsError::Io(format!("missing block: {digest}")))?;
                queue.push(encode(Record::Block {
                    digest: digest.clone(),
                    chunk: chunk.into(),
                })?);
            }
            queue.push(encode(Record::Upsert { path, inode })?);
        }
        for (path, tombstone) in tombstones {
            queue.push(encode(Record::Tombstone { path, tombstone })?);
        }

        let budget = frame_size.unwrap_or(self.inner.config.frame_size);
        let mut frames = Vec::new();
        while let Some(frame) = queue.produce_frame(budget) {
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let kura = Kura::in_memory().await.unwrap();
        kura.mkdir("/docs").unwrap();
        kura.write_file("/docs/a.txt", "hello world", Some(4)).await.unwrap();

        let file = kura.read_file("/docs/a.txt").await.unwrap();
        assert_eq!(file.text().unwrap(), "hello world");
        assert_eq!(file.name, "a.txt");
        assert_eq!(file.mime, "text/plain");
        assert_eq!(kura.inode("/docs/a.txt").unwrap().blocks().len(), 3);
    }

    #[tokio::test]
    async fn test_write_errors() {
        let kura = Kura::in_memory().await.unwrap();
        kura.mkdir("/d").unwrap();
        let err = kura.write_file("/d", "x", None).await.unwrap_err();
        assert_eq!(err.code(), "EISDIR");
        let err = kura.write_file("/nope/f", "x", None).await.unwrap_err();
        assert_eq!(err.code(), "ENOENT");
        let err = kura.write_file("/f", "x", Some(0)).await.unwrap_err();
        assert_eq!(err.code(), "EINVAL");
        let err = kura.read_file("/d").await.unwrap_err();
        assert_eq!(err.code(), "EISDIR");
    }

    #[tokio::test]
    async fn test_rewrite_keeps_cdate_and_emits_change() {
        let kura = Kura::in_memory().await.unwrap();
        let mut sub = kura.subscribe("file.*");

        kura.write_file("/f", "one", None).await.unwrap();
        let cdate = kura.inode("/f").unwrap().cdate();
        kura.write_file("/f", "two", None).await.unwrap();

        let inode = kura.inode("/f").unwrap();
        assert_eq!(inode.cdate(), cdate);
        assert!(inode.mdate() > cdate);
        assert_eq!(sub.recv().await.unwrap().subject, "file.created");
        assert_eq!(sub.recv().await.unwrap().subject, "file.changed");
    }

    #[tokio::test]
    async fn test_chdir_and_relative_paths() {
        let kura = Kura::in_memory().await.unwrap();
        kura.mkdir("/a").unwrap();
        kura.mkdir("a/b").unwrap();
        kura.chdir("/a").unwrap();
        assert_eq!(kura.getcwd(), "/a");

        kura.write_file("b/f", "x", None).await.unwrap();
        assert!(kura.is_file("/a/b/f"));
        assert_eq!(kura.listdir(None).unwrap(), vec!["b"]);
        assert_eq!(kura.relpath("/a/b/f", None), "b/f");
        assert_eq!(kura.chdir("/a/b/f").unwrap_err().code(), "ENOTDIR");
        assert_eq!(kura.chdir("/zzz").unwrap_err().code(), "ENOENT");
    }

    #[tokio::test]
    async fn test_metainfo_omits_blocks() {
        let kura = Kura::in_memory().await.unwrap();
        kura.write_file("/f", vec![1u8, 2, 3], None).await.unwrap();
        let info = kura.metainfo("/f").unwrap();
        assert_eq!(info.size, Some(3));
        assert_eq!(info.mime.as_deref(), Some("application/octet-stream"));
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("blocks").is_none());
        assert_eq!(json["type"], "file");
    }

    #[tokio::test]
    async fn test_observer_can_reenter_engine() {
        let kura = Kura::in_memory().await.unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let engine = kura.clone();
        let s = seen.clone();
        kura.on("create-dir", move |event| {
            s.fetch_add(1, Ordering::SeqCst);
            if event.path() == Some("/a") {
                engine.mkdir("/a/nested")?;
            }
            Ok(())
        });

        kura.mkdir("/a").unwrap();
        assert!(kura.is_dir("/a/nested"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_emit_rejects_storage_events() {
        let kura = Kura::in_memory().await.unwrap();
        let mut sub = kura.subscribe(">");

        let err = kura
            .emit(FsEvent::WriteInode {
                path: "/phantom".into(),
                inode: Inode::dir(1, 1),
                source: OpSource::Local,
            })
            .unwrap_err();
        assert_eq!(err.code(), "EINVAL");
        assert!(!kura.is_dir("/phantom"));
        assert_eq!(kura.pending_tx(), 0);
        assert!(sub.try_recv().is_none());

        kura.emit(FsEvent::ReadFile { path: "/x".into() }).unwrap();
        assert_eq!(sub.try_recv().unwrap().subject, "file.read");
    }

    #[tokio::test]
    async fn test_ready_and_onready() {
        let kura = Kura::in_memory().await.unwrap();
        kura.ready().await;
        assert!(kura.is_ready());

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        kura.onready(move || f.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_local_changes_queue_for_tx() {
        let kura = Kura::in_memory().await.unwrap();
        kura.mkdir("/d").unwrap();
        kura.write_file("/d/f", "abc", None).await.unwrap();
        // dir inode, block, file inode
        assert_eq!(kura.pending_tx(), 3);

        let frame = kura.produce_frame(None).unwrap();
        assert_eq!(frame.matches('|').count(), 2);
        assert_eq!(kura.pending_tx(), 0);
    }

    #[tokio::test]
    async fn test_sync_disabled_queues_nothing() {
        let config = KuraConfig {
            sync: false,
            ..KuraConfig::default()
        };
        let kura = Kura::open(Arc::new(MemoryBackend::new()), config)
            .await
            .unwrap();
        kura.mkdir("/d").unwrap();
        assert_eq!(kura.pending_tx(), 0);
    }
}
