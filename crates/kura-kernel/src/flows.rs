//! Observer bus for file system events.
//!
//! Every namespace mutation is announced as an [`FsEvent`]. Listeners come in
//! two flavours:
//!
//! - synchronous observers registered with [`FlowBus::on`], called in
//!   registration order on the publishing task before `publish` returns;
//! - asynchronous [`Subscription`]s from [`FlowBus::subscribe`], fed through a
//!   broadcast channel.
//!
//! # Pattern Matching
//!
//! Both take NATS-style subject patterns over dot-separated tokens:
//! - `*` matches exactly one token: `file.*` matches `file.created`
//! - `>` matches one or more tokens (only at end): `>` matches everything
//! - Exact match: `inode.written` only matches `inode.written`
//!
//! Event names in their hyphenated form (`write-inode`, `create-dir`, ...) are
//! accepted wherever a pattern is, see [`resolve_pattern`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::sync::broadcast;
use tracing::{error, warn};

use kura_cas::Digest;

use crate::vfs::{Inode, Tombstone};

// ============================================================================
// Origin Tracking
// ============================================================================

/// Origin of a mutation.
///
/// Used to prevent echo loops in replication:
/// - Local mutations are queued for transmission to peers
/// - Remote mutations (merged from a peer) are persisted but NOT sent back
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpSource {
    /// Generated by a local operation.
    #[default]
    Local,
    /// Received from a peer via `push_rx`.
    Remote,
}

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
///
/// ```
/// use kura_kernel::flows::matches_pattern;
/// assert!(matches_pattern("file.*", "file.created"));
/// assert!(matches_pattern("tree.>", "tree.moved"));
/// assert!(!matches_pattern("file.*", "dir.created"));
/// ```
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            ">" => {
                // `>` must be last and swallows the remaining tokens
                return pi == pattern_tokens.len() - 1;
            }
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

/// Translate an event name into a subject pattern.
///
/// Hyphenated event names map to their subject; anything else is taken to be
/// a pattern already.
///
/// ```
/// use kura_kernel::flows::resolve_pattern;
/// assert_eq!(resolve_pattern("write-inode"), "inode.written");
/// assert_eq!(resolve_pattern("file.*"), "file.*");
/// ```
pub fn resolve_pattern(event: &str) -> String {
    match event.parse::<EventKind>() {
        Ok(kind) => kind.subject().to_string(),
        Err(_) => event.to_string(),
    }
}

// ============================================================================
// Flow Message Types
// ============================================================================

/// Trait for payloads that know their subject.
pub trait HasSubject {
    /// Get the subject string for this payload.
    fn subject(&self) -> &str;
}

/// A message published to the flow bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    /// The subject (derived from payload).
    pub subject: String,
    /// The payload data.
    pub payload: T,
    /// When this message was created.
    pub timestamp: Instant,
}

impl<T: HasSubject> FlowMessage<T> {
    /// Create a new flow message.
    pub fn new(payload: T) -> Self {
        let subject = payload.subject().to_string();
        Self {
            subject,
            payload,
            timestamp: Instant::now(),
        }
    }
}

// ============================================================================
// File System Events
// ============================================================================

/// Name of an event, in its hyphenated form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum EventKind {
    CreateDir,
    DeleteDir,
    CreateFile,
    ChangeFile,
    DeleteFile,
    ReadFile,
    Move,
    Copy,
    CreateTree,
    DeleteTree,
    WriteBlock,
    WriteInode,
    DeleteInode,
    ChangePath,
}

impl EventKind {
    /// Dotted subject events of this kind are published under.
    pub fn subject(self) -> &'static str {
        match self {
            EventKind::CreateDir => "dir.created",
            EventKind::DeleteDir => "dir.deleted",
            EventKind::CreateFile => "file.created",
            EventKind::ChangeFile => "file.changed",
            EventKind::DeleteFile => "file.deleted",
            EventKind::ReadFile => "file.read",
            EventKind::Move => "tree.moved",
            EventKind::Copy => "tree.copied",
            EventKind::CreateTree => "tree.created",
            EventKind::DeleteTree => "tree.deleted",
            EventKind::WriteBlock => "block.written",
            EventKind::WriteInode => "inode.written",
            EventKind::DeleteInode => "inode.deleted",
            EventKind::ChangePath => "cwd.changed",
        }
    }

    /// Reverse of [`EventKind::subject`].
    pub fn from_subject(subject: &str) -> Option<Self> {
        EventKind::iter().find(|kind| kind.subject() == subject)
    }
}

/// File system events.
///
/// Storage-level events (`WriteInode`, `DeleteInode`, `WriteBlock`) drive
/// persistence and replication; the rest describe operations for anyone
/// watching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsEvent {
    /// A directory was created.
    CreateDir { path: String, source: OpSource },
    /// A directory was removed.
    DeleteDir { path: String, source: OpSource },
    /// A file was created.
    CreateFile { path: String, source: OpSource },
    /// A file's content was replaced.
    ChangeFile { path: String, source: OpSource },
    /// A file was removed.
    DeleteFile { path: String, source: OpSource },
    /// A file was read.
    ReadFile { path: String },
    /// A file or directory was moved.
    Move {
        src: String,
        dest: String,
        source: OpSource,
    },
    /// A file or directory was copied.
    Copy {
        src: String,
        dest: String,
        source: OpSource,
    },
    /// A subtree was transferred over another.
    CreateTree {
        src: String,
        dest: String,
        source: OpSource,
    },
    /// A subtree was deleted.
    DeleteTree { path: String, source: OpSource },
    /// A novel block was stored.
    WriteBlock {
        digest: Digest,
        chunk: Arc<[u8]>,
        source: OpSource,
    },
    /// An inode was created or replaced.
    WriteInode {
        path: String,
        inode: Inode,
        source: OpSource,
    },
    /// An inode was removed.
    DeleteInode {
        path: String,
        tombstone: Tombstone,
        source: OpSource,
    },
    /// The working directory changed.
    ChangePath { path: String },
}

impl FsEvent {
    /// Name of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            FsEvent::CreateDir { .. } => EventKind::CreateDir,
            FsEvent::DeleteDir { .. } => EventKind::DeleteDir,
            FsEvent::CreateFile { .. } => EventKind::CreateFile,
            FsEvent::ChangeFile { .. } => EventKind::ChangeFile,
            FsEvent::DeleteFile { .. } => EventKind::DeleteFile,
            FsEvent::ReadFile { .. } => EventKind::ReadFile,
            FsEvent::Move { .. } => EventKind::Move,
            FsEvent::Copy { .. } => EventKind::Copy,
            FsEvent::CreateTree { .. } => EventKind::CreateTree,
            FsEvent::DeleteTree { .. } => EventKind::DeleteTree,
            FsEvent::WriteBlock { .. } => EventKind::WriteBlock,
            FsEvent::WriteInode { .. } => EventKind::WriteInode,
            FsEvent::DeleteInode { .. } => EventKind::DeleteInode,
            FsEvent::ChangePath { .. } => EventKind::ChangePath,
        }
    }

    /// Origin of the mutation. Reads and working directory changes are always
    /// local.
    pub fn source(&self) -> OpSource {
        match self {
            FsEvent::CreateDir { source, .. }
            | FsEvent::DeleteDir { source, .. }
            | FsEvent::CreateFile { source, .. }
            | FsEvent::ChangeFile { source, .. }
            | FsEvent::DeleteFile { source, .. }
            | FsEvent::Move { source, .. }
            | FsEvent::Copy { source, .. }
            | FsEvent::CreateTree { source, .. }
            | FsEvent::DeleteTree { source, .. }
            | FsEvent::WriteBlock { source, .. }
            | FsEvent::WriteInode { source, .. }
            | FsEvent::DeleteInode { source, .. } => *source,
            FsEvent::ReadFile { .. } | FsEvent::ChangePath { .. } => OpSource::Local,
        }
    }

    /// Returns true for the events that carry stored state: block writes and
    /// inode writes or deletions. Persistence and replication act on these.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            FsEvent::WriteBlock { .. } | FsEvent::WriteInode { .. } | FsEvent::DeleteInode { .. }
        )
    }

    /// Primary path the event concerns, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            FsEvent::CreateDir { path, .. }
            | FsEvent::DeleteDir { path, .. }
            | FsEvent::CreateFile { path, .. }
            | FsEvent::ChangeFile { path, .. }
            | FsEvent::DeleteFile { path, .. }
            | FsEvent::ReadFile { path }
            | FsEvent::DeleteTree { path, .. }
            | FsEvent::WriteInode { path, .. }
            | FsEvent::DeleteInode { path, .. }
            | FsEvent::ChangePath { path } => Some(path),
            FsEvent::Move { dest, .. } | FsEvent::Copy { dest, .. } | FsEvent::CreateTree { dest, .. } => {
                Some(dest)
            }
            FsEvent::WriteBlock { .. } => None,
        }
    }
}

impl HasSubject for FsEvent {
    fn subject(&self) -> &str {
        self.kind().subject()
    }
}

// ============================================================================
// FlowBus
// ============================================================================

/// Synchronous event handler. Errors are logged and swallowed.
pub type Handler<T> = Arc<dyn Fn(&FlowMessage<T>) -> anyhow::Result<()> + Send + Sync>;

struct Observer<T> {
    id: u64,
    pattern: String,
    handler: Handler<T>,
}

type ObserverList<T> = RwLock<Vec<Observer<T>>>;

/// Typed publish/subscribe bus.
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
    observers: Arc<ObserverList<T>>,
    next_id: Arc<AtomicU64>,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    /// Create a new flow bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            capacity,
            observers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of active async subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Register a synchronous observer for subjects matching `pattern`.
    pub fn on<F>(&self, pattern: &str, handler: F) -> ObserverHandle<T>
    where
        F: Fn(&FlowMessage<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push(Observer {
            id,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        ObserverHandle {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Remove an observer. Returns false if it was already gone.
    pub fn off(&self, id: u64) -> bool {
        remove_observer(&self.observers, id)
    }
}

fn remove_observer<T>(observers: &ObserverList<T>, id: u64) -> bool {
    let mut observers = observers.write();
    let before = observers.len();
    observers.retain(|o| o.id != id);
    observers.len() != before
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish a payload to the bus.
    ///
    /// Matching observers run first, in registration order; a failing or
    /// panicking observer is logged and does not stop the others. Returns the
    /// number of async subscribers that received the message.
    pub fn publish(&self, payload: T) -> usize {
        let msg = FlowMessage::new(payload);

        let handlers: Vec<(u64, Handler<T>)> = self
            .observers
            .read()
            .iter()
            .filter(|o| matches_pattern(&o.pattern, &msg.subject))
            .map(|o| (o.id, o.handler.clone()))
            .collect();

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&msg))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(subject = %msg.subject, observer = id, error = %e, "observer failed");
                }
                Err(_) => {
                    error!(subject = %msg.subject, observer = id, "observer panicked");
                }
            }
        }

        self.tx.send(msg).unwrap_or(0)
    }

    /// Subscribe to messages matching a pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
            observers: self.observers.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for FlowBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowBus")
            .field("capacity", &self.capacity)
            .field("observers", &self.observer_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`FlowBus::on`].
///
/// Dropping the handle leaves the observer registered; call
/// [`ObserverHandle::unsubscribe`] to remove it.
pub struct ObserverHandle<T> {
    id: u64,
    observers: Weak<ObserverList<T>>,
}

impl<T> ObserverHandle<T> {
    /// Observer id, usable with [`FlowBus::off`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the observer. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.observers.upgrade() {
            Some(observers) => remove_observer(&observers, self.id),
            None => false,
        }
    }
}

impl<T> std::fmt::Debug for ObserverHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle").field("id", &self.id).finish()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A subscription to a FlowBus with pattern filtering.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    /// Get the subscription pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message, waiting if necessary.
    ///
    /// Returns None once the bus is gone.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(pattern = %self.pattern, lagged = n, "flow subscription lagged behind");
                }
            }
        }
    }

    /// Receive the next matching message without blocking.
    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(pattern = %self.pattern, lagged = n, "flow subscription lagged behind");
                }
            }
        }
    }
}

impl<T: Clone> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Bus carrying file system events.
pub type FsBus = FlowBus<FsEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn created(path: &str) -> FsEvent {
        FsEvent::CreateFile {
            path: path.to_string(),
            source: OpSource::Local,
        }
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("inode.written", "inode.written"));
        assert!(!matches_pattern("inode.written", "inode.deleted"));
        assert!(matches_pattern("inode.*", "inode.deleted"));
        assert!(!matches_pattern("inode.*", "inode"));
        assert!(matches_pattern(">", "tree.moved"));
        assert!(matches_pattern("*.created", "dir.created"));
        assert!(!matches_pattern("*.created", "tree.moved"));
    }

    #[test]
    fn test_event_names_resolve_to_subjects() {
        for kind in EventKind::iter() {
            let name = kind.to_string();
            assert_eq!(resolve_pattern(&name), kind.subject());
            assert_eq!(EventKind::from_subject(kind.subject()), Some(kind));
        }
        assert_eq!(EventKind::DeleteInode.to_string(), "delete-inode");
        assert_eq!(created("/a").subject(), "file.created");
    }

    #[test]
    fn test_observers_run_in_order() {
        let bus = FsBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        bus.on("file.*", move |msg| {
            s.lock().unwrap().push(format!("first {}", msg.payload.path().unwrap_or("")));
            Ok(())
        });
        let s = seen.clone();
        bus.on("file.created", move |_| {
            s.lock().unwrap().push("second".to_string());
            Ok(())
        });
        bus.on("dir.*", |_| panic!("must not match"));

        bus.publish(created("/a"));
        assert_eq!(*seen.lock().unwrap(), vec!["first /a", "second"]);
    }

    #[test]
    fn test_failing_observer_does_not_stop_others() {
        let bus = FsBus::new(16);
        let count = Arc::new(AtomicU64::new(0));

        bus.on(">", |_| anyhow::bail!("broken"));
        bus.on(">", |_| panic!("worse"));
        let c = count.clone();
        bus.on(">", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(created("/a"));
        bus.publish(created("/b"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = FsBus::new(16);
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        let handle = bus.on(">", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.publish(created("/a"));
        assert!(handle.unsubscribe());
        bus.publish(created("/b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let handle = bus.on(">", |_| Ok(()));
        assert!(bus.off(handle.id()));
        assert!(!bus.off(handle.id()));
        assert_eq!(bus.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_filters() {
        let bus = FsBus::new(16);
        let mut sub = bus.subscribe("dir.*");

        bus.publish(created("/f"));
        bus.publish(FsEvent::CreateDir {
            path: "/d".into(),
            source: OpSource::Local,
        });

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "dir.created");
        assert_eq!(msg.payload.path(), Some("/d"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = FsBus::new(4);
        assert_eq!(bus.publish(created("/a")), 0);
    }
}
