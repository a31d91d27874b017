//! Typed domain events and the publish/subscribe bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use vaultsync_common::{Error, Result, VaultPath};

use crate::changelog::FileChange;
use crate::classify::{ClassificationRule, Classifier};
use crate::conflict::Winner;

/// Event family, the part before the colon in `task:created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Job,
    Task,
    Approval,
    Note,
    System,
    File,
    Scan,
    Conflict,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Job => "job",
            Domain::Task => "task",
            Domain::Approval => "approval",
            Domain::Note => "note",
            Domain::System => "system",
            Domain::File => "file",
            Domain::Scan => "scan",
            Domain::Conflict => "conflict",
        }
    }

    const ALL: [Domain; 8] = [
        Domain::Job,
        Domain::Task,
        Domain::Approval,
        Domain::Note,
        Domain::System,
        Domain::File,
        Domain::Scan,
        Domain::Conflict,
    ];
}

/// What happened, the part after the colon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Modified,
    Deleted,
    Renamed,
    Claimed,
    Completed,
    Failed,
    Requested,
    Resolved,
    Started,
    Detected,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Modified => "modified",
            Action::Deleted => "deleted",
            Action::Renamed => "renamed",
            Action::Claimed => "claimed",
            Action::Completed => "completed",
            Action::Failed => "failed",
            Action::Requested => "requested",
            Action::Resolved => "resolved",
            Action::Started => "started",
            Action::Detected => "detected",
        }
    }

    const ALL: [Action; 11] = [
        Action::Created,
        Action::Modified,
        Action::Deleted,
        Action::Renamed,
        Action::Claimed,
        Action::Completed,
        Action::Failed,
        Action::Requested,
        Action::Resolved,
        Action::Started,
        Action::Detected,
    ];
}

/// A `domain:action` tag such as `job:claimed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType {
    pub domain: Domain,
    pub action: Action,
}

impl EventType {
    pub const SCAN_STARTED: Self = Self::new(Domain::Scan, Action::Started);
    pub const SCAN_COMPLETED: Self = Self::new(Domain::Scan, Action::Completed);
    pub const CONFLICT_DETECTED: Self = Self::new(Domain::Conflict, Action::Detected);
    pub const CONFLICT_RESOLVED: Self = Self::new(Domain::Conflict, Action::Resolved);

    pub const fn new(domain: Domain, action: Action) -> Self {
        Self { domain, action }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain.as_str(), self.action.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("unknown event type {:?}", s));
        let (domain, action) = s.split_once(':').ok_or_else(invalid)?;
        let domain = Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == domain)
            .ok_or_else(invalid)?;
        let action = Action::ALL
            .into_iter()
            .find(|a| a.as_str() == action)
            .ok_or_else(invalid)?;
        Ok(Self::new(domain, action))
    }
}

impl TryFrom<String> for EventType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.to_string()
    }
}

/// Payload attached to an event, shaped per event family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    None,
    /// A document in a classified directory; `id` is the file stem.
    Document { id: String, directory: String },
    /// A document that was renamed or moved.
    Moved {
        id: String,
        directory: Option<String>,
        old_path: VaultPath,
    },
    Scan { change_count: usize },
    Conflict {
        conflict_id: String,
        winner: Option<Winner>,
        loser_path: Option<VaultPath>,
    },
}

/// A classified change, dispatched to subscribers and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEvent {
    pub event_type: EventType,
    pub path: VaultPath,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
    /// Journal id of the underlying change, once journaled.
    pub change_id: Option<i64>,
}

impl VaultEvent {
    /// An engine-originated event not tied to one file change.
    pub fn engine(event_type: EventType, path: VaultPath, data: EventData) -> Self {
        Self {
            event_type,
            path,
            timestamp: Utc::now(),
            data,
            change_id: None,
        }
    }
}

/// Error type handlers may return; it is logged and otherwise ignored.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of event handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&VaultEvent) -> HandlerResult + Send + Sync>;

/// Exact-type subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPattern {
    /// `*`: every event.
    Any,
    Exact(EventType),
}

impl EventPattern {
    fn matches(&self, event: &VaultEvent) -> bool {
        match self {
            EventPattern::Any => true,
            EventPattern::Exact(t) => *t == event.event_type,
        }
    }
}

impl From<EventType> for EventPattern {
    fn from(event_type: EventType) -> Self {
        EventPattern::Exact(event_type)
    }
}

impl FromStr for EventPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "*" {
            Ok(EventPattern::Any)
        } else {
            s.parse().map(EventPattern::Exact)
        }
    }
}

/// Cross-cutting subscription filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<EventType>>,
    /// Directory prefixes such as `jobs/` or `tasks/pending`.
    pub directories: Option<Vec<String>>,
}

impl EventFilter {
    pub fn matches(&self, event: &VaultEvent) -> bool {
        let type_ok = self
            .event_types
            .as_ref()
            .map_or(true, |types| types.contains(&event.event_type));
        let dir_ok = self
            .directories
            .as_ref()
            .map_or(true, |dirs| dirs.iter().any(|d| event.path.is_under(d)));
        type_ok && dir_ok
    }
}

enum Matcher {
    Pattern(EventPattern),
    Filter(EventFilter),
}

impl Matcher {
    fn matches(&self, event: &VaultEvent) -> bool {
        match self {
            Matcher::Pattern(p) => p.matches(event),
            Matcher::Filter(f) => f.matches(event),
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, Matcher, Handler)>,
}

/// Handle returned by [`EventBus::on`] and [`EventBus::subscribe`].
///
/// Dropping it keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to stop receiving events.
pub struct Subscription {
    id: u64,
    registry: Weak<RwLock<Registry>>,
}

impl Subscription {
    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry.write().unwrap_or_else(PoisonError::into_inner);
        let before = registry.handlers.len();
        registry.handlers.retain(|(id, _, _)| *id != self.id);
        registry.handlers.len() != before
    }
}

/// Delivery outcome of one [`EventBus::emit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Typed publish/subscribe with per-handler failure isolation.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
    classifier: Arc<Classifier>,
    stream: broadcast::Sender<VaultEvent>,
}

impl EventBus {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        let (stream, _) = broadcast::channel(1024);
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            classifier: Arc::new(Classifier::new(rules)),
            stream,
        }
    }

    /// Subscribe to one event type, or to everything with [`EventPattern::Any`].
    pub fn on<F>(&self, pattern: impl Into<EventPattern>, handler: F) -> Subscription
    where
        F: Fn(&VaultEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Matcher::Pattern(pattern.into()), Arc::new(handler))
    }

    /// Subscribe to every event matching `filter`.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&VaultEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Matcher::Filter(filter), Arc::new(handler))
    }

    fn register(&self, matcher: Matcher, handler: Handler) -> Subscription {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.push((id, matcher, handler));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Async receiver of every emitted event, for consumers that prefer a
    /// stream to callbacks. Slow receivers observe `Lagged`.
    pub fn stream(&self) -> broadcast::Receiver<VaultEvent> {
        self.stream.subscribe()
    }

    /// Deliver `event` to every matching handler.
    ///
    /// Handlers run in registration order. A handler that returns an error or
    /// panics is logged and counted; the remaining handlers still run.
    pub fn emit(&self, event: &VaultEvent) -> EmitReport {
        let handlers: Vec<Handler> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .handlers
                .iter()
                .filter(|(_, matcher, _)| matcher.matches(event))
                .map(|(_, _, handler)| handler.clone())
                .collect()
        };

        let mut report = EmitReport::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!("Handler for {} failed: {}", event.event_type, e);
                }
                Err(_) => {
                    report.failed += 1;
                    warn!("Handler for {} panicked", event.event_type);
                }
            }
        }

        let _ = self.stream.send(event.clone());
        debug!(
            "Emitted {} for {} ({} delivered, {} failed)",
            event.event_type, event.path, report.delivered, report.failed
        );
        report
    }

    /// Deterministic raw change to domain event mapping.
    pub fn classify_change(&self, change: &FileChange) -> VaultEvent {
        self.classifier.classify(change)
    }

    /// Number of live subscriptions.
    pub fn handler_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::classify::default_rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn event(kind: &str, path: &str) -> VaultEvent {
        VaultEvent::engine(
            kind.parse().unwrap(),
            VaultPath::parse(path).unwrap(),
            EventData::None,
        )
    }

    #[test]
    fn test_event_type_parse_and_display() {
        let t: EventType = "job:claimed".parse().unwrap();
        assert_eq!(t, EventType::new(Domain::Job, Action::Claimed));
        assert_eq!(t.to_string(), "job:claimed");
        assert!("job".parse::<EventType>().is_err());
        assert!("job:exploded".parse::<EventType>().is_err());
        assert_eq!(
            serde_json::to_string(&EventType::SCAN_STARTED).unwrap(),
            "\"scan:started\""
        );
    }

    #[test]
    fn test_exact_and_wildcard_handlers() {
        let bus = EventBus::default();
        let exact = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let e = exact.clone();
        bus.on("task:created".parse::<EventPattern>().unwrap(), move |_| {
            e.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let a = all.clone();
        bus.on(EventPattern::Any, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(&event("task:created", "tasks/pending/t1.md"));
        bus.emit(&event("note:modified", "notes/a.md"));

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_filter_subscription() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(
            EventFilter {
                event_types: Some(vec!["job:claimed".parse().unwrap()]),
                directories: Some(vec!["jobs/".to_string()]),
            },
            move |event| {
                s.lock().unwrap().push(event.path.to_string());
                Ok(())
            },
        );

        bus.emit(&event("job:claimed", "jobs/running/1.md"));
        bus.emit(&event("job:created", "jobs/pending/2.md"));
        bus.emit(&event("job:claimed", "elsewhere/3.md"));

        assert_eq!(*seen.lock().unwrap(), vec!["jobs/running/1.md".to_string()]);
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let bus = EventBus::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.on(EventPattern::Any, |_| Err("subscriber broke".into()));
        bus.on(EventPattern::Any, |_| panic!("subscriber panicked"));
        let d = delivered.clone();
        bus.on(EventPattern::Any, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = bus.emit(&event("note:created", "notes/a.md"));
        assert_eq!(report, EmitReport { delivered: 1, failed: 2 });
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        bus.emit(&event("note:created", "notes/b.md"));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = bus.on(EventPattern::Any, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(&event("note:created", "notes/a.md"));
        assert!(sub.unsubscribe());
        bus.emit(&event("note:created", "notes/a.md"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.stream();
        bus.emit(&event("system:modified", "system/config.md"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type.to_string(), "system:modified");
    }
}
