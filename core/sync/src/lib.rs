//! Vaultsync engine
//!
//! Local-first synchronization for a directory of structured documents
//! shared by several processes and devices:
//! - Watcher and periodic full scans that detect changes
//! - Append-only change journal with per-consumer cursors
//! - Per-file version tracking with retained history
//! - Directory-driven event classification and dispatch
//! - Advisory TTL locks for external writers
//! - Deterministic, non-destructive conflict resolution between devices

pub mod changelog;
pub mod classify;
pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod events;
pub mod lock;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod state;
pub mod watcher;

pub use changelog::{ChangeLog, ChangeSource, ChangeType, FileChange, LoggedChange};
pub use classify::{default_rules, ClassificationRule, Classifier};
pub use config::SyncConfig;
pub use conflict::{
    Conflict, ConflictResolution, ConflictResolver, ConflictStrategy, ResolvedBy, Winner,
};
pub use db::Database;
pub use engine::{InjectReport, RemoteChange, VaultSync};
pub use events::{
    Action, Domain, EmitReport, EventBus, EventData, EventFilter, EventPattern, EventType,
    HandlerResult, Subscription, VaultEvent,
};
pub use lock::{FileLock, LockGuard, LockManager};
pub use retry::{retry, RetryConfig, RetryExecutor};
pub use scanner::FullScanner;
pub use scheduler::Scheduler;
pub use state::{FileVersion, SyncState};
pub use watcher::{ChannelBackend, FileWatcher, NotifyBackend, RawEvent, WatchBackend, WatchTimings};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry = RetryConfig::default();
        let _bus = EventBus::default();
        let _classifier = Classifier::default();
        let _db = Database::open_in_memory().unwrap();
    }
}
